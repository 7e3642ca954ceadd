//! Tiered document cache
//!
//! The memory tier is an LRU store bounded by a byte budget with per-entry
//! TTLs. The browser and CDN tiers are not stored here; they are driven by
//! the cache headers this module generates for the response path.
//!
//! ```text
//!   request ──▶ memory tier (DocumentCacheManager)
//!                   │ miss
//!                   ▼
//!              browser HTTP cache  (get_browser_cache_headers)
//!                   │ miss
//!                   ▼
//!              CDN                 (get_cdn_cache_headers)
//! ```

mod headers;
mod manager;
mod types;

pub use headers::{CacheHeaders, CDN_MAX_AGE_SECS};
pub use manager::DocumentCacheManager;
pub use types::{
    BrowserCacheStrategy, CacheConfig, CacheConfigUpdate, CacheEntry, CacheEntryMetadata,
    CachePayload, CacheStats, CachedPage, DocumentInfo, OptimizeReport,
};
