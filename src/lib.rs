//! Amnesia render engine
//!
//! Reliable page rendering for the document viewer: a fallback chain of
//! rendering methods driven by error recovery, resilient document fetching,
//! progress tracking with stuck detection, per-request diagnostics and a
//! tiered page cache tuned by observed reading behavior.
//!
//! # Modules
//!
//! - `renderer`: `ReliableRenderer` orchestration and rendering strategies
//! - `recovery`: per-attempt contexts and retry/fallback decisions
//! - `network`: streaming fetch with retry, backoff and URL refresh
//! - `cache`: memory tier plus browser/CDN cache headers
//! - `optimization`: behavior learning, preloading and cache warming
//! - `performance`: canvas pooling and adaptive tuning
//! - `progress`, `diagnostics`: observability for each request

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod network;
pub mod optimization;
pub mod performance;
pub mod preferences;
pub mod progress;
pub mod recovery;
pub mod renderer;
pub mod routes;
pub mod state;

pub use error::{AppError, ErrorKind, RenderError, Result};
