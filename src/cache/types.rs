//! Cache data types

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Browser-tier caching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserCacheStrategy {
    /// Validator based (ETag), 7-day max-age
    #[default]
    Conservative,
    /// Immutable with a far-future Expires
    Aggressive,
    /// 1-hour max-age
    Minimal,
}

impl BrowserCacheStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BrowserCacheStrategy::Conservative => "conservative",
            BrowserCacheStrategy::Aggressive => "aggressive",
            BrowserCacheStrategy::Minimal => "minimal",
        }
    }
}

impl FromStr for BrowserCacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Ok(BrowserCacheStrategy::Conservative),
            "aggressive" => Ok(BrowserCacheStrategy::Aggressive),
            "minimal" => Ok(BrowserCacheStrategy::Minimal),
            other => Err(format!("unknown cache strategy: {}", other)),
        }
    }
}

/// Cache configuration options
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Byte budget of the memory tier
    pub max_memory_bytes: usize,
    /// TTL for page entries; document entries live twice as long
    pub page_ttl: Duration,
    /// Entries accessed fewer times than this are dropped by `optimize_cache`
    pub min_access_count: u32,
    pub browser_strategy: BrowserCacheStrategy,
    /// Interval of the background maintenance task
    pub optimize_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * 1024 * 1024,
            page_ttl: Duration::from_secs(3600),
            min_access_count: 2,
            browser_strategy: BrowserCacheStrategy::Conservative,
            optimize_interval: Duration::from_secs(300),
        }
    }
}

/// Partial configuration change applied by the optimization service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheConfigUpdate {
    pub max_memory_bytes: Option<usize>,
    pub page_ttl: Option<Duration>,
    pub browser_strategy: Option<BrowserCacheStrategy>,
}

/// Document-level metadata kept in the document tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub document_id: String,
    pub url: String,
    pub page_count: u32,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: u32,
}

/// Cached value
#[derive(Debug, Clone)]
pub enum CachePayload {
    Page(Arc<Vec<u8>>),
    Document(Arc<DocumentInfo>),
}

impl CachePayload {
    /// Approximate memory footprint in bytes
    pub fn size(&self) -> usize {
        match self {
            CachePayload::Page(data) => data.len(),
            CachePayload::Document(info) => {
                std::mem::size_of::<DocumentInfo>()
                    + info.document_id.len()
                    + info.url.len()
                    + info.title.as_ref().map(String::len).unwrap_or(0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryMetadata {
    pub document_id: String,
    /// `None` for document-level entries
    pub page_number: Option<u32>,
    pub content_type: String,
    pub version: u32,
    /// How a page image was produced, e.g. `CANVAS@1.5`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendition: Option<String>,
}

/// One memory-tier entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: CachePayload,
    pub timestamp: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
    pub size: usize,
    pub ttl: Duration,
    pub metadata: CacheEntryMetadata,
}

impl CacheEntry {
    pub fn new(key: String, data: CachePayload, ttl: Duration, metadata: CacheEntryMetadata) -> Self {
        let now = Instant::now();
        Self {
            key,
            size: data.size(),
            data,
            timestamp: now,
            access_count: 0,
            last_accessed: now,
            ttl,
            metadata,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) >= self.ttl
    }
}

/// Page image returned from the memory tier
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub data: Arc<Vec<u8>>,
    pub content_type: String,
    pub version: u32,
    pub rendition: Option<String>,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub page_entries: usize,
    pub document_entries: usize,
    pub memory_usage_bytes: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Percentage, 0-100
    pub hit_rate: f64,
    pub average_entry_size: usize,
    pub browser_strategy: BrowserCacheStrategy,
}

/// Outcome of an `optimize_cache` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub expired_removed: usize,
    pub low_frequency_removed: usize,
    pub bytes_freed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "Aggressive".parse::<BrowserCacheStrategy>().unwrap(),
            BrowserCacheStrategy::Aggressive
        );
        assert_eq!(
            " minimal ".parse::<BrowserCacheStrategy>().unwrap(),
            BrowserCacheStrategy::Minimal
        );
        assert!("forever".parse::<BrowserCacheStrategy>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry() {
        let entry = CacheEntry::new(
            "page:doc:1".to_string(),
            CachePayload::Page(Arc::new(vec![0; 16])),
            Duration::from_secs(10),
            CacheEntryMetadata {
                document_id: "doc".to_string(),
                page_number: Some(1),
                content_type: "image/png".to_string(),
                version: 1,
                rendition: None,
            },
        );
        assert_eq!(entry.size, 16);
        assert!(!entry.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(entry.is_expired(Instant::now()));
    }
}
