//! Document cache manager
//!
//! Memory tier with LRU eviction bounded by a byte budget, TTL expiry and
//! hit/miss accounting.
//!
//! # Thread Safety
//!
//! The store sits behind a `tokio::sync::RwLock`. Lookups take the write
//! lock because a hit updates LRU order and access counters. Callers only
//! ever receive cloned `Arc` payloads, never references into the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lru::LruCache;
use parking_lot::{Mutex, RwLock as SyncRwLock};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::headers::{browser_headers, cdn_headers, CacheHeaders};
use super::types::{
    CacheConfig, CacheConfigUpdate, CacheEntry, CacheEntryMetadata, CachePayload, CacheStats,
    CachedPage, DocumentInfo, OptimizeReport,
};

const DOCUMENT_CONTENT_TYPE: &str = "application/json";

fn page_key(document_id: &str, page: u32) -> String {
    format!("page:{}:{}", document_id, page)
}

fn document_key(document_id: &str) -> String {
    format!("doc:{}", document_id)
}

struct CacheStore {
    entries: LruCache<String, CacheEntry>,
    memory_usage: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheStore {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            memory_usage: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.memory_usage = self.memory_usage.saturating_sub(entry.size);
        Some(entry)
    }

    /// Evict least-recently-accessed entries until `incoming` more bytes fit
    fn make_room(&mut self, incoming: usize, budget: usize) -> usize {
        let mut freed = 0;
        while self.memory_usage + incoming > budget {
            match self.entries.pop_lru() {
                Some((key, evicted)) => {
                    self.memory_usage = self.memory_usage.saturating_sub(evicted.size);
                    self.evictions += 1;
                    freed += evicted.size;
                    tracing::trace!(key = %key, size = evicted.size, "Evicted cache entry");
                }
                None => break,
            }
        }
        freed
    }

    fn insert(&mut self, entry: CacheEntry, budget: usize) -> bool {
        if entry.size > budget {
            tracing::warn!(
                key = %entry.key,
                size = entry.size,
                budget,
                "Entry larger than cache budget, not caching"
            );
            return false;
        }
        self.remove(&entry.key);
        self.make_room(entry.size, budget);
        self.memory_usage += entry.size;
        self.entries.put(entry.key.clone(), entry);
        true
    }

    /// Look up a live entry, dropping it if its TTL has elapsed
    fn lookup(&mut self, key: &str) -> Option<&CacheEntry> {
        let now = Instant::now();
        let expired = match self.entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.misses += 1;
                return None;
            }
        };

        if expired {
            self.remove(key);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        Some(&*entry)
    }
}

struct ManagerInner {
    store: RwLock<CacheStore>,
    config: SyncRwLock<CacheConfig>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Thread-safe, caller-owned document cache
///
/// Cloning shares the same store. Call `destroy` to stop background
/// maintenance and drop all entries.
#[derive(Clone)]
pub struct DocumentCacheManager {
    inner: Arc<ManagerInner>,
}

impl Default for DocumentCacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl DocumentCacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store: RwLock::new(CacheStore::new()),
                config: SyncRwLock::new(config),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config.read().clone()
    }

    /// Cache a rendered page with the configured page TTL
    pub async fn set_page_cache(
        &self,
        document_id: &str,
        page: u32,
        data: Vec<u8>,
        content_type: &str,
        version: u32,
    ) -> bool {
        self.insert_page(document_id, page, data, content_type, version, None)
            .await
    }

    /// Cache a page image tagged with the rendition that produced it
    pub async fn set_rendered_page(
        &self,
        document_id: &str,
        page: u32,
        data: Vec<u8>,
        content_type: &str,
        rendition: &str,
    ) -> bool {
        self.insert_page(document_id, page, data, content_type, 1, Some(rendition.to_string()))
            .await
    }

    async fn insert_page(
        &self,
        document_id: &str,
        page: u32,
        data: Vec<u8>,
        content_type: &str,
        version: u32,
        rendition: Option<String>,
    ) -> bool {
        let (budget, ttl) = {
            let config = self.inner.config.read();
            (config.max_memory_bytes, config.page_ttl)
        };

        let entry = CacheEntry::new(
            page_key(document_id, page),
            CachePayload::Page(Arc::new(data)),
            ttl,
            CacheEntryMetadata {
                document_id: document_id.to_string(),
                page_number: Some(page),
                content_type: content_type.to_string(),
                version,
                rendition,
            },
        );

        let mut store = self.inner.store.write().await;
        store.insert(entry, budget)
    }

    pub async fn get_page_cache(&self, document_id: &str, page: u32) -> Option<CachedPage> {
        let mut store = self.inner.store.write().await;
        let entry = store.lookup(&page_key(document_id, page))?;
        match &entry.data {
            CachePayload::Page(data) => Some(CachedPage {
                data: data.clone(),
                content_type: entry.metadata.content_type.clone(),
                version: entry.metadata.version,
                rendition: entry.metadata.rendition.clone(),
            }),
            CachePayload::Document(_) => None,
        }
    }

    /// Whether a live page entry exists, without touching counters or LRU order
    pub async fn contains_page(&self, document_id: &str, page: u32) -> bool {
        let store = self.inner.store.read().await;
        store
            .entries
            .peek(&page_key(document_id, page))
            .map(|entry| !entry.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    /// Cache document metadata; lives twice as long as page entries
    pub async fn set_document_cache(&self, info: DocumentInfo) -> bool {
        let (budget, ttl) = {
            let config = self.inner.config.read();
            (config.max_memory_bytes, config.page_ttl * 2)
        };

        let entry = CacheEntry::new(
            document_key(&info.document_id),
            CachePayload::Document(Arc::new(info.clone())),
            ttl,
            CacheEntryMetadata {
                document_id: info.document_id.clone(),
                page_number: None,
                content_type: DOCUMENT_CONTENT_TYPE.to_string(),
                version: info.version,
                rendition: None,
            },
        );

        let mut store = self.inner.store.write().await;
        store.insert(entry, budget)
    }

    pub async fn get_document_cache(&self, document_id: &str) -> Option<Arc<DocumentInfo>> {
        let mut store = self.inner.store.write().await;
        match &store.lookup(&document_key(document_id))?.data {
            CachePayload::Document(info) => Some(info.clone()),
            CachePayload::Page(_) => None,
        }
    }

    /// Document metadata without touching counters or LRU order
    pub async fn peek_document(&self, document_id: &str) -> Option<Arc<DocumentInfo>> {
        let store = self.inner.store.read().await;
        let entry = store.entries.peek(&document_key(document_id))?;
        match &entry.data {
            CachePayload::Document(info) if !entry.is_expired(Instant::now()) => Some(info.clone()),
            _ => None,
        }
    }

    /// Remove every entry belonging to `document_id`; returns the count removed
    pub async fn invalidate_document(&self, document_id: &str) -> usize {
        let mut store = self.inner.store.write().await;
        let keys_to_remove: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.metadata.document_id == document_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys_to_remove {
            store.remove(key);
        }

        tracing::debug!(document_id, removed = keys_to_remove.len(), "Invalidated document");
        keys_to_remove.len()
    }

    pub async fn invalidate_page(&self, document_id: &str, page: u32) -> bool {
        let mut store = self.inner.store.write().await;
        store.remove(&page_key(document_id, page)).is_some()
    }

    /// Drop all entries and reset counters
    pub async fn clear_cache(&self) {
        let mut store = self.inner.store.write().await;
        *store = CacheStore::new();
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let config = self.config();
        let store = self.inner.store.read().await;
        let entries = store.entries.len();
        let page_entries = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.metadata.page_number.is_some())
            .count();
        let lookups = store.hits + store.misses;

        CacheStats {
            entries,
            page_entries,
            document_entries: entries - page_entries,
            memory_usage_bytes: store.memory_usage,
            max_memory_bytes: config.max_memory_bytes,
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                store.hits as f64 / lookups as f64 * 100.0
            },
            average_entry_size: if entries == 0 {
                0
            } else {
                store.memory_usage / entries
            },
            browser_strategy: config.browser_strategy,
        }
    }

    /// hits / (hits + misses) * 100
    pub async fn get_cache_efficiency(&self) -> f64 {
        self.get_cache_stats().await.hit_rate
    }

    pub async fn memory_usage(&self) -> usize {
        self.inner.store.read().await.memory_usage
    }

    /// Total access count per document, used as a popularity signal
    pub async fn document_access_counts(&self) -> HashMap<String, u64> {
        let store = self.inner.store.read().await;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for (_, entry) in store.entries.iter() {
            *counts.entry(entry.metadata.document_id.clone()).or_default() += entry.access_count;
        }
        counts
    }

    /// Drop expired entries and entries accessed less than `min_access_count` times
    pub async fn optimize_cache(&self) -> OptimizeReport {
        let min_access_count = self.inner.config.read().min_access_count as u64;
        let now = Instant::now();
        let mut report = OptimizeReport::default();

        let mut store = self.inner.store.write().await;
        let candidates: Vec<(String, bool)> = store
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                if entry.is_expired(now) {
                    Some((key.clone(), true))
                } else if entry.access_count < min_access_count {
                    Some((key.clone(), false))
                } else {
                    None
                }
            })
            .collect();

        for (key, expired) in candidates {
            if let Some(entry) = store.remove(&key) {
                report.bytes_freed += entry.size;
                if expired {
                    report.expired_removed += 1;
                } else {
                    report.low_frequency_removed += 1;
                }
            }
        }

        tracing::debug!(
            expired = report.expired_removed,
            low_frequency = report.low_frequency_removed,
            bytes_freed = report.bytes_freed,
            "Cache optimized"
        );
        report
    }

    /// Apply a configuration change; shrinking the budget evicts immediately
    pub async fn update_config(&self, update: CacheConfigUpdate) {
        let budget = {
            let mut config = self.inner.config.write();
            if let Some(max) = update.max_memory_bytes {
                config.max_memory_bytes = max;
            }
            if let Some(ttl) = update.page_ttl {
                config.page_ttl = ttl;
            }
            if let Some(strategy) = update.browser_strategy {
                config.browser_strategy = strategy;
            }
            config.max_memory_bytes
        };

        let mut store = self.inner.store.write().await;
        let freed = store.make_room(0, budget);
        if freed > 0 {
            tracing::debug!(freed, budget, "Evicted entries after budget change");
        }
    }

    /// Browser-tier headers for the configured strategy
    pub fn get_browser_cache_headers(&self, content_type: &str) -> CacheHeaders {
        let strategy = self.inner.config.read().browser_strategy;
        browser_headers(strategy, content_type, content_type.as_bytes(), Utc::now())
    }

    /// Browser-tier headers with a validator derived from the cached page
    pub fn browser_headers_for_page(&self, page: &CachedPage) -> CacheHeaders {
        let strategy = self.inner.config.read().browser_strategy;
        browser_headers(strategy, &page.content_type, &page.data, Utc::now())
    }

    pub fn get_cdn_cache_headers(&self) -> CacheHeaders {
        cdn_headers()
    }

    /// Run `optimize_cache` on the configured interval until `destroy`
    pub fn start_maintenance(&self) {
        let mut maintenance = self.inner.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        let interval = self.inner.config.read().optimize_interval;
        let weak = Arc::downgrade(&self.inner);

        *maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                DocumentCacheManager { inner }.optimize_cache().await;
            }
        }));
    }

    /// Stop background maintenance and drop every entry
    pub async fn destroy(&self) {
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        self.clear_cache().await;
        tracing::debug!("Document cache destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BrowserCacheStrategy;
    use std::time::Duration;

    fn manager(max_memory_bytes: usize) -> DocumentCacheManager {
        DocumentCacheManager::new(CacheConfig {
            max_memory_bytes,
            page_ttl: Duration::from_secs(60),
            min_access_count: 2,
            browser_strategy: BrowserCacheStrategy::Conservative,
            optimize_interval: Duration::from_secs(300),
        })
    }

    fn info(document_id: &str) -> DocumentInfo {
        DocumentInfo {
            document_id: document_id.to_string(),
            url: format!("https://cdn.example.com/{}.pdf", document_id),
            page_count: 12,
            size_bytes: 4096,
            title: None,
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_set_then_get_page() {
        let cache = manager(1024);
        assert!(cache.set_page_cache("doc", 1, vec![7; 32], "image/png", 1).await);

        let page = cache.get_page_cache("doc", 1).await.unwrap();
        assert_eq!(page.data.as_slice(), &[7; 32]);
        assert_eq!(page.content_type, "image/png");
        assert!(cache.get_page_cache("doc", 2).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_expires_after_ttl() {
        let cache = manager(1024);
        cache.set_page_cache("doc", 1, vec![1; 8], "image/png", 1).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get_page_cache("doc", 1).await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get_page_cache("doc", 1).await.is_none());
        assert_eq!(cache.get_cache_stats().await.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_ttl_is_twice_page_ttl() {
        let cache = manager(4096);
        cache.set_document_cache(info("doc")).await;

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(cache.get_document_cache("doc").await.is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.get_document_cache("doc").await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_on_budget() {
        let cache = manager(100);
        cache.set_page_cache("doc", 1, vec![0; 40], "image/png", 1).await;
        cache.set_page_cache("doc", 2, vec![0; 40], "image/png", 1).await;

        // Touch page 1 so page 2 becomes least recently used
        cache.get_page_cache("doc", 1).await;
        cache.set_page_cache("doc", 3, vec![0; 40], "image/png", 1).await;

        assert!(cache.contains_page("doc", 1).await);
        assert!(!cache.contains_page("doc", 2).await);
        assert!(cache.contains_page("doc", 3).await);

        let stats = cache.get_cache_stats().await;
        assert_eq!(stats.evictions, 1);
        assert!(stats.memory_usage_bytes <= 100);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let cache = manager(16);
        assert!(!cache.set_page_cache("doc", 1, vec![0; 32], "image/png", 1).await);
        assert_eq!(cache.memory_usage().await, 0);
    }

    #[tokio::test]
    async fn test_replacing_entry_keeps_accounting() {
        let cache = manager(1024);
        cache.set_page_cache("doc", 1, vec![0; 100], "image/png", 1).await;
        cache.set_page_cache("doc", 1, vec![0; 50], "image/png", 2).await;
        assert_eq!(cache.memory_usage().await, 50);
        assert_eq!(cache.get_page_cache("doc", 1).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_invalidate_document_only_touches_that_document() {
        let cache = manager(4096);
        cache.set_page_cache("a", 1, vec![0; 10], "image/png", 1).await;
        cache.set_page_cache("a", 2, vec![0; 10], "image/png", 1).await;
        cache.set_document_cache(info("a")).await;
        cache.set_page_cache("b", 1, vec![0; 10], "image/png", 1).await;
        cache.set_page_cache("ab", 1, vec![0; 10], "image/png", 1).await;

        assert_eq!(cache.invalidate_document("a").await, 3);
        assert!(!cache.contains_page("a", 1).await);
        assert!(cache.get_document_cache("a").await.is_none());
        assert!(cache.contains_page("b", 1).await);
        assert!(cache.contains_page("ab", 1).await);
    }

    #[tokio::test]
    async fn test_invalidate_page() {
        let cache = manager(1024);
        cache.set_page_cache("doc", 1, vec![0; 10], "image/png", 1).await;
        assert!(cache.invalidate_page("doc", 1).await);
        assert!(!cache.invalidate_page("doc", 1).await);
    }

    #[tokio::test]
    async fn test_efficiency() {
        let cache = manager(1024);
        cache.set_page_cache("doc", 1, vec![0; 10], "image/png", 1).await;
        cache.get_page_cache("doc", 1).await;
        cache.get_page_cache("doc", 1).await;
        cache.get_page_cache("doc", 1).await;
        cache.get_page_cache("doc", 9).await;

        assert!((cache.get_cache_efficiency().await - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimize_removes_expired_and_cold_entries() {
        let cache = manager(4096);
        cache.set_page_cache("doc", 1, vec![0; 10], "image/png", 1).await;
        cache.set_page_cache("doc", 2, vec![0; 10], "image/png", 1).await;
        cache.get_page_cache("doc", 2).await;
        cache.get_page_cache("doc", 2).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.set_page_cache("doc", 3, vec![0; 10], "image/png", 1).await;
        cache.get_page_cache("doc", 3).await;
        cache.get_page_cache("doc", 3).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = cache.optimize_cache().await;

        // Page 1 and 2 expired, page 3 is live and warm
        assert_eq!(report.expired_removed, 2);
        assert_eq!(report.low_frequency_removed, 0);
        assert!(cache.contains_page("doc", 3).await);

        cache.set_page_cache("doc", 4, vec![0; 10], "image/png", 1).await;
        let report = cache.optimize_cache().await;
        assert_eq!(report.low_frequency_removed, 1);
    }

    #[tokio::test]
    async fn test_shrinking_budget_evicts() {
        let cache = manager(1000);
        for page in 1..=5 {
            cache.set_page_cache("doc", page, vec![0; 100], "image/png", 1).await;
        }
        cache
            .update_config(CacheConfigUpdate {
                max_memory_bytes: Some(250),
                ..Default::default()
            })
            .await;

        let stats = cache.get_cache_stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.max_memory_bytes, 250);
        assert!(cache.contains_page("doc", 5).await);
    }

    #[tokio::test]
    async fn test_headers_follow_strategy() {
        let cache = manager(1024);
        let headers = cache.get_browser_cache_headers("image/png");
        assert!(headers.get("ETag").is_some());

        cache
            .update_config(CacheConfigUpdate {
                browser_strategy: Some(BrowserCacheStrategy::Aggressive),
                ..Default::default()
            })
            .await;
        let headers = cache.get_browser_cache_headers("image/png");
        assert!(headers.get("Expires").is_some());

        let cdn = cache.get_cdn_cache_headers();
        assert!(cdn.get("Cache-Control").unwrap().contains("2592000"));
    }

    #[tokio::test]
    async fn test_destroy_clears() {
        let cache = manager(1024);
        cache.start_maintenance();
        cache.set_page_cache("doc", 1, vec![0; 10], "image/png", 1).await;
        cache.destroy().await;
        assert_eq!(cache.get_cache_stats().await.entries, 0);
    }
}
