//! Adaptive cache tuning, predictive preloading and warming

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::behavior::BehaviorTracker;
use super::types::{
    BehaviorUpdate, CacheStrategyDecision, OptimizationConfig, PagePreloader, PreloadReport,
    UserBehaviorPattern, WarmReport,
};
use crate::cache::{BrowserCacheStrategy, CacheConfig, CacheConfigUpdate, DocumentCacheManager};
use crate::network::NetworkCondition;

/// Load times kept for the average used by recommendations
const LOAD_TIME_WINDOW: usize = 100;

struct ServiceInner {
    cache: DocumentCacheManager,
    preloader: Option<Arc<dyn PagePreloader>>,
    config: OptimizationConfig,
    /// Cache configuration before any adaptive change
    baseline: CacheConfig,
    behavior: Mutex<BehaviorTracker>,
    downlink_mbps: RwLock<Option<f64>>,
    load_times: Mutex<VecDeque<Duration>>,
    warming: Mutex<Option<JoinHandle<()>>>,
}

/// Tunes a `DocumentCacheManager` from observed behavior
///
/// Cloning shares state. Without a preloader, preloading and warming only
/// report what they would have done.
#[derive(Clone)]
pub struct CacheOptimizationService {
    inner: Arc<ServiceInner>,
}

impl CacheOptimizationService {
    pub fn new(
        cache: DocumentCacheManager,
        config: OptimizationConfig,
        preloader: Option<Arc<dyn PagePreloader>>,
    ) -> Self {
        let baseline = cache.config();
        let behavior = BehaviorTracker::new(
            config.max_patterns,
            config.max_popular_documents,
            config.max_page_history,
        );

        Self {
            inner: Arc::new(ServiceInner {
                cache,
                preloader,
                config,
                baseline,
                behavior: Mutex::new(behavior),
                downlink_mbps: RwLock::new(None),
                load_times: Mutex::new(VecDeque::new()),
                warming: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.inner.config
    }

    pub fn record_network_measurement(&self, downlink_mbps: f64) {
        if downlink_mbps.is_finite() && downlink_mbps >= 0.0 {
            *self.inner.downlink_mbps.write() = Some(downlink_mbps);
        }
    }

    /// Moderate until a measurement is recorded
    pub fn network_condition(&self) -> NetworkCondition {
        self.inner
            .downlink_mbps
            .read()
            .map(NetworkCondition::from_downlink_mbps)
            .unwrap_or_default()
    }

    pub fn record_load_time(&self, duration: Duration) {
        let mut load_times = self.inner.load_times.lock();
        load_times.push_back(duration);
        while load_times.len() > LOAD_TIME_WINDOW {
            load_times.pop_front();
        }
    }

    fn average_load_time(&self) -> Option<Duration> {
        let load_times = self.inner.load_times.lock();
        if load_times.is_empty() {
            return None;
        }
        let total: Duration = load_times.iter().sum();
        Some(total / load_times.len() as u32)
    }

    pub fn update_user_behavior_pattern(&self, update: BehaviorUpdate) {
        self.inner.behavior.lock().record(&update);
        tracing::trace!(
            user = %update.user_id,
            document = %update.document_id,
            page = update.page,
            "Recorded page view"
        );
    }

    pub fn user_behavior_pattern(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Option<UserBehaviorPattern> {
        self.inner
            .behavior
            .lock()
            .pattern(user_id, document_id)
            .cloned()
    }

    pub fn document_popularity(&self, document_id: &str) -> u64 {
        self.inner.behavior.lock().popularity(document_id)
    }

    /// Adjust the cache budget, TTL and browser strategy for a document view
    pub async fn optimize_cache_strategy(
        &self,
        document_id: &str,
        user_id: Option<&str>,
    ) -> CacheStrategyDecision {
        let condition = self.network_condition();
        let baseline = &self.inner.baseline;
        let config = &self.inner.config;

        let (mut max_memory_bytes, mut page_ttl, browser_strategy) = match condition {
            NetworkCondition::Slow => (
                baseline.max_memory_bytes.saturating_mul(2),
                baseline.page_ttl * 2,
                BrowserCacheStrategy::Aggressive,
            ),
            NetworkCondition::Moderate => (
                baseline.max_memory_bytes,
                baseline.page_ttl,
                baseline.browser_strategy,
            ),
            NetworkCondition::Fast => (
                baseline.max_memory_bytes / 2,
                baseline.page_ttl / 2,
                BrowserCacheStrategy::Conservative,
            ),
        };

        let (frequent_user, popular_document) = {
            let behavior = self.inner.behavior.lock();
            let frequent = user_id
                .and_then(|user| behavior.pattern(user, document_id))
                .is_some_and(|p| p.access_count >= config.frequent_user_threshold);
            let popular = behavior.popularity(document_id) >= config.popularity_threshold;
            (frequent, popular)
        };

        if frequent_user {
            max_memory_bytes = max_memory_bytes.saturating_mul(3) / 2;
            page_ttl *= 2;
        }
        if popular_document {
            page_ttl = page_ttl.mul_f64(1.5);
        }

        self.inner
            .cache
            .update_config(CacheConfigUpdate {
                max_memory_bytes: Some(max_memory_bytes),
                page_ttl: Some(page_ttl),
                browser_strategy: Some(browser_strategy),
            })
            .await;

        tracing::info!(
            document = %document_id,
            condition = ?condition,
            max_memory_bytes,
            ttl_secs = page_ttl.as_secs(),
            strategy = browser_strategy.as_str(),
            "Cache strategy adjusted"
        );

        CacheStrategyDecision {
            document_id: document_id.to_string(),
            network_condition: condition,
            max_memory_bytes,
            page_ttl_secs: page_ttl.as_secs(),
            browser_strategy,
            frequent_user,
            popular_document,
        }
    }

    /// Pages worth rendering next, most likely first
    ///
    /// Sequential neighbours come first, then this user's observed
    /// transitions, then the document's most viewed pages. The current page
    /// and pages past the known page count are never returned.
    pub async fn predictive_preload(
        &self,
        document_id: &str,
        current_page: u32,
        user_id: Option<&str>,
    ) -> Vec<u32> {
        let limit = self.inner.config.max_preload_pages;
        let page_count = self
            .inner
            .cache
            .peek_document(document_id)
            .await
            .map(|info| info.page_count)
            .filter(|&count| count > 0);

        let mut candidates: Vec<u32> = [
            current_page.checked_add(1),
            current_page.checked_sub(1),
            current_page.checked_add(2),
            current_page.checked_add(3),
        ]
        .into_iter()
        .flatten()
        .collect();

        {
            let behavior = self.inner.behavior.lock();
            if let Some(pattern) = user_id.and_then(|user| behavior.pattern(user, document_id)) {
                candidates.extend(pattern.likely_next_pages(current_page));
            }
            candidates.extend(behavior.popular_pages(document_id));
        }

        let mut pages = Vec::with_capacity(limit);
        for page in candidates {
            if pages.len() >= limit {
                break;
            }
            let in_range = page >= 1 && page_count.map_or(true, |count| page <= count);
            if in_range && page != current_page && !pages.contains(&page) {
                pages.push(page);
            }
        }
        pages
    }

    /// Render pages missing from the memory tier
    pub async fn preload_pages(&self, document_id: &str, pages: &[u32]) -> PreloadReport {
        let mut report = PreloadReport {
            requested: pages.len(),
            ..PreloadReport::default()
        };

        for &page in pages {
            if self.inner.cache.contains_page(document_id, page).await {
                report.already_cached += 1;
                continue;
            }
            let Some(preloader) = &self.inner.preloader else {
                continue;
            };
            match preloader.preload_page(document_id, page).await {
                Ok(()) => report.preloaded += 1,
                Err(e) => {
                    tracing::warn!(document = %document_id, page, "Preload failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            document = %document_id,
            requested = report.requested,
            preloaded = report.preloaded,
            "Preload finished"
        );
        report
    }

    /// Preload the leading pages of every popular document
    pub async fn warm_popular_documents(&self) -> WarmReport {
        let popular = self
            .inner
            .behavior
            .lock()
            .popular_documents(self.inner.config.popularity_threshold);

        let mut report = WarmReport::default();
        for (document_id, _) in popular {
            let page_count = self
                .inner
                .cache
                .peek_document(&document_id)
                .await
                .map(|info| info.page_count)
                .filter(|&count| count > 0);
            let last = page_count
                .map_or(self.inner.config.warm_pages, |count| {
                    count.min(self.inner.config.warm_pages)
                });
            if last == 0 {
                continue;
            }

            let pages: Vec<u32> = (1..=last).collect();
            report.pages.merge(self.preload_pages(&document_id, &pages).await);
            report.documents += 1;
        }

        if report.documents > 0 {
            tracing::info!(
                documents = report.documents,
                preloaded = report.pages.preloaded,
                failed = report.pages.failed,
                "Cache warmed"
            );
        }
        report
    }

    /// Human-readable tuning advice for the current cache state
    pub async fn get_cache_recommendations(&self) -> Vec<String> {
        let config = &self.inner.config;
        let stats = self.inner.cache.get_cache_stats().await;
        let mut recommendations = Vec::new();

        if stats.hits + stats.misses >= config.min_lookups_for_hit_rate
            && stats.hit_rate < config.low_hit_rate
        {
            recommendations.push(format!(
                "Cache hit rate is {:.1}%. Enable predictive preloading or lengthen the page TTL.",
                stats.hit_rate
            ));
        }

        if stats.max_memory_bytes > 0 {
            let ratio = stats.memory_usage_bytes as f64 / stats.max_memory_bytes as f64;
            if ratio >= config.high_memory_ratio {
                recommendations.push(format!(
                    "Memory cache is {:.0}% full. Raise the memory budget or shorten the page TTL.",
                    ratio * 100.0
                ));
            }
        }

        if let Some(average) = self.average_load_time() {
            if average >= config.slow_load_time {
                recommendations.push(format!(
                    "Average page load time is {} ms. Preload upcoming pages or prefer server conversion for heavy documents.",
                    average.as_millis()
                ));
            }
        }

        if let Some(downlink) = *self.inner.downlink_mbps.read() {
            if downlink < config.slow_network_mbps {
                recommendations.push(format!(
                    "Network downlink is {:.1} Mbit/s. Use the aggressive browser cache strategy.",
                    downlink
                ));
            }
        }

        recommendations
    }

    /// Run `warm_popular_documents` on the configured interval until `destroy`
    pub fn start_warming(&self) {
        let mut warming = self.inner.warming.lock();
        if warming.is_some() {
            return;
        }
        let interval = self.inner.config.warm_interval;
        let weak = Arc::downgrade(&self.inner);

        *warming = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CacheOptimizationService { inner }
                    .warm_popular_documents()
                    .await;
            }
        }));
    }

    /// Stop warming and forget all behavior
    pub async fn destroy(&self) {
        if let Some(handle) = self.inner.warming.lock().take() {
            handle.abort();
        }
        self.inner.behavior.lock().clear();
        self.inner.load_times.lock().clear();
        *self.inner.downlink_mbps.write() = None;
        tracing::debug!("Cache optimization service destroyed");
    }
}
