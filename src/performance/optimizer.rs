//! Adaptive performance optimizer
//!
//! Keeps a bounded history of render outcomes and derives the adaptive
//! configuration (canvas pool size, retry multiplier, progress interval)
//! from it. Method selection combines fixed rules over the environment and
//! document with a bounded learning cache of past outcomes.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use super::pool::CanvasPool;
use super::types::{
    AdaptiveConfig, MemoryPressure, PerformanceConfig, PerformanceSample, RetryTiming,
};
use crate::diagnostics::{BrowserEnvironment, DeviceType};
use crate::network::NetworkCondition;
use crate::renderer::{ContentComplexity, DocumentCharacteristics, RenderingMethod};

/// Samples needed before a learned method overrides the rules
const MIN_LEARNED_SAMPLES: u32 = 2;
/// Render-time penalty per megabyte of memory, in milliseconds
const MEMORY_WEIGHT_MS_PER_MB: f64 = 2.0;

/// Bucketed characteristics used as the learning-cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicsKey {
    size_bucket: u8,
    page_bucket: u8,
    complexity: ContentComplexity,
    image_heavy: bool,
}

impl CharacteristicsKey {
    pub fn from_characteristics(characteristics: &DocumentCharacteristics) -> Self {
        Self::new(
            characteristics.size_bytes,
            characteristics.page_count,
            characteristics.complexity,
            characteristics.image_heavy,
        )
    }

    fn new(size_bytes: u64, page_count: u32, complexity: ContentComplexity, image_heavy: bool) -> Self {
        Self {
            size_bucket: log2_bucket(size_bytes / (256 * 1024)),
            page_bucket: log2_bucket(page_count as u64),
            complexity,
            image_heavy,
        }
    }
}

fn log2_bucket(value: u64) -> u8 {
    (64 - value.leading_zeros()) as u8
}

#[derive(Debug, Clone, Copy, Default)]
struct MethodOutcomes {
    successes: u32,
    failures: u32,
    total_render_ms: f64,
    total_memory_mb: f64,
}

impl MethodOutcomes {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    /// Lower is better
    fn score(&self) -> f64 {
        let n = self.successes.max(1) as f64;
        self.total_render_ms / n + MEMORY_WEIGHT_MS_PER_MB * self.total_memory_mb / n
    }
}

/// Bounded cache of (characteristics → method → outcome) observations
pub struct MethodLearningCache {
    entries: LruCache<CharacteristicsKey, HashMap<RenderingMethod, MethodOutcomes>>,
}

impl MethodLearningCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn record_outcome(&mut self, key: CharacteristicsKey, sample: &PerformanceSample) {
        let outcomes = self.entries.get_or_insert_mut(key, HashMap::new);
        let entry = outcomes.entry(sample.method).or_default();
        if sample.success {
            entry.successes += 1;
            entry.total_render_ms += sample.render_time.as_secs_f64() * 1000.0;
            entry.total_memory_mb += sample.memory_bytes as f64 / (1024.0 * 1024.0);
        } else {
            entry.failures += 1;
        }
    }

    /// Best observed method among those allowed, if enough evidence exists
    pub fn best_method(
        &mut self,
        key: &CharacteristicsKey,
        allowed: impl Fn(RenderingMethod) -> bool,
    ) -> Option<RenderingMethod> {
        let outcomes = self.entries.get(key)?;
        outcomes
            .iter()
            .filter(|(method, stats)| {
                allowed(**method)
                    && stats.successes >= MIN_LEARNED_SAMPLES
                    && stats.success_rate() >= 0.5
            })
            .min_by(|a, b| a.1.score().total_cmp(&b.1.score()))
            .map(|(method, _)| *method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct OptimizerInner {
    config: PerformanceConfig,
    environment: BrowserEnvironment,
    server_conversion_available: bool,
    pool: CanvasPool,
    adaptive: RwLock<AdaptiveConfig>,
    history: Mutex<VecDeque<PerformanceSample>>,
    learning: Mutex<MethodLearningCache>,
    retry_timings: Mutex<HashMap<(u8, NetworkCondition), RetryTiming>>,
    progress_intervals: Mutex<HashMap<ContentComplexity, Duration>>,
}

/// Thread-safe adaptive optimizer
#[derive(Clone)]
pub struct PerformanceOptimizer {
    inner: Arc<OptimizerInner>,
}

impl PerformanceOptimizer {
    pub fn new(
        config: PerformanceConfig,
        environment: BrowserEnvironment,
        pool: CanvasPool,
        server_conversion_available: bool,
    ) -> Self {
        pool.resize(config.initial_pool_size);
        let adaptive = AdaptiveConfig {
            canvas_pool_size: config.initial_pool_size,
            retry_multiplier: 1.0,
            progress_update_interval: Duration::from_millis(50)
                .clamp(config.min_progress_interval, config.max_progress_interval),
        };

        Self {
            inner: Arc::new(OptimizerInner {
                learning: Mutex::new(MethodLearningCache::new(config.learning_cache_size)),
                history: Mutex::new(VecDeque::with_capacity(config.history_size)),
                adaptive: RwLock::new(adaptive),
                retry_timings: Mutex::new(HashMap::new()),
                progress_intervals: Mutex::new(HashMap::new()),
                config,
                environment,
                server_conversion_available,
                pool,
            }),
        }
    }

    pub fn adaptive_config(&self) -> AdaptiveConfig {
        self.inner.adaptive.read().clone()
    }

    pub fn canvas_pool(&self) -> &CanvasPool {
        &self.inner.pool
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    /// Record an attempt outcome and retune the adaptive configuration
    pub fn record_performance(&self, sample: PerformanceSample) {
        let key = CharacteristicsKey::new(
            sample.size_bytes,
            sample.page_count,
            sample.complexity,
            sample.image_heavy,
        );
        self.inner.learning.lock().record_outcome(key, &sample);

        let (failure_rate, average_render) = {
            let mut history = self.inner.history.lock();
            if history.len() >= self.inner.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(sample);

            let failures = history.iter().filter(|s| !s.success).count();
            let successes: Vec<&PerformanceSample> = history.iter().filter(|s| s.success).collect();
            let average = if successes.is_empty() {
                None
            } else {
                let total: Duration = successes.iter().map(|s| s.render_time).sum();
                Some(total / successes.len() as u32)
            };
            (failures as f64 / history.len() as f64, average)
        };

        self.retune(failure_rate, average_render);
    }

    fn retune(&self, failure_rate: f64, average_render: Option<Duration>) {
        let config = &self.inner.config;
        let stats = self.inner.pool.stats();

        let mut adaptive = self.inner.adaptive.write();

        adaptive.retry_multiplier = (1.0 + failure_rate * 2.0).clamp(1.0, 3.0);

        // Grow the pool when demand saturated it and memory allows
        let low_memory = self.inner.environment.available_memory_mb < config.low_memory_threshold_mb;
        if stats.peak_active >= adaptive.canvas_pool_size
            && !low_memory
            && adaptive.canvas_pool_size < config.max_pool_size
        {
            adaptive.canvas_pool_size += 1;
            self.inner.pool.resize(adaptive.canvas_pool_size);
            self.inner.pool.reset_peak();
            tracing::debug!(size = adaptive.canvas_pool_size, "Canvas pool grown");
        }

        if let Some(average) = average_render {
            // Slow renders update less often
            adaptive.progress_update_interval = (average / 20)
                .clamp(config.min_progress_interval, config.max_progress_interval);
        }
    }

    fn method_available(&self, method: RenderingMethod) -> bool {
        let capabilities = &self.inner.environment.capabilities;
        match method {
            RenderingMethod::Canvas | RenderingMethod::ImageBased => capabilities.canvas,
            RenderingMethod::NativeViewer => capabilities.native_pdf_viewer,
            RenderingMethod::ServerConversion => self.inner.server_conversion_available,
            RenderingMethod::DownloadFallback => false,
        }
    }

    fn rule_based_method(&self, characteristics: &DocumentCharacteristics) -> RenderingMethod {
        let config = &self.inner.config;
        let environment = &self.inner.environment;
        let large = characteristics.size_bytes >= config.large_document_bytes;
        let low_memory = environment.available_memory_mb < config.low_memory_threshold_mb;

        if !environment.capabilities.canvas {
            return if environment.capabilities.native_pdf_viewer {
                RenderingMethod::NativeViewer
            } else if self.inner.server_conversion_available {
                RenderingMethod::ServerConversion
            } else {
                RenderingMethod::DownloadFallback
            };
        }

        if large && characteristics.image_heavy && self.inner.server_conversion_available {
            return RenderingMethod::ServerConversion;
        }

        if low_memory || (environment.device_type == DeviceType::Mobile && large) {
            return RenderingMethod::ImageBased;
        }

        RenderingMethod::Canvas
    }

    /// Choose the initial method for a document
    ///
    /// Rules decide unless the learning cache has enough successful
    /// observations for these characteristics.
    pub fn select_optimal_method_with_learning(
        &self,
        characteristics: &DocumentCharacteristics,
    ) -> RenderingMethod {
        let rule = self.rule_based_method(characteristics);
        let key = CharacteristicsKey::from_characteristics(characteristics);
        let learned = self
            .inner
            .learning
            .lock()
            .best_method(&key, |method| self.method_available(method));

        match learned {
            Some(method) if method != rule => {
                tracing::debug!(rule = %rule, learned = %method, "Learned method overrides rules");
                method
            }
            _ => rule,
        }
    }

    /// Retry schedule for a document size and network condition
    pub fn tune_retry_timing(&self, size_bytes: u64, condition: NetworkCondition) -> RetryTiming {
        let bucket = log2_bucket(size_bytes / (1024 * 1024));
        let config = &self.inner.config;

        *self
            .inner
            .retry_timings
            .lock()
            .entry((bucket, condition))
            .or_insert_with(|| {
                let network_factor = match condition {
                    NetworkCondition::Slow => 2.0,
                    NetworkCondition::Moderate => 1.0,
                    NetworkCondition::Fast => 0.5,
                };
                let size_factor = 1.0 + bucket as f64 / 4.0;
                RetryTiming {
                    base_delay: config
                        .base_retry_delay
                        .mul_f64(network_factor * size_factor)
                        .clamp(config.min_retry_delay, config.max_retry_delay),
                    max_delay: config.max_retry_delay,
                    backoff_factor: 2.0,
                }
            })
    }

    /// Delay before retry `retry` (0-based), including the adaptive multiplier
    pub fn retry_delay(&self, timing: &RetryTiming, retry: u32) -> Duration {
        timing.delay_for(retry, self.inner.adaptive.read().retry_multiplier)
    }

    /// Progress callback interval for a content complexity
    pub fn optimize_progress_update_frequency(&self, complexity: ContentComplexity) -> Duration {
        let config = &self.inner.config;
        let interval = *self
            .inner
            .progress_intervals
            .lock()
            .entry(complexity)
            .or_insert_with(|| {
                let base = match complexity {
                    ContentComplexity::Low => Duration::from_millis(50),
                    ContentComplexity::Medium => Duration::from_millis(100),
                    ContentComplexity::High => Duration::from_millis(200),
                };
                base.clamp(config.min_progress_interval, config.max_progress_interval)
            });

        self.inner.adaptive.write().progress_update_interval = interval;
        interval
    }

    /// Expected render time; never decreases with size or page count
    pub fn estimate_render_time(
        &self,
        characteristics: &DocumentCharacteristics,
        method: RenderingMethod,
    ) -> Duration {
        let (base_ms, per_page_ms, per_mb_ms) = match method {
            RenderingMethod::Canvas => (50.0, 120.0, 15.0),
            RenderingMethod::ImageBased => (50.0, 80.0, 10.0),
            RenderingMethod::NativeViewer => (20.0, 5.0, 2.0),
            RenderingMethod::ServerConversion => (300.0, 150.0, 5.0),
            RenderingMethod::DownloadFallback => (0.0, 0.0, 0.0),
        };
        let complexity = match characteristics.complexity {
            ContentComplexity::Low => 1.0,
            ContentComplexity::Medium => 1.5,
            ContentComplexity::High => 2.5,
        };
        let ms = base_ms
            + complexity
                * (per_page_ms * characteristics.page_count as f64
                    + per_mb_ms * characteristics.size_mb());
        Duration::from_secs_f64(ms / 1000.0)
    }

    /// Release canvases under memory pressure; returns the new pool size
    pub fn handle_memory_pressure(&self, pressure: MemoryPressure) -> usize {
        let config = &self.inner.config;
        let mut adaptive = self.inner.adaptive.write();
        let size = match pressure {
            MemoryPressure::Normal => return adaptive.canvas_pool_size,
            MemoryPressure::Moderate => (adaptive.canvas_pool_size / 2).max(config.min_pool_size),
            MemoryPressure::Critical => config.min_pool_size,
        };

        adaptive.canvas_pool_size = size;
        self.inner.pool.resize(size);
        tracing::info!(?pressure, pool_size = size, "Canvas pool shrunk under memory pressure");
        size
    }
}
