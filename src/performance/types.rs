//! Performance optimizer types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::renderer::{ContentComplexity, RenderingMethod};

/// Optimizer bounds and starting values
#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    pub initial_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Largest canvas (width * height) the default factory will allocate
    pub max_canvas_area: u64,
    /// Samples kept for adaptive tuning
    pub history_size: usize,
    /// Characteristics buckets remembered by the method-learning cache
    pub learning_cache_size: usize,
    pub min_retry_delay: Duration,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub min_progress_interval: Duration,
    pub max_progress_interval: Duration,
    /// Below this much available memory, low-memory methods are preferred
    pub low_memory_threshold_mb: u32,
    /// Documents above this size count as large
    pub large_document_bytes: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            initial_pool_size: 4,
            min_pool_size: 1,
            max_pool_size: 16,
            max_canvas_area: 4096 * 4096,
            history_size: 100,
            learning_cache_size: 128,
            min_retry_delay: Duration::from_millis(100),
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
            min_progress_interval: Duration::from_millis(16),
            max_progress_interval: Duration::from_millis(500),
            low_memory_threshold_mb: 1024,
            large_document_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Configuration tuned from observed history
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveConfig {
    pub canvas_pool_size: usize,
    /// Scales every retry delay; grows with the observed failure rate
    pub retry_multiplier: f64,
    #[serde(with = "duration_ms")]
    pub progress_update_interval: Duration,
}

/// Retry schedule for one (size, network) combination
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryTiming {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryTiming {
    /// Delay before retry number `retry` (0-based), scaled by `multiplier`
    pub fn delay_for(&self, retry: u32, multiplier: f64) -> Duration {
        let factor = self.backoff_factor.powi(retry.min(16) as i32) * multiplier.max(0.0);
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Observed outcome of one render attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSample {
    pub method: RenderingMethod,
    pub size_bytes: u64,
    pub page_count: u32,
    pub complexity: ContentComplexity,
    pub image_heavy: bool,
    pub render_time: Duration,
    pub memory_bytes: u64,
    pub success: bool,
}

/// Host memory pressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Normal,
    Moderate,
    Critical,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let timing = RetryTiming {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };
        assert_eq!(timing.delay_for(0, 1.0), Duration::from_millis(200));
        assert_eq!(timing.delay_for(1, 1.0), Duration::from_millis(400));
        assert_eq!(timing.delay_for(1, 1.5), Duration::from_millis(600));
        assert_eq!(timing.delay_for(5, 1.0), Duration::from_secs(1));
    }
}
