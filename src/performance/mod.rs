//! Performance optimization
//!
//! Canvas pooling plus an optimizer that tunes pool size, retry timing and
//! progress frequency from observed render outcomes, and picks the initial
//! rendering method for a document.

mod optimizer;
mod pool;
mod types;

pub use optimizer::{CharacteristicsKey, MethodLearningCache, PerformanceOptimizer};
pub use pool::{Canvas, CanvasFactory, CanvasPool, CanvasPoolStats, DefaultCanvasFactory, PooledCanvas};
pub use types::{
    AdaptiveConfig, MemoryPressure, PerformanceConfig, PerformanceSample, RetryTiming,
};
