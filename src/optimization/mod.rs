//! Cache optimization service
//!
//! Learns from page views and network measurements to tune the document
//! cache: budget and TTL adjustments, predictive preloading of likely next
//! pages, and periodic warming of popular documents.

mod behavior;
mod service;
mod types;

pub use behavior::BehaviorTracker;
pub use service::CacheOptimizationService;
pub use types::{
    BehaviorUpdate, CacheStrategyDecision, OptimizationConfig, PagePreloader, PreloadReport,
    UserBehaviorPattern, WarmReport,
};
