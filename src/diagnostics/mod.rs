//! Diagnostics collection
//!
//! Append-only telemetry per render request: stage transitions, accumulated
//! performance metrics, every error seen and every method attempted. A
//! finalized snapshot is handed to the caller with the render result and the
//! record is purged after a delay.

mod collector;
mod types;

pub use collector::DiagnosticsCollector;
pub use types::{
    AttemptSummary, BrowserCapabilities, BrowserEnvironment, DeviceType, DiagnosticsConfig,
    DiagnosticsReport, PerformanceMetrics,
};
