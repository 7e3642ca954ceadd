//! Progress tracking with stuck detection
//!
//! Each operation moves through the render stages with a stage-banded
//! percentage. An operation that receives no update within the stuck
//! threshold is flagged once per episode; `force_retry` resets a stuck
//! operation so the caller can restart it without waiting for a network
//! timeout. Finished operations stay readable for a grace period.

mod tracker;
mod types;

pub use tracker::{ProgressCallback, ProgressTracker, RetryCallback, StuckCallback, SubscriptionId};
pub use types::{ProgressConfig, ProgressState, ProgressUpdate, RenderStage};
