//! Error recovery
//!
//! Classifies failed attempts, decides between retrying, falling back to the
//! next rendering method or giving up, and builds the fresh context each
//! retry runs in.

mod context;
mod policy;

pub use context::RenderContext;
pub use policy::{ErrorRecovery, RecoveryAction, RecoveryState};
