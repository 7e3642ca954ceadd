//! Progress data types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tracker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// Silence after which an unfinished operation is considered stuck
    pub stuck_detection_threshold: Duration,
    /// Grace period before a finished operation is removed
    pub cleanup_delay: Duration,
    /// Minimum spacing between callback deliveries within one stage
    pub min_update_interval: Duration,
    /// Subscribers of an id that is still not tracked after this long are dropped
    pub orphan_subscription_ttl: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            stuck_detection_threshold: Duration::from_secs(30),
            cleanup_delay: Duration::from_secs(5),
            min_update_interval: Duration::from_millis(50),
            orphan_subscription_ttl: Duration::from_secs(60),
        }
    }
}

/// Render stages, ordered
///
/// `Error` is a terminal state reachable from any stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderStage {
    #[default]
    Initializing,
    Fetching,
    Parsing,
    Rendering,
    Finalizing,
    Complete,
    Error,
}

impl RenderStage {
    /// Percentage band covered by this stage
    pub fn band(self) -> Option<(f64, f64)> {
        match self {
            RenderStage::Initializing => Some((0.0, 10.0)),
            RenderStage::Fetching => Some((10.0, 30.0)),
            RenderStage::Parsing => Some((30.0, 50.0)),
            RenderStage::Rendering => Some((50.0, 90.0)),
            RenderStage::Finalizing => Some((90.0, 100.0)),
            RenderStage::Complete => Some((100.0, 100.0)),
            RenderStage::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RenderStage::Complete | RenderStage::Error)
    }
}

/// Observable progress of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    /// 0-100, never decreasing within one attempt
    pub percentage: f64,
    pub stage: RenderStage,
    pub bytes_loaded: u64,
    /// 0 when unknown
    pub total_bytes: u64,
    pub time_elapsed_ms: u64,
    pub is_stuck: bool,
    pub last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressState {
    /// Fresh state at the start of an attempt
    pub fn initial() -> Self {
        Self::at_stage(RenderStage::Initializing)
    }

    pub fn at_stage(stage: RenderStage) -> Self {
        Self {
            percentage: stage.band().map(|(lo, _)| lo).unwrap_or(0.0),
            stage,
            bytes_loaded: 0,
            total_bytes: 0,
            time_elapsed_ms: 0,
            is_stuck: false,
            last_update: Utc::now(),
            message: None,
        }
    }

    /// Apply a partial update
    ///
    /// Stages only move forward (except into `Error`) and the percentage
    /// never decreases.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if let Some(stage) = update.stage {
            if stage >= self.stage || stage == RenderStage::Error {
                self.stage = stage;
            }
        }
        if let Some(total) = update.total_bytes {
            self.total_bytes = total;
        }
        if let Some(loaded) = update.bytes_loaded {
            self.bytes_loaded = loaded;
        }
        if update.message.is_some() {
            self.message = update.message.clone();
        }

        let target = match update.percentage {
            Some(percentage) => percentage,
            None => match self.stage.band() {
                Some((lo, hi)) => {
                    let fraction = update
                        .stage_progress
                        .or_else(|| self.byte_fraction())
                        .unwrap_or(0.0)
                        .clamp(0.0, 1.0);
                    lo + (hi - lo) * fraction
                }
                None => self.percentage,
            },
        };

        self.percentage = target.clamp(0.0, 100.0).max(self.percentage);
        self.is_stuck = false;
        self.last_update = Utc::now();
    }

    fn byte_fraction(&self) -> Option<f64> {
        if self.stage == RenderStage::Fetching && self.total_bytes > 0 {
            Some(self.bytes_loaded as f64 / self.total_bytes as f64)
        } else {
            None
        }
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Partial progress update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub stage: Option<RenderStage>,
    pub bytes_loaded: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Fraction (0-1) of the current stage that is done
    pub stage_progress: Option<f64>,
    /// Explicit percentage, overrides the stage band
    pub percentage: Option<f64>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn stage(stage: RenderStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn bytes(loaded: u64, total: Option<u64>) -> Self {
        Self {
            stage: Some(RenderStage::Fetching),
            bytes_loaded: Some(loaded),
            total_bytes: total,
            ..Default::default()
        }
    }

    pub fn with_stage_progress(mut self, fraction: f64) -> Self {
        self.stage_progress = Some(fraction);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
