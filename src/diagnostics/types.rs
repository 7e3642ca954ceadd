//! Diagnostics data types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ErrorRecord};
use crate::progress::RenderStage;
use crate::renderer::RenderingMethod;

/// Collector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    /// How long a finalized record stays readable before it is purged
    pub purge_delay: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            purge_delay: Duration::from_secs(60),
        }
    }
}

/// Class of device hosting the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Tablet,
    Mobile,
}

/// Feature support reported by the hosting viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCapabilities {
    pub canvas: bool,
    pub native_pdf_viewer: bool,
    pub web_workers: bool,
    pub streaming: bool,
}

impl Default for BrowserCapabilities {
    fn default() -> Self {
        Self {
            canvas: true,
            native_pdf_viewer: true,
            web_workers: true,
            streaming: true,
        }
    }
}

/// Environment the render runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserEnvironment {
    pub user_agent: String,
    pub device_type: DeviceType,
    /// Memory available to the viewer, in megabytes
    pub available_memory_mb: u32,
    pub hardware_concurrency: u32,
    pub capabilities: BrowserCapabilities,
}

impl Default for BrowserEnvironment {
    fn default() -> Self {
        Self {
            user_agent: format!("amnesia-render/{}", env!("CARGO_PKG_VERSION")),
            device_type: DeviceType::Desktop,
            available_memory_mb: 4096,
            hardware_concurrency: 4,
            capabilities: BrowserCapabilities::default(),
        }
    }
}

/// Performance counters, accumulated additively across stages and attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub network_time_ms: u64,
    pub parse_time_ms: u64,
    pub render_time_ms: u64,
    pub memory_usage_bytes: u64,
    pub retry_count: u32,
}

impl PerformanceMetrics {
    /// Add `delta` into these metrics
    pub fn accumulate(&mut self, delta: &PerformanceMetrics) {
        self.network_time_ms = self.network_time_ms.saturating_add(delta.network_time_ms);
        self.parse_time_ms = self.parse_time_ms.saturating_add(delta.parse_time_ms);
        self.render_time_ms = self.render_time_ms.saturating_add(delta.render_time_ms);
        self.memory_usage_bytes = self
            .memory_usage_bytes
            .saturating_add(delta.memory_usage_bytes);
        self.retry_count = self.retry_count.saturating_add(delta.retry_count);
    }

    pub fn network(duration: Duration) -> Self {
        Self {
            network_time_ms: duration.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn parse(duration: Duration) -> Self {
        Self {
            parse_time_ms: duration.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn render(duration: Duration, memory_usage_bytes: u64) -> Self {
        Self {
            render_time_ms: duration.as_millis() as u64,
            memory_usage_bytes,
            ..Default::default()
        }
    }

    pub fn retry() -> Self {
        Self {
            retry_count: 1,
            ..Default::default()
        }
    }
}

/// One attempt within a render request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSummary {
    pub rendering_id: String,
    pub method: RenderingMethod,
    /// `None` when the attempt succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Immutable diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub rendering_id: String,
    pub url: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub method: Option<RenderingMethod>,
    pub stage: RenderStage,
    pub success: bool,
    pub errors: Vec<ErrorRecord>,
    pub metrics: PerformanceMetrics,
    /// Distinct methods in the order they were first tried
    pub methods_attempted: Vec<RenderingMethod>,
    pub attempts: Vec<AttemptSummary>,
    pub environment: BrowserEnvironment,
}

impl DiagnosticsReport {
    /// Placeholder report for requests that never reached the collector
    pub fn empty(rendering_id: &str, url: &str, environment: BrowserEnvironment) -> Self {
        Self {
            rendering_id: rendering_id.to_string(),
            url: url.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0,
            method: None,
            stage: RenderStage::Initializing,
            success: false,
            errors: Vec::new(),
            metrics: PerformanceMetrics::default(),
            methods_attempted: Vec::new(),
            attempts: Vec::new(),
            environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate() {
        let mut metrics = PerformanceMetrics::network(Duration::from_millis(120));
        metrics.accumulate(&PerformanceMetrics::parse(Duration::from_millis(30)));
        metrics.accumulate(&PerformanceMetrics::render(Duration::from_millis(400), 2048));
        metrics.accumulate(&PerformanceMetrics::network(Duration::from_millis(80)));
        metrics.accumulate(&PerformanceMetrics::retry());

        assert_eq!(metrics.network_time_ms, 200);
        assert_eq!(metrics.parse_time_ms, 30);
        assert_eq!(metrics.render_time_ms, 400);
        assert_eq!(metrics.memory_usage_bytes, 2048);
        assert_eq!(metrics.retry_count, 1);
    }

    #[test]
    fn test_environment_serializes_camel_case() {
        let json = serde_json::to_value(BrowserEnvironment::default()).unwrap();
        assert_eq!(json["deviceType"], "desktop");
        assert_eq!(json["capabilities"]["nativePdfViewer"], true);
    }
}
