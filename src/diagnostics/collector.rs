//! Diagnostics collector keyed by rendering id
//!
//! Records are created by `start_diagnostics`, appended to while the request
//! runs and finalized once by `complete_diagnostics`. A finalized record is
//! purged after `purge_delay` so late readers still see it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::types::{
    AttemptSummary, BrowserEnvironment, DiagnosticsConfig, DiagnosticsReport, PerformanceMetrics,
};
use crate::error::{ErrorKind, ErrorRecord};
use crate::progress::RenderStage;
use crate::renderer::RenderingMethod;

struct DiagnosticsRecord {
    generation: u64,
    url: String,
    start_time: DateTime<Utc>,
    started: Instant,
    end_time: Option<DateTime<Utc>>,
    duration_ms: u64,
    method: Option<RenderingMethod>,
    stage: RenderStage,
    success: bool,
    errors: Vec<ErrorRecord>,
    metrics: PerformanceMetrics,
    methods_attempted: Vec<RenderingMethod>,
    attempts: Vec<AttemptSummary>,
    finalized: bool,
}

impl DiagnosticsRecord {
    fn snapshot(&self, rendering_id: &str, environment: &BrowserEnvironment) -> DiagnosticsReport {
        DiagnosticsReport {
            rendering_id: rendering_id.to_string(),
            url: self.url.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: if self.finalized {
                self.duration_ms
            } else {
                self.started.elapsed().as_millis() as u64
            },
            method: self.method,
            stage: self.stage,
            success: self.success,
            errors: self.errors.clone(),
            metrics: self.metrics,
            methods_attempted: self.methods_attempted.clone(),
            attempts: self.attempts.clone(),
            environment: environment.clone(),
        }
    }
}

/// Thread-safe diagnostics collector
#[derive(Clone)]
pub struct DiagnosticsCollector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    records: Mutex<HashMap<String, DiagnosticsRecord>>,
    environment: BrowserEnvironment,
    config: DiagnosticsConfig,
    generation: AtomicU64,
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self::new(DiagnosticsConfig::default(), BrowserEnvironment::default())
    }
}

impl DiagnosticsCollector {
    pub fn new(config: DiagnosticsConfig, environment: BrowserEnvironment) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                records: Mutex::new(HashMap::new()),
                environment,
                config,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Environment reported in every snapshot
    pub fn environment(&self) -> &BrowserEnvironment {
        &self.inner.environment
    }

    /// Begin a new record, replacing any previous record under `rendering_id`
    pub fn start_diagnostics(&self, rendering_id: &str, url: &str, method: Option<RenderingMethod>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let record = DiagnosticsRecord {
            generation,
            url: url.to_string(),
            start_time: Utc::now(),
            started: Instant::now(),
            end_time: None,
            duration_ms: 0,
            method,
            stage: RenderStage::Initializing,
            success: false,
            errors: Vec::new(),
            metrics: PerformanceMetrics::default(),
            methods_attempted: method.into_iter().collect(),
            attempts: Vec::new(),
            finalized: false,
        };

        self.inner
            .records
            .lock()
            .insert(rendering_id.to_string(), record);

        tracing::debug!(rendering_id, url, "Diagnostics started");
    }

    fn with_open_record(&self, rendering_id: &str, f: impl FnOnce(&mut DiagnosticsRecord)) {
        let mut records = self.inner.records.lock();
        match records.get_mut(rendering_id) {
            Some(record) if !record.finalized => f(record),
            _ => tracing::trace!(rendering_id, "Ignoring diagnostics update for closed record"),
        }
    }

    pub fn update_stage(&self, rendering_id: &str, stage: RenderStage) {
        self.with_open_record(rendering_id, |record| record.stage = stage);
    }

    /// Switch the active method, remembering it in `methods_attempted`
    pub fn record_method(&self, rendering_id: &str, method: RenderingMethod) {
        self.with_open_record(rendering_id, |record| {
            record.method = Some(method);
            if !record.methods_attempted.contains(&method) {
                record.methods_attempted.push(method);
            }
        });
    }

    pub fn record_attempt(
        &self,
        rendering_id: &str,
        attempt_id: &str,
        method: RenderingMethod,
        error_kind: Option<ErrorKind>,
    ) {
        self.with_open_record(rendering_id, |record| {
            record.attempts.push(AttemptSummary {
                rendering_id: attempt_id.to_string(),
                method,
                error_kind,
            });
        });
    }

    /// Add `delta` to the accumulated metrics
    pub fn update_performance_metrics(&self, rendering_id: &str, delta: PerformanceMetrics) {
        self.with_open_record(rendering_id, |record| record.metrics.accumulate(&delta));
    }

    pub fn add_error(&self, rendering_id: &str, error: ErrorRecord) {
        self.with_open_record(rendering_id, |record| {
            tracing::debug!(
                rendering_id,
                kind = %error.kind,
                "Diagnostics error recorded: {}",
                error.message
            );
            record.errors.push(error);
        });
    }

    /// Finalize the record and return its snapshot
    ///
    /// Returns `None` when there is no open record, including when the record
    /// was already completed.
    pub fn complete_diagnostics(&self, rendering_id: &str, success: bool) -> Option<DiagnosticsReport> {
        let (report, generation) = {
            let mut records = self.inner.records.lock();
            let record = records.get_mut(rendering_id)?;
            if record.finalized {
                return None;
            }
            record.finalized = true;
            record.success = success;
            record.end_time = Some(Utc::now());
            record.duration_ms = record.started.elapsed().as_millis() as u64;
            if success {
                record.stage = RenderStage::Complete;
            }
            (
                record.snapshot(rendering_id, &self.inner.environment),
                record.generation,
            )
        };

        self.schedule_purge(rendering_id, generation);

        tracing::debug!(
            rendering_id,
            success,
            duration_ms = report.duration_ms,
            errors = report.errors.len(),
            "Diagnostics completed"
        );

        Some(report)
    }

    /// Read a snapshot without finalizing
    pub fn get_diagnostics(&self, rendering_id: &str) -> Option<DiagnosticsReport> {
        let records = self.inner.records.lock();
        records
            .get(rendering_id)
            .map(|record| record.snapshot(rendering_id, &self.inner.environment))
    }

    /// Drop a record immediately
    pub fn purge(&self, rendering_id: &str) {
        self.inner.records.lock().remove(rendering_id);
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_purge(&self, rendering_id: &str, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let delay = self.inner.config.purge_delay;
        let rendering_id = rendering_id.to_string();

        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                let mut records = inner.records.lock();
                let same_record = records
                    .get(&rendering_id)
                    .map(|r| r.finalized && r.generation == generation)
                    .unwrap_or(false);
                if same_record {
                    records.remove(&rendering_id);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use std::time::Duration;

    fn collector() -> DiagnosticsCollector {
        DiagnosticsCollector::new(
            DiagnosticsConfig {
                purge_delay: Duration::from_secs(10),
            },
            BrowserEnvironment::default(),
        )
    }

    #[tokio::test]
    async fn test_complete_returns_snapshot_once() {
        let diagnostics = collector();
        diagnostics.start_diagnostics("r-1", "https://cdn.example.com/a.pdf", Some(RenderingMethod::Canvas));
        diagnostics.update_stage("r-1", RenderStage::Fetching);

        let report = diagnostics.complete_diagnostics("r-1", true).unwrap();
        assert!(report.success);
        assert_eq!(report.stage, RenderStage::Complete);
        assert_eq!(report.methods_attempted, vec![RenderingMethod::Canvas]);

        assert!(diagnostics.complete_diagnostics("r-1", true).is_none());
        assert!(diagnostics.complete_diagnostics("unknown", true).is_none());
    }

    #[tokio::test]
    async fn test_metrics_accumulate_across_stages() {
        let diagnostics = collector();
        diagnostics.start_diagnostics("r-2", "u", None);
        diagnostics.update_performance_metrics("r-2", PerformanceMetrics::network(Duration::from_millis(100)));
        diagnostics.update_stage("r-2", RenderStage::Parsing);
        diagnostics.update_performance_metrics("r-2", PerformanceMetrics::network(Duration::from_millis(50)));
        diagnostics.update_performance_metrics("r-2", PerformanceMetrics::retry());

        let report = diagnostics.complete_diagnostics("r-2", false).unwrap();
        assert_eq!(report.metrics.network_time_ms, 150);
        assert_eq!(report.metrics.retry_count, 1);
    }

    #[tokio::test]
    async fn test_errors_and_methods_are_appended() {
        let diagnostics = collector();
        diagnostics.start_diagnostics("r-3", "u", Some(RenderingMethod::Canvas));
        diagnostics.add_error(
            "r-3",
            ErrorRecord::from_error(
                &RenderError::Canvas("no context".into()),
                Some(RenderingMethod::Canvas),
                RenderStage::Rendering,
                1,
            ),
        );
        diagnostics.record_method("r-3", RenderingMethod::NativeViewer);
        diagnostics.record_method("r-3", RenderingMethod::Canvas);

        let report = diagnostics.get_diagnostics("r-3").unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            report.methods_attempted,
            vec![RenderingMethod::Canvas, RenderingMethod::NativeViewer]
        );
        assert_eq!(report.method, Some(RenderingMethod::Canvas));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalized_record_is_purged_after_delay() {
        let diagnostics = collector();
        diagnostics.start_diagnostics("r-4", "u", None);
        diagnostics.complete_diagnostics("r-4", true);
        assert!(diagnostics.get_diagnostics("r-4").is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(diagnostics.get_diagnostics("r-4").is_none());
    }

    #[tokio::test]
    async fn test_updates_after_completion_are_ignored() {
        let diagnostics = collector();
        diagnostics.start_diagnostics("r-5", "u", None);
        diagnostics.complete_diagnostics("r-5", false);
        diagnostics.update_performance_metrics("r-5", PerformanceMetrics::retry());

        let report = diagnostics.get_diagnostics("r-5").unwrap();
        assert_eq!(report.metrics.retry_count, 0);
    }
}
