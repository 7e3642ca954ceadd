//! Progress tracker
//!
//! State lives behind a `parking_lot::Mutex`; callbacks are always invoked
//! after the lock is released. Timers (stuck watchdog, delayed cleanup) are
//! tokio tasks and are skipped when no runtime is available.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::{ProgressConfig, ProgressState, ProgressUpdate, RenderStage};

/// Receives every delivered progress state for one operation
pub type ProgressCallback = Arc<dyn Fn(&ProgressState) + Send + Sync>;
/// Fired once per stuck episode with the operation id
pub type StuckCallback = Arc<dyn Fn(&str, &ProgressState) + Send + Sync>;
/// Fired when `force_retry` resets a stuck operation
pub type RetryCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by `on_progress_update`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct TrackedOperation {
    state: ProgressState,
    generation: u64,
    started: Instant,
    finished: bool,
    watchdog_generation: u64,
    watchdog: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    last_notified: Option<(Instant, RenderStage)>,
}

impl TrackedOperation {
    fn snapshot(&self) -> ProgressState {
        let mut state = self.state.clone();
        state.time_elapsed_ms = self.started.elapsed().as_millis() as u64;
        state
    }

    fn stop_timers(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}

struct TrackerInner {
    config: ProgressConfig,
    update_interval: Mutex<Duration>,
    operations: Mutex<HashMap<String, TrackedOperation>>,
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, ProgressCallback)>>>,
    stuck_callbacks: Mutex<Vec<StuckCallback>>,
    retry_callbacks: Mutex<Vec<RetryCallback>>,
    counter: AtomicU64,
}

/// Thread-safe progress tracker
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ProgressConfig::default())
    }
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                update_interval: Mutex::new(config.min_update_interval),
                config,
                operations: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                stuck_callbacks: Mutex::new(Vec::new()),
                retry_callbacks: Mutex::new(Vec::new()),
                counter: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Adjust the callback throttle interval
    pub fn set_update_interval(&self, interval: Duration) {
        *self.inner.update_interval.lock() = interval;
    }

    pub fn update_interval(&self) -> Duration {
        *self.inner.update_interval.lock()
    }

    /// Start tracking `id`, replacing any previous operation with that id
    pub fn initialize(&self, id: &str, stage: Option<RenderStage>) -> ProgressState {
        let generation = self.next_id();
        let state = ProgressState::at_stage(stage.unwrap_or(RenderStage::Initializing));

        {
            let mut operations = self.inner.operations.lock();
            if let Some(mut previous) = operations.remove(id) {
                previous.stop_timers();
            }
            let mut operation = TrackedOperation {
                state: state.clone(),
                generation,
                started: Instant::now(),
                finished: false,
                watchdog_generation: 0,
                watchdog: None,
                cleanup: None,
                last_notified: None,
            };
            self.arm_watchdog(id, &mut operation);
            operations.insert(id.to_string(), operation);
        }

        tracing::trace!(operation = id, "Progress initialized");
        self.deliver(id, true);
        state
    }

    /// Apply a partial update; returns the new state, or `None` when the
    /// operation is unknown or already finished
    pub fn update(&self, id: &str, update: ProgressUpdate) -> Option<ProgressState> {
        let (state, force) = {
            let mut operations = self.inner.operations.lock();
            let operation = operations.get_mut(id)?;
            if operation.finished {
                return None;
            }
            let previous_stage = operation.state.stage;
            operation.state.apply(&update);
            self.arm_watchdog(id, operation);
            (
                operation.snapshot(),
                operation.state.stage != previous_stage || operation.state.stage.is_terminal(),
            )
        };

        self.deliver(id, force);
        Some(state)
    }

    /// Mark the operation complete at 100%
    pub fn complete(&self, id: &str) -> Option<ProgressState> {
        self.finish(id, RenderStage::Complete, None)
    }

    /// Mark the operation failed, keeping its last percentage
    pub fn fail(&self, id: &str, message: Option<&str>) -> Option<ProgressState> {
        self.finish(id, RenderStage::Error, message.map(str::to_string))
    }

    fn finish(&self, id: &str, stage: RenderStage, message: Option<String>) -> Option<ProgressState> {
        let state = {
            let mut operations = self.inner.operations.lock();
            let operation = operations.get_mut(id)?;
            if operation.finished {
                return Some(operation.snapshot());
            }
            let update = ProgressUpdate {
                stage: Some(stage),
                percentage: (stage == RenderStage::Complete).then_some(100.0),
                message,
                ..Default::default()
            };
            operation.state.apply(&update);
            operation.finished = true;
            if let Some(handle) = operation.watchdog.take() {
                handle.abort();
            }
            operation.cleanup = self.schedule_cleanup(id, operation.generation);
            operation.snapshot()
        };

        tracing::debug!(operation = id, stage = ?stage, "Progress finished");
        self.deliver(id, true);
        Some(state)
    }

    pub fn get(&self, id: &str) -> Option<ProgressState> {
        let operations = self.inner.operations.lock();
        operations.get(id).map(TrackedOperation::snapshot)
    }

    pub fn is_tracking(&self, id: &str) -> bool {
        self.inner.operations.lock().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        let operations = self.inner.operations.lock();
        operations.values().filter(|op| !op.finished).count()
    }

    /// Register a callback for progress of `id`
    ///
    /// `id` may not be tracked yet. If it is still unknown after
    /// `orphan_subscription_ttl`, its subscribers are dropped.
    pub fn on_progress_update<F>(&self, id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressState) + Send + Sync + 'static,
    {
        let subscription = SubscriptionId(self.next_id());
        self.inner
            .subscribers
            .lock()
            .entry(id.to_string())
            .or_default()
            .push((subscription, Arc::new(callback)));

        if !self.is_tracking(id) {
            self.schedule_orphan_expiry(id);
        }
        subscription
    }

    /// Channel-based subscription; the channel closes on cleanup
    pub fn subscribe(&self, id: &str) -> mpsc::UnboundedReceiver<ProgressState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_progress_update(id, move |state| {
            let _ = tx.send(state.clone());
        });
        rx
    }

    pub fn unsubscribe(&self, id: &str, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let Some(list) = subscribers.get_mut(id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != subscription);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(id);
        }
        removed
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn on_stuck_detection<F>(&self, callback: F)
    where
        F: Fn(&str, &ProgressState) + Send + Sync + 'static,
    {
        self.inner.stuck_callbacks.lock().push(Arc::new(callback));
    }

    pub fn on_retry<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.retry_callbacks.lock().push(Arc::new(callback));
    }

    /// Reset a stuck operation and fire the retry callbacks
    ///
    /// No-op (returns `false`) unless the operation is currently stuck.
    pub fn force_retry(&self, id: &str) -> bool {
        {
            let mut operations = self.inner.operations.lock();
            let Some(operation) = operations.get_mut(id) else {
                return false;
            };
            if !operation.state.is_stuck || operation.finished {
                return false;
            }
            let total_bytes = operation.state.total_bytes;
            operation.state = ProgressState::initial();
            operation.state.total_bytes = total_bytes;
            operation.last_notified = None;
            self.arm_watchdog(id, operation);
        }

        tracing::info!(operation = id, "Forcing retry of stuck operation");

        let callbacks: Vec<RetryCallback> = self.inner.retry_callbacks.lock().clone();
        for callback in callbacks {
            callback(id);
        }
        self.deliver(id, true);
        true
    }

    /// Remove the operation and all of its subscribers immediately
    pub fn cleanup(&self, id: &str) {
        if let Some(mut operation) = self.inner.operations.lock().remove(id) {
            operation.stop_timers();
        }
        self.inner.subscribers.lock().remove(id);
    }

    /// Deliver the current state to subscribers, honoring the throttle
    fn deliver(&self, id: &str, force: bool) {
        let state = {
            let mut operations = self.inner.operations.lock();
            let Some(operation) = operations.get_mut(id) else {
                return;
            };
            let interval = *self.inner.update_interval.lock();
            let now = Instant::now();
            let due = match operation.last_notified {
                None => true,
                Some((at, stage)) => {
                    stage != operation.state.stage || now.duration_since(at) >= interval
                }
            };
            if !force && !due {
                return;
            }
            operation.last_notified = Some((now, operation.state.stage));
            operation.snapshot()
        };

        let callbacks: Vec<ProgressCallback> = self
            .inner
            .subscribers
            .lock()
            .get(id)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in callbacks {
            callback(&state);
        }
    }

    fn arm_watchdog(&self, id: &str, operation: &mut TrackedOperation) {
        if let Some(handle) = operation.watchdog.take() {
            handle.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let watchdog_generation = self.next_id();
        operation.watchdog_generation = watchdog_generation;

        let weak = Arc::downgrade(&self.inner);
        let threshold = self.inner.config.stuck_detection_threshold;
        let id = id.to_string();
        operation.watchdog = Some(runtime.spawn(async move {
            tokio::time::sleep(threshold).await;
            Self::mark_stuck(weak, &id, watchdog_generation);
        }));
    }

    fn mark_stuck(weak: Weak<TrackerInner>, id: &str, watchdog_generation: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let state = {
            let mut operations = inner.operations.lock();
            let Some(operation) = operations.get_mut(id) else {
                return;
            };
            if operation.finished
                || operation.state.is_stuck
                || operation.watchdog_generation != watchdog_generation
            {
                return;
            }
            operation.state.is_stuck = true;
            operation.watchdog = None;
            operation.snapshot()
        };

        tracing::warn!(
            operation = id,
            stage = ?state.stage,
            percentage = state.percentage,
            "Operation appears stuck"
        );

        let stuck: Vec<StuckCallback> = inner.stuck_callbacks.lock().clone();
        for callback in stuck {
            callback(id, &state);
        }
        let subscribers: Vec<ProgressCallback> = inner
            .subscribers
            .lock()
            .get(id)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in subscribers {
            callback(&state);
        }
    }

    fn schedule_orphan_expiry(&self, id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let ttl = self.inner.config.orphan_subscription_ttl;
        let id = id.to_string();

        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let operations = inner.operations.lock();
            if operations.contains_key(&id) {
                return;
            }
            if let Some(dropped) = inner.subscribers.lock().remove(&id) {
                tracing::debug!(
                    operation = %id,
                    subscribers = dropped.len(),
                    "Dropped subscribers of an operation that never started"
                );
            };
        });
    }

    fn schedule_cleanup(&self, id: &str, generation: u64) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.cleanup_delay;
        let id = id.to_string();

        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let removed = {
                let mut operations = inner.operations.lock();
                let same = operations
                    .get(&id)
                    .map(|op| op.generation == generation)
                    .unwrap_or(false);
                if same {
                    operations.remove(&id);
                }
                same
            };
            if removed {
                inner.subscribers.lock().remove(&id);
                tracing::trace!(operation = %id, "Progress cleaned up");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(ProgressConfig {
            stuck_detection_threshold: Duration::from_millis(1000),
            cleanup_delay: Duration::from_millis(500),
            min_update_interval: Duration::ZERO,
            orphan_subscription_ttl: Duration::from_millis(2000),
        })
    }

    #[tokio::test]
    async fn test_initialize_and_update() {
        let tracker = tracker();
        tracker.initialize("op", None);

        let state = tracker
            .update("op", ProgressUpdate::bytes(250, Some(1000)))
            .unwrap();
        assert_eq!(state.stage, RenderStage::Fetching);
        assert!((state.percentage - 15.0).abs() < f64::EPSILON);

        assert!(tracker.update("missing", ProgressUpdate::default()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_detection_fires_once() {
        let tracker = tracker();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        tracker.on_stuck_detection(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.initialize("op", None);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(tracker.get("op").unwrap().is_stuck);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Any update clears the flag and starts a new episode
        let state = tracker
            .update("op", ProgressUpdate::stage(RenderStage::Fetching))
            .unwrap();
        assert!(!state.is_stuck);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_keep_operation_alive() {
        let tracker = tracker();
        tracker.initialize("op", None);

        for i in 1..=5 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            tracker.update("op", ProgressUpdate::bytes(i * 100, Some(1000)));
        }
        assert!(!tracker.get("op").unwrap().is_stuck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_operation_is_never_stuck() {
        let tracker = tracker();
        tracker.initialize("op", None);
        tracker.complete("op");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = tracker.get("op").unwrap();
        assert_eq!(state.percentage, 100.0);
        assert!(!state.is_stuck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_retry_only_when_stuck() {
        let tracker = tracker();
        let retried = Arc::new(Mutex::new(Vec::new()));
        let sink = retried.clone();
        tracker.on_retry(move |id| sink.lock().push(id.to_string()));

        tracker.initialize("op", None);
        tracker.update("op", ProgressUpdate::bytes(400, Some(1000)));
        assert!(!tracker.force_retry("op"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(tracker.force_retry("op"));

        let state = tracker.get("op").unwrap();
        assert_eq!(state.percentage, 0.0);
        assert_eq!(state.stage, RenderStage::Initializing);
        assert_eq!(state.bytes_loaded, 0);
        assert_eq!(state.total_bytes, 1000);
        assert!(!state.is_stuck);
        assert_eq!(retried.lock().as_slice(), ["op".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_cleanup_after_completion() {
        let tracker = tracker();
        let mut rx = tracker.subscribe("op");
        tracker.initialize("op", None);
        tracker.complete("op");

        // Late readers still observe the final state
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.get("op").unwrap().stage, RenderStage::Complete);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(tracker.get("op").is_none());
        assert_eq!(tracker.subscriber_count("op"), 0);

        let mut seen = Vec::new();
        while let Some(state) = rx.recv().await {
            seen.push(state.stage);
        }
        assert_eq!(seen.last(), Some(&RenderStage::Complete));
    }

    #[tokio::test]
    async fn test_callbacks_see_non_decreasing_percentages() {
        let tracker = tracker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tracker.on_progress_update("op", move |state| sink.lock().push(state.percentage));

        tracker.initialize("op", None);
        tracker.update("op", ProgressUpdate::bytes(100, Some(1000)));
        tracker.update("op", ProgressUpdate::bytes(900, Some(1000)));
        tracker.update("op", ProgressUpdate::stage(RenderStage::Parsing));
        tracker.update("op", ProgressUpdate::stage(RenderStage::Rendering).with_stage_progress(0.5));
        tracker.update("op", ProgressUpdate::stage(RenderStage::Fetching));
        tracker.complete("op");

        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_cleanup() {
        let tracker = tracker();
        let sub = tracker.on_progress_update("op", |_| {});
        tracker.on_progress_update("op", |_| {});
        assert_eq!(tracker.subscriber_count("op"), 2);

        assert!(tracker.unsubscribe("op", sub));
        assert!(!tracker.unsubscribe("op", sub));
        assert_eq!(tracker.subscriber_count("op"), 1);

        tracker.initialize("op", None);
        tracker.cleanup("op");
        assert_eq!(tracker.subscriber_count("op"), 0);
        assert!(tracker.get("op").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_of_unstarted_operations_expire() {
        let tracker = tracker();
        tracker.on_progress_update("never-started", |_| {});
        tracker.on_progress_update("started", |_| {});
        tracker.initialize("started", None);

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(tracker.subscriber_count("never-started"), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.subscriber_count("never-started"), 0);
        assert_eq!(tracker.subscriber_count("started"), 1);
    }

    #[tokio::test]
    async fn test_fail_keeps_message() {
        let tracker = tracker();
        tracker.initialize("op", Some(RenderStage::Fetching));
        let state = tracker.fail("op", Some("connection reset")).unwrap();
        assert_eq!(state.stage, RenderStage::Error);
        assert_eq!(state.message.as_deref(), Some("connection reset"));
        assert!(tracker.update("op", ProgressUpdate::default()).is_none());
    }
}
