//! Retry and fallback decisions

use std::time::Duration;

use uuid::Uuid;

use super::context::RenderContext;
use crate::error::{ErrorKind, ErrorRecord, RenderError};
use crate::progress::{ProgressState, RenderStage};
use crate::renderer::RenderingMethod;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Run the same method again in a fresh context after `delay`
    Retry {
        method: RenderingMethod,
        delay: Duration,
    },
    /// Release memory first, then retry the same method
    CleanupAndRetry {
        method: RenderingMethod,
        delay: Duration,
    },
    /// Switch to the next method in the chain
    Fallback { method: RenderingMethod },
    /// Give up; the error is not recoverable
    Terminal,
    /// Every permitted method failed
    Exhausted,
}

/// Retry bookkeeping for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub method: RenderingMethod,
    /// Retries of the current method so far
    pub retries: u32,
    /// Distinct methods in the order they were tried
    pub attempted: Vec<RenderingMethod>,
    pub memory_cleanup_used: bool,
}

impl RecoveryState {
    pub fn new(method: RenderingMethod) -> Self {
        Self {
            method,
            retries: 0,
            attempted: vec![method],
            memory_cleanup_used: false,
        }
    }

    /// Switch the method without counting a failure, e.g. after analysis
    pub fn select(&mut self, method: RenderingMethod) {
        if let Some(last) = self.attempted.last_mut() {
            if *last == self.method && self.retries == 0 {
                *last = method;
            }
        }
        if !self.attempted.contains(&method) {
            self.attempted.push(method);
        }
        self.method = method;
    }

    /// Treat every method in the chain as tried
    pub fn exhaust(&mut self) {
        for method in RenderingMethod::FALLBACK_CHAIN {
            if !self.attempted.contains(&method) {
                self.attempted.push(method);
            }
        }
    }

    pub fn apply(&mut self, action: &RecoveryAction) {
        match *action {
            RecoveryAction::Retry { .. } => self.retries += 1,
            RecoveryAction::CleanupAndRetry { .. } => {
                self.retries += 1;
                self.memory_cleanup_used = true;
            }
            RecoveryAction::Fallback { method } => {
                self.method = method;
                self.retries = 0;
                if !self.attempted.contains(&method) {
                    self.attempted.push(method);
                }
            }
            RecoveryAction::Terminal | RecoveryAction::Exhausted => {}
        }
    }
}

/// Failure classification and fresh-context construction
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorRecovery;

impl ErrorRecovery {
    pub fn new() -> Self {
        Self
    }

    /// Build the context for the next attempt
    ///
    /// New identity, zero attempts, initial progress, empty history and no
    /// handles. URL, options and method are copied by value.
    pub fn create_fresh_context(&self, previous: &RenderContext) -> RenderContext {
        RenderContext {
            rendering_id: Uuid::new_v4().to_string(),
            request_id: previous.request_id.clone(),
            url: previous.url.clone(),
            options: previous.options.clone(),
            current_method: previous.current_method,
            attempt_count: 0,
            progress: ProgressState::initial(),
            error_history: Vec::new(),
            canvas: None,
            document: None,
        }
    }

    /// Append `error` to the context's history and return the record
    pub fn record_error(
        &self,
        ctx: &mut RenderContext,
        error: &RenderError,
        stage: RenderStage,
    ) -> ErrorRecord {
        let record = ErrorRecord::from_error(
            error,
            Some(ctx.current_method),
            stage,
            ctx.attempt_count.max(1),
        );
        ctx.error_history.push(record.clone());
        record
    }

    /// Decide how to continue after `error`
    ///
    /// `retry_delay` maps the retry number (0-based) to a backoff delay.
    pub fn decide(
        &self,
        error: &RenderError,
        state: &RecoveryState,
        max_retries: u32,
        fallback_enabled: bool,
        retry_delay: impl Fn(u32) -> Duration,
    ) -> RecoveryAction {
        let kind = error.kind();
        if kind.is_terminal() {
            return RecoveryAction::Terminal;
        }

        let fallback = |prefer: Option<RenderingMethod>| {
            if !fallback_enabled {
                return RecoveryAction::Exhausted;
            }
            let next = prefer
                .filter(|method| !state.attempted.contains(method))
                .or_else(|| RenderingMethod::next_untried(&state.attempted));
            match next {
                Some(method) => RecoveryAction::Fallback { method },
                None => RecoveryAction::Exhausted,
            }
        };

        match kind {
            ErrorKind::BrowserCompatibility => fallback(None),
            ErrorKind::MemoryError => {
                if state.memory_cleanup_used {
                    fallback(Some(RenderingMethod::ImageBased))
                } else {
                    RecoveryAction::CleanupAndRetry {
                        method: state.method,
                        delay: retry_delay(state.retries),
                    }
                }
            }
            _ if !error.is_retryable() => fallback(None),
            _ => {
                if state.retries < max_retries {
                    RecoveryAction::Retry {
                        method: state.method,
                        delay: retry_delay(state.retries),
                    }
                } else {
                    fallback(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::CanvasPool;
    use crate::renderer::RenderOptions;

    fn delay(retry: u32) -> Duration {
        Duration::from_millis(100 * (retry as u64 + 1))
    }

    fn canvas_error() -> RenderError {
        RenderError::Canvas("allocation failed".into())
    }

    #[test]
    fn test_fresh_context_is_independent() {
        let pool = CanvasPool::with_max_area(2, 1 << 20);
        let mut options = RenderOptions::default();
        options.preferred_method = Some(RenderingMethod::ImageBased);
        let mut previous = RenderContext::new(
            "https://cdn.example.com/a.pdf",
            options,
            RenderingMethod::NativeViewer,
        );
        previous.attempt_count = 3;
        previous.progress.percentage = 64.0;
        previous.progress.stage = RenderStage::Rendering;
        previous.progress.bytes_loaded = 4096;
        previous.canvas = Some(pool.acquire(10, 10).unwrap());
        ErrorRecovery::new().record_error(&mut previous, &canvas_error(), RenderStage::Rendering);

        let fresh = ErrorRecovery::new().create_fresh_context(&previous);

        assert_ne!(fresh.rendering_id, previous.rendering_id);
        assert_eq!(fresh.request_id, previous.request_id);
        assert_eq!(fresh.attempt_count, 0);
        assert!(fresh.error_history.is_empty());
        assert!(!fresh.has_handles());
        assert_eq!(fresh.progress.stage, RenderStage::Initializing);
        assert_eq!(fresh.progress.percentage, 0.0);
        assert_eq!(fresh.progress.bytes_loaded, 0);
        assert!(!fresh.progress.is_stuck);
        assert_eq!(fresh.url, previous.url);
        assert_eq!(fresh.options, previous.options);
        assert_eq!(fresh.current_method, RenderingMethod::NativeViewer);

        // Mutating the old context afterwards leaves the fresh one alone
        previous.url.push_str("?sig=changed");
        previous.options.scale = 9.0;
        previous.options.preferred_method = None;
        previous.current_method = RenderingMethod::Canvas;
        assert_eq!(fresh.url, "https://cdn.example.com/a.pdf");
        assert_eq!(fresh.options.scale, RenderOptions::default().scale);
        assert_eq!(fresh.options.preferred_method, Some(RenderingMethod::ImageBased));
        assert_eq!(fresh.current_method, RenderingMethod::NativeViewer);
    }

    #[test]
    fn test_terminal_kinds_stop_immediately() {
        let recovery = ErrorRecovery::new();
        let state = RecoveryState::new(RenderingMethod::Canvas);
        for error in [
            RenderError::PasswordProtected,
            RenderError::Corrupted("bad xref".into()),
            RenderError::PermissionDenied("cors".into()),
            RenderError::Authentication("refresh failed".into()),
            RenderError::Cancelled("user".into()),
        ] {
            assert_eq!(
                recovery.decide(&error, &state, 3, true, delay),
                RecoveryAction::Terminal
            );
        }
    }

    #[test]
    fn test_canvas_errors_retry_then_fall_back() {
        let recovery = ErrorRecovery::new();
        let mut state = RecoveryState::new(RenderingMethod::Canvas);

        for retry in 0..3 {
            let action = recovery.decide(&canvas_error(), &state, 3, true, delay);
            assert_eq!(
                action,
                RecoveryAction::Retry {
                    method: RenderingMethod::Canvas,
                    delay: delay(retry)
                }
            );
            state.apply(&action);
        }

        let action = recovery.decide(&canvas_error(), &state, 3, true, delay);
        assert_eq!(
            action,
            RecoveryAction::Fallback {
                method: RenderingMethod::NativeViewer
            }
        );
        state.apply(&action);
        assert_eq!(state.retries, 0);
        assert_eq!(
            state.attempted,
            vec![RenderingMethod::Canvas, RenderingMethod::NativeViewer]
        );
    }

    #[test]
    fn test_compatibility_falls_back_immediately() {
        let recovery = ErrorRecovery::new();
        let state = RecoveryState::new(RenderingMethod::NativeViewer);
        let action = recovery.decide(
            &RenderError::BrowserCompatibility("no viewer".into()),
            &state,
            3,
            true,
            delay,
        );
        assert_eq!(
            action,
            RecoveryAction::Fallback {
                method: RenderingMethod::Canvas
            }
        );
    }

    #[test]
    fn test_memory_cleanup_once_then_image_based() {
        let recovery = ErrorRecovery::new();
        let mut state = RecoveryState::new(RenderingMethod::Canvas);
        let error = RenderError::Memory("allocation failed".into());

        let action = recovery.decide(&error, &state, 3, true, delay);
        assert!(matches!(action, RecoveryAction::CleanupAndRetry { .. }));
        state.apply(&action);

        let action = recovery.decide(&error, &state, 3, true, delay);
        assert_eq!(
            action,
            RecoveryAction::Fallback {
                method: RenderingMethod::ImageBased
            }
        );
    }

    #[test]
    fn test_fallback_disabled_exhausts() {
        let recovery = ErrorRecovery::new();
        let state = RecoveryState::new(RenderingMethod::Canvas);
        let action = recovery.decide(
            &RenderError::BrowserCompatibility("no canvas".into()),
            &state,
            3,
            false,
            delay,
        );
        assert_eq!(action, RecoveryAction::Exhausted);
    }

    #[test]
    fn test_chain_exhaustion() {
        let recovery = ErrorRecovery::new();
        let mut state = RecoveryState::new(RenderingMethod::Canvas);
        for method in &RenderingMethod::FALLBACK_CHAIN[1..] {
            state.apply(&RecoveryAction::Fallback { method: *method });
        }
        let action = recovery.decide(
            &RenderError::BrowserCompatibility("nothing left".into()),
            &state,
            3,
            true,
            delay,
        );
        assert_eq!(action, RecoveryAction::Exhausted);
    }

    #[test]
    fn test_permanent_http_error_skips_retries() {
        let recovery = ErrorRecovery::new();
        let state = RecoveryState::new(RenderingMethod::Canvas);
        let error = RenderError::Http {
            status: 404,
            url: "https://cdn.example.com/a.pdf".into(),
        };
        assert_eq!(
            recovery.decide(&error, &state, 3, true, delay),
            RecoveryAction::Fallback {
                method: RenderingMethod::NativeViewer
            }
        );
    }

    #[test]
    fn test_select_replaces_untried_initial_method() {
        let mut state = RecoveryState::new(RenderingMethod::Canvas);
        state.select(RenderingMethod::ImageBased);
        assert_eq!(state.method, RenderingMethod::ImageBased);
        assert_eq!(state.attempted, vec![RenderingMethod::ImageBased]);
    }

    #[test]
    fn test_record_error_appends_in_order() {
        let recovery = ErrorRecovery::new();
        let mut ctx = RenderContext::new(
            "https://cdn.example.com/a.pdf",
            RenderOptions::default(),
            RenderingMethod::Canvas,
        );
        recovery.record_error(&mut ctx, &canvas_error(), RenderStage::Rendering);
        recovery.record_error(&mut ctx, &RenderError::Timeout(10), RenderStage::Fetching);
        assert_eq!(ctx.error_history.len(), 2);
        assert_eq!(ctx.error_history[0].kind, ErrorKind::CanvasError);
        assert_eq!(ctx.last_error().unwrap().kind, ErrorKind::TimeoutError);
    }
}
