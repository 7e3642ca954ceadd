//! Per-attempt rendering context

use std::sync::Arc;

use uuid::Uuid;

use crate::error::ErrorRecord;
use crate::performance::PooledCanvas;
use crate::progress::ProgressState;
use crate::renderer::{RenderOptions, RenderableDocument, RenderingMethod};

/// State owned by exactly one render attempt
///
/// A retry never reuses a context; it gets a fresh one from
/// `ErrorRecovery::create_fresh_context`.
pub struct RenderContext {
    /// Identity of this attempt
    pub rendering_id: String,
    /// Identity of the request the attempt belongs to; progress and
    /// diagnostics are reported under it
    pub request_id: String,
    pub url: String,
    pub options: RenderOptions,
    pub current_method: RenderingMethod,
    pub attempt_count: u32,
    pub progress: ProgressState,
    /// Oldest first
    pub error_history: Vec<ErrorRecord>,
    pub canvas: Option<PooledCanvas>,
    pub document: Option<Arc<dyn RenderableDocument>>,
}

impl RenderContext {
    /// Context for a new request; the attempt id doubles as the request id
    pub fn new(url: &str, options: RenderOptions, method: RenderingMethod) -> Self {
        let id = Uuid::new_v4().to_string();
        Self::with_request_id(&id, url, options, method)
    }

    pub fn with_request_id(
        request_id: &str,
        url: &str,
        options: RenderOptions,
        method: RenderingMethod,
    ) -> Self {
        Self {
            rendering_id: request_id.to_string(),
            request_id: request_id.to_string(),
            url: url.to_string(),
            options,
            current_method: method,
            attempt_count: 0,
            progress: ProgressState::initial(),
            error_history: Vec::new(),
            canvas: None,
            document: None,
        }
    }

    /// Drop the canvas and document handles
    pub fn release_handles(&mut self) {
        self.canvas = None;
        self.document = None;
    }

    pub fn has_handles(&self) -> bool {
        self.canvas.is_some() || self.document.is_some()
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error_history.last()
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("rendering_id", &self.rendering_id)
            .field("request_id", &self.request_id)
            .field("url", &self.url)
            .field("current_method", &self.current_method)
            .field("attempt_count", &self.attempt_count)
            .field("stage", &self.progress.stage)
            .field("errors", &self.error_history.len())
            .field("has_canvas", &self.canvas.is_some())
            .field("has_document", &self.document.is_some())
            .finish()
    }
}
