//! Render API endpoints
//!
//! - Start a render and wait for its result
//! - List active renders
//! - Read progress and diagnostics
//! - Cancel or force-retry a request
//! - Report host memory pressure

use std::time::Duration;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsReport;
use crate::error::AppError;
use crate::optimization::BehaviorUpdate;
use crate::performance::MemoryPressure;
use crate::progress::ProgressState;
use crate::renderer::{ActiveRender, RenderOptions, RenderResult, RenderingMethod};
use crate::state::AppState;

/// Per-request overrides of the configured render options
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderOptionsBody {
    pub timeout_ms: Option<u64>,
    pub preferred_method: Option<RenderingMethod>,
    pub fallback_enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub scale: Option<f32>,
    pub pages: Option<Vec<u32>>,
    pub page_limit: Option<u32>,
}

impl RenderOptionsBody {
    fn resolve(self, mut options: RenderOptions) -> Result<RenderOptions, AppError> {
        if let Some(timeout_ms) = self.timeout_ms {
            if timeout_ms == 0 {
                return Err(AppError::BadRequest("timeoutMs must be positive".into()));
            }
            options.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 || scale > 8.0 {
                return Err(AppError::BadRequest("scale must be in (0, 8]".into()));
            }
            options.scale = scale;
        }
        if self.preferred_method == Some(RenderingMethod::DownloadFallback) {
            return Err(AppError::BadRequest(
                "DOWNLOAD_FALLBACK cannot be requested".into(),
            ));
        }
        options.preferred_method = self.preferred_method.or(options.preferred_method);
        options.fallback_enabled = self.fallback_enabled.unwrap_or(options.fallback_enabled);
        options.max_retries = self.max_retries.unwrap_or(options.max_retries);
        options.page_limit = self.page_limit.unwrap_or(options.page_limit);
        if self.pages.is_some() {
            options.pages = self.pages;
        }
        Ok(options)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub url: String,
    #[serde(default)]
    pub options: RenderOptionsBody,
    /// Caller-chosen id, so progress can be polled while the render runs
    pub request_id: Option<String>,
    /// Attributes the page views to a reader for behavior learning
    pub user_id: Option<String>,
    /// Embed rendered page images as data URLs
    #[serde(default)]
    pub inline_images: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub page_number: u32,
    pub data_url: String,
}

#[derive(Serialize)]
pub struct RenderResponse {
    #[serde(flatten)]
    pub result: RenderResult,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<InlineImage>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct ForceRetryResponse {
    pub retried: bool,
}

#[derive(Deserialize)]
pub struct MemoryPressureRequest {
    pub pressure: MemoryPressure,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPressureResponse {
    pub canvas_pool_size: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(render_document))
        .route("/active", get(list_active))
        .route("/memory-pressure", post(memory_pressure))
        .route("/:id/progress", get(get_progress))
        .route("/:id/diagnostics", get(get_diagnostics))
        .route("/:id/cancel", post(cancel_render))
        .route("/:id/force-retry", post(force_retry))
}

/// Render a document and return the outcome
///
/// Failed renders still answer 200; the body carries `success`, the error
/// and a download URL when every method was exhausted.
async fn render_document(
    State(state): State<AppState>,
    Json(request): Json<RenderRequest>,
) -> Result<Json<RenderResponse>, AppError> {
    let url = request.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AppError::BadRequest(format!("Unsupported document URL: {}", url)));
    }

    let options = request
        .options
        .resolve(RenderOptions::from_config(&state.config().render))?;

    let renderer = state.renderer();
    let result = match &request.request_id {
        Some(id) if !id.trim().is_empty() => renderer.render_with_id(id, url, options).await,
        _ => renderer.render(url, options).await,
    };

    let optimization = state.optimization();
    if let Some(mbps) = renderer.downlink_mbps() {
        optimization.record_network_measurement(mbps);
    }
    if result.success && !result.from_cache {
        optimization.record_load_time(Duration::from_millis(result.diagnostics.duration_ms));
    }
    if let (Some(user_id), Some(document_id)) = (&request.user_id, &result.document_id) {
        for page in &result.pages {
            optimization.update_user_behavior_pattern(BehaviorUpdate::new(
                user_id,
                document_id,
                page.page_number,
            ));
        }
    }

    let images = if request.inline_images {
        result
            .pages
            .iter()
            .filter(|page| page.has_image())
            .map(|page| InlineImage {
                page_number: page.page_number,
                data_url: format!(
                    "data:{};base64,{}",
                    page.content_type,
                    BASE64.encode(page.data.as_slice())
                ),
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(Json(RenderResponse { result, images }))
}

async fn list_active(State(state): State<AppState>) -> Json<Vec<ActiveRender>> {
    Json(state.renderer().active_renders())
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProgressState>, AppError> {
    state
        .renderer()
        .get_progress(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No progress for {}", id)))
}

async fn get_diagnostics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DiagnosticsReport>, AppError> {
    state
        .renderer()
        .diagnostics()
        .get_diagnostics(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No diagnostics for {}", id)))
}

async fn cancel_render(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if state.renderer().cancel(&id) {
        Ok(Json(CancelResponse { cancelled: true }))
    } else {
        Err(AppError::NotFound(format!("No active render {}", id)))
    }
}

async fn force_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ForceRetryResponse> {
    Json(ForceRetryResponse {
        retried: state.renderer().force_retry(&id),
    })
}

async fn memory_pressure(
    State(state): State<AppState>,
    Json(request): Json<MemoryPressureRequest>,
) -> Json<MemoryPressureResponse> {
    let canvas_pool_size = state
        .renderer()
        .handle_memory_pressure(request.pressure)
        .await;
    Json(MemoryPressureResponse { canvas_pool_size })
}
