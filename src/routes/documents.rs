//! Document cache endpoints
//!
//! Cached pages are served with the cache headers of the requested tier.
//! Preloading, behavior recording and strategy tuning feed the
//! optimization service.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::cache::DocumentInfo;
use crate::error::AppError;
use crate::optimization::{BehaviorUpdate, CacheStrategyDecision};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    #[default]
    Browser,
    Cdn,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub tier: CacheTier,
}

#[derive(Debug, Deserialize)]
pub struct PreloadQuery {
    pub page: u32,
    pub user: Option<String>,
    /// Render the predicted pages in the background
    #[serde(default)]
    pub execute: bool,
}

#[derive(Serialize)]
pub struct PreloadResponse {
    pub pages: Vec<u32>,
    pub scheduled: bool,
}

#[derive(Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StrategyRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BehaviorRequest {
    pub user_id: String,
    pub document_id: String,
    pub page: u32,
    pub session_duration_ms: Option<u64>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:doc_id", get(get_document).delete(invalidate_document))
        .route("/:doc_id/pages/:page", get(get_page).delete(invalidate_page))
        .route("/:doc_id/preload", get(preload))
        .route("/:doc_id/strategy", post(optimize_strategy))
}

pub fn behavior_router() -> Router<AppState> {
    Router::new().route("/", post(record_behavior))
}

async fn get_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DocumentInfo>, AppError> {
    state
        .cache()
        .get_document_cache(&doc_id)
        .await
        .map(|info| Json(info.as_ref().clone()))
        .ok_or_else(|| AppError::NotFound(format!("Document {} is not cached", doc_id)))
}

/// Serve a cached page image
///
/// Browser-tier responses honor `If-None-Match` against the page validator.
async fn get_page(
    State(state): State<AppState>,
    Path((doc_id, page)): Path<(String, u32)>,
    Query(query): Query<PageQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let cache = state.cache();
    let cached = cache
        .get_page_cache(&doc_id, page)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Page {} of {} is not cached", page, doc_id)))?;

    let mut headers = match query.tier {
        CacheTier::Browser => cache.browser_headers_for_page(&cached),
        CacheTier::Cdn => cache.get_cdn_cache_headers(),
    }
    .to_header_map();

    if let Ok(content_type) = cached.content_type.parse() {
        headers.insert(header::CONTENT_TYPE, content_type);
    }

    let not_modified = match (
        headers.get(header::ETAG),
        request_headers.get(header::IF_NONE_MATCH),
    ) {
        (Some(etag), Some(candidate)) => etag == candidate,
        _ => false,
    };
    if not_modified {
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    let body = Body::from(cached.data.as_ref().clone());
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn invalidate_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Json<InvalidateResponse> {
    let removed = state.cache().invalidate_document(&doc_id).await;
    tracing::info!(document = %doc_id, removed, "Document invalidated");
    Json(InvalidateResponse { removed })
}

async fn invalidate_page(
    State(state): State<AppState>,
    Path((doc_id, page)): Path<(String, u32)>,
) -> Result<StatusCode, AppError> {
    if state.cache().invalidate_page(&doc_id, page).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Page {} of {} is not cached", page, doc_id)))
    }
}

async fn preload(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<PreloadQuery>,
) -> Result<Json<PreloadResponse>, AppError> {
    if query.page == 0 {
        return Err(AppError::BadRequest("page numbers start at 1".into()));
    }

    let optimization = state.optimization().clone();
    let pages = optimization
        .predictive_preload(&doc_id, query.page, query.user.as_deref())
        .await;

    let scheduled = query.execute && !pages.is_empty();
    if scheduled {
        let pages = pages.clone();
        tokio::spawn(async move {
            optimization.preload_pages(&doc_id, &pages).await;
        });
    }

    Ok(Json(PreloadResponse { pages, scheduled }))
}

async fn optimize_strategy(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    body: Option<Json<StrategyRequest>>,
) -> Json<CacheStrategyDecision> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let decision = state
        .optimization()
        .optimize_cache_strategy(&doc_id, request.user_id.as_deref())
        .await;
    Json(decision)
}

async fn record_behavior(
    State(state): State<AppState>,
    Json(request): Json<BehaviorRequest>,
) -> Result<StatusCode, AppError> {
    if request.page == 0 {
        return Err(AppError::BadRequest("page numbers start at 1".into()));
    }

    let mut update = BehaviorUpdate::new(&request.user_id, &request.document_id, request.page);
    if let Some(ms) = request.session_duration_ms {
        update = update.with_session(std::time::Duration::from_millis(ms));
    }
    state.optimization().update_user_behavior_pattern(update);
    Ok(StatusCode::NO_CONTENT)
}
