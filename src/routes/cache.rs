//! Cache management endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheHeaders, CacheStats, OptimizeReport};
use crate::optimization::WarmReport;
use crate::state::AppState;

#[derive(Serialize)]
pub struct RecommendationsResponse {
    pub recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeadersQuery {
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "image/png".to_string()
}

#[derive(Serialize)]
pub struct HeadersResponse {
    pub browser: CacheHeaders,
    pub cdn: CacheHeaders,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", delete(clear_cache))
        .route("/stats", get(get_stats))
        .route("/optimize", post(optimize))
        .route("/warm", post(warm))
        .route("/recommendations", get(recommendations))
        .route("/headers", get(headers))
}

async fn get_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache().get_cache_stats().await)
}

async fn optimize(State(state): State<AppState>) -> Json<OptimizeReport> {
    Json(state.cache().optimize_cache().await)
}

async fn warm(State(state): State<AppState>) -> Json<WarmReport> {
    Json(state.optimization().warm_popular_documents().await)
}

async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.cache().clear_cache().await;
    tracing::info!("Memory cache cleared");
    StatusCode::NO_CONTENT
}

async fn recommendations(State(state): State<AppState>) -> Json<RecommendationsResponse> {
    Json(RecommendationsResponse {
        recommendations: state.optimization().get_cache_recommendations().await,
    })
}

async fn headers(
    State(state): State<AppState>,
    Query(query): Query<HeadersQuery>,
) -> Json<HeadersResponse> {
    let cache = state.cache();
    Json(HeadersResponse {
        browser: cache.get_browser_cache_headers(&query.content_type),
        cdn: cache.get_cdn_cache_headers(),
    })
}
