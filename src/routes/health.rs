//! Health check endpoint

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_renders: usize,
    pub cache_entries: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.cache().get_cache_stats().await;
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        active_renders: state.renderer().active_renders().len(),
        cache_entries: stats.entries,
    })
}
