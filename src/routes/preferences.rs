//! Viewer preference endpoints

use axum::{extract::State, routing::get, Json, Router};

use crate::error::AppError;
use crate::preferences::ViewerPreferences;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_preferences).put(put_preferences))
}

async fn get_preferences(State(state): State<AppState>) -> Json<ViewerPreferences> {
    Json(state.preferences().load().await)
}

async fn put_preferences(
    State(state): State<AppState>,
    Json(preferences): Json<ViewerPreferences>,
) -> Result<Json<ViewerPreferences>, AppError> {
    state.preferences().save(&preferences).await?;
    Ok(Json(preferences))
}
