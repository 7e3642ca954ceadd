//! Route modules for the Amnesia render service

pub mod cache;
pub mod documents;
pub mod health;
pub mod preferences;
pub mod render;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Application router without middleware layers
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/render", render::router())
        .nest("/api/v1/documents", documents::router())
        .nest("/api/v1/behavior", documents::behavior_router())
        .nest("/api/v1/cache", cache::router())
        .nest("/api/v1/preferences", preferences::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::DocumentCacheManager;
    use crate::config::Config;
    use crate::diagnostics::DiagnosticsCollector;
    use crate::network::mock::{MockTransport, Scripted};
    use crate::network::NetworkResilience;
    use crate::performance::{CanvasPool, PerformanceOptimizer};
    use crate::preferences::InMemoryPreferenceStore;
    use crate::progress::ProgressTracker;
    use crate::renderer::analysis::fixtures::pdf_bytes;
    use crate::renderer::primitive::mock::MockPageRenderer;
    use crate::renderer::{ReliableRenderer, RendererComponents};

    const URL: &str = "https://cdn.example.com/books/7.pdf";

    fn test_state(script: Vec<Scripted>) -> AppState {
        let config = Config::default();
        let progress = ProgressTracker::new(config.progress.clone());
        let network = NetworkResilience::new(
            Arc::new(MockTransport::new(script)),
            config.network.clone(),
        )
        .with_progress(progress.clone());
        let environment = config.render.environment.clone();
        let optimizer = PerformanceOptimizer::new(
            config.performance.clone(),
            environment.clone(),
            CanvasPool::with_max_area(4, 1 << 22),
            false,
        );

        let renderer = ReliableRenderer::new(
            config.render.clone(),
            RendererComponents {
                network,
                cache: DocumentCacheManager::new(config.cache.clone()),
                progress,
                diagnostics: DiagnosticsCollector::new(config.diagnostics.clone(), environment),
                optimizer,
                page_renderer: Some(Arc::new(MockPageRenderer::new(2))),
            },
        );
        AppState::from_parts(config, renderer, Arc::new(InMemoryPreferenceStore::default()))
    }

    fn pdf(pages: u32) -> Scripted {
        Scripted::Respond {
            status: 200,
            body: pdf_bytes(pages, 0),
        }
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(test_state(vec![]));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_render_then_serve_cached_page() {
        let app = app(test_state(vec![pdf(2)]));

        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/render", json!({ "url": URL })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result = body_json(response).await;
        assert_eq!(result["success"], true);
        assert_eq!(result["method"], "CANVAS");
        assert_eq!(result["pages"].as_array().unwrap().len(), 2);
        let document_id = result["documentId"].as_str().unwrap().to_string();

        let page_uri = format!("/api/v1/documents/{}/pages/1", document_id);
        let response = app.clone().oneshot(get(&page_uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let etag = response.headers()[header::ETAG].clone();

        let revalidate = Request::builder()
            .uri(&page_uri)
            .header(header::IF_NONE_MATCH, etag)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(revalidate).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let response = app
            .clone()
            .oneshot(get(&format!("{}?tier=cdn", page_uri)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("cdn-cache-control"));

        let response = app
            .oneshot(get(&format!("/api/v1/documents/{}/pages/9", document_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_render_rejects_bad_input() {
        let app = app(test_state(vec![]));

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/render",
                json!({ "url": "file:///etc/passwd" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/v1/render",
                json!({ "url": URL, "options": { "scale": -1.0 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_requests_are_not_found() {
        let app = app(test_state(vec![]));

        let response = app
            .clone()
            .oneshot(get("/api/v1/render/missing/progress"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(Method::POST, "/api/v1/render/missing/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_behavior_feeds_preload() {
        let app = app(test_state(vec![]));

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/behavior",
                json!({ "user_id": "alice", "document_id": "doc", "page": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(get("/api/v1/documents/doc/preload?page=1&user=alice"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["pages"], json!([2, 3, 4]));
        assert_eq!(body["scheduled"], false);
    }

    #[tokio::test]
    async fn test_preferences_round_trip() {
        let app = app(test_state(vec![]));

        let response = app.clone().oneshot(get("/api/v1/preferences")).await.unwrap();
        assert_eq!(body_json(response).await["zoom"], 1.0);

        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/api/v1/preferences",
                json!({ "viewMode": "scroll", "zoom": 2.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/api/v1/preferences")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["viewMode"], "scroll");
        assert_eq!(body["zoom"], 2.0);

        let response = app
            .oneshot(json_request(
                Method::PUT,
                "/api/v1/preferences",
                json!({ "zoom": 100.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cache_stats_and_clear() {
        let state = test_state(vec![]);
        state
            .cache()
            .set_page_cache("doc", 1, vec![1, 2, 3], "image/png", 1)
            .await;
        let app = app(state);

        let response = app.clone().oneshot(get("/api/v1/cache/stats")).await.unwrap();
        assert_eq!(body_json(response).await["pageEntries"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/v1/cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get("/api/v1/cache/stats")).await.unwrap();
        assert_eq!(body_json(response).await["entries"], 0);
    }
}
