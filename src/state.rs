//! Application state management

use std::sync::Arc;

use crate::cache::DocumentCacheManager;
use crate::config::Config;
use crate::diagnostics::DiagnosticsCollector;
use crate::network::{HttpUrlRefresher, NetworkResilience, ReqwestTransport};
use crate::optimization::{CacheOptimizationService, PagePreloader};
use crate::performance::{CanvasPool, PerformanceOptimizer};
use crate::preferences::{JsonFilePreferenceStore, PreferenceStore};
use crate::progress::ProgressTracker;
use crate::renderer::{PageRenderer, ReliableRenderer, RendererComponents};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    renderer: ReliableRenderer,
    optimization: CacheOptimizationService,
    preferences: Arc<dyn PreferenceStore>,
}

#[cfg(feature = "mupdf")]
fn default_page_renderer() -> Option<Arc<dyn PageRenderer>> {
    Some(Arc::new(crate::renderer::MupdfPageRenderer::new()))
}

#[cfg(not(feature = "mupdf"))]
fn default_page_renderer() -> Option<Arc<dyn PageRenderer>> {
    tracing::warn!("Built without the mupdf feature; canvas rendering is unavailable");
    None
}

impl AppState {
    /// Build every engine component from configuration
    pub fn new(config: Config) -> Self {
        let progress = ProgressTracker::new(config.progress.clone());
        progress.on_stuck_detection(|id, state| {
            tracing::warn!(
                rendering_id = id,
                stage = ?state.stage,
                percentage = state.percentage,
                "Rendering appears stuck"
            );
        });

        let mut network = NetworkResilience::new(
            Arc::new(ReqwestTransport::new()),
            config.network.clone(),
        )
        .with_progress(progress.clone());
        if let Some(endpoint) = &config.network.refresh_endpoint {
            tracing::info!("Signed URL refresh via {}", endpoint);
            network = network.with_refresher(Arc::new(HttpUrlRefresher::new(endpoint)));
        }

        let environment = config.render.environment.clone();
        let pool = CanvasPool::with_max_area(
            config.performance.initial_pool_size,
            config.performance.max_canvas_area,
        );
        let optimizer = PerformanceOptimizer::new(
            config.performance.clone(),
            environment.clone(),
            pool,
            config.render.conversion_endpoint.is_some(),
        );

        let renderer = ReliableRenderer::new(
            config.render.clone(),
            RendererComponents {
                network,
                cache: DocumentCacheManager::new(config.cache.clone()),
                progress,
                diagnostics: DiagnosticsCollector::new(config.diagnostics.clone(), environment),
                optimizer,
                page_renderer: default_page_renderer(),
            },
        );

        let preferences: Arc<dyn PreferenceStore> =
            Arc::new(JsonFilePreferenceStore::new(config.preferences.path.clone()));

        Self::from_parts(config, renderer, preferences)
    }

    /// Assemble state around an existing renderer
    pub fn from_parts(
        config: Config,
        renderer: ReliableRenderer,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let preloader: Arc<dyn PagePreloader> = Arc::new(renderer.clone());
        let optimization = CacheOptimizationService::new(
            renderer.cache().clone(),
            config.optimization.clone(),
            Some(preloader),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                renderer,
                optimization,
                preferences,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn renderer(&self) -> &ReliableRenderer {
        &self.inner.renderer
    }

    pub fn cache(&self) -> &DocumentCacheManager {
        self.inner.renderer.cache()
    }

    pub fn optimization(&self) -> &CacheOptimizationService {
        &self.inner.optimization
    }

    pub fn preferences(&self) -> &dyn PreferenceStore {
        self.inner.preferences.as_ref()
    }

    /// Start cache maintenance and warming; requires a running runtime
    pub fn start_background_tasks(&self) {
        self.cache().start_maintenance();
        self.inner.optimization.start_warming();
    }

    /// Stop background work and cancel in-flight renders
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down rendering engine...");
        self.inner.optimization.destroy().await;
        self.inner.renderer.destroy().await;
    }
}
