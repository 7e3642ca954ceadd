//! Reliable renderer
//!
//! Sequences fetch, analysis, method selection and rendering for one
//! request, and drives retries and fallbacks through `ErrorRecovery`. Each
//! attempt runs in its own `RenderContext` under a timeout and can be
//! interrupted by `cancel` or by a forced retry of a stuck operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::analysis::DocumentAnalyzer;
use super::primitive::PageRenderer;
use super::strategy::{
    probe_image, CanvasStrategy, DocumentSource, ImageBasedStrategy, NativeViewerStrategy,
    RenderStrategy, ServerConversionStrategy, StageReporter,
};
use super::types::{ActiveRender, RenderOptions, RenderResult, RenderedPage, RendererConfig, RenderingMethod};
use crate::cache::{DocumentCacheManager, DocumentInfo};
use crate::diagnostics::{DiagnosticsCollector, DiagnosticsReport, PerformanceMetrics};
use crate::error::{ErrorKind, ErrorRecord, RenderError, Result};
use crate::network::{NetworkCondition, NetworkResilience};
use crate::optimization::PagePreloader;
use crate::performance::{MemoryPressure, PerformanceOptimizer, PerformanceSample};
use crate::progress::{ProgressState, ProgressTracker, ProgressUpdate, RenderStage, SubscriptionId};
use crate::recovery::{ErrorRecovery, RecoveryAction, RecoveryState, RenderContext};

/// Cache key of a document: SHA-256 of its URL without query or fragment,
/// so reissued signed URLs map to the same document
pub fn document_id_for(url: &str) -> String {
    let base = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
    hex::encode(Sha256::digest(base.as_bytes()))
}

/// Tag of cached page images: the method and the requested scale
fn rendition_tag(method: RenderingMethod, scale: f32) -> String {
    format!("{}@{}", method, scale)
}

/// Collaborators the renderer is built from
pub struct RendererComponents {
    pub network: NetworkResilience,
    pub cache: DocumentCacheManager,
    pub progress: ProgressTracker,
    pub diagnostics: DiagnosticsCollector,
    pub optimizer: PerformanceOptimizer,
    /// Rasterizer for the canvas and image-based methods
    pub page_renderer: Option<Arc<dyn PageRenderer>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptSignal {
    Running,
    Retry,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Retry,
    Cancel,
}

impl Interrupt {
    fn into_error(self, elapsed: Duration) -> RenderError {
        match self {
            Interrupt::Cancel => RenderError::Cancelled("cancelled by caller".to_string()),
            Interrupt::Retry => RenderError::Timeout(elapsed.as_millis() as u64),
        }
    }
}

/// Resolves once the request is cancelled or a retry is forced
async fn next_interrupt(signal: &mut watch::Receiver<AttemptSignal>) -> Interrupt {
    loop {
        if signal.changed().await.is_err() {
            return std::future::pending().await;
        }
        match *signal.borrow_and_update() {
            AttemptSignal::Running => continue,
            AttemptSignal::Retry => return Interrupt::Retry,
            AttemptSignal::Cancel => return Interrupt::Cancel,
        }
    }
}

struct ActiveEntry {
    render: ActiveRender,
    token: u64,
    signal: watch::Sender<AttemptSignal>,
}

/// Bookkeeping that outlives individual attempts of one request
struct RequestState {
    recovery: RecoveryState,
    source: Option<DocumentSource>,
    fetch_attempted: bool,
    method_selected: bool,
    /// Entries of the current context's error history already in diagnostics
    reported_errors: usize,
}

impl RequestState {
    fn new(method: RenderingMethod, method_selected: bool) -> Self {
        Self {
            recovery: RecoveryState::new(method),
            source: None,
            fetch_attempted: false,
            method_selected,
            reported_errors: 0,
        }
    }

    fn sample(
        &self,
        method: RenderingMethod,
        render_time: Duration,
        memory_bytes: u64,
        success: bool,
    ) -> Option<PerformanceSample> {
        let characteristics = &self.source.as_ref()?.characteristics;
        Some(PerformanceSample {
            method,
            size_bytes: characteristics.size_bytes,
            page_count: characteristics.page_count,
            complexity: characteristics.complexity,
            image_heavy: characteristics.image_heavy,
            render_time,
            memory_bytes,
            success,
        })
    }
}

struct RendererInner {
    config: RendererConfig,
    network: NetworkResilience,
    cache: DocumentCacheManager,
    progress: ProgressTracker,
    diagnostics: DiagnosticsCollector,
    optimizer: PerformanceOptimizer,
    recovery: ErrorRecovery,
    analyzer: DocumentAnalyzer,
    reporter: StageReporter,
    strategies: HashMap<RenderingMethod, Arc<dyn RenderStrategy>>,
    active: Mutex<HashMap<String, ActiveEntry>>,
    tokens: AtomicU64,
    /// Downlink in Mbit/s measured on the last document download
    downlink_mbps: RwLock<Option<f64>>,
}

impl RendererInner {
    fn signal(&self, request_id: &str, signal: AttemptSignal) -> bool {
        self.active
            .lock()
            .get(request_id)
            .map(|entry| entry.signal.send(signal).is_ok())
            .unwrap_or(false)
    }
}

/// Top-level render entry point
#[derive(Clone)]
pub struct ReliableRenderer {
    inner: Arc<RendererInner>,
}

impl ReliableRenderer {
    pub fn new(config: RendererConfig, components: RendererComponents) -> Self {
        let RendererComponents {
            network,
            cache,
            progress,
            diagnostics,
            optimizer,
            page_renderer,
        } = components;

        let reporter = StageReporter::new(progress.clone(), diagnostics.clone());
        let pool = optimizer.canvas_pool().clone();
        let strategies: Vec<Arc<dyn RenderStrategy>> = vec![
            Arc::new(CanvasStrategy::new(
                page_renderer.clone(),
                pool.clone(),
                reporter.clone(),
            )),
            Arc::new(NativeViewerStrategy::new(
                config.environment.capabilities.clone(),
                reporter.clone(),
            )),
            Arc::new(ServerConversionStrategy::new(
                config.conversion_endpoint.clone(),
                network.clone(),
                reporter.clone(),
            )),
            Arc::new(ImageBasedStrategy::new(page_renderer, pool, reporter.clone())),
        ];

        let inner = Arc::new(RendererInner {
            strategies: strategies
                .into_iter()
                .map(|strategy| (strategy.method(), strategy))
                .collect(),
            config,
            network,
            cache,
            progress,
            diagnostics,
            optimizer,
            recovery: ErrorRecovery::new(),
            analyzer: DocumentAnalyzer::new(),
            reporter,
            active: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(1),
            downlink_mbps: RwLock::new(None),
        });

        // Forced retries of stuck operations interrupt the running attempt
        let weak = Arc::downgrade(&inner);
        inner.progress.on_retry(move |request_id| {
            if let Some(inner) = weak.upgrade() {
                inner.signal(request_id, AttemptSignal::Retry);
            }
        });

        Self { inner }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &DocumentCacheManager {
        &self.inner.cache
    }

    pub fn optimizer(&self) -> &PerformanceOptimizer {
        &self.inner.optimizer
    }

    pub fn diagnostics(&self) -> &DiagnosticsCollector {
        &self.inner.diagnostics
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.inner.progress
    }

    /// Network condition estimated from the last document download
    pub fn network_condition(&self) -> NetworkCondition {
        self.downlink_mbps()
            .map(NetworkCondition::from_downlink_mbps)
            .unwrap_or_default()
    }

    pub fn downlink_mbps(&self) -> Option<f64> {
        *self.inner.downlink_mbps.read()
    }

    /// Render `url` under a new request id
    pub async fn render(&self, url: &str, options: RenderOptions) -> RenderResult {
        let request_id = Uuid::new_v4().to_string();
        self.render_with_id(&request_id, url, options).await
    }

    /// Render `url` under a caller-chosen request id
    ///
    /// Progress, diagnostics and the active-render table are keyed by
    /// `request_id`, so callers can subscribe before awaiting the result.
    pub async fn render_with_id(&self, request_id: &str, url: &str, options: RenderOptions) -> RenderResult {
        if let Some(result) = self.render_from_cache(request_id, url, &options).await {
            return result;
        }

        let method = options.preferred_method.unwrap_or(RenderingMethod::Canvas);
        let request = RequestState::new(method, options.preferred_method.is_some());
        let ctx = RenderContext::with_request_id(request_id, url, options, method);
        self.execute(ctx, request).await
    }

    /// Run a previously attempted context again from a fresh context
    ///
    /// The method of `previous` is kept; selection is not repeated.
    pub async fn retry_rendering(&self, previous: &RenderContext) -> RenderResult {
        let ctx = self.inner.recovery.create_fresh_context(previous);
        let request = RequestState::new(ctx.current_method, true);
        self.execute(ctx, request).await
    }

    /// Cancel an in-flight request
    ///
    /// The running attempt is dropped at its next suspension point, which
    /// releases its canvas and document handles. Returns `false` when no
    /// request with this id is active.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(entry) = self.inner.active.lock().remove(request_id) else {
            return false;
        };
        let _ = entry.signal.send(AttemptSignal::Cancel);
        self.inner.progress.fail(request_id, Some("Rendering cancelled"));
        tracing::info!(rendering_id = request_id, "Rendering cancelled");
        true
    }

    pub fn get_progress(&self, request_id: &str) -> Option<ProgressState> {
        self.inner.progress.get(request_id)
    }

    pub fn on_progress_update<F>(&self, request_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressState) + Send + Sync + 'static,
    {
        self.inner.progress.on_progress_update(request_id, callback)
    }

    pub fn subscribe(&self, request_id: &str) -> mpsc::UnboundedReceiver<ProgressState> {
        self.inner.progress.subscribe(request_id)
    }

    /// Restart a stuck request; no-op unless its progress is flagged stuck
    pub fn force_retry(&self, request_id: &str) -> bool {
        self.inner.progress.force_retry(request_id)
    }

    pub fn active_renders(&self) -> Vec<ActiveRender> {
        let active = self.inner.active.lock();
        let mut renders: Vec<ActiveRender> = active.values().map(|entry| entry.render.clone()).collect();
        renders.sort_by(|a, b| a.rendering_id.cmp(&b.rendering_id));
        renders
    }

    /// Shrink the canvas pool and trim the memory tier
    pub async fn handle_memory_pressure(&self, pressure: MemoryPressure) -> usize {
        let pool_size = self.inner.optimizer.handle_memory_pressure(pressure);
        if pressure != MemoryPressure::Normal {
            let report = self.inner.cache.optimize_cache().await;
            tracing::info!(
                pool_size,
                bytes_freed = report.bytes_freed,
                "Memory released"
            );
        }
        pool_size
    }

    /// Cancel every active request and stop background cache maintenance
    pub async fn destroy(&self) {
        let ids: Vec<String> = self.inner.active.lock().keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
        self.inner.cache.destroy().await;
    }

    async fn render_from_cache(
        &self,
        request_id: &str,
        url: &str,
        options: &RenderOptions,
    ) -> Option<RenderResult> {
        // Only rasterized pages are cached
        let method = options.preferred_method.unwrap_or(RenderingMethod::Canvas);
        if !matches!(method, RenderingMethod::Canvas | RenderingMethod::ImageBased) {
            return None;
        }
        let wanted_rendition = rendition_tag(method, options.scale);

        let cache = &self.inner.cache;
        let document_id = document_id_for(url);
        let info = cache.get_document_cache(&document_id).await?;
        let wanted = options.pages_for(info.page_count);
        if wanted.is_empty() {
            return None;
        }

        let mut pages = Vec::with_capacity(wanted.len());
        for page in wanted {
            let cached = cache.get_page_cache(&document_id, page).await?;
            if cached.rendition.as_deref() != Some(wanted_rendition.as_str()) {
                tracing::debug!(
                    rendering_id = request_id,
                    page,
                    cached = ?cached.rendition,
                    wanted = %wanted_rendition,
                    "Cached page rendition does not match"
                );
                return None;
            }
            let (width, height, _) = probe_image(&cached.data).ok()?;
            pages.push(RenderedPage {
                page_number: page,
                width,
                height,
                content_type: cached.content_type.clone(),
                byte_size: cached.data.len(),
                data: cached.data,
                viewer_url: None,
            });
        }

        let diagnostics = &self.inner.diagnostics;
        diagnostics.start_diagnostics(request_id, url, Some(method));
        self.inner.progress.initialize(request_id, None);
        self.inner.progress.complete(request_id);
        let report = diagnostics
            .complete_diagnostics(request_id, true)
            .unwrap_or_else(|| DiagnosticsReport::empty(request_id, url, diagnostics.environment().clone()));

        tracing::debug!(rendering_id = request_id, %document_id, "Served from memory tier");

        Some(RenderResult {
            rendering_id: request_id.to_string(),
            success: true,
            method,
            pages,
            document_id: Some(document_id),
            error: None,
            download_url: None,
            from_cache: true,
            diagnostics: report,
        })
    }

    /// Register the request, run it to completion and deregister it
    async fn execute(&self, ctx: RenderContext, request: RequestState) -> RenderResult {
        let request_id = ctx.request_id.clone();
        let (token, signal) = self.register(&ctx);

        self.inner
            .diagnostics
            .start_diagnostics(&request_id, &ctx.url, None);
        self.inner.progress.initialize(&request_id, None);

        tracing::info!(
            rendering_id = %request_id,
            url = %ctx.url,
            method = %ctx.current_method,
            "Rendering started"
        );

        let result = self.run(ctx, request, signal).await;
        self.deregister(&request_id, token);
        result
    }

    fn register(&self, ctx: &RenderContext) -> (u64, watch::Receiver<AttemptSignal>) {
        let (tx, rx) = watch::channel(AttemptSignal::Running);
        let token = self.inner.tokens.fetch_add(1, Ordering::Relaxed);
        let entry = ActiveEntry {
            render: ActiveRender {
                rendering_id: ctx.request_id.clone(),
                attempt_id: ctx.rendering_id.clone(),
                url: ctx.url.clone(),
                method: ctx.current_method,
                attempt: ctx.attempt_count,
            },
            token,
            signal: tx,
        };

        let mut active = self.inner.active.lock();
        if let Some(previous) = active.remove(&ctx.request_id) {
            tracing::debug!(rendering_id = %ctx.request_id, "Superseding active render");
            let _ = previous.signal.send(AttemptSignal::Cancel);
        }
        active.insert(ctx.request_id.clone(), entry);
        (token, rx)
    }

    fn deregister(&self, request_id: &str, token: u64) {
        let mut active = self.inner.active.lock();
        if active.get(request_id).is_some_and(|entry| entry.token == token) {
            active.remove(request_id);
        }
    }

    fn track_attempt(&self, ctx: &RenderContext) {
        if let Some(entry) = self.inner.active.lock().get_mut(&ctx.request_id) {
            entry.render.attempt_id = ctx.rendering_id.clone();
            entry.render.method = ctx.current_method;
            entry.render.attempt = ctx.attempt_count;
        }
    }

    async fn run(
        &self,
        mut ctx: RenderContext,
        mut request: RequestState,
        mut signal: watch::Receiver<AttemptSignal>,
    ) -> RenderResult {
        if request.recovery.method == RenderingMethod::DownloadFallback {
            let error = RenderError::BrowserCompatibility("download requested".to_string());
            let record = self.record_failure(&mut ctx, &mut request, &error, Duration::ZERO);
            return self.finish_failed(ctx, &request, record, true);
        }

        loop {
            let pending = *signal.borrow_and_update();
            if pending == AttemptSignal::Cancel {
                let error = Interrupt::Cancel.into_error(Duration::ZERO);
                let record = self.record_failure(&mut ctx, &mut request, &error, Duration::ZERO);
                return self.finish_failed(ctx, &request, record, false);
            }

            ctx.current_method = request.recovery.method;
            ctx.attempt_count = request.recovery.retries + 1;
            self.track_attempt(&ctx);

            let started = Instant::now();
            let timeout = ctx.options.timeout;
            let outcome = tokio::select! {
                result = tokio::time::timeout(timeout, self.attempt(&mut ctx, &mut request)) => {
                    result.unwrap_or_else(|_| Err(RenderError::Timeout(timeout.as_millis() as u64)))
                }
                interrupt = next_interrupt(&mut signal) => Err(interrupt.into_error(started.elapsed())),
            };
            let elapsed = started.elapsed();

            let error = match outcome {
                Ok(pages) => return self.finish_success(ctx, &mut request, pages, elapsed).await,
                Err(error) => error,
            };

            let record = self.record_failure(&mut ctx, &mut request, &error, elapsed);

            let size = request
                .source
                .as_ref()
                .map(|source| source.characteristics.size_bytes)
                .unwrap_or(0);
            let timing = self
                .inner
                .optimizer
                .tune_retry_timing(size, self.network_condition());
            let optimizer = &self.inner.optimizer;
            let action = self.inner.recovery.decide(
                &error,
                &request.recovery,
                ctx.options.max_retries,
                ctx.options.fallback_enabled,
                |retry| optimizer.retry_delay(&timing, retry),
            );

            match action {
                RecoveryAction::Terminal => return self.finish_failed(ctx, &request, record, false),
                RecoveryAction::Exhausted => return self.finish_failed(ctx, &request, record, true),
                RecoveryAction::Retry { method, delay } | RecoveryAction::CleanupAndRetry { method, delay } => {
                    if matches!(action, RecoveryAction::CleanupAndRetry { .. }) {
                        self.handle_memory_pressure(MemoryPressure::Moderate).await;
                    }
                    tracing::info!(
                        rendering_id = %ctx.request_id,
                        %method,
                        attempt = ctx.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        kind = %record.kind,
                        "Retrying render"
                    );
                    request.recovery.apply(&action);
                    self.inner
                        .diagnostics
                        .update_performance_metrics(&ctx.request_id, PerformanceMetrics::retry());
                    ctx = self.next_context(ctx, method, &mut request);

                    // A cancel during the backoff is picked up at the top of the loop
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = next_interrupt(&mut signal) => {}
                    }
                }
                RecoveryAction::Fallback { method } => {
                    tracing::info!(
                        rendering_id = %ctx.request_id,
                        from = %ctx.current_method,
                        to = %method,
                        kind = %record.kind,
                        "Falling back to next rendering method"
                    );
                    request.recovery.apply(&action);
                    ctx = self.next_context(ctx, method, &mut request);
                }
            }
        }
    }

    /// One attempt: fetch and analyze if needed, select a method, render
    async fn attempt(&self, ctx: &mut RenderContext, request: &mut RequestState) -> Result<Vec<RenderedPage>> {
        let needs_source = self
            .inner
            .strategies
            .get(&request.recovery.method)
            .map(|strategy| strategy.needs_source())
            .unwrap_or(true);

        // Methods that work from the URL alone skip a fetch that already failed
        if request.source.is_none() && (needs_source || !request.fetch_attempted) {
            request.fetch_attempted = true;
            let source = self.load_source(ctx).await?;
            if let Some(rejection) = source.characteristics.rejection() {
                return Err(rejection);
            }
            let interval = self
                .inner
                .optimizer
                .optimize_progress_update_frequency(source.characteristics.complexity);
            self.inner.progress.set_update_interval(interval);
            request.source = Some(source);
        }

        if !request.method_selected {
            if let Some(source) = &request.source {
                request.method_selected = true;
                let method = self
                    .inner
                    .optimizer
                    .select_optimal_method_with_learning(&source.characteristics);
                if method == RenderingMethod::DownloadFallback {
                    request.recovery.exhaust();
                    return Err(RenderError::BrowserCompatibility(
                        "no rendering method is available".to_string(),
                    ));
                }
                request.recovery.select(method);
                ctx.current_method = method;
                tracing::debug!(
                    rendering_id = %ctx.request_id,
                    %method,
                    estimate_ms = self
                        .inner
                        .optimizer
                        .estimate_render_time(&source.characteristics, method)
                        .as_millis() as u64,
                    "Rendering method selected"
                );
            }
        }

        let method = request.recovery.method;
        self.inner.diagnostics.record_method(&ctx.request_id, method);
        self.track_attempt(ctx);

        let strategy = self.inner.strategies.get(&method).cloned().ok_or_else(|| {
            RenderError::BrowserCompatibility(format!("{} is not a rendering strategy", method))
        })?;
        let outcome = strategy.render(ctx, request.source.as_ref()).await;

        // The loaded document's page count replaces the byte-scan estimate
        if let (Some(document), Some(source)) = (&ctx.document, request.source.as_mut()) {
            let pages = document.num_pages();
            if pages > 0 && pages != source.characteristics.page_count {
                tracing::debug!(
                    rendering_id = %ctx.request_id,
                    estimated = source.characteristics.page_count,
                    loaded = pages,
                    "Page count corrected by loaded document"
                );
                source.characteristics.page_count = pages;
            }
        }
        outcome
    }

    async fn load_source(&self, ctx: &mut RenderContext) -> Result<DocumentSource> {
        self.inner
            .reporter
            .report(ctx, ProgressUpdate::stage(RenderStage::Fetching));

        let started = Instant::now();
        let url = ctx.url.clone();
        let response = self.inner.network.fetch_data(&url, ctx).await?;
        let network_time = started.elapsed();
        self.inner
            .diagnostics
            .update_performance_metrics(&ctx.request_id, PerformanceMetrics::network(network_time));
        self.observe_throughput(response.bytes_received, network_time);

        self.inner
            .reporter
            .report(ctx, ProgressUpdate::stage(RenderStage::Parsing));
        let started = Instant::now();
        let characteristics = self.inner.analyzer.analyze(&response.data);
        self.inner
            .diagnostics
            .update_performance_metrics(&ctx.request_id, PerformanceMetrics::parse(started.elapsed()));

        tracing::debug!(
            rendering_id = %ctx.request_id,
            size_bytes = characteristics.size_bytes,
            pages = characteristics.page_count,
            complexity = ?characteristics.complexity,
            "Document analyzed"
        );

        Ok(DocumentSource {
            data: Arc::new(response.data),
            characteristics,
            document_id: document_id_for(&url),
        })
    }

    fn observe_throughput(&self, bytes: u64, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        if bytes == 0 || seconds < 0.001 {
            return;
        }
        let mbps = bytes as f64 * 8.0 / seconds / 1_000_000.0;
        *self.inner.downlink_mbps.write() = Some(mbps);
    }

    /// Release the attempt's handles and build the context for the next one
    fn next_context(
        &self,
        mut ctx: RenderContext,
        method: RenderingMethod,
        request: &mut RequestState,
    ) -> RenderContext {
        ctx.release_handles();
        let mut fresh = self.inner.recovery.create_fresh_context(&ctx);
        fresh.current_method = method;
        drop(ctx);

        request.reported_errors = 0;
        self.inner.progress.initialize(&fresh.request_id, None);
        fresh
    }

    /// Copy errors recorded inside the attempt (network retries) into diagnostics
    fn flush_errors(&self, ctx: &RenderContext, request: &mut RequestState) {
        for record in ctx.error_history.iter().skip(request.reported_errors) {
            self.inner
                .diagnostics
                .add_error(&ctx.request_id, record.clone());
        }
        request.reported_errors = ctx.error_history.len();
    }

    fn record_failure(
        &self,
        ctx: &mut RenderContext,
        request: &mut RequestState,
        error: &RenderError,
        elapsed: Duration,
    ) -> ErrorRecord {
        let method = request.recovery.method;
        let stage = ctx.progress.stage;
        self.flush_errors(ctx, request);

        let record = self.inner.recovery.record_error(ctx, error, stage);
        request.reported_errors = ctx.error_history.len();

        let diagnostics = &self.inner.diagnostics;
        diagnostics.record_method(&ctx.request_id, method);
        diagnostics.add_error(&ctx.request_id, record.clone());
        diagnostics.record_attempt(&ctx.request_id, &ctx.rendering_id, method, Some(record.kind));

        if record.kind != ErrorKind::Cancelled {
            if let Some(sample) = request.sample(method, elapsed, 0, false) {
                self.inner.optimizer.record_performance(sample);
            }
        }

        tracing::warn!(
            rendering_id = %ctx.request_id,
            %method,
            attempt = ctx.attempt_count,
            stage = ?stage,
            kind = %record.kind,
            "Render attempt failed: {}",
            record.message
        );
        record
    }

    async fn finish_success(
        &self,
        mut ctx: RenderContext,
        request: &mut RequestState,
        pages: Vec<RenderedPage>,
        elapsed: Duration,
    ) -> RenderResult {
        let method = request.recovery.method;
        let request_id = ctx.request_id.clone();
        let memory: u64 = pages.iter().map(|page| page.byte_size as u64).sum();

        self.flush_errors(&ctx, request);
        let diagnostics = &self.inner.diagnostics;
        diagnostics.update_performance_metrics(&request_id, PerformanceMetrics::render(elapsed, memory));
        diagnostics.record_attempt(&request_id, &ctx.rendering_id, method, None);
        if let Some(sample) = request.sample(method, elapsed, memory, true) {
            self.inner.optimizer.record_performance(sample);
        }

        if let Some(source) = &request.source {
            let rendition = rendition_tag(method, ctx.options.scale);
            self.store_pages(&ctx.url, source, &pages, &rendition).await;
        }

        ctx.release_handles();
        self.inner.progress.complete(&request_id);
        let report = diagnostics
            .complete_diagnostics(&request_id, true)
            .unwrap_or_else(|| DiagnosticsReport::empty(&request_id, &ctx.url, diagnostics.environment().clone()));

        tracing::info!(
            rendering_id = %request_id,
            %method,
            pages = pages.len(),
            duration_ms = report.duration_ms,
            "Rendering complete"
        );

        RenderResult {
            rendering_id: request_id,
            success: true,
            method,
            pages,
            document_id: request.source.as_ref().map(|source| source.document_id.clone()),
            error: None,
            download_url: None,
            from_cache: false,
            diagnostics: report,
        }
    }

    /// Failed result; exhaustion degrades to a download link
    fn finish_failed(
        &self,
        mut ctx: RenderContext,
        request: &RequestState,
        record: ErrorRecord,
        exhausted: bool,
    ) -> RenderResult {
        let request_id = ctx.request_id.clone();
        ctx.release_handles();

        self.inner.progress.fail(&request_id, Some(&record.message));
        let diagnostics = &self.inner.diagnostics;
        diagnostics.update_stage(&request_id, RenderStage::Error);
        let report = diagnostics
            .complete_diagnostics(&request_id, false)
            .unwrap_or_else(|| DiagnosticsReport::empty(&request_id, &ctx.url, diagnostics.environment().clone()));

        let method = if exhausted {
            RenderingMethod::DownloadFallback
        } else {
            request.recovery.method
        };
        let download_url = (record.kind != ErrorKind::Cancelled).then(|| ctx.url.clone());

        if exhausted {
            tracing::warn!(
                rendering_id = %request_id,
                attempted = ?request.recovery.attempted,
                "All rendering methods failed, offering download"
            );
        } else {
            tracing::warn!(rendering_id = %request_id, kind = %record.kind, "Rendering failed");
        }

        RenderResult {
            rendering_id: request_id,
            success: false,
            method,
            pages: Vec::new(),
            document_id: request.source.as_ref().map(|source| source.document_id.clone()),
            error: Some(record),
            download_url,
            from_cache: false,
            diagnostics: report,
        }
    }

    async fn store_pages(
        &self,
        url: &str,
        source: &DocumentSource,
        pages: &[RenderedPage],
        rendition: &str,
    ) {
        let cache = &self.inner.cache;
        for page in pages.iter().filter(|page| page.has_image()) {
            cache
                .set_rendered_page(
                    &source.document_id,
                    page.page_number,
                    page.data.as_ref().clone(),
                    &page.content_type,
                    rendition,
                )
                .await;
        }
        cache
            .set_document_cache(DocumentInfo {
                document_id: source.document_id.clone(),
                url: url.to_string(),
                page_count: source.characteristics.page_count,
                size_bytes: source.characteristics.size_bytes,
                title: None,
                version: 1,
            })
            .await;
    }
}

/// Renders a known document page into the memory tier
#[async_trait]
impl PagePreloader for ReliableRenderer {
    async fn preload_page(&self, document_id: &str, page: u32) -> Result<()> {
        let info = self
            .inner
            .cache
            .peek_document(document_id)
            .await
            .ok_or_else(|| RenderError::Primitive(format!("unknown document {}", document_id)))?;

        let mut options = RenderOptions::from_config(&self.inner.config);
        options.pages = Some(vec![page]);
        let result = self.render(&info.url, options).await;
        match result.error {
            _ if result.success => Ok(()),
            Some(record) => Err(RenderError::Primitive(record.message)),
            None => Err(RenderError::Primitive(format!("page {} was not rendered", page))),
        }
    }
}
