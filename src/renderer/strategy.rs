//! Rendering strategies
//!
//! One strategy per rendering method. A strategy runs a single attempt in
//! the context it is handed and reports stage progress through a
//! `StageReporter`; retry and fallback are decided by the orchestrator.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use super::analysis::DocumentCharacteristics;
use super::primitive::{scaled_dimensions, PageRenderer};
use super::types::{RenderedPage, RenderingMethod};
use crate::diagnostics::{BrowserCapabilities, DiagnosticsCollector};
use crate::error::{RenderError, Result};
use crate::network::NetworkResilience;
use crate::performance::{Canvas, CanvasPool};
use crate::progress::{ProgressTracker, ProgressUpdate, RenderStage};
use crate::recovery::RenderContext;

/// Fetched document bytes shared across the attempts of one request
#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub data: Arc<Vec<u8>>,
    pub characteristics: DocumentCharacteristics,
    pub document_id: String,
}

/// Writes progress into the attempt context, the tracker and diagnostics
#[derive(Clone)]
pub struct StageReporter {
    progress: ProgressTracker,
    diagnostics: DiagnosticsCollector,
}

impl StageReporter {
    pub fn new(progress: ProgressTracker, diagnostics: DiagnosticsCollector) -> Self {
        Self {
            progress,
            diagnostics,
        }
    }

    pub fn report(&self, ctx: &mut RenderContext, update: ProgressUpdate) {
        let previous = ctx.progress.stage;
        ctx.progress.apply(&update);
        if ctx.progress.stage != previous {
            self.diagnostics
                .update_stage(&ctx.request_id, ctx.progress.stage);
        }
        self.progress.update(&ctx.request_id, update);
    }
}

/// One rendering method
#[async_trait]
pub trait RenderStrategy: Send + Sync {
    fn method(&self) -> RenderingMethod;

    /// Whether the document bytes must be fetched before `render`
    fn needs_source(&self) -> bool {
        true
    }

    async fn render(
        &self,
        ctx: &mut RenderContext,
        source: Option<&DocumentSource>,
    ) -> Result<Vec<RenderedPage>>;
}

#[derive(Debug, Clone, Copy)]
enum PageEncoding {
    Png,
    Jpeg,
}

impl PageEncoding {
    fn content_type(self) -> &'static str {
        match self {
            PageEncoding::Png => "image/png",
            PageEncoding::Jpeg => "image/jpeg",
        }
    }

    fn encode(self, canvas: &Canvas) -> Result<Vec<u8>> {
        let image = canvas
            .to_image()
            .ok_or_else(|| RenderError::Canvas("canvas buffer does not match its size".to_string()))?;

        let mut out = Cursor::new(Vec::new());
        let written = match self {
            PageEncoding::Png => DynamicImage::ImageRgba8(image).write_to(&mut out, ImageFormat::Png),
            // JPEG has no alpha channel
            PageEncoding::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8())
                .write_to(&mut out, ImageFormat::Jpeg),
        };
        written.map_err(|e| RenderError::Canvas(format!("page encoding failed: {}", e)))?;
        Ok(out.into_inner())
    }
}

/// Dimensions and MIME type of an encoded image, read from its header
pub(crate) fn probe_image(data: &[u8]) -> Result<(u32, u32, &'static str)> {
    let unreadable = |e: std::io::Error| RenderError::Primitive(format!("unreadable page image: {}", e));
    let reader = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(unreadable)?;
    let content_type = reader
        .format()
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| RenderError::Primitive(format!("unreadable page image: {}", e)))?;
    Ok((width, height, content_type))
}

fn missing_source() -> RenderError {
    RenderError::Primitive("document bytes were not loaded".to_string())
}

/// Rasterize the requested pages one pooled canvas at a time
async fn rasterize(
    renderer: &dyn PageRenderer,
    pool: &CanvasPool,
    reporter: &StageReporter,
    ctx: &mut RenderContext,
    source: &DocumentSource,
    scale: f32,
    encoding: PageEncoding,
) -> Result<Vec<RenderedPage>> {
    reporter.report(ctx, ProgressUpdate::stage(RenderStage::Parsing));
    let document = renderer.load_document(source.data.clone()).await?;
    ctx.document = Some(document.clone());

    let pages = ctx.options.pages_for(document.num_pages());
    reporter.report(
        ctx,
        ProgressUpdate::stage(RenderStage::Rendering)
            .with_message(format!("Rendering {} pages", pages.len())),
    );

    let mut rendered = Vec::with_capacity(pages.len());
    for (index, &page) in pages.iter().enumerate() {
        let (width, height) = scaled_dimensions(document.page_size(page).await?, scale);

        // Replacing the slot returns the previous page's canvas to the pool
        ctx.canvas = None;
        let canvas = ctx.canvas.insert(pool.acquire(width, height)?);
        document.render_page(page, &mut **canvas, scale).await?;
        let data = encoding.encode(&**canvas)?;

        tracing::trace!(
            rendering_id = %ctx.rendering_id,
            page,
            bytes = data.len(),
            "Page rasterized"
        );
        rendered.push(RenderedPage::image(
            page,
            width,
            height,
            encoding.content_type(),
            data,
        ));
        reporter.report(
            ctx,
            ProgressUpdate::stage(RenderStage::Rendering)
                .with_stage_progress((index + 1) as f64 / pages.len() as f64),
        );
    }

    ctx.canvas = None;
    reporter.report(ctx, ProgressUpdate::stage(RenderStage::Finalizing));
    Ok(rendered)
}

/// Full-resolution rasterization onto pooled canvases, PNG output
pub struct CanvasStrategy {
    renderer: Option<Arc<dyn PageRenderer>>,
    pool: CanvasPool,
    reporter: StageReporter,
}

impl CanvasStrategy {
    pub fn new(
        renderer: Option<Arc<dyn PageRenderer>>,
        pool: CanvasPool,
        reporter: StageReporter,
    ) -> Self {
        Self {
            renderer,
            pool,
            reporter,
        }
    }
}

#[async_trait]
impl RenderStrategy for CanvasStrategy {
    fn method(&self) -> RenderingMethod {
        RenderingMethod::Canvas
    }

    async fn render(
        &self,
        ctx: &mut RenderContext,
        source: Option<&DocumentSource>,
    ) -> Result<Vec<RenderedPage>> {
        let renderer = self.renderer.as_deref().ok_or_else(|| {
            RenderError::BrowserCompatibility("no page renderer is available".to_string())
        })?;
        let source = source.ok_or_else(missing_source)?;
        let scale = ctx.options.scale;
        rasterize(
            renderer,
            &self.pool,
            &self.reporter,
            ctx,
            source,
            scale,
            PageEncoding::Png,
        )
        .await
    }
}

/// Low-memory rasterization at half scale, JPEG output
pub struct ImageBasedStrategy {
    renderer: Option<Arc<dyn PageRenderer>>,
    pool: CanvasPool,
    reporter: StageReporter,
}

impl ImageBasedStrategy {
    pub fn new(
        renderer: Option<Arc<dyn PageRenderer>>,
        pool: CanvasPool,
        reporter: StageReporter,
    ) -> Self {
        Self {
            renderer,
            pool,
            reporter,
        }
    }
}

#[async_trait]
impl RenderStrategy for ImageBasedStrategy {
    fn method(&self) -> RenderingMethod {
        RenderingMethod::ImageBased
    }

    async fn render(
        &self,
        ctx: &mut RenderContext,
        source: Option<&DocumentSource>,
    ) -> Result<Vec<RenderedPage>> {
        let renderer = self.renderer.as_deref().ok_or_else(|| {
            RenderError::BrowserCompatibility("no page renderer is available".to_string())
        })?;
        let source = source.ok_or_else(missing_source)?;
        let scale = (ctx.options.scale * 0.5).max(0.25);
        rasterize(
            renderer,
            &self.pool,
            &self.reporter,
            ctx,
            source,
            scale,
            PageEncoding::Jpeg,
        )
        .await
    }
}

/// Page numbers when the page count may be unknown
fn requested_pages(ctx: &RenderContext, source: Option<&DocumentSource>) -> Vec<u32> {
    match source {
        Some(source) => ctx.options.pages_for(source.characteristics.page_count),
        None => ctx.options.pages.clone().unwrap_or_else(|| vec![1]),
    }
}

/// Hands the document URL to the viewer's built-in PDF viewer
pub struct NativeViewerStrategy {
    capabilities: BrowserCapabilities,
    reporter: StageReporter,
}

impl NativeViewerStrategy {
    pub fn new(capabilities: BrowserCapabilities, reporter: StageReporter) -> Self {
        Self {
            capabilities,
            reporter,
        }
    }
}

#[async_trait]
impl RenderStrategy for NativeViewerStrategy {
    fn method(&self) -> RenderingMethod {
        RenderingMethod::NativeViewer
    }

    fn needs_source(&self) -> bool {
        false
    }

    async fn render(
        &self,
        ctx: &mut RenderContext,
        source: Option<&DocumentSource>,
    ) -> Result<Vec<RenderedPage>> {
        if !self.capabilities.native_pdf_viewer {
            return Err(RenderError::BrowserCompatibility(
                "native PDF viewer not available".to_string(),
            ));
        }

        let pages: Vec<RenderedPage> = requested_pages(ctx, source)
            .into_iter()
            .map(|page| RenderedPage::viewer(page, format!("{}#page={}", ctx.url, page)))
            .collect();
        self.reporter
            .report(ctx, ProgressUpdate::stage(RenderStage::Finalizing));
        Ok(pages)
    }
}

/// Page images produced by the conversion service
pub struct ServerConversionStrategy {
    endpoint: Option<String>,
    network: NetworkResilience,
    reporter: StageReporter,
}

impl ServerConversionStrategy {
    pub fn new(endpoint: Option<String>, network: NetworkResilience, reporter: StageReporter) -> Self {
        Self {
            endpoint,
            network,
            reporter,
        }
    }

    fn page_url(endpoint: &str, source_url: &str, page: u32) -> String {
        format!(
            "{}?source={}&page={}",
            endpoint.trim_end_matches('/'),
            urlencoding::encode(source_url),
            page
        )
    }
}

#[async_trait]
impl RenderStrategy for ServerConversionStrategy {
    fn method(&self) -> RenderingMethod {
        RenderingMethod::ServerConversion
    }

    fn needs_source(&self) -> bool {
        false
    }

    async fn render(
        &self,
        ctx: &mut RenderContext,
        source: Option<&DocumentSource>,
    ) -> Result<Vec<RenderedPage>> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            RenderError::BrowserCompatibility("server conversion is not configured".to_string())
        })?;

        let pages = requested_pages(ctx, source);
        self.reporter
            .report(ctx, ProgressUpdate::stage(RenderStage::Rendering));

        let mut rendered = Vec::with_capacity(pages.len());
        for (index, &page) in pages.iter().enumerate() {
            let response = self
                .network
                .fetch(&Self::page_url(endpoint, &ctx.url, page))
                .await?;

            let (width, height, content_type) = probe_image(&response.data)?;

            rendered.push(RenderedPage::image(
                page,
                width,
                height,
                content_type,
                response.data,
            ));
            self.reporter.report(
                ctx,
                ProgressUpdate::stage(RenderStage::Rendering)
                    .with_stage_progress((index + 1) as f64 / pages.len() as f64),
            );
        }

        self.reporter
            .report(ctx, ProgressUpdate::stage(RenderStage::Finalizing));
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{BrowserEnvironment, DiagnosticsConfig};
    use crate::network::mock::{MockTransport, Scripted};
    use crate::network::NetworkConfig;
    use crate::renderer::analysis::fixtures::pdf_bytes;
    use crate::renderer::analysis::DocumentAnalyzer;
    use crate::renderer::primitive::mock::MockPageRenderer;
    use crate::renderer::RenderOptions;

    fn reporter() -> StageReporter {
        StageReporter::new(
            ProgressTracker::default(),
            DiagnosticsCollector::new(DiagnosticsConfig::default(), BrowserEnvironment::default()),
        )
    }

    fn source(pages: u32) -> DocumentSource {
        let data = pdf_bytes(pages, 0);
        DocumentSource {
            characteristics: DocumentAnalyzer::new().analyze(&data),
            data: Arc::new(data),
            document_id: "doc-1".to_string(),
        }
    }

    fn context(method: RenderingMethod) -> RenderContext {
        RenderContext::new("https://cdn.example.com/book.pdf", RenderOptions::default(), method)
    }

    #[tokio::test]
    async fn test_canvas_strategy_renders_png_pages() {
        let pool = CanvasPool::with_max_area(2, 1 << 20);
        let strategy = CanvasStrategy::new(
            Some(Arc::new(MockPageRenderer::new(3))),
            pool.clone(),
            reporter(),
        );
        let mut ctx = context(RenderingMethod::Canvas);

        let pages = strategy.render(&mut ctx, Some(&source(3))).await.unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].content_type, "image/png");
        assert_eq!((pages[0].width, pages[0].height), (60, 90));
        assert!(pages.iter().all(RenderedPage::has_image));
        assert_eq!(ctx.progress.stage, RenderStage::Finalizing);
        assert!(ctx.canvas.is_none());

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 2);
    }

    #[tokio::test]
    async fn test_image_based_uses_half_scale_jpeg() {
        let strategy = ImageBasedStrategy::new(
            Some(Arc::new(MockPageRenderer::new(1))),
            CanvasPool::with_max_area(2, 1 << 20),
            reporter(),
        );
        let mut ctx = context(RenderingMethod::ImageBased);
        ctx.options.scale = 2.0;

        let pages = strategy.render(&mut ctx, Some(&source(1))).await.unwrap();

        assert_eq!(pages[0].content_type, "image/jpeg");
        assert_eq!((pages[0].width, pages[0].height), (40, 60));
    }

    #[tokio::test]
    async fn test_canvas_strategy_without_renderer_is_incompatible() {
        let strategy = CanvasStrategy::new(None, CanvasPool::with_max_area(1, 1 << 20), reporter());
        let mut ctx = context(RenderingMethod::Canvas);

        let error = strategy.render(&mut ctx, Some(&source(1))).await.unwrap_err();
        assert!(matches!(error, RenderError::BrowserCompatibility(_)));
    }

    #[tokio::test]
    async fn test_canvas_failure_keeps_pool_balanced() {
        let pool = CanvasPool::with_max_area(2, 1 << 20);
        let renderer = MockPageRenderer::failing_renders(2, 1, || {
            RenderError::Canvas("context lost".to_string())
        });
        let strategy = CanvasStrategy::new(Some(Arc::new(renderer)), pool.clone(), reporter());
        let mut ctx = context(RenderingMethod::Canvas);

        let error = strategy.render(&mut ctx, Some(&source(2))).await.unwrap_err();
        assert!(matches!(error, RenderError::Canvas(_)));

        ctx.release_handles();
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_native_viewer_requires_capability() {
        let mut capabilities = BrowserCapabilities::default();
        capabilities.native_pdf_viewer = false;
        let strategy = NativeViewerStrategy::new(capabilities, reporter());
        let mut ctx = context(RenderingMethod::NativeViewer);

        let error = strategy.render(&mut ctx, None).await.unwrap_err();
        assert!(matches!(error, RenderError::BrowserCompatibility(_)));
    }

    #[tokio::test]
    async fn test_native_viewer_links_pages() {
        let strategy = NativeViewerStrategy::new(BrowserCapabilities::default(), reporter());
        let mut ctx = context(RenderingMethod::NativeViewer);
        ctx.options.pages = Some(vec![2, 4]);

        let pages = strategy.render(&mut ctx, None).await.unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[1].viewer_url.as_deref(),
            Some("https://cdn.example.com/book.pdf#page=4")
        );
        assert!(!pages[1].has_image());
    }

    #[tokio::test]
    async fn test_server_conversion_fetches_each_page() {
        let mut png = Cursor::new(Vec::new());
        DynamicImage::new_rgba8(8, 12)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        let png = png.into_inner();

        let transport = Arc::new(MockTransport::new(vec![
            Scripted::Respond {
                status: 200,
                body: png.clone(),
            },
            Scripted::Respond {
                status: 200,
                body: png,
            },
        ]));
        let network = NetworkResilience::new(transport.clone(), NetworkConfig::default());
        let strategy = ServerConversionStrategy::new(
            Some("https://convert.example.com/pages/".to_string()),
            network,
            reporter(),
        );
        let mut ctx = context(RenderingMethod::ServerConversion);

        let pages = strategy.render(&mut ctx, Some(&source(2))).await.unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].content_type, "image/png");
        assert_eq!((pages[0].width, pages[0].height), (8, 12));

        let requests = transport.requests();
        assert_eq!(
            requests[1].url,
            "https://convert.example.com/pages?source=https%3A%2F%2Fcdn.example.com%2Fbook.pdf&page=2"
        );
    }

    #[tokio::test]
    async fn test_server_conversion_unconfigured_is_incompatible() {
        let network = NetworkResilience::new(
            Arc::new(MockTransport::default()),
            NetworkConfig::default(),
        );
        let strategy = ServerConversionStrategy::new(None, network, reporter());
        let mut ctx = context(RenderingMethod::ServerConversion);

        let error = strategy.render(&mut ctx, None).await.unwrap_err();
        assert!(matches!(error, RenderError::BrowserCompatibility(_)));
    }
}
