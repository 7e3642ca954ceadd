//! Renderer data types

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{BrowserEnvironment, DiagnosticsReport};
use crate::error::ErrorRecord;

/// Strategy for turning a document page into displayable pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderingMethod {
    /// Page rasterization onto a pooled canvas
    Canvas,
    /// Hand the document to the viewer's built-in PDF viewer
    NativeViewer,
    /// Page images produced by a conversion service
    ServerConversion,
    /// Low-memory rasterization delivered as compressed images
    ImageBased,
    /// Terminal outcome: only a download link is offered
    DownloadFallback,
}

impl RenderingMethod {
    /// Fallback order; `DownloadFallback` is never part of the chain
    pub const FALLBACK_CHAIN: [RenderingMethod; 4] = [
        RenderingMethod::Canvas,
        RenderingMethod::NativeViewer,
        RenderingMethod::ServerConversion,
        RenderingMethod::ImageBased,
    ];

    /// First method in the chain that has not been attempted yet
    pub fn next_untried(attempted: &[RenderingMethod]) -> Option<RenderingMethod> {
        Self::FALLBACK_CHAIN
            .into_iter()
            .find(|method| !attempted.contains(method))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RenderingMethod::Canvas => "CANVAS",
            RenderingMethod::NativeViewer => "NATIVE_VIEWER",
            RenderingMethod::ServerConversion => "SERVER_CONVERSION",
            RenderingMethod::ImageBased => "IMAGE_BASED",
            RenderingMethod::DownloadFallback => "DOWNLOAD_FALLBACK",
        }
    }
}

impl std::fmt::Display for RenderingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
    /// Upper bound for one attempt
    pub timeout: Duration,
    /// Retries of one method before falling back
    pub max_retries_per_method: u32,
    pub fallback_enabled: bool,
    pub default_scale: f32,
    /// Pages rendered when the request does not list any
    pub default_page_limit: u32,
    /// Base URL of the page conversion service
    pub conversion_endpoint: Option<String>,
    pub environment: BrowserEnvironment,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries_per_method: 3,
            fallback_enabled: true,
            default_scale: 1.5,
            default_page_limit: 5,
            conversion_endpoint: None,
            environment: BrowserEnvironment::default(),
        }
    }
}

/// Resolved per-request options
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub timeout: Duration,
    /// Skips method selection when set
    pub preferred_method: Option<RenderingMethod>,
    pub fallback_enabled: bool,
    pub max_retries: u32,
    pub scale: f32,
    /// Explicit page numbers (1-based); `None` renders the first `page_limit` pages
    pub pages: Option<Vec<u32>>,
    pub page_limit: u32,
}

impl RenderOptions {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            timeout: config.timeout,
            preferred_method: None,
            fallback_enabled: config.fallback_enabled,
            max_retries: config.max_retries_per_method,
            scale: config.default_scale,
            pages: None,
            page_limit: config.default_page_limit,
        }
    }

    /// Page numbers to render for a document with `num_pages` pages
    pub fn pages_for(&self, num_pages: u32) -> Vec<u32> {
        match &self.pages {
            Some(pages) => pages
                .iter()
                .copied()
                .filter(|&page| page >= 1 && page <= num_pages)
                .collect(),
            None => (1..=num_pages.min(self.page_limit.max(1))).collect(),
        }
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from_config(&RendererConfig::default())
    }
}

/// One delivered page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPage {
    pub page_number: u32,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
    #[serde(skip)]
    pub data: Arc<Vec<u8>>,
    pub byte_size: usize,
    /// Set when the page is displayed by the viewer itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_url: Option<String>,
}

impl RenderedPage {
    pub fn image(page_number: u32, width: u32, height: u32, content_type: &str, data: Vec<u8>) -> Self {
        Self {
            page_number,
            width,
            height,
            content_type: content_type.to_string(),
            byte_size: data.len(),
            data: Arc::new(data),
            viewer_url: None,
        }
    }

    pub fn viewer(page_number: u32, viewer_url: String) -> Self {
        Self {
            page_number,
            width: 0,
            height: 0,
            content_type: "application/pdf".to_string(),
            data: Arc::new(Vec::new()),
            byte_size: 0,
            viewer_url: Some(viewer_url),
        }
    }

    pub fn has_image(&self) -> bool {
        self.viewer_url.is_none() && self.byte_size > 0
    }
}

/// Outcome of a render request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    pub rendering_id: String,
    pub success: bool,
    pub method: RenderingMethod,
    pub pages: Vec<RenderedPage>,
    /// Cache key of the document, when its bytes were fetched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Offered when every method failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Served from the memory tier without rendering
    pub from_cache: bool,
    pub diagnostics: DiagnosticsReport,
}

/// Entry of the active-render table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRender {
    pub rendering_id: String,
    /// Id of the context currently running
    pub attempt_id: String,
    pub url: String,
    pub method: RenderingMethod,
    pub attempt: u32,
}
