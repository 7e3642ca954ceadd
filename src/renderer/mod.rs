//! Reliable rendering
//!
//! `ReliableRenderer` turns a document URL into rendered pages. Documents
//! are fetched through the network layer, analyzed, and rendered with the
//! method the performance optimizer selects. Failed attempts are retried in
//! fresh contexts and fall back along the method chain:
//!
//! ```text
//!   CANVAS ─▶ NATIVE_VIEWER ─▶ SERVER_CONVERSION ─▶ IMAGE_BASED ─▶ DOWNLOAD_FALLBACK
//! ```

pub mod analysis;
mod orchestrator;
pub mod primitive;
mod strategy;
mod types;

pub use analysis::{ContentComplexity, DocumentAnalyzer, DocumentCharacteristics};
pub use orchestrator::{document_id_for, ReliableRenderer, RendererComponents};
#[cfg(feature = "mupdf")]
pub use primitive::MupdfPageRenderer;
pub use primitive::{scaled_dimensions, PageRenderer, RenderableDocument};
pub use strategy::{
    CanvasStrategy, DocumentSource, ImageBasedStrategy, NativeViewerStrategy, RenderStrategy,
    ServerConversionStrategy, StageReporter,
};
pub use types::{
    ActiveRender, RenderOptions, RenderResult, RenderedPage, RendererConfig, RenderingMethod,
};
