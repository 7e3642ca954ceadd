//! Page-rendering primitive
//!
//! The engine never parses documents itself. A `PageRenderer` loads a
//! document from bytes and rasterizes pages onto canvases handed out by the
//! canvas pool.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::performance::Canvas;

/// Loads documents for rasterization
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn load_document(&self, data: Arc<Vec<u8>>) -> Result<Arc<dyn RenderableDocument>>;
}

/// A loaded document
#[async_trait]
pub trait RenderableDocument: Send + Sync {
    fn num_pages(&self) -> u32;

    /// Page size in points at scale 1.0
    async fn page_size(&self, page: u32) -> Result<(f32, f32)>;

    /// Rasterize `page` (1-based) onto `canvas`, which is already sized for `scale`
    async fn render_page(&self, page: u32, canvas: &mut Canvas, scale: f32) -> Result<()>;
}

/// Canvas dimensions for a page of `size` points at `scale`
pub fn scaled_dimensions(size: (f32, f32), scale: f32) -> (u32, u32) {
    let width = (size.0 * scale).ceil().max(1.0) as u32;
    let height = (size.1 * scale).ceil().max(1.0) as u32;
    (width, height)
}

#[cfg(feature = "mupdf")]
pub use self::mupdf_backend::MupdfPageRenderer;

#[cfg(feature = "mupdf")]
mod mupdf_backend {
    use std::sync::Arc;

    use async_trait::async_trait;
    use mupdf::{Colorspace, Document, Matrix};

    use super::{PageRenderer, RenderableDocument};
    use crate::error::{RenderError, Result};
    use crate::performance::Canvas;

    const MIME: &str = "application/pdf";

    fn mupdf_error(e: mupdf::Error) -> RenderError {
        RenderError::Primitive(e.to_string())
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| RenderError::Primitive(format!("render task failed: {}", e)))?
    }

    /// MuPDF-backed renderer
    ///
    /// MuPDF's `fz_context` is not thread-safe, so every operation opens a
    /// fresh document from the shared bytes on a blocking thread.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MupdfPageRenderer;

    impl MupdfPageRenderer {
        pub fn new() -> Self {
            Self
        }
    }

    struct MupdfDocument {
        data: Arc<Vec<u8>>,
        page_count: u32,
    }

    #[async_trait]
    impl PageRenderer for MupdfPageRenderer {
        async fn load_document(&self, data: Arc<Vec<u8>>) -> Result<Arc<dyn RenderableDocument>> {
            let bytes = data.clone();
            let page_count = blocking(move || {
                let doc = Document::from_bytes(&bytes, MIME).map_err(mupdf_error)?;
                if doc.needs_password().map_err(mupdf_error)? {
                    return Err(RenderError::PasswordProtected);
                }
                let count = doc.page_count().map_err(mupdf_error)?;
                if count <= 0 {
                    return Err(RenderError::Corrupted("document has no pages".to_string()));
                }
                Ok(count as u32)
            })
            .await?;

            Ok(Arc::new(MupdfDocument { data, page_count }))
        }
    }

    #[async_trait]
    impl RenderableDocument for MupdfDocument {
        fn num_pages(&self) -> u32 {
            self.page_count
        }

        async fn page_size(&self, page: u32) -> Result<(f32, f32)> {
            let data = self.data.clone();
            blocking(move || {
                let doc = Document::from_bytes(&data, MIME).map_err(mupdf_error)?;
                let page = doc.load_page(page as i32 - 1).map_err(mupdf_error)?;
                let bounds = page.bounds().map_err(mupdf_error)?;
                Ok((bounds.x1 - bounds.x0, bounds.y1 - bounds.y0))
            })
            .await
        }

        async fn render_page(&self, page: u32, canvas: &mut Canvas, scale: f32) -> Result<()> {
            let data = self.data.clone();
            let (width, height) = (canvas.width(), canvas.height());

            let rgba = blocking(move || {
                let doc = Document::from_bytes(&data, MIME).map_err(mupdf_error)?;
                let page = doc.load_page(page as i32 - 1).map_err(mupdf_error)?;
                let matrix = Matrix::new_scale(scale, scale);
                let pixmap = page
                    .to_pixmap(&matrix, &Colorspace::device_rgb(), true, true)
                    .map_err(mupdf_error)?;

                let samples = pixmap.samples();
                let n = pixmap.n() as usize;
                let src_width = pixmap.width() as usize;
                let src_height = pixmap.height() as usize;
                let mut rgba = vec![0u8; width as usize * height as usize * 4];

                for y in 0..src_height.min(height as usize) {
                    for x in 0..src_width.min(width as usize) {
                        let src = (y * src_width + x) * n;
                        let dst = (y * width as usize + x) * 4;
                        for c in 0..3 {
                            rgba[dst + c] = samples.get(src + c).copied().unwrap_or(0);
                        }
                        rgba[dst + 3] = if n >= 4 {
                            samples.get(src + 3).copied().unwrap_or(255)
                        } else {
                            255
                        };
                    }
                }
                Ok(rgba)
            })
            .await?;

            canvas.pixels_mut().copy_from_slice(&rgba);
            Ok(())
        }
    }
}
