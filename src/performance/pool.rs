//! Canvas pooling
//!
//! Rasterization surfaces are expensive to allocate, so they are pooled and
//! reused across pages and attempts.
//!
//! ```text
//! acquire(w, h) ──▶ PooledCanvas ──▶ render_page(...) ──▶ drop()
//!     │                                                     │
//!  [pop or create]                               [back to pool if room]
//!  [active += 1]                                 [active -= 1]
//! ```
//!
//! The guard owns an `Arc` to the pool so it can be stored in a render
//! context and outlive the call that acquired it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{RenderError, Result};

/// RGBA8 drawing surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Bytes held by the pixel buffer
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Reshape the surface, reusing the allocation, and clear it
    pub fn reset(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width as usize * height as usize * 4, 0);
    }

    /// Copy the surface into an `image` buffer
    pub fn to_image(&self) -> Option<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

/// Allocates canvases for the pool
pub trait CanvasFactory: Send + Sync {
    fn create(&self, width: u32, height: u32) -> Result<Canvas>;

    /// Whether a pooled canvas may be reshaped to these dimensions
    fn permits(&self, width: u32, height: u32) -> bool;
}

/// Factory enforcing a maximum surface area
#[derive(Debug, Clone, Copy)]
pub struct DefaultCanvasFactory {
    max_area: u64,
}

impl DefaultCanvasFactory {
    pub fn new(max_area: u64) -> Self {
        Self { max_area }
    }
}

impl CanvasFactory for DefaultCanvasFactory {
    fn create(&self, width: u32, height: u32) -> Result<Canvas> {
        if !self.permits(width, height) {
            return Err(RenderError::Canvas(format!(
                "cannot allocate {}x{} canvas (max area {})",
                width, height, self.max_area
            )));
        }
        Ok(Canvas::new(width, height))
    }

    fn permits(&self, width: u32, height: u32) -> bool {
        let area = width as u64 * height as u64;
        area > 0 && area <= self.max_area
    }
}

struct PoolInner {
    available: Mutex<Vec<Canvas>>,
    factory: Arc<dyn CanvasFactory>,
    max_size: AtomicUsize,
    created_count: AtomicUsize,
    active_count: AtomicUsize,
    peak_active: AtomicUsize,
    reused_count: AtomicUsize,
}

impl PoolInner {
    fn release(&self, canvas: Canvas) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);

        let mut pool = self.available.lock();
        if pool.len() < self.max_size.load(Ordering::Relaxed) {
            pool.push(canvas);
        }
    }
}

/// Thread-safe canvas pool
#[derive(Clone)]
pub struct CanvasPool {
    inner: Arc<PoolInner>,
}

impl CanvasPool {
    pub fn new(max_size: usize, factory: Arc<dyn CanvasFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                available: Mutex::new(Vec::with_capacity(max_size)),
                factory,
                max_size: AtomicUsize::new(max_size),
                created_count: AtomicUsize::new(0),
                active_count: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                reused_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_max_area(max_size: usize, max_area: u64) -> Self {
        Self::new(max_size, Arc::new(DefaultCanvasFactory::new(max_area)))
    }

    /// Take a canvas of the given size, reusing a pooled one when possible
    pub fn acquire(&self, width: u32, height: u32) -> Result<PooledCanvas> {
        let pooled = if self.inner.factory.permits(width, height) {
            self.inner.available.lock().pop()
        } else {
            None
        };

        let canvas = match pooled {
            Some(mut canvas) => {
                canvas.reset(width, height);
                self.inner.reused_count.fetch_add(1, Ordering::Relaxed);
                canvas
            }
            None => {
                let canvas = self.inner.factory.create(width, height)?;
                self.inner.created_count.fetch_add(1, Ordering::Relaxed);
                canvas
            }
        };

        let active = self.inner.active_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.peak_active.fetch_max(active, Ordering::Relaxed);

        Ok(PooledCanvas {
            canvas,
            pool: self.inner.clone(),
        })
    }

    /// Change the pool capacity, dropping surplus idle canvases
    pub fn resize(&self, max_size: usize) {
        self.inner.max_size.store(max_size, Ordering::Relaxed);
        self.inner.available.lock().truncate(max_size);
    }

    /// Drop idle canvases down to `keep`, without changing capacity
    pub fn shrink_to(&self, keep: usize) -> usize {
        let mut available = self.inner.available.lock();
        let before = available.len();
        available.truncate(keep);
        before - available.len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CanvasPoolStats {
        CanvasPoolStats {
            created: self.inner.created_count.load(Ordering::Relaxed),
            reused: self.inner.reused_count.load(Ordering::Relaxed),
            active: self.inner.active_count.load(Ordering::Relaxed),
            available: self.inner.available.lock().len(),
            peak_active: self.inner.peak_active.load(Ordering::Relaxed),
            max_size: self.max_size(),
        }
    }

    /// Reset the high-water mark used for adaptive sizing
    pub fn reset_peak(&self) {
        let active = self.inner.active_count.load(Ordering::Relaxed);
        self.inner.peak_active.store(active, Ordering::Relaxed);
    }
}

/// RAII guard, returns the canvas to the pool on drop
pub struct PooledCanvas {
    canvas: Canvas,
    pool: Arc<PoolInner>,
}

impl Deref for PooledCanvas {
    type Target = Canvas;

    fn deref(&self) -> &Canvas {
        &self.canvas
    }
}

impl DerefMut for PooledCanvas {
    fn deref_mut(&mut self) -> &mut Canvas {
        &mut self.canvas
    }
}

impl std::fmt::Debug for PooledCanvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledCanvas")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Drop for PooledCanvas {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.canvas));
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasPoolStats {
    /// Canvases ever allocated
    pub created: usize,
    /// Acquisitions served from the pool
    pub reused: usize,
    pub active: usize,
    pub available: usize,
    pub peak_active: usize,
    pub max_size: usize,
}

impl CanvasPoolStats {
    /// Share of acquisitions served without allocating (0.0 to 1.0)
    pub fn reuse_efficiency(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            return 1.0;
        }
        self.reused as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_size: usize) -> CanvasPool {
        CanvasPool::with_max_area(max_size, 1024 * 1024)
    }

    #[test]
    fn test_acquire_release_reuses() {
        let pool = pool(2);

        {
            let canvas = pool.acquire(100, 50).unwrap();
            assert_eq!(canvas.byte_size(), 100 * 50 * 4);
            assert_eq!(pool.stats().active, 1);
        }

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.available, 1);

        let canvas = pool.acquire(20, 20).unwrap();
        assert_eq!(canvas.width(), 20);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert!((stats.reuse_efficiency() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_keeps_at_most_max_size() {
        let pool = pool(2);
        let a = pool.acquire(10, 10).unwrap();
        let b = pool.acquire(10, 10).unwrap();
        let c = pool.acquire(10, 10).unwrap();
        assert_eq!(pool.stats().peak_active, 3);

        drop(a);
        drop(b);
        drop(c);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn test_oversized_canvas_is_canvas_error() {
        let pool = pool(2);
        let error = pool.acquire(4096, 4096).unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::CanvasError);
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_shrink_and_resize() {
        let pool = pool(4);
        let canvases: Vec<_> = (0..4).map(|_| pool.acquire(8, 8).unwrap()).collect();
        drop(canvases);
        assert_eq!(pool.stats().available, 4);

        assert_eq!(pool.shrink_to(1), 3);
        assert_eq!(pool.stats().available, 1);

        pool.resize(0);
        assert_eq!(pool.stats().available, 0);
        drop(pool.acquire(8, 8).unwrap());
        assert_eq!(pool.stats().available, 0);
    }

    #[test]
    fn test_reset_clears_pixels() {
        let pool = pool(1);
        {
            let mut canvas = pool.acquire(2, 2).unwrap();
            canvas.pixels_mut().fill(255);
        }
        let canvas = pool.acquire(2, 2).unwrap();
        assert!(canvas.pixels().iter().all(|&b| b == 0));
        assert!(canvas.to_image().is_some());
    }
}
