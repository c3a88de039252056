//! Decoded tile pixels and the memory that backs them.
//!
//! A [`TileBitmap`] is an immutable RGBA8 buffer shared by handle. Buffers
//! checked out of a [`TileBitmapPool`] go back to that pool when the last
//! handle drops, so the next tile of the same dimensions reuses the allocation.

pub mod cache;
pub mod pool;

use image::RgbaImage;
use std::fmt;
use std::sync::{Arc, Weak};

pub use cache::{MemoryTileBitmapCache, TileBitmapCache};
pub use pool::{PoolStats, TileBitmapPool};

pub const BYTES_PER_PIXEL: usize = 4;

/// How aggressively cached memory should be given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimLevel {
    /// Release about half of what is held
    Moderate,
    /// Release everything
    Complete,
}

#[derive(Clone)]
pub struct TileBitmap {
    inner: Arc<BitmapData>,
}

struct BitmapData {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    pool: Option<Weak<TileBitmapPool>>,
}

impl Drop for BitmapData {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|pool| pool.upgrade()) {
            pool.checkin(self.width, self.height, std::mem::take(&mut self.pixels));
        }
    }
}

impl TileBitmap {
    /// Wrap pixels that do not belong to any pool
    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            inner: Arc::new(BitmapData {
                width,
                height,
                pixels: image.into_raw(),
                pool: None,
            }),
        }
    }

    /// Wrap a buffer checked out of `pool`; it is checked back in on the last drop.
    pub fn from_pooled(width: u32, height: u32, pixels: Vec<u8>, pool: &Arc<TileBitmapPool>) -> Self {
        debug_assert_eq!(pixels.len(), byte_count_of(width, height));
        Self {
            inner: Arc::new(BitmapData {
                width,
                height,
                pixels,
                pool: Some(Arc::downgrade(pool)),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.inner.pixels
    }

    pub fn byte_count(&self) -> usize {
        self.inner.pixels.len()
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width(), self.height(), self.inner.pixels.clone())
    }

    /// Whether both handles point at the same allocation
    pub fn same_allocation(&self, other: &TileBitmap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for TileBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileBitmap({}x{})", self.width(), self.height())
    }
}

pub fn byte_count_of(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_clone_shares_allocation() {
        let bitmap = TileBitmap::from_rgba(RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 4])));
        let other = bitmap.clone();
        assert!(bitmap.same_allocation(&other));
        assert_eq!(bitmap.handle_count(), 2);
        assert_eq!(bitmap.byte_count(), 32);
        assert_eq!(other.to_rgba_image().unwrap().get_pixel(3, 1), &Rgba([1, 2, 3, 4]));
    }

    #[test]
    fn test_last_handle_returns_buffer_to_pool() {
        let pool = Arc::new(TileBitmapPool::new(1024 * 1024, true));
        let pixels = pool.checkout(8, 8);
        let bitmap = TileBitmap::from_pooled(8, 8, pixels, &pool);
        let copy = bitmap.clone();

        drop(bitmap);
        assert_eq!(pool.bytes(), 0);

        drop(copy);
        assert_eq!(pool.bytes(), byte_count_of(8, 8));

        let _reused = pool.checkout(8, 8);
        assert_eq!(pool.stats().hits, 1);
    }
}
