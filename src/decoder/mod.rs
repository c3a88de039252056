//! Region decoding of tiles.
//!
//! Decoding is a strategy picked when the engine is built: a
//! [`TileDecoderFactory`] probes images and creates one [`TileDecoder`] per
//! image. The default factory is [`ImageTileDecoderFactory`].

pub mod image_decoder;
pub mod worker_pool;

use crate::bitmap::{TileBitmap, TileBitmapPool};
use crate::error::DecodeError;
use crate::exif_orientation::ExifOrientation;
use crate::geometry::{IntRect, IntSize};
use crate::image_info::ImageInfo;
use crate::image_source::ImageSource;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use image_decoder::{ImageTileDecoder, ImageTileDecoderFactory};
pub use worker_pool::DecodeWorkerPool;

/// Cooperative cancellation flag shared between a loading tile and its decode job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once the token has been cancelled
    pub fn check(&self) -> Result<(), DecodeError> {
        if self.is_cancelled() {
            Err(DecodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub trait TileDecoder: Send + Sync {
    /// Decode `src_rect` (display space, full resolution) downsampled by `sample_size`.
    ///
    /// The result is `ceil(src_rect.size / sample_size)` pixels, in display orientation.
    fn decode(
        &self,
        src_rect: IntRect,
        sample_size: u32,
        cancel: &CancelToken,
    ) -> Result<TileBitmap, DecodeError>;

    /// Release whatever the decoder keeps between calls
    fn close(&self) {}
}

/// What a factory learns about an image before any tile is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    /// Info of the encoded (raw) image
    pub image_info: ImageInfo,
    pub orientation: ExifOrientation,
}

impl PreparedImage {
    /// Image info in display space
    pub fn display_info(&self) -> ImageInfo {
        self.image_info.oriented(self.orientation)
    }
}

pub trait TileDecoderFactory: Send + Sync {
    fn read_image_info(&self, source: &dyn ImageSource) -> Result<PreparedImage, DecodeError>;

    fn supports_region_decode(&self, mime_type: &str) -> bool;

    fn create_decoder(
        &self,
        source: Arc<dyn ImageSource>,
        prepared: &PreparedImage,
        pool: Arc<TileBitmapPool>,
    ) -> Result<Arc<dyn TileDecoder>, DecodeError>;
}

/// Pixel size of a region decoded at `sample_size`
pub fn decoded_size(region: IntSize, sample_size: u32) -> (u32, u32) {
    let sample_size = sample_size.max(1);
    (
        (region.width.max(0) as u32).div_ceil(sample_size),
        (region.height.max(0) as u32).div_ceil(sample_size),
    )
}

/// Run a decode, turning a panic inside the decoder into `DecodeFailed`.
pub fn decode_catching_panics(
    decoder: &dyn TileDecoder,
    src_rect: IntRect,
    sample_size: u32,
    cancel: &CancelToken,
) -> Result<TileBitmap, DecodeError> {
    match panic::catch_unwind(AssertUnwindSafe(|| {
        decoder.decode(src_rect, sample_size, cancel)
    })) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(msg) = payload.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown panic payload".to_string()
            };
            log::error!("Tile decoder panicked on {src_rect} sample {sample_size}: {message}");
            Err(DecodeError::DecodeFailed(format!("decoder panicked: {message}")))
        }
    }
}
