use crate::bitmap::{TileBitmap, TileBitmapPool};
use crate::decoder::{
    CancelToken, PreparedImage, TileDecoder, TileDecoderFactory, decoded_size,
};
use crate::error::{DecodeError, DecodeErrorKind};
use crate::exif_orientation::ExifOrientation;
use crate::geometry::{IntRect, IntSize};
use crate::image_info::{ImageInfo, MIME_SVG};
use crate::image_source::ImageSource;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Decoder factory that reports a fixed image and paints every tile a flat
/// colour. Each decode still opens the source, so source failures surface as
/// tile errors.
#[derive(Clone)]
pub struct FakeDecoderFactory {
    inner: Arc<FakeState>,
}

struct FakeState {
    image_size: IntSize,
    mime_type: String,
    decode_delay: Duration,
    decodes: Mutex<Vec<(IntRect, u32)>>,
    decoders_created: AtomicUsize,
    failure: Mutex<Option<DecodeErrorKind>>,
}

impl FakeDecoderFactory {
    pub fn new(image_size: IntSize) -> Self {
        Self::build(image_size, "image/jpeg", Duration::ZERO)
    }

    pub fn with_mime_type(image_size: IntSize, mime_type: &str) -> Self {
        Self::build(image_size, mime_type, Duration::ZERO)
    }

    pub fn with_decode_delay(image_size: IntSize, decode_delay: Duration) -> Self {
        Self::build(image_size, "image/jpeg", decode_delay)
    }

    fn build(image_size: IntSize, mime_type: &str, decode_delay: Duration) -> Self {
        Self {
            inner: Arc::new(FakeState {
                image_size,
                mime_type: mime_type.to_string(),
                decode_delay,
                decodes: Mutex::new(Vec::new()),
                decoders_created: AtomicUsize::new(0),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Completed decodes, in completion order
    pub fn decodes(&self) -> Vec<(IntRect, u32)> {
        self.inner.decodes.lock().unwrap().clone()
    }

    pub fn decode_count(&self) -> usize {
        self.inner.decodes.lock().unwrap().len()
    }

    pub fn decoders_created(&self) -> usize {
        self.inner.decoders_created.load(Ordering::SeqCst)
    }

    /// Make every following decode fail with `kind`, or succeed again with `None`
    pub fn fail_decodes_with(&self, kind: Option<DecodeErrorKind>) {
        *self.inner.failure.lock().unwrap() = kind;
    }
}

impl TileDecoderFactory for FakeDecoderFactory {
    fn read_image_info(&self, _source: &dyn ImageSource) -> Result<PreparedImage, DecodeError> {
        Ok(PreparedImage {
            image_info: ImageInfo::new(self.inner.image_size, self.inner.mime_type.clone()),
            orientation: ExifOrientation::Normal,
        })
    }

    fn supports_region_decode(&self, mime_type: &str) -> bool {
        mime_type != MIME_SVG && mime_type != "image/gif"
    }

    fn create_decoder(
        &self,
        source: Arc<dyn ImageSource>,
        _prepared: &PreparedImage,
        pool: Arc<TileBitmapPool>,
    ) -> Result<Arc<dyn TileDecoder>, DecodeError> {
        self.inner.decoders_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeDecoder {
            state: self.inner.clone(),
            source,
            pool,
        }))
    }
}

struct FakeDecoder {
    state: Arc<FakeState>,
    source: Arc<dyn ImageSource>,
    pool: Arc<TileBitmapPool>,
}

impl TileDecoder for FakeDecoder {
    fn decode(
        &self,
        src_rect: IntRect,
        sample_size: u32,
        cancel: &CancelToken,
    ) -> Result<TileBitmap, DecodeError> {
        let mut first_byte = [0u8; 1];
        let _ = self.source.open_source()?.read(&mut first_byte)?;
        if let Some(kind) = *self.state.failure.lock().unwrap() {
            return Err(fake_error(kind));
        }

        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while waited < self.state.decode_delay {
            cancel.check()?;
            thread::sleep(step);
            waited += step;
        }
        cancel.check()?;

        let (width, height) = decoded_size(src_rect.size(), sample_size);
        let mut pixels = self.pool.checkout(width, height);
        pixels.fill(sample_size.min(255) as u8);
        self.state
            .decodes
            .lock()
            .unwrap()
            .push((src_rect, sample_size));
        Ok(TileBitmap::from_pooled(width, height, pixels, &self.pool))
    }
}

fn fake_error(kind: DecodeErrorKind) -> DecodeError {
    match kind {
        DecodeErrorKind::SourceUnavailable => DecodeError::SourceUnavailable(std::io::Error::other("fake source")),
        DecodeErrorKind::UnsupportedFormat => DecodeError::UnsupportedFormat {
            mime_type: "image/x-fake".to_string(),
        },
        DecodeErrorKind::DecodeFailed => DecodeError::DecodeFailed("fake corrupt tile".to_string()),
        DecodeErrorKind::OutOfMemory => DecodeError::OutOfMemory("fake allocation limit".to_string()),
        DecodeErrorKind::FrameFailed => DecodeError::FrameFailed("fake corrupt frame".to_string()),
        DecodeErrorKind::Cancelled => DecodeError::Cancelled,
    }
}
