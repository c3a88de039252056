use super::{CancelToken, PreparedImage, TileDecoder, TileDecoderFactory, decoded_size};
use crate::bitmap::{TileBitmap, TileBitmapPool};
use crate::error::DecodeError;
use crate::exif_orientation::ExifOrientation;
use crate::geometry::{IntRect, IntSize};
use crate::image_info::{read_exif_orientation, read_image_info};
use crate::image_source::ImageSource;
use fast_image_resize as fr;
use image::{ImageFormat, RgbaImage, imageops};
use log::{debug, info, warn};
use std::num::NonZeroU32;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Formats the `image` crate decodes that are worth subsampling.
/// Animated and vector formats are left to the host.
const REGION_DECODE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/bmp",
    "image/tiff",
];

/// How often a tile waiting for another tile's frame decode checks its cancel token
const FRAME_WAIT_POLL: Duration = Duration::from_millis(20);

/// Decoder factory built on the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageTileDecoderFactory;

impl TileDecoderFactory for ImageTileDecoderFactory {
    fn read_image_info(&self, source: &dyn ImageSource) -> Result<PreparedImage, DecodeError> {
        let bytes = source.read_all()?;
        let image_info = read_image_info(&bytes)?;
        let orientation = if self.supports_region_decode(&image_info.mime_type) {
            read_exif_orientation(&bytes)
        } else {
            ExifOrientation::Undefined
        };
        debug!(
            "Read image info {} orientation {orientation:?} for {}",
            image_info.to_short_string(),
            source.key()
        );
        Ok(PreparedImage {
            image_info,
            orientation,
        })
    }

    fn supports_region_decode(&self, mime_type: &str) -> bool {
        REGION_DECODE_MIME_TYPES.contains(&mime_type)
    }

    fn create_decoder(
        &self,
        source: Arc<dyn ImageSource>,
        prepared: &PreparedImage,
        pool: Arc<TileBitmapPool>,
    ) -> Result<Arc<dyn TileDecoder>, DecodeError> {
        let mime_type = &prepared.image_info.mime_type;
        if !self.supports_region_decode(mime_type) {
            return Err(DecodeError::UnsupportedFormat {
                mime_type: mime_type.clone(),
            });
        }
        let format =
            ImageFormat::from_mime_type(mime_type).ok_or_else(|| DecodeError::UnsupportedFormat {
                mime_type: mime_type.clone(),
            })?;
        Ok(Arc::new(ImageTileDecoder {
            source,
            format,
            raw_size: prepared.image_info.size,
            orientation: prepared.orientation,
            pool,
            frame: Mutex::new(FrameSlot::Empty),
            frame_changed: Condvar::new(),
        }))
    }
}

enum FrameSlot {
    Empty,
    /// One tile is decoding the frame; the others wait on `frame_changed`
    Decoding,
    Ready(Arc<RgbaImage>),
    /// Frame-wide failure, handed to every later tile without decoding again
    Failed(String),
    Closed,
}

/// Region decoder over a fully decoded frame.
///
/// The `image` crate cannot decode a sub-rectangle of most formats, so the raw
/// frame is decoded on first use and kept until [`TileDecoder::close`]. Tiles
/// are cropped from it, downsampled and oriented into pooled buffers. A closed
/// decoder answers every decode with `Cancelled`.
pub struct ImageTileDecoder {
    source: Arc<dyn ImageSource>,
    format: ImageFormat,
    raw_size: IntSize,
    orientation: ExifOrientation,
    pool: Arc<TileBitmapPool>,
    frame: Mutex<FrameSlot>,
    frame_changed: Condvar,
}

impl ImageTileDecoder {
    fn lock_frame(&self) -> MutexGuard<'_, FrameSlot> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frame(&self, cancel: &CancelToken) -> Result<Arc<RgbaImage>, DecodeError> {
        let mut slot = self.lock_frame();
        loop {
            match &*slot {
                FrameSlot::Ready(frame) => return Ok(frame.clone()),
                FrameSlot::Failed(message) => return Err(DecodeError::FrameFailed(message.clone())),
                FrameSlot::Closed => return Err(DecodeError::Cancelled),
                FrameSlot::Empty => break,
                FrameSlot::Decoding => {
                    cancel.check()?;
                    slot = self
                        .frame_changed
                        .wait_timeout(slot, FRAME_WAIT_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *slot = FrameSlot::Decoding;
        drop(slot);

        // The lock is not held here, so close() and other tiles never wait on the decode
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.decode_frame(cancel)))
            .unwrap_or_else(|_| Err(DecodeError::FrameFailed("frame decode panicked".to_string())));

        let mut slot = self.lock_frame();
        let closed = matches!(*slot, FrameSlot::Closed);
        if !closed {
            *slot = match &result {
                Ok(frame) => FrameSlot::Ready(frame.clone()),
                Err(DecodeError::FrameFailed(message)) => {
                    warn!("Frame of {} failed to decode: {message}", self.source.key());
                    FrameSlot::Failed(message.clone())
                }
                // Source errors and cancellation leave the next tile free to try again
                Err(_) => FrameSlot::Empty,
            };
        }
        drop(slot);
        self.frame_changed.notify_all();

        if closed {
            return Err(DecodeError::Cancelled);
        }
        result
    }

    fn decode_frame(&self, cancel: &CancelToken) -> Result<Arc<RgbaImage>, DecodeError> {
        cancel.check()?;
        let bytes = self.source.read_all()?;
        cancel.check()?;

        // The bytes are in memory, so any error from here on is a property of the image
        let frame = image::load_from_memory_with_format(&bytes, self.format)
            .map_err(|e| DecodeError::FrameFailed(DecodeError::from(e).to_string()))?
            .into_rgba8();
        if frame.width() as i32 != self.raw_size.width
            || frame.height() as i32 != self.raw_size.height
        {
            return Err(DecodeError::FrameFailed(format!(
                "decoded frame {}x{} does not match probed size {}",
                frame.width(),
                frame.height(),
                self.raw_size
            )));
        }
        info!(
            "Decoded full frame {} for {}",
            self.raw_size,
            self.source.key()
        );
        Ok(Arc::new(frame))
    }

    fn display_size(&self) -> IntSize {
        self.orientation.apply_to_size(self.raw_size)
    }

    /// Crop `raw_rect` out of the frame and downsample it in raw orientation
    fn sample_region(
        &self,
        frame: &RgbaImage,
        raw_rect: IntRect,
        sample_size: u32,
    ) -> Result<RgbaImage, DecodeError> {
        let (width, height) = decoded_size(raw_rect.size(), sample_size);
        let mut pixels = self.pool.checkout(width, height);

        if sample_size == 1 {
            copy_region(frame, raw_rect, &mut pixels);
        } else {
            let cropped = imageops::crop_imm(
                frame,
                raw_rect.left as u32,
                raw_rect.top as u32,
                raw_rect.width() as u32,
                raw_rect.height() as u32,
            )
            .to_image();
            pixels = match downsample(cropped, width, height, pixels) {
                Ok(pixels) => pixels,
                Err((error, Some(buffer))) => {
                    self.pool.checkin(width, height, buffer);
                    return Err(error);
                }
                Err((error, None)) => return Err(error),
            };
        }

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| DecodeError::DecodeFailed("sampled buffer has wrong length".into()))
    }
}

impl TileDecoder for ImageTileDecoder {
    fn decode(
        &self,
        src_rect: IntRect,
        sample_size: u32,
        cancel: &CancelToken,
    ) -> Result<TileBitmap, DecodeError> {
        if src_rect.is_empty() || !IntRect::from_size(self.display_size()).contains_rect(&src_rect) {
            return Err(DecodeError::DecodeFailed(format!(
                "tile rect {src_rect} outside image {}",
                self.display_size()
            )));
        }
        if !sample_size.is_power_of_two() {
            return Err(DecodeError::DecodeFailed(format!(
                "sample size {sample_size} is not a power of two"
            )));
        }
        cancel.check()?;

        let frame = self.frame(cancel)?;
        cancel.check()?;

        let raw_rect = self.orientation.display_rect_to_raw(src_rect, self.raw_size);
        let sampled = self.sample_region(&frame, raw_rect, sample_size)?;
        let (width, height) = (sampled.width(), sampled.height());

        if self.orientation.is_identity() {
            return Ok(TileBitmap::from_pooled(
                width,
                height,
                sampled.into_raw(),
                &self.pool,
            ));
        }

        let oriented = self.orientation.apply_to_image(&sampled);
        self.pool.checkin(width, height, sampled.into_raw());
        let (width, height) = oriented.dimensions();
        let mut pixels = self.pool.checkout(width, height);
        pixels.copy_from_slice(oriented.as_raw());
        Ok(TileBitmap::from_pooled(width, height, pixels, &self.pool))
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_frame(), FrameSlot::Closed);
        self.frame_changed.notify_all();
        if matches!(previous, FrameSlot::Ready(_)) {
            debug!("Released decoded frame of {}", self.source.key());
        }
    }
}

fn copy_region(frame: &RgbaImage, rect: IntRect, pixels: &mut [u8]) {
    let stride = frame.width() as usize * 4;
    let row_len = rect.width() as usize * 4;
    let raw = frame.as_raw();
    for (row, y) in (rect.top..rect.bottom).enumerate() {
        let start = y as usize * stride + rect.left as usize * 4;
        pixels[row * row_len..(row + 1) * row_len].copy_from_slice(&raw[start..start + row_len]);
    }
}

/// Box-filter downsample into `dst_buffer`. On failure the buffer is handed back
/// when it can still be recovered.
fn downsample(
    src: RgbaImage,
    width: u32,
    height: u32,
    dst_buffer: Vec<u8>,
) -> Result<Vec<u8>, (DecodeError, Option<Vec<u8>>)> {
    let invalid = |what: &str| DecodeError::DecodeFailed(format!("invalid {what}"));
    let (src_width, src_height) = src.dimensions();
    let src_image = fr::Image::from_vec_u8(
        NonZeroU32::new(src_width).ok_or_else(|| (invalid("source width"), None))?,
        NonZeroU32::new(src_height).ok_or_else(|| (invalid("source height"), None))?,
        src.into_raw(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| (DecodeError::DecodeFailed(e.to_string()), None))?;

    let dst_width = NonZeroU32::new(width).ok_or_else(|| (invalid("target width"), None))?;
    let dst_height = NonZeroU32::new(height).ok_or_else(|| (invalid("target height"), None))?;
    let mut dst_image = fr::Image::from_vec_u8(dst_width, dst_height, dst_buffer, fr::PixelType::U8x4)
        .map_err(|e| (DecodeError::DecodeFailed(e.to_string()), None))?;

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Box));
    match resizer.resize(&src_image.view(), &mut dst_image.view_mut()) {
        Ok(()) => Ok(dst_image.into_vec()),
        Err(e) => Err((
            DecodeError::DecodeFailed(e.to_string()),
            Some(dst_image.into_vec()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_info::ImageInfo;
    use crate::image_source::ByteArrayImageSource;
    use crate::test_utils::FlakySource;
    use image::{Rgba, RgbaImage};
    use std::io::{self, Cursor, Read};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        })
    }

    fn png_bytes(image: &RgbaImage) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn png_source(image: &RgbaImage) -> Arc<dyn ImageSource> {
        Arc::new(ByteArrayImageSource::new(png_bytes(image)))
    }

    fn decoder_with(
        source: Arc<dyn ImageSource>,
        size: IntSize,
        orientation: ExifOrientation,
        pool: &Arc<TileBitmapPool>,
    ) -> Arc<dyn TileDecoder> {
        let prepared = PreparedImage {
            image_info: ImageInfo::new(size, "image/png"),
            orientation,
        };
        ImageTileDecoderFactory
            .create_decoder(source, &prepared, pool.clone())
            .unwrap()
    }

    /// Blocks every read until the test sends on the gate
    #[derive(Debug)]
    struct GatedSource {
        bytes: Vec<u8>,
        opened: AtomicBool,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl ImageSource for GatedSource {
        fn key(&self) -> &str {
            "gated"
        }

        fn open_source(&self) -> io::Result<Box<dyn Read + Send>> {
            self.opened.store(true, Ordering::SeqCst);
            let _ = self.gate.lock().unwrap().recv();
            Ok(Box::new(Cursor::new(self.bytes.clone())))
        }
    }

    fn decoder_for(image: &RgbaImage, pool: &Arc<TileBitmapPool>) -> Arc<dyn TileDecoder> {
        let factory = ImageTileDecoderFactory;
        let source = png_source(image);
        let prepared = factory.read_image_info(source.as_ref()).unwrap();
        factory.create_decoder(source, &prepared, pool.clone()).unwrap()
    }

    #[test]
    fn test_full_resolution_region_is_exact_crop() {
        let image = gradient(300, 200);
        let pool = Arc::new(TileBitmapPool::new(16 * 1024 * 1024, true));
        let decoder = decoder_for(&image, &pool);

        let rect = IntRect::new(100, 50, 228, 178);
        let bitmap = decoder.decode(rect, 1, &CancelToken::new()).unwrap();
        let expected = imageops::crop_imm(&image, 100, 50, 128, 128).to_image();
        assert_eq!(bitmap.to_rgba_image().unwrap(), expected);
    }

    #[test]
    fn test_sampled_region_size() {
        let image = gradient(300, 200);
        let pool = Arc::new(TileBitmapPool::new(16 * 1024 * 1024, true));
        let decoder = decoder_for(&image, &pool);

        let bitmap = decoder
            .decode(IntRect::new(0, 0, 300, 200), 4, &CancelToken::new())
            .unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (75, 50));

        let edge = decoder
            .decode(IntRect::new(256, 0, 300, 130), 2, &CancelToken::new())
            .unwrap();
        assert_eq!((edge.width(), edge.height()), (22, 65));
    }

    #[test]
    fn test_decode_is_pure_for_same_request() {
        let image = gradient(64, 64);
        let pool = Arc::new(TileBitmapPool::new(16 * 1024 * 1024, true));
        let decoder = decoder_for(&image, &pool);
        let rect = IntRect::new(0, 0, 64, 64);

        let first = decoder.decode(rect, 2, &CancelToken::new()).unwrap();
        let first_pixels = first.pixels().to_vec();
        drop(first);
        // The second decode reuses the released buffer and must produce the same pixels
        let second = decoder.decode(rect, 2, &CancelToken::new()).unwrap();
        assert_eq!(second.pixels(), &first_pixels[..]);
        assert!(pool.stats().hits >= 1);
    }

    #[test]
    fn test_rejects_out_of_bounds_rect() {
        let image = gradient(32, 32);
        let pool = Arc::new(TileBitmapPool::new(1024 * 1024, true));
        let decoder = decoder_for(&image, &pool);
        let result = decoder.decode(IntRect::new(16, 16, 48, 48), 1, &CancelToken::new());
        assert!(matches!(result, Err(DecodeError::DecodeFailed(_))));
    }

    #[test]
    fn test_cancelled_before_decode() {
        let image = gradient(32, 32);
        let pool = Arc::new(TileBitmapPool::new(1024 * 1024, true));
        let decoder = decoder_for(&image, &pool);
        let token = CancelToken::new();
        token.cancel();
        let result = decoder.decode(IntRect::new(0, 0, 32, 32), 1, &token);
        assert!(matches!(result, Err(DecodeError::Cancelled)));
    }

    #[test]
    fn test_factory_refuses_gif() {
        let factory = ImageTileDecoderFactory;
        assert!(!factory.supports_region_decode("image/gif"));
        assert!(!factory.supports_region_decode("image/svg+xml"));
        assert!(factory.supports_region_decode("image/jpeg"));
    }

    #[test]
    fn test_corrupt_frame_is_decoded_once() {
        let image = gradient(64, 64);
        let mut bytes = png_bytes(&image);
        bytes.truncate(bytes.len() / 2);
        let source = Arc::new(FlakySource::new("truncated", bytes, 0));
        let pool = Arc::new(TileBitmapPool::new(1024 * 1024, true));
        let decoder = decoder_with(source.clone(), IntSize::new(64, 64), ExifOrientation::Normal, &pool);

        for rect in [IntRect::new(0, 0, 32, 32), IntRect::new(32, 32, 64, 64)] {
            let result = decoder.decode(rect, 1, &CancelToken::new());
            assert!(matches!(result, Err(DecodeError::FrameFailed(_))), "{result:?}");
        }
        assert_eq!(source.opens(), 1);
    }

    #[test]
    fn test_source_failure_is_retried_by_next_tile() {
        let image = gradient(32, 32);
        let source = Arc::new(FlakySource::new("flaky", png_bytes(&image), 1));
        let pool = Arc::new(TileBitmapPool::new(1024 * 1024, true));
        let decoder = decoder_with(source.clone(), IntSize::new(32, 32), ExifOrientation::Normal, &pool);
        let rect = IntRect::new(0, 0, 32, 32);

        let first = decoder.decode(rect, 1, &CancelToken::new());
        assert!(matches!(first, Err(DecodeError::SourceUnavailable(_))));
        assert!(decoder.decode(rect, 1, &CancelToken::new()).is_ok());
        assert_eq!(source.opens(), 2);
    }

    #[test]
    fn test_close_does_not_wait_for_frame_decode() {
        let image = gradient(32, 32);
        let (gate, receiver) = mpsc::channel();
        let source = Arc::new(GatedSource {
            bytes: png_bytes(&image),
            opened: AtomicBool::new(false),
            gate: Mutex::new(receiver),
        });
        let pool = Arc::new(TileBitmapPool::new(1024 * 1024, true));
        let decoder = decoder_with(source.clone(), IntSize::new(32, 32), ExifOrientation::Normal, &pool);

        let worker = {
            let decoder = decoder.clone();
            thread::spawn(move || decoder.decode(IntRect::new(0, 0, 32, 32), 1, &CancelToken::new()))
        };
        while !source.opened.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        decoder.close();
        assert!(started.elapsed() < Duration::from_millis(500));

        gate.send(()).unwrap();
        assert!(matches!(worker.join().unwrap(), Err(DecodeError::Cancelled)));
        let after_close = decoder.decode(IntRect::new(0, 0, 8, 8), 1, &CancelToken::new());
        assert!(matches!(after_close, Err(DecodeError::Cancelled)));
    }

    #[test]
    fn test_rotated_tile_at_sample_two() {
        // 2x2 blocks of one colour, so sampling by two is exact
        let raw = RgbaImage::from_fn(64, 32, |x, y| {
            Rgba([(x / 2 * 8) as u8, (y / 2 * 16) as u8, ((x / 2 + y / 2) * 4) as u8, 255])
        });
        let pool = Arc::new(TileBitmapPool::new(16 * 1024 * 1024, true));
        let orientation = ExifOrientation::Rotate90;
        let decoder = decoder_with(png_source(&raw), IntSize::new(64, 32), orientation, &pool);
        let display = orientation.apply_to_image(&raw);
        assert_eq!(display.dimensions(), (32, 64));

        for rect in [IntRect::new(0, 0, 32, 64), IntRect::new(8, 16, 32, 48)] {
            let tile = decoder
                .decode(rect, 2, &CancelToken::new())
                .unwrap()
                .to_rgba_image()
                .unwrap();
            assert_eq!(
                tile.dimensions(),
                (rect.width() as u32 / 2, rect.height() as u32 / 2)
            );
            for (x, y, pixel) in tile.enumerate_pixels() {
                let expected = display.get_pixel(rect.left as u32 + x * 2, rect.top as u32 + y * 2);
                for channel in 0..4 {
                    let delta = (pixel[channel] as i32 - expected[channel] as i32).abs();
                    assert!(delta <= 1, "tile {rect} pixel ({x},{y}): {pixel:?} vs {expected:?}");
                }
            }
        }
    }
}
