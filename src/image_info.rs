use crate::error::DecodeError;
use crate::exif_orientation::ExifOrientation;
use crate::geometry::IntSize;
use image::{ImageDecoder, ImageReader};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const MIME_SVG: &str = "image/svg+xml";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageInfo {
    pub size: IntSize,
    pub mime_type: String,
}

impl ImageInfo {
    pub fn new(size: IntSize, mime_type: impl Into<String>) -> Self {
        Self {
            size,
            mime_type: mime_type.into(),
        }
    }

    pub fn width(&self) -> i32 {
        self.size.width
    }

    pub fn height(&self) -> i32 {
        self.size.height
    }

    /// Image info as displayed, with the orientation applied to the size
    pub fn oriented(&self, orientation: ExifOrientation) -> ImageInfo {
        ImageInfo {
            size: orientation.apply_to_size(self.size),
            mime_type: self.mime_type.clone(),
        }
    }

    pub fn to_short_string(&self) -> String {
        format!("({},'{}')", self.size.to_short_string(), self.mime_type)
    }
}

/// Probe the size and mime type of an encoded image without decoding pixels.
pub fn read_image_info(bytes: &[u8]) -> Result<ImageInfo, DecodeError> {
    let mime_type = detect_mime_type(bytes).ok_or_else(|| {
        DecodeError::DecodeFailed("unrecognized image data".to_string())
    })?;

    if mime_type == MIME_SVG {
        // Vector images have no pixel size to subsample
        return Err(DecodeError::UnsupportedFormat { mime_type });
    }

    match imagesize::blob_size(bytes) {
        Ok(size) => {
            let size = IntSize::new(size.width as i32, size.height as i32);
            debug!("Probed image info: {size} '{mime_type}'");
            Ok(ImageInfo::new(size, mime_type))
        }
        Err(e) => {
            warn!("Failed to probe image size for '{mime_type}': {e}");
            Err(DecodeError::DecodeFailed(format!(
                "failed to read image size: {e}"
            )))
        }
    }
}

/// Read the EXIF orientation. Formats without EXIF support report `Undefined`.
pub fn read_exif_orientation(bytes: &[u8]) -> ExifOrientation {
    let reader = match ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => {
            debug!("Cannot guess format for orientation probe: {e}");
            return ExifOrientation::Undefined;
        }
    };
    let mut decoder = match reader.into_decoder() {
        Ok(decoder) => decoder,
        Err(e) => {
            debug!("Cannot open decoder for orientation probe: {e}");
            return ExifOrientation::Undefined;
        }
    };
    match decoder.orientation() {
        Ok(orientation) => orientation.into(),
        Err(e) => {
            debug!("Failed to read exif orientation: {e}");
            ExifOrientation::Undefined
        }
    }
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<String> {
    match imagesize::image_type(bytes) {
        Ok(image_type) => Some(mime_for_image_type(image_type).to_string()),
        Err(_) if looks_like_svg(bytes) => Some(MIME_SVG.to_string()),
        Err(_) => None,
    }
}

fn mime_for_image_type(image_type: imagesize::ImageType) -> &'static str {
    use imagesize::ImageType;
    match image_type {
        ImageType::Jpeg => "image/jpeg",
        ImageType::Png => "image/png",
        ImageType::Webp => "image/webp",
        ImageType::Bmp => "image/bmp",
        ImageType::Gif => "image/gif",
        ImageType::Tiff => "image/tiff",
        _ => "application/octet-stream",
    }
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}
