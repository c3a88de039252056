use std::io;
use thiserror::Error;

/// Failure of a single tile decode or of probing an image source.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Opening or reading the source failed. Assumed transient.
    #[error("image source unavailable: {0}")]
    SourceUnavailable(#[from] io::Error),

    /// The image format cannot be region decoded. Permanent for the image.
    #[error("unsupported image format: {mime_type}")]
    UnsupportedFormat { mime_type: String },

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The whole frame could not be decoded, so no tile of the image can be.
    #[error("image frame failed to decode: {0}")]
    FrameFailed(String),

    #[error("decode cancelled")]
    Cancelled,
}

impl DecodeError {
    /// Whether a tile in this error state is picked up again by the next grid refresh
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            DecodeError::SourceUnavailable(_) => DecodeErrorKind::SourceUnavailable,
            DecodeError::UnsupportedFormat { .. } => DecodeErrorKind::UnsupportedFormat,
            DecodeError::DecodeFailed(_) => DecodeErrorKind::DecodeFailed,
            DecodeError::OutOfMemory(_) => DecodeErrorKind::OutOfMemory,
            DecodeError::FrameFailed(_) => DecodeErrorKind::FrameFailed,
            DecodeError::Cancelled => DecodeErrorKind::Cancelled,
        }
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(error: image::ImageError) -> Self {
        match error {
            image::ImageError::IoError(e) => DecodeError::SourceUnavailable(e),
            image::ImageError::Unsupported(e) => DecodeError::UnsupportedFormat {
                mime_type: e.to_string(),
            },
            image::ImageError::Limits(e) => DecodeError::OutOfMemory(e.to_string()),
            other => DecodeError::DecodeFailed(other.to_string()),
        }
    }
}

/// Copyable classification of a [`DecodeError`], kept in tile state and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    SourceUnavailable,
    UnsupportedFormat,
    DecodeFailed,
    OutOfMemory,
    FrameFailed,
    Cancelled,
}

impl DecodeErrorKind {
    /// Only source failures are transient
    pub fn is_retryable(self) -> bool {
        self == DecodeErrorKind::SourceUnavailable
    }
}

/// Image-level failure: subsampling is disabled for the image and the host
/// should fall back to showing it without tiles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubsamplingError {
    #[error("image format {mime_type} does not support region decoding")]
    UnsupportedFormat { mime_type: String },

    #[error("failed to read image info: {0}")]
    ImageInfo(String),

    /// The source could not be read. Retried on the next reset, resume or viewport change.
    #[error("image source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("image cannot be decoded: {0}")]
    DecodeFailed(String),
}

impl From<DecodeError> for SubsamplingError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::UnsupportedFormat { mime_type } => {
                SubsamplingError::UnsupportedFormat { mime_type }
            }
            DecodeError::SourceUnavailable(e) => SubsamplingError::SourceUnavailable(e.to_string()),
            DecodeError::FrameFailed(message) => SubsamplingError::DecodeFailed(message),
            other => SubsamplingError::ImageInfo(other.to_string()),
        }
    }
}

/// Failure to build a [`crate::SubsamplingEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid subsampling config: {0}")]
    InvalidConfig(String),

    #[error("failed to start engine threads: {0}")]
    Spawn(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_source_errors_are_retryable() {
        let io = DecodeError::SourceUnavailable(io::Error::other("gone"));
        assert!(io.is_retryable());
        assert!(!DecodeError::DecodeFailed("bad huffman".into()).is_retryable());
        assert!(!DecodeError::OutOfMemory("limits".into()).is_retryable());
        assert!(!DecodeError::FrameFailed("truncated".into()).is_retryable());
        assert!(DecodeErrorKind::SourceUnavailable.is_retryable());
        assert!(!DecodeErrorKind::DecodeFailed.is_retryable());
    }

    #[test]
    fn test_source_and_frame_failures_map_to_image_level() {
        let error: SubsamplingError = DecodeError::SourceUnavailable(io::Error::other("offline")).into();
        assert_eq!(error, SubsamplingError::SourceUnavailable("offline".into()));

        let error: SubsamplingError = DecodeError::FrameFailed("bad huffman".into()).into();
        assert_eq!(error, SubsamplingError::DecodeFailed("bad huffman".into()));
    }

    #[test]
    fn test_unsupported_maps_to_image_level_error() {
        let error: SubsamplingError = DecodeError::UnsupportedFormat {
            mime_type: "image/svg+xml".into(),
        }
        .into();
        assert_eq!(
            error,
            SubsamplingError::UnsupportedFormat {
                mime_type: "image/svg+xml".into()
            }
        );
    }
}
