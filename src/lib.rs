//! Subsampling tile engine for pan/zoom image viewers.
//!
//! A host feeds [`SubsamplingEngine`] an image source and viewport updates and
//! draws the tiles published in [`SubsamplingEngine::current_tiles`]. Only the
//! visible part of the image is decoded, at the resolution the current scale
//! needs.

pub mod bitmap;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod exif_orientation;
pub mod geometry;
pub mod image_info;
pub mod image_source;
pub mod tiles;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::SubsamplingConfig;
pub use engine::{EngineEvent, SubsamplingEngine, SubsamplingStatus};
pub use error::{DecodeError, EngineError, SubsamplingError};
pub use geometry::{IntOffset, IntRect, IntSize};
pub use image_info::ImageInfo;
pub use image_source::{ByteArrayImageSource, FileImageSource, ImageSource};
pub use tiles::{TileSnapshot, TileSnapshotList, TileState, Viewport};
