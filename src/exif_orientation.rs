//! EXIF orientation as a coordinate transform.
//!
//! Tile grids are computed in display space: the image as the user sees it
//! after rotation/flip. Decoding happens in raw space. This module converts
//! sizes and rects between the two spaces and turns decoded raw regions into
//! display orientation.

use crate::geometry::{IntOffset, IntRect, IntSize};
use image::RgbaImage;
use image::imageops;
use image::metadata::Orientation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExifOrientation {
    #[default]
    Undefined,
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    /// Mirror over the main diagonal (EXIF 5)
    Transpose,
    Rotate90,
    /// Mirror over the anti-diagonal (EXIF 7)
    Transverse,
    Rotate270,
}

impl ExifOrientation {
    pub fn from_exif(value: u16) -> Self {
        match value {
            1 => ExifOrientation::Normal,
            2 => ExifOrientation::FlipHorizontal,
            3 => ExifOrientation::Rotate180,
            4 => ExifOrientation::FlipVertical,
            5 => ExifOrientation::Transpose,
            6 => ExifOrientation::Rotate90,
            7 => ExifOrientation::Transverse,
            8 => ExifOrientation::Rotate270,
            _ => ExifOrientation::Undefined,
        }
    }

    pub fn exif_value(&self) -> u16 {
        match self {
            ExifOrientation::Undefined => 0,
            ExifOrientation::Normal => 1,
            ExifOrientation::FlipHorizontal => 2,
            ExifOrientation::Rotate180 => 3,
            ExifOrientation::FlipVertical => 4,
            ExifOrientation::Transpose => 5,
            ExifOrientation::Rotate90 => 6,
            ExifOrientation::Transverse => 7,
            ExifOrientation::Rotate270 => 8,
        }
    }

    /// Whether width and height trade places in display space
    pub fn swaps_dimensions(&self) -> bool {
        matches!(
            self,
            ExifOrientation::Transpose
                | ExifOrientation::Rotate90
                | ExifOrientation::Transverse
                | ExifOrientation::Rotate270
        )
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, ExifOrientation::Undefined | ExifOrientation::Normal)
    }

    /// Raw image size to display size
    pub fn apply_to_size(&self, raw_size: IntSize) -> IntSize {
        if self.swaps_dimensions() {
            raw_size.rotated()
        } else {
            raw_size
        }
    }

    /// Map a rect given in display space back to the raw image it was taken from.
    pub fn display_rect_to_raw(&self, display_rect: IntRect, raw_size: IntSize) -> IntRect {
        let a = self.display_point_to_raw(display_rect.top_left(), raw_size);
        let b = self.display_point_to_raw(display_rect.bottom_right(), raw_size);
        IntRect::from_corners(a, b)
    }

    /// Edge coordinates are continuous, so a rect maps onto a rect by its corners.
    fn display_point_to_raw(&self, point: IntOffset, raw_size: IntSize) -> IntOffset {
        let (w, h) = (raw_size.width, raw_size.height);
        let (x, y) = (point.x, point.y);
        match self {
            ExifOrientation::Undefined | ExifOrientation::Normal => IntOffset::new(x, y),
            ExifOrientation::FlipHorizontal => IntOffset::new(w - x, y),
            ExifOrientation::Rotate180 => IntOffset::new(w - x, h - y),
            ExifOrientation::FlipVertical => IntOffset::new(x, h - y),
            ExifOrientation::Transpose => IntOffset::new(y, x),
            ExifOrientation::Rotate90 => IntOffset::new(y, h - x),
            ExifOrientation::Transverse => IntOffset::new(w - y, h - x),
            ExifOrientation::Rotate270 => IntOffset::new(w - y, x),
        }
    }

    /// Copy of a decoded raw region in display orientation.
    pub fn apply_to_image(&self, image: &RgbaImage) -> RgbaImage {
        match self {
            ExifOrientation::Undefined | ExifOrientation::Normal => image.clone(),
            ExifOrientation::FlipHorizontal => imageops::flip_horizontal(image),
            ExifOrientation::Rotate180 => imageops::rotate180(image),
            ExifOrientation::FlipVertical => imageops::flip_vertical(image),
            ExifOrientation::Transpose => imageops::flip_horizontal(&imageops::rotate90(image)),
            ExifOrientation::Rotate90 => imageops::rotate90(image),
            ExifOrientation::Transverse => imageops::flip_horizontal(&imageops::rotate270(image)),
            ExifOrientation::Rotate270 => imageops::rotate270(image),
        }
    }
}

impl From<Orientation> for ExifOrientation {
    fn from(orientation: Orientation) -> Self {
        match orientation {
            Orientation::NoTransforms => ExifOrientation::Normal,
            Orientation::Rotate90 => ExifOrientation::Rotate90,
            Orientation::Rotate180 => ExifOrientation::Rotate180,
            Orientation::Rotate270 => ExifOrientation::Rotate270,
            Orientation::FlipHorizontal => ExifOrientation::FlipHorizontal,
            Orientation::FlipVertical => ExifOrientation::FlipVertical,
            Orientation::Rotate90FlipH => ExifOrientation::Transpose,
            Orientation::Rotate270FlipH => ExifOrientation::Transverse,
        }
    }
}
