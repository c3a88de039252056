//! Tile size, sample size and grid layout.
//!
//! All rects here are in display-space image pixels at full resolution.

use super::{Tile, TileCoordinate};
use crate::geometry::{IntRect, IntSize};
use std::collections::BTreeMap;

const MAX_SAMPLE_SIZE_SHIFT: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGridSize {
    pub columns: i32,
    pub rows: i32,
}

impl TileGridSize {
    pub fn tile_count(&self) -> usize {
        (self.columns.max(0) * self.rows.max(0)) as usize
    }
}

/// Why an image is shown without subsampling
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NotNeededReason {
    EmptySize,
    /// The content is already displayed at (or above) full resolution
    ImageNotLargerThanContent,
    /// The content is not a scaled copy of the image
    AspectRatioMismatch { width_ratio: f32, height_ratio: f32 },
}

/// Half the container in each dimension, kept within the configured bounds
pub fn calculate_preferred_tile_size(
    container_size: IntSize,
    min_tile_size: i32,
    max_tile_size: i32,
) -> IntSize {
    // max wins over min, so inverted bounds cannot panic
    let clamp = |value: i32| (value / 2).max(min_tile_size).min(max_tile_size);
    IntSize::new(clamp(container_size.width), clamp(container_size.height))
}

/// How many image pixels fall on one screen pixel at `scale`.
///
/// Uses the smaller axis so the decoded tiles are never coarser than the screen
/// on either axis.
pub fn sample_ratio(image_size: IntSize, content_size: IntSize, scale: f32) -> f32 {
    if content_size.is_empty() || scale <= 0.0 {
        return 1.0;
    }
    let width_ratio = image_size.width as f32 / (content_size.width as f32 * scale);
    let height_ratio = image_size.height as f32 / (content_size.height as f32 * scale);
    width_ratio.min(height_ratio)
}

/// Largest power of two not above the image-to-screen ratio, at least 1
pub fn calculate_sample_size(image_size: IntSize, content_size: IntSize, scale: f32) -> u32 {
    floor_power_of_two(sample_ratio(image_size, content_size, scale))
}

fn floor_power_of_two(value: f32) -> u32 {
    if !value.is_finite() || value < 2.0 {
        return 1;
    }
    let shift = (value.log2().floor() as u32).min(MAX_SAMPLE_SIZE_SHIFT);
    1 << shift
}

/// Sample size selection with hysteresis.
///
/// A chosen sample size `s` is kept while the ratio stays within
/// `[s * (1 - h), 2s * (1 + h))`, so scale jitter around a power of two does not
/// flip the grid back and forth.
#[derive(Debug, Clone)]
pub struct SampleSizeSelector {
    hysteresis: f32,
    current: Option<u32>,
}

impl SampleSizeSelector {
    pub fn new(hysteresis: f32) -> Self {
        Self {
            hysteresis,
            current: None,
        }
    }

    pub fn select(&mut self, ratio: f32) -> u32 {
        if let Some(current) = self.current {
            let low = current as f32 * (1.0 - self.hysteresis);
            let high = 2.0 * current as f32 * (1.0 + self.hysteresis);
            if ratio >= low && ratio < high {
                return current;
            }
        }
        let target = floor_power_of_two(ratio);
        self.current = Some(target);
        target
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Smallest sample size at which one tile covers the whole image
pub fn max_sample_size(image_size: IntSize, tile_size: IntSize) -> u32 {
    let mut sample_size = 1u32;
    while sample_size < (1 << MAX_SAMPLE_SIZE_SHIFT)
        && ((image_size.width as u32).div_ceil(sample_size) > tile_size.width as u32
            || (image_size.height as u32).div_ceil(sample_size) > tile_size.height as u32)
    {
        sample_size *= 2;
    }
    sample_size
}

pub fn tile_grid_size(image_size: IntSize, tile_size: IntSize, sample_size: u32) -> TileGridSize {
    let source_width = tile_size.width * sample_size as i32;
    let source_height = tile_size.height * sample_size as i32;
    TileGridSize {
        columns: (image_size.width as u32).div_ceil(source_width as u32) as i32,
        rows: (image_size.height as u32).div_ceil(source_height as u32) as i32,
    }
}

/// Grid sizes of every level, from sample size 1 up to the single-tile level
pub fn tile_grid_size_map(image_size: IntSize, tile_size: IntSize) -> BTreeMap<u32, TileGridSize> {
    let max = max_sample_size(image_size, tile_size);
    let mut map = BTreeMap::new();
    let mut sample_size = 1;
    while sample_size <= max {
        map.insert(sample_size, tile_grid_size(image_size, tile_size, sample_size));
        sample_size *= 2;
    }
    map
}

/// Tiles of one level, row-major. Edge tiles are clipped to the image bounds.
pub fn build_tile_grid(image_size: IntSize, tile_size: IntSize, sample_size: u32) -> Vec<Tile> {
    let grid = tile_grid_size(image_size, tile_size, sample_size);
    let source_width = tile_size.width * sample_size as i32;
    let source_height = tile_size.height * sample_size as i32;
    let mut tiles = Vec::with_capacity(grid.tile_count());
    for row in 0..grid.rows {
        for col in 0..grid.columns {
            let left = col * source_width;
            let top = row * source_height;
            let src_rect = IntRect::new(
                left,
                top,
                (left + source_width).min(image_size.width),
                (top + source_height).min(image_size.height),
            );
            tiles.push(Tile::new(TileCoordinate::new(col, row), src_rect, sample_size));
        }
    }
    tiles
}

/// Visible rect plus the prefetch margin on every side, clipped to the image.
pub fn calculate_image_load_rect(image_size: IntSize, visible_rect: IntRect, margin: f32) -> IntRect {
    let bounds = IntRect::from_size(image_size);
    let Some(visible) = visible_rect.intersect(&bounds) else {
        return IntRect::ZERO;
    };
    let horizontal = (visible.width() as f32 * margin).round() as i32;
    let vertical = (visible.height() as f32 * margin).round() as i32;
    visible
        .inflate(horizontal, vertical)
        .intersect(&bounds)
        .unwrap_or(IntRect::ZERO)
}

pub fn check_can_use_subsampling(
    image_size: IntSize,
    content_size: IntSize,
    max_aspect_ratio_delta: f32,
) -> Result<(), NotNeededReason> {
    if image_size.is_empty() || content_size.is_empty() {
        return Err(NotNeededReason::EmptySize);
    }
    if image_size.width <= content_size.width && image_size.height <= content_size.height {
        return Err(NotNeededReason::ImageNotLargerThanContent);
    }
    let width_ratio = image_size.width as f32 / content_size.width as f32;
    let height_ratio = image_size.height as f32 / content_size.height as f32;
    let delta = (width_ratio - height_ratio).abs() / width_ratio.max(height_ratio);
    if delta > max_aspect_ratio_delta {
        return Err(NotNeededReason::AspectRatioMismatch {
            width_ratio,
            height_ratio,
        });
    }
    Ok(())
}
