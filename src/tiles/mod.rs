//! Tiles, their lifecycle, and the immutable snapshots handed to renderers.

pub mod grid;
pub mod manager;

use crate::bitmap::TileBitmap;
use crate::decoder::CancelToken;
use crate::error::DecodeErrorKind;
use crate::geometry::{IntRect, IntSize};
use crate::image_info::ImageInfo;
use std::fmt;

pub use grid::{NotNeededReason, SampleSizeSelector, TileGridSize};
pub use manager::{DecodeApply, DecodeOutcome, DecodeRequest, RefreshOutcome, TileManager};

/// Column and row of a tile within its grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub col: i32,
    pub row: i32,
}

impl TileCoordinate {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.col, self.row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Initialized,
    Loading,
    Loaded,
    Error(DecodeErrorKind),
}

impl TileState {
    pub fn is_settled(&self) -> bool {
        matches!(self, TileState::Loaded | TileState::Error(_))
    }
}

/// What the host knows about its display when asking for tiles.
///
/// `visible_rect` is in display-space image pixels at full resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub container_size: IntSize,
    /// Size of the image as laid out at scale 1
    pub content_size: IntSize,
    pub visible_rect: IntRect,
    pub scale: f32,
}

impl Viewport {
    pub fn new(container_size: IntSize, content_size: IntSize, visible_rect: IntRect, scale: f32) -> Self {
        Self {
            container_size,
            content_size,
            visible_rect,
            scale,
        }
    }

    /// Content fitted into the container, with the visible rect covering the whole image.
    pub fn fit(container_size: IntSize, image_size: IntSize) -> Self {
        let content_size = fit_size(image_size, container_size);
        Self::new(container_size, content_size, IntRect::from_size(image_size), 1.0)
    }

    pub fn is_valid(&self) -> bool {
        !self.container_size.is_empty()
            && !self.content_size.is_empty()
            && self.scale.is_finite()
            && self.scale > 0.0
    }
}

/// Largest size with the aspect of `size` that fits inside `bounds`
pub fn fit_size(size: IntSize, bounds: IntSize) -> IntSize {
    if size.is_empty() || bounds.is_empty() {
        return IntSize::ZERO;
    }
    let scale = (bounds.width as f64 / size.width as f64).min(bounds.height as f64 / size.height as f64);
    IntSize::new(
        ((size.width as f64 * scale).round() as i32).max(1),
        ((size.height as f64 * scale).round() as i32).max(1),
    )
}

pub fn tile_cache_key(image_key: &str, src_rect: IntRect, sample_size: u32) -> String {
    format!("{image_key}_tile_{}_{sample_size}", src_rect.to_short_string())
}

/// One cell of a grid level, owned by the [`TileManager`].
#[derive(Debug)]
pub struct Tile {
    pub coordinate: TileCoordinate,
    pub src_rect: IntRect,
    pub sample_size: u32,
    pub(crate) state: TileState,
    pub(crate) bitmap: Option<TileBitmap>,
    pub(crate) generation: u64,
    pub(crate) cancel: Option<CancelToken>,
}

impl Tile {
    pub fn new(coordinate: TileCoordinate, src_rect: IntRect, sample_size: u32) -> Self {
        Self {
            coordinate,
            src_rect,
            sample_size,
            state: TileState::Initialized,
            bitmap: None,
            generation: 0,
            cancel: None,
        }
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn bitmap(&self) -> Option<&TileBitmap> {
        self.bitmap.as_ref()
    }

    pub(crate) fn set_loaded(&mut self, bitmap: TileBitmap) {
        self.state = TileState::Loaded;
        self.bitmap = Some(bitmap);
        self.cancel = None;
    }

    /// Back to `Initialized`, cancelling any decode in flight.
    /// Returns true if a decode was cancelled.
    pub(crate) fn release(&mut self) -> bool {
        let was_loading = self.state == TileState::Loading;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.state = TileState::Initialized;
        self.bitmap = None;
        was_loading
    }

    pub fn snapshot(&self) -> TileSnapshot {
        TileSnapshot {
            coordinate: self.coordinate,
            src_rect: self.src_rect,
            sample_size: self.sample_size,
            state: self.state,
            bitmap: self.bitmap.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TileSnapshot {
    pub coordinate: TileCoordinate,
    pub src_rect: IntRect,
    pub sample_size: u32,
    pub state: TileState,
    pub bitmap: Option<TileBitmap>,
}

/// Immutable view of the tiles at one point in time.
///
/// Renderers draw `background` first, then `foreground` over it. Bitmaps are
/// shared handles, so a snapshot stays drawable after the engine moves on.
#[derive(Debug, Clone, Default)]
pub struct TileSnapshotList {
    pub version: u64,
    pub image_info: Option<ImageInfo>,
    pub sample_size: u32,
    pub image_load_rect: IntRect,
    pub foreground: Vec<TileSnapshot>,
    pub background: Vec<TileSnapshot>,
}

impl TileSnapshotList {
    pub fn is_empty(&self) -> bool {
        self.foreground.is_empty() && self.background.is_empty()
    }

    pub fn loaded_count(&self) -> usize {
        self.foreground
            .iter()
            .filter(|tile| tile.state == TileState::Loaded)
            .count()
    }

    pub fn count_in_state(&self, state: TileState) -> usize {
        self.foreground.iter().filter(|tile| tile.state == state).count()
    }

    /// Tiles with pixels, in draw order
    pub fn drawable(&self) -> impl Iterator<Item = &TileSnapshot> {
        self.background
            .iter()
            .chain(self.foreground.iter())
            .filter(|tile| tile.bitmap.is_some())
    }
}
