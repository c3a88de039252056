use super::grid::{
    SampleSizeSelector, build_tile_grid, calculate_image_load_rect, calculate_preferred_tile_size,
    max_sample_size, sample_ratio, tile_grid_size,
};
use super::{
    Tile, TileCoordinate, TileGridSize, TileSnapshot, TileSnapshotList, TileState, Viewport,
    tile_cache_key,
};
use crate::bitmap::{TileBitmap, TileBitmapCache};
use crate::config::SubsamplingConfig;
use crate::decoder::CancelToken;
use crate::error::{DecodeError, SubsamplingError};
use crate::geometry::{IntRect, IntSize};
use crate::image_info::ImageInfo;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A tile decode to be run off the coordination thread.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub coordinate: TileCoordinate,
    pub sample_size: u32,
    pub src_rect: IntRect,
    pub generation: u64,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct DecodeOutcome {
    pub coordinate: TileCoordinate,
    pub sample_size: u32,
    pub generation: u64,
    pub result: Result<TileBitmap, DecodeError>,
}

impl DecodeOutcome {
    pub fn for_request(request: &DecodeRequest, result: Result<TileBitmap, DecodeError>) -> Self {
        Self {
            coordinate: request.coordinate,
            sample_size: request.sample_size,
            generation: request.generation,
            result,
        }
    }
}

#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Decodes to start, nearest to the visible centre first
    pub requests: Vec<DecodeRequest>,
    /// In-flight decodes whose tiles left the load rect
    pub cancelled: usize,
    /// Whether the tile set or any tile state changed
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeApply {
    Applied { trim_memory: bool },
    /// The result belongs to a tile that was released or re-requested since
    Discarded,
    /// The decoder refused the format or the whole frame failed; the manager is now disabled
    ImageUnusable(SubsamplingError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RefreshKey {
    tile_size: IntSize,
    sample_size: u32,
    visible_rect: IntRect,
    load_rect: IntRect,
    allow_decode: bool,
}

struct TileGridLevel {
    size: TileGridSize,
    tiles: Vec<Tile>,
}

impl TileGridLevel {
    fn new(image_size: IntSize, tile_size: IntSize, sample_size: u32) -> Self {
        Self {
            size: tile_grid_size(image_size, tile_size, sample_size),
            tiles: build_tile_grid(image_size, tile_size, sample_size),
        }
    }

    fn tile_mut(&mut self, coordinate: TileCoordinate) -> Option<&mut Tile> {
        if coordinate.col < 0
            || coordinate.row < 0
            || coordinate.col >= self.size.columns
            || coordinate.row >= self.size.rows
        {
            return None;
        }
        let index = (coordinate.row * self.size.columns + coordinate.col) as usize;
        self.tiles.get_mut(index)
    }

    fn release_all(&mut self) -> usize {
        self.tiles
            .iter_mut()
            .map(|tile| tile.release())
            .filter(|cancelled| *cancelled)
            .count()
    }
}

/// Owns the tile grid of one image and decides which tiles to decode.
///
/// The manager does no I/O. [`TileManager::refresh`] returns the decodes to run
/// and [`TileManager::on_decode_finished`] folds their results back in, so it
/// is driven entirely from one thread.
pub struct TileManager {
    image_key: String,
    image_info: ImageInfo,
    cache: Option<Arc<dyn TileBitmapCache>>,
    min_tile_size: i32,
    max_tile_size: i32,
    prefetch_margin: f32,
    background_tiles: bool,
    selector: SampleSizeSelector,
    tile_size: IntSize,
    sample_size: u32,
    levels: BTreeMap<u32, TileGridLevel>,
    visible_rect: IntRect,
    load_rect: IntRect,
    background: Vec<TileSnapshot>,
    last_refresh: Option<RefreshKey>,
    next_generation: u64,
    disabled: bool,
}

impl TileManager {
    /// `image_info` is in display space.
    pub fn new(
        image_key: impl Into<String>,
        image_info: ImageInfo,
        config: &SubsamplingConfig,
        cache: Option<Arc<dyn TileBitmapCache>>,
    ) -> Self {
        Self {
            image_key: image_key.into(),
            image_info,
            cache,
            min_tile_size: config.min_tile_size,
            max_tile_size: config.max_tile_size,
            prefetch_margin: config.prefetch_margin,
            background_tiles: !config.disable_background_tiles,
            selector: SampleSizeSelector::new(config.sample_size_hysteresis),
            tile_size: IntSize::ZERO,
            sample_size: 0,
            levels: BTreeMap::new(),
            visible_rect: IntRect::ZERO,
            load_rect: IntRect::ZERO,
            background: Vec::new(),
            last_refresh: None,
            next_generation: 1,
            disabled: false,
        }
    }

    pub fn image_key(&self) -> &str {
        &self.image_key
    }

    pub fn image_info(&self) -> &ImageInfo {
        &self.image_info
    }

    pub fn tile_size(&self) -> IntSize {
        self.tile_size
    }

    /// 0 until the first refresh
    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn image_load_rect(&self) -> IntRect {
        self.load_rect
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn tile_state(&self, sample_size: u32, coordinate: TileCoordinate) -> Option<TileState> {
        let level = self.levels.get(&sample_size)?;
        level
            .tiles
            .iter()
            .find(|tile| tile.coordinate == coordinate)
            .map(Tile::state)
    }

    pub fn loading_count(&self) -> usize {
        self.current_tiles()
            .filter(|tile| tile.state == TileState::Loading)
            .count()
    }

    pub fn loaded_count(&self) -> usize {
        self.current_tiles()
            .filter(|tile| tile.state == TileState::Loaded)
            .count()
    }

    pub fn background_count(&self) -> usize {
        self.background.len()
    }

    fn current_tiles(&self) -> impl Iterator<Item = &Tile> {
        self.levels
            .get(&self.sample_size)
            .into_iter()
            .flat_map(|level| level.tiles.iter())
    }

    /// Recompute the grid for `viewport` and return the decodes to start.
    ///
    /// Calling it again with the same viewport is a no-op. With `allow_decode`
    /// false the grid is still updated and cache hits are applied, but nothing
    /// new is scheduled.
    pub fn refresh(&mut self, viewport: &Viewport, allow_decode: bool) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        if self.disabled || !viewport.is_valid() {
            return outcome;
        }

        let image_size = self.image_info.size;
        let tile_size = calculate_preferred_tile_size(
            viewport.container_size,
            self.min_tile_size,
            self.max_tile_size,
        );
        if tile_size != self.tile_size {
            if !self.levels.is_empty() {
                info!(
                    "Tile size changed {} -> {}, rebuilding grid",
                    self.tile_size, tile_size
                );
                outcome.cancelled += self.release_levels();
                self.background.clear();
                outcome.changed = true;
            }
            self.tile_size = tile_size;
        }

        let ratio = sample_ratio(image_size, viewport.content_size, viewport.scale);
        let sample_size = self
            .selector
            .select(ratio)
            .min(max_sample_size(image_size, tile_size));
        let visible_rect = viewport
            .visible_rect
            .intersect(&IntRect::from_size(image_size))
            .unwrap_or(IntRect::ZERO);
        let load_rect = calculate_image_load_rect(image_size, visible_rect, self.prefetch_margin);

        let key = RefreshKey {
            tile_size,
            sample_size,
            visible_rect,
            load_rect,
            allow_decode,
        };
        if self.last_refresh == Some(key) {
            return outcome;
        }
        self.last_refresh = Some(key);

        if sample_size != self.sample_size {
            outcome.cancelled += self.switch_sample_size(sample_size);
            outcome.changed = true;
        }
        self.visible_rect = visible_rect;
        self.load_rect = load_rect;

        let level = self
            .levels
            .entry(sample_size)
            .or_insert_with(|| TileGridLevel::new(image_size, tile_size, sample_size));

        let mut candidates = Vec::new();
        for (index, tile) in level.tiles.iter_mut().enumerate() {
            let desired = !load_rect.is_empty() && tile.src_rect.overlaps(&load_rect);
            if desired {
                match tile.state {
                    TileState::Initialized => candidates.push(index),
                    TileState::Error(kind) if kind.is_retryable() => candidates.push(index),
                    _ => {}
                }
            } else if tile.state != TileState::Initialized {
                if tile.release() {
                    outcome.cancelled += 1;
                }
                outcome.changed = true;
            }
        }

        let (center_x, center_y) = visible_rect.center();
        let distance = |tile: &Tile| {
            let (x, y) = tile.src_rect.center();
            (x - center_x).powi(2) + (y - center_y).powi(2)
        };
        candidates.sort_by(|&a, &b| distance(&level.tiles[a]).total_cmp(&distance(&level.tiles[b])));

        for index in candidates {
            let tile = &mut level.tiles[index];
            if let Some(cache) = &self.cache {
                let cache_key = tile_cache_key(&self.image_key, tile.src_rect, tile.sample_size);
                if let Some(bitmap) = cache.get(&cache_key) {
                    debug!("Tile {} sample {} from memory cache", tile.coordinate, sample_size);
                    tile.set_loaded(bitmap);
                    outcome.changed = true;
                    continue;
                }
            }
            if !allow_decode {
                continue;
            }
            let cancel = CancelToken::new();
            tile.state = TileState::Loading;
            tile.bitmap = None;
            tile.generation = self.next_generation;
            tile.cancel = Some(cancel.clone());
            self.next_generation += 1;
            outcome.requests.push(DecodeRequest {
                coordinate: tile.coordinate,
                sample_size,
                src_rect: tile.src_rect,
                generation: tile.generation,
                cancel,
            });
            outcome.changed = true;
        }

        if self.prune_background() {
            outcome.changed = true;
        }

        debug!(
            "Refresh '{}': sample {} tile {} load {} -> {} decodes, {} cancelled",
            self.image_key,
            sample_size,
            tile_size,
            load_rect,
            outcome.requests.len(),
            outcome.cancelled
        );
        outcome
    }

    /// Apply the result of a decode started by [`TileManager::refresh`].
    pub fn on_decode_finished(&mut self, outcome: DecodeOutcome) -> DecodeApply {
        if self.disabled {
            return DecodeApply::Discarded;
        }
        let Some(tile) = self
            .levels
            .get_mut(&outcome.sample_size)
            .and_then(|level| level.tile_mut(outcome.coordinate))
        else {
            debug!(
                "Discarding tile {} sample {}: level released",
                outcome.coordinate, outcome.sample_size
            );
            return DecodeApply::Discarded;
        };
        if tile.state != TileState::Loading || tile.generation != outcome.generation {
            debug!(
                "Discarding stale tile {} sample {} generation {}",
                outcome.coordinate, outcome.sample_size, outcome.generation
            );
            return DecodeApply::Discarded;
        }
        tile.cancel = None;

        let apply = match outcome.result {
            Ok(bitmap) => {
                if let Some(cache) = &self.cache {
                    let cache_key = tile_cache_key(&self.image_key, tile.src_rect, tile.sample_size);
                    cache.put(&cache_key, bitmap.clone(), &self.image_key, &self.image_info);
                }
                tile.set_loaded(bitmap);
                DecodeApply::Applied { trim_memory: false }
            }
            Err(DecodeError::Cancelled) => {
                tile.state = TileState::Initialized;
                DecodeApply::Applied { trim_memory: false }
            }
            Err(error @ (DecodeError::UnsupportedFormat { .. } | DecodeError::FrameFailed(_))) => {
                warn!("Disabling tiles of '{}': {error}", self.image_key);
                self.disable();
                return DecodeApply::ImageUnusable(error.into());
            }
            Err(error) => {
                warn!(
                    "Tile {} sample {} of '{}' failed: {error}",
                    tile.coordinate, tile.sample_size, self.image_key
                );
                tile.state = TileState::Error(error.kind());
                DecodeApply::Applied {
                    trim_memory: matches!(error, DecodeError::OutOfMemory(_)),
                }
            }
        };
        self.prune_background();
        apply
    }

    pub fn snapshot(&self, version: u64) -> TileSnapshotList {
        let foreground = self
            .current_tiles()
            .filter(|tile| !self.load_rect.is_empty() && tile.src_rect.overlaps(&self.load_rect))
            .map(Tile::snapshot)
            .collect();
        TileSnapshotList {
            version,
            image_info: Some(self.image_info.clone()),
            sample_size: self.sample_size,
            image_load_rect: self.load_rect,
            foreground,
            background: self.background.clone(),
        }
    }

    /// Drop background tiles and loaded tiles outside the visible rect.
    /// Returns the number of tiles released.
    pub fn trim_memory(&mut self) -> usize {
        let mut released = self.background.len();
        self.background.clear();
        let visible_rect = self.visible_rect;
        if let Some(level) = self.levels.get_mut(&self.sample_size) {
            for tile in &mut level.tiles {
                if tile.state == TileState::Loaded && !tile.src_rect.overlaps(&visible_rect) {
                    tile.release();
                    released += 1;
                }
            }
        }
        // Released margin tiles are re-requested by the next refresh
        self.last_refresh = None;
        info!("Trimmed {released} tiles of '{}'", self.image_key);
        released
    }

    /// Drop every bitmap but let decodes in flight finish.
    pub fn release_bitmaps(&mut self) -> usize {
        let mut released = self.background.len();
        self.background.clear();
        for level in self.levels.values_mut() {
            for tile in &mut level.tiles {
                if tile.state != TileState::Loading && tile.state != TileState::Initialized {
                    tile.release();
                    released += 1;
                }
            }
        }
        self.last_refresh = None;
        released
    }

    /// Release every tile, cancelling decodes in flight. The sample size
    /// selection is kept. Returns the number of cancelled decodes.
    pub fn release_all(&mut self) -> usize {
        let cancelled = self.release_levels();
        self.background.clear();
        self.last_refresh = None;
        cancelled
    }

    /// Release every tile and forget the last viewport, so the next refresh
    /// starts from scratch. Returns the number of cancelled decodes.
    pub fn reset(&mut self) -> usize {
        let cancelled = self.release_all();
        self.selector.reset();
        self.sample_size = 0;
        self.visible_rect = IntRect::ZERO;
        self.load_rect = IntRect::ZERO;
        cancelled
    }

    fn disable(&mut self) {
        self.reset();
        self.disabled = true;
    }

    fn release_levels(&mut self) -> usize {
        let cancelled = self.levels.values_mut().map(TileGridLevel::release_all).sum();
        self.levels.clear();
        cancelled
    }

    /// Move the loaded tiles of the old level to the background and drop every
    /// other level. Returns the number of cancelled decodes.
    fn switch_sample_size(&mut self, sample_size: u32) -> usize {
        let previous = self.sample_size;
        if self.background_tiles {
            let loaded: Vec<TileSnapshot> = self
                .current_tiles()
                .filter(|tile| tile.state == TileState::Loaded)
                .map(Tile::snapshot)
                .collect();
            // Keep the older background if the level being left had nothing yet
            if !loaded.is_empty() {
                self.background = loaded;
            }
        } else {
            self.background.clear();
        }

        let mut cancelled = 0;
        for (level_sample_size, level) in self.levels.iter_mut() {
            if *level_sample_size != sample_size {
                cancelled += level.release_all();
            }
        }
        self.levels.retain(|level_sample_size, _| *level_sample_size == sample_size);
        self.sample_size = sample_size;

        if previous != 0 {
            info!(
                "Sample size of '{}' {previous} -> {sample_size}, {} background tiles",
                self.image_key,
                self.background.len()
            );
        }
        cancelled
    }

    /// Drop background tiles outside the load rect, or all of them once every
    /// wanted foreground tile has settled. Returns true if any were dropped.
    fn prune_background(&mut self) -> bool {
        if self.background.is_empty() {
            return false;
        }
        let before = self.background.len();
        let load_rect = self.load_rect;
        let settled = self
            .current_tiles()
            .filter(|tile| tile.src_rect.overlaps(&load_rect))
            .all(|tile| tile.state.is_settled());
        if settled {
            self.background.clear();
        } else {
            self.background.retain(|tile| tile.src_rect.overlaps(&load_rect));
        }
        before != self.background.len()
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        self.release_levels();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::MemoryTileBitmapCache;
    use crate::error::DecodeErrorKind;
    use crate::decoder::decoded_size;
    use image::RgbaImage;

    fn wide_image() -> ImageInfo {
        ImageInfo::new(IntSize::new(8000, 2000), "image/jpeg")
    }

    fn fit_viewport() -> Viewport {
        Viewport::fit(IntSize::new(1000, 1000), IntSize::new(8000, 2000))
    }

    fn zoomed_viewport(scale: f32, visible_rect: IntRect) -> Viewport {
        Viewport::new(IntSize::new(1000, 1000), IntSize::new(1000, 250), visible_rect, scale)
    }

    fn manager(cache: Option<Arc<dyn TileBitmapCache>>) -> TileManager {
        TileManager::new("file:///wide.jpg", wide_image(), &SubsamplingConfig::default(), cache)
    }

    fn bitmap_for(request: &DecodeRequest) -> TileBitmap {
        let (width, height) = decoded_size(request.src_rect.size(), request.sample_size);
        TileBitmap::from_rgba(RgbaImage::new(width, height))
    }

    fn finish_all(manager: &mut TileManager, requests: &[DecodeRequest]) {
        for request in requests {
            let outcome = DecodeOutcome::for_request(request, Ok(bitmap_for(request)));
            assert_eq!(
                manager.on_decode_finished(outcome),
                DecodeApply::Applied { trim_memory: false }
            );
        }
    }

    #[test]
    fn test_fit_viewport_uses_sample_eight() {
        let mut manager = manager(None);
        let outcome = manager.refresh(&fit_viewport(), true);
        assert_eq!(manager.sample_size(), 8);
        assert_eq!(manager.tile_size(), IntSize::new(500, 500));
        // 8000x2000 at sample 8 with 4000px source tiles: 2 columns, 1 row
        assert_eq!(outcome.requests.len(), 2);
        assert!(outcome.changed);
        for request in &outcome.requests {
            assert_eq!(request.sample_size, 8);
            assert_eq!(decoded_size(request.src_rect.size(), 8), (500, 250));
        }
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut manager = manager(None);
        let viewport = zoomed_viewport(4.0, IntRect::new(2000, 500, 4000, 1000));
        let first = manager.refresh(&viewport, true);
        assert!(!first.requests.is_empty());
        let second = manager.refresh(&viewport, true);
        assert!(second.requests.is_empty());
        assert!(!second.changed);
        assert_eq!(second.cancelled, 0);
    }

    #[test]
    fn test_requests_cover_load_rect_nearest_first() {
        let mut manager = manager(None);
        let visible = IntRect::new(3000, 500, 5000, 1000);
        let outcome = manager.refresh(&zoomed_viewport(4.0, visible), true);
        assert_eq!(manager.sample_size(), 2);
        let load_rect = manager.image_load_rect();
        assert!(load_rect.contains_rect(&visible));

        // Union of requested tiles covers the load rect
        for y in (load_rect.top..load_rect.bottom).step_by(97) {
            for x in (load_rect.left..load_rect.right).step_by(97) {
                assert!(
                    outcome.requests.iter().any(|r| r.src_rect.contains_point(x, y)),
                    "({x},{y}) not covered"
                );
            }
        }

        let (cx, cy) = visible.center();
        let distances: Vec<f32> = outcome
            .requests
            .iter()
            .map(|r| {
                let (x, y) = r.src_rect.center();
                (x - cx).powi(2) + (y - cy).powi(2)
            })
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_pan_cancels_tiles_leaving_load_rect() {
        let mut manager = manager(None);
        let left = manager.refresh(&zoomed_viewport(8.0, IntRect::new(0, 0, 1000, 250)), true);
        assert_eq!(manager.sample_size(), 1);
        let tokens: Vec<CancelToken> = left.requests.iter().map(|r| r.cancel.clone()).collect();

        let right = manager.refresh(&zoomed_viewport(8.0, IntRect::new(7000, 1750, 8000, 2000)), true);
        assert_eq!(right.cancelled, left.requests.len());
        assert!(tokens.iter().all(CancelToken::is_cancelled));

        // Late results of the cancelled decodes are discarded
        for request in &left.requests {
            let outcome = DecodeOutcome::for_request(request, Ok(bitmap_for(request)));
            assert_eq!(manager.on_decode_finished(outcome), DecodeApply::Discarded);
        }
        assert_eq!(manager.loaded_count(), 0);
        finish_all(&mut manager, &right.requests);
        assert_eq!(manager.loaded_count(), right.requests.len());
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let mut manager = manager(None);
        let viewport = zoomed_viewport(8.0, IntRect::new(0, 0, 1000, 250));
        let first = manager.refresh(&viewport, true);
        let request = first.requests[0].clone();

        // Leave and come back: the same tile is requested again with a new generation
        manager.refresh(&zoomed_viewport(8.0, IntRect::new(7000, 1750, 8000, 2000)), true);
        let again = manager.refresh(&viewport, true);
        let renewed = again
            .requests
            .iter()
            .find(|r| r.coordinate == request.coordinate)
            .unwrap();
        assert_ne!(renewed.generation, request.generation);

        let stale = DecodeOutcome::for_request(&request, Ok(bitmap_for(&request)));
        assert_eq!(manager.on_decode_finished(stale), DecodeApply::Discarded);
        let fresh = DecodeOutcome::for_request(renewed, Ok(bitmap_for(renewed)));
        assert_eq!(
            manager.on_decode_finished(fresh),
            DecodeApply::Applied { trim_memory: false }
        );
    }

    #[test]
    fn test_zoom_keeps_old_level_as_background() {
        let mut manager = manager(None);
        let fit = manager.refresh(&fit_viewport(), true);
        finish_all(&mut manager, &fit.requests);
        assert_eq!(manager.loaded_count(), 2);

        let zoomed = manager.refresh(&zoomed_viewport(4.0, IntRect::new(3000, 500, 5000, 1000)), true);
        assert_eq!(manager.sample_size(), 2);
        assert!(manager.background_count() > 0);
        let snapshot = manager.snapshot(1);
        assert!(snapshot.background.iter().all(|t| t.sample_size == 8));
        assert!(snapshot.drawable().count() > 0);

        finish_all(&mut manager, &zoomed.requests);
        assert_eq!(manager.background_count(), 0);
        assert_eq!(manager.snapshot(2).loaded_count(), zoomed.requests.len());
    }

    #[test]
    fn test_background_disabled() {
        let config = SubsamplingConfig {
            disable_background_tiles: true,
            ..SubsamplingConfig::default()
        };
        let mut manager = TileManager::new("k", wide_image(), &config, None);
        let fit = manager.refresh(&fit_viewport(), true);
        finish_all(&mut manager, &fit.requests);
        manager.refresh(&zoomed_viewport(4.0, IntRect::new(3000, 500, 5000, 1000)), true);
        assert_eq!(manager.background_count(), 0);
    }

    #[test]
    fn test_source_unavailable_is_retried_on_next_refresh() {
        let mut manager = manager(None);
        let first = manager.refresh(&zoomed_viewport(8.0, IntRect::new(0, 0, 1000, 250)), true);
        let failed = first.requests[0].clone();
        let error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        manager.on_decode_finished(DecodeOutcome::for_request(&failed, Err(error.into())));
        assert_eq!(
            manager.tile_state(1, failed.coordinate),
            Some(TileState::Error(DecodeErrorKind::SourceUnavailable))
        );

        // Same viewport: nothing happens
        assert!(manager
            .refresh(&zoomed_viewport(8.0, IntRect::new(0, 0, 1000, 250)), true)
            .requests
            .is_empty());

        // A small pan keeps the tile wanted and retries it
        let pan = manager.refresh(&zoomed_viewport(8.0, IntRect::new(10, 0, 1010, 250)), true);
        assert!(pan.requests.iter().any(|r| r.coordinate == failed.coordinate));
    }

    #[test]
    fn test_decode_failed_is_not_retried() {
        let mut manager = manager(None);
        let first = manager.refresh(&zoomed_viewport(8.0, IntRect::new(0, 0, 1000, 250)), true);
        let failed = first.requests[0].clone();
        let outcome = DecodeOutcome::for_request(&failed, Err(DecodeError::OutOfMemory("big".into())));
        assert_eq!(
            manager.on_decode_finished(outcome),
            DecodeApply::Applied { trim_memory: true }
        );
        let pan = manager.refresh(&zoomed_viewport(8.0, IntRect::new(10, 0, 1010, 250)), true);
        assert!(!pan.requests.iter().any(|r| r.coordinate == failed.coordinate));
    }

    #[test]
    fn test_unsupported_format_disables_manager() {
        let mut manager = manager(None);
        let first = manager.refresh(&fit_viewport(), true);
        let outcome = DecodeOutcome::for_request(
            &first.requests[0],
            Err(DecodeError::UnsupportedFormat {
                mime_type: "image/x-foo".into(),
            }),
        );
        assert!(matches!(
            manager.on_decode_finished(outcome),
            DecodeApply::ImageUnusable(SubsamplingError::UnsupportedFormat { .. })
        ));
        assert!(manager.is_disabled());
        assert!(first.requests[1].cancel.is_cancelled());
        assert!(manager.refresh(&zoomed_viewport(2.0, IntRect::new(0, 0, 4000, 1000)), true).requests.is_empty());
    }

    #[test]
    fn test_frame_failure_disables_manager_once() {
        let mut manager = manager(None);
        let first = manager.refresh(&fit_viewport(), true);
        let outcome = DecodeOutcome::for_request(
            &first.requests[0],
            Err(DecodeError::FrameFailed("corrupt stream".into())),
        );
        assert_eq!(
            manager.on_decode_finished(outcome),
            DecodeApply::ImageUnusable(SubsamplingError::DecodeFailed("corrupt stream".into()))
        );
        assert!(manager.is_disabled());

        // The sibling tile fails the same way but its tile was already released
        let sibling = DecodeOutcome::for_request(
            &first.requests[1],
            Err(DecodeError::FrameFailed("corrupt stream".into())),
        );
        assert_eq!(manager.on_decode_finished(sibling), DecodeApply::Discarded);
    }

    #[test]
    fn test_cache_hit_skips_decode() {
        let cache: Arc<dyn TileBitmapCache> = Arc::new(MemoryTileBitmapCache::new(64 * 1024 * 1024));
        let mut first = manager(Some(cache.clone()));
        let outcome = first.refresh(&fit_viewport(), true);
        finish_all(&mut first, &outcome.requests);
        drop(first);

        let mut second = manager(Some(cache));
        let outcome = second.refresh(&fit_viewport(), true);
        assert!(outcome.requests.is_empty());
        assert!(outcome.changed);
        assert_eq!(second.loaded_count(), 2);
    }

    #[test]
    fn test_paused_refresh_schedules_nothing() {
        let mut manager = manager(None);
        let outcome = manager.refresh(&fit_viewport(), false);
        assert!(outcome.requests.is_empty());
        assert_eq!(manager.sample_size(), 8);
        let resumed = manager.refresh(&fit_viewport(), true);
        assert_eq!(resumed.requests.len(), 2);
    }

    #[test]
    fn test_release_bitmaps_keeps_in_flight_decodes() {
        let mut manager = manager(None);
        let outcome = manager.refresh(&fit_viewport(), true);
        finish_all(&mut manager, &outcome.requests[..1]);
        assert_eq!(manager.release_bitmaps(), 1);
        assert_eq!(manager.loaded_count(), 0);
        assert_eq!(manager.loading_count(), 1);
        assert!(!outcome.requests[1].cancel.is_cancelled());
        finish_all(&mut manager, &outcome.requests[1..]);
        assert_eq!(manager.loaded_count(), 1);
    }

    #[test]
    fn test_tile_size_change_rebuilds_grid() {
        let mut manager = manager(None);
        let first = manager.refresh(&fit_viewport(), true);
        let viewport = Viewport::fit(IntSize::new(2000, 2000), IntSize::new(8000, 2000));
        let outcome = manager.refresh(&viewport, true);
        assert_eq!(manager.tile_size(), IntSize::new(1000, 1000));
        assert_eq!(outcome.cancelled, first.requests.len());
        assert_eq!(manager.sample_size(), 4);
    }

    #[test]
    fn test_trim_and_reset() {
        let mut manager = manager(None);
        let outcome = manager.refresh(&zoomed_viewport(8.0, IntRect::new(3000, 800, 4000, 1050)), true);
        finish_all(&mut manager, &outcome.requests);
        let loaded = manager.loaded_count();
        let released = manager.trim_memory();
        assert!(released > 0);
        assert_eq!(manager.loaded_count(), loaded - released);

        // Refresh brings margin tiles back
        let again = manager.refresh(&zoomed_viewport(8.0, IntRect::new(3000, 800, 4000, 1050)), true);
        assert_eq!(again.requests.len(), released);

        assert_eq!(manager.reset(), released);
        assert_eq!(manager.sample_size(), 0);
        assert!(manager.snapshot(0).foreground.is_empty());
    }
}
