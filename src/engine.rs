//! The subsampling engine: a coordination thread that owns the tile grid,
//! a worker pool that decodes tiles, and lock-free snapshot publication.

use crate::bitmap::{MemoryTileBitmapCache, PoolStats, TileBitmapCache, TileBitmapPool, TrimLevel};
use crate::config::SubsamplingConfig;
use crate::decoder::{
    DecodeWorkerPool, ImageTileDecoderFactory, PreparedImage, TileDecoder, TileDecoderFactory,
    decode_catching_panics,
};
use crate::error::{DecodeError, EngineError, SubsamplingError};
use crate::image_info::ImageInfo;
use crate::image_source::ImageSource;
use crate::tiles::grid::check_can_use_subsampling;
use crate::tiles::{DecodeApply, DecodeOutcome, DecodeRequest, TileManager, TileSnapshotList, Viewport};
use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};

/// Notifications sent to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Image info was read; display-space size
    Ready(ImageInfo),
    /// A new snapshot was published
    TilesChanged { version: u64 },
    /// Subsampling is off for the current image. Sent once per image.
    Unavailable(SubsamplingError),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SubsamplingStatus {
    /// No image source
    #[default]
    Idle,
    /// Reading image info
    Preparing,
    /// The image is displayed fine without tiles at the current viewport
    NotNeeded,
    Ready(ImageInfo),
    Unavailable(SubsamplingError),
}

enum EngineMessage {
    SetImageSource(Option<Arc<dyn ImageSource>>),
    SetViewport(Viewport),
    ClearViewport,
    Pause,
    Resume,
    SetTransforming(bool),
    Reset,
    TrimMemory(TrimLevel),
    Subscribe(Sender<EngineEvent>),
    Prepared {
        image_generation: u64,
        result: Result<(PreparedImage, Arc<dyn TileDecoder>), DecodeError>,
    },
    DecodeFinished {
        image_generation: u64,
        outcome: DecodeOutcome,
    },
    Shutdown,
}

/// Handle to the engine. All methods return immediately; work happens on the
/// coordination thread and results show up in [`SubsamplingEngine::current_tiles`].
pub struct SubsamplingEngine {
    sender: Sender<EngineMessage>,
    snapshot: Arc<ArcSwap<TileSnapshotList>>,
    status: Arc<ArcSwap<SubsamplingStatus>>,
    pool: Arc<TileBitmapPool>,
    thread: Option<JoinHandle<()>>,
}

impl SubsamplingEngine {
    /// Engine with the `image` crate decoder and an in-memory tile cache
    pub fn new(config: SubsamplingConfig) -> Result<Self, EngineError> {
        let cache: Option<Arc<dyn TileBitmapCache>> = if config.disable_memory_cache {
            None
        } else {
            Some(Arc::new(MemoryTileBitmapCache::new(config.memory_cache_max_bytes)))
        };
        Self::with_collaborators(config, Arc::new(ImageTileDecoderFactory), cache)
    }

    pub fn with_collaborators(
        config: SubsamplingConfig,
        factory: Arc<dyn TileDecoderFactory>,
        cache: Option<Arc<dyn TileBitmapCache>>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        let (sender, receiver) = channel();
        let snapshot = Arc::new(ArcSwap::from_pointee(TileSnapshotList::default()));
        let status = Arc::new(ArcSwap::from_pointee(SubsamplingStatus::Idle));
        let pool = Arc::new(TileBitmapPool::new(
            config.bitmap_pool_max_bytes,
            !config.disable_bitmap_reuse,
        ));
        let workers = DecodeWorkerPool::new(config.decode_threads, "zoomimage-decode")?;

        let coordinator = Coordinator {
            config,
            factory,
            cache,
            pool: pool.clone(),
            workers,
            sender: sender.clone(),
            receiver,
            snapshot: snapshot.clone(),
            status: status.clone(),
            listeners: Vec::new(),
            source: None,
            image: None,
            image_generation: 0,
            viewport: None,
            paused: false,
            transforming: false,
            unavailable_sent: false,
            retry_prepare: false,
            version: 0,
            dirty: false,
        };
        let thread = thread::Builder::new()
            .name("zoomimage-engine".to_string())
            .spawn(move || coordinator.run())?;

        Ok(Self {
            sender,
            snapshot,
            status,
            pool,
            thread: Some(thread),
        })
    }

    fn send(&self, message: EngineMessage) {
        if self.sender.send(message).is_err() {
            error!("Subsampling engine thread is gone");
        }
    }

    /// Switch to another image, or to none. Setting the current source again is a no-op.
    pub fn set_image_source(&self, source: Option<Arc<dyn ImageSource>>) {
        self.send(EngineMessage::SetImageSource(source));
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.send(EngineMessage::SetViewport(viewport));
    }

    pub fn clear_viewport(&self) {
        self.send(EngineMessage::ClearViewport);
    }

    pub fn pause(&self) {
        self.send(EngineMessage::Pause);
    }

    pub fn resume(&self) {
        self.send(EngineMessage::Resume);
    }

    /// Host reports a continuous gesture (pinch, fling) starting or ending
    pub fn set_transforming(&self, transforming: bool) {
        self.send(EngineMessage::SetTransforming(transforming));
    }

    pub fn reset(&self) {
        self.send(EngineMessage::Reset);
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        self.send(EngineMessage::TrimMemory(level));
    }

    /// Latest published snapshot. Never blocks.
    pub fn current_tiles(&self) -> Arc<TileSnapshotList> {
        self.snapshot.load_full()
    }

    /// Events from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (sender, receiver) = channel();
        self.send(EngineMessage::Subscribe(sender));
        receiver
    }

    pub fn status(&self) -> SubsamplingStatus {
        self.status.load().as_ref().clone()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Drop for SubsamplingEngine {
    fn drop(&mut self) {
        let _ = self.sender.send(EngineMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Subsampling engine thread panicked");
            }
        }
    }
}

struct LoadedImage {
    source: Arc<dyn ImageSource>,
    decoder: Arc<dyn TileDecoder>,
    manager: TileManager,
}

impl LoadedImage {
    fn close(self) {
        self.decoder.close();
    }
}

/// State owned by the coordination thread.
struct Coordinator {
    config: SubsamplingConfig,
    factory: Arc<dyn TileDecoderFactory>,
    cache: Option<Arc<dyn TileBitmapCache>>,
    pool: Arc<TileBitmapPool>,
    workers: DecodeWorkerPool,
    sender: Sender<EngineMessage>,
    receiver: Receiver<EngineMessage>,
    snapshot: Arc<ArcSwap<TileSnapshotList>>,
    status: Arc<ArcSwap<SubsamplingStatus>>,
    listeners: Vec<Sender<EngineEvent>>,
    source: Option<Arc<dyn ImageSource>>,
    image: Option<LoadedImage>,
    /// Bumped on every source change; results of older images are dropped
    image_generation: u64,
    viewport: Option<Viewport>,
    paused: bool,
    transforming: bool,
    unavailable_sent: bool,
    /// Reading image info failed on the source; prepare again on the next chance
    retry_prepare: bool,
    version: u64,
    dirty: bool,
}

impl Coordinator {
    fn run(mut self) {
        debug!("Subsampling engine started");
        while let Ok(first) = self.receiver.recv() {
            let mut batch = vec![first];
            batch.extend(self.receiver.try_iter());

            // Only the newest viewport of a burst matters
            let last_viewport = batch
                .iter()
                .rposition(|message| matches!(message, EngineMessage::SetViewport(_)));

            for (index, message) in batch.into_iter().enumerate() {
                if matches!(message, EngineMessage::SetViewport(_)) && Some(index) != last_viewport {
                    continue;
                }
                if !self.handle(message) {
                    self.shutdown();
                    return;
                }
            }
            self.publish_if_dirty();
        }
        self.shutdown();
    }

    /// Returns false on shutdown.
    fn handle(&mut self, message: EngineMessage) -> bool {
        match message {
            EngineMessage::SetImageSource(source) => self.set_image_source(source),
            EngineMessage::SetViewport(viewport) => {
                self.viewport = Some(viewport);
                self.refresh();
            }
            EngineMessage::ClearViewport => {
                self.viewport = None;
                if let Some(image) = &mut self.image {
                    image.manager.release_all();
                    self.dirty = true;
                }
            }
            EngineMessage::Pause => self.pause(),
            EngineMessage::Resume => self.resume(),
            EngineMessage::SetTransforming(transforming) => {
                let ended = self.transforming && !transforming;
                self.transforming = transforming;
                if ended {
                    self.refresh();
                }
            }
            EngineMessage::Reset => {
                if let Some(image) = &mut self.image {
                    image.manager.reset();
                    self.dirty = true;
                }
                self.refresh();
            }
            EngineMessage::TrimMemory(level) => self.trim_memory(level),
            EngineMessage::Subscribe(listener) => self.listeners.push(listener),
            EngineMessage::Prepared {
                image_generation,
                result,
            } => self.on_prepared(image_generation, result),
            EngineMessage::DecodeFinished {
                image_generation,
                outcome,
            } => self.on_decode_finished(image_generation, outcome),
            EngineMessage::Shutdown => return false,
        }
        true
    }

    fn set_image_source(&mut self, source: Option<Arc<dyn ImageSource>>) {
        let same = match (&self.source, &source) {
            (Some(current), Some(new)) => current.key() == new.key(),
            (None, None) => true,
            _ => false,
        };
        if same {
            if self.retry_prepare && self.image.is_none() {
                self.prepare();
            }
            return;
        }

        if let Some(image) = self.image.take() {
            debug!("Closing '{}'", image.source.key());
            image.close();
        }
        self.image_generation += 1;
        self.unavailable_sent = false;
        self.retry_prepare = false;
        self.source = source;
        self.dirty = true;

        if self.source.is_none() {
            info!("Image source cleared");
            self.set_status(SubsamplingStatus::Idle);
            return;
        }
        self.prepare();
    }

    /// Read image info and create the decoder of the current source on a worker
    fn prepare(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        info!("Preparing '{}'", source.key());
        self.retry_prepare = false;
        self.set_status(SubsamplingStatus::Preparing);

        let factory = self.factory.clone();
        let pool = self.pool.clone();
        let sender = self.sender.clone();
        let image_generation = self.image_generation;
        self.workers.execute(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let prepared = factory.read_image_info(source.as_ref())?;
                if !factory.supports_region_decode(&prepared.image_info.mime_type) {
                    return Err(DecodeError::UnsupportedFormat {
                        mime_type: prepared.image_info.mime_type.clone(),
                    });
                }
                let decoder = factory.create_decoder(source.clone(), &prepared, pool)?;
                Ok((prepared, decoder))
            }))
            .unwrap_or_else(|_| Err(DecodeError::DecodeFailed("reading image info panicked".to_string())));
            let _ = sender.send(EngineMessage::Prepared {
                image_generation,
                result,
            });
        });
    }

    fn on_prepared(
        &mut self,
        image_generation: u64,
        result: Result<(PreparedImage, Arc<dyn TileDecoder>), DecodeError>,
    ) {
        if image_generation != self.image_generation {
            if let Ok((_, decoder)) = result {
                decoder.close();
            }
            return;
        }
        let Some(source) = self.source.clone() else {
            return;
        };

        match result {
            Ok((prepared, decoder)) => {
                let display_info = prepared.display_info();
                info!(
                    "Image '{}' ready: {} orientation {:?}",
                    source.key(),
                    display_info.to_short_string(),
                    prepared.orientation
                );
                let manager = TileManager::new(
                    source.key(),
                    display_info.clone(),
                    &self.config,
                    self.cache.clone(),
                );
                self.image = Some(LoadedImage {
                    source,
                    decoder,
                    manager,
                });
                self.unavailable_sent = false;
                self.set_status(SubsamplingStatus::Ready(display_info.clone()));
                self.emit(EngineEvent::Ready(display_info));
                self.refresh();
            }
            Err(error) => {
                warn!("Subsampling unavailable for '{}': {error}", source.key());
                self.retry_prepare = error.is_retryable();
                self.mark_unavailable(error.into());
            }
        }
    }

    fn on_decode_finished(&mut self, image_generation: u64, outcome: DecodeOutcome) {
        if image_generation != self.image_generation {
            return;
        }
        let Some(image) = &mut self.image else {
            return;
        };
        match image.manager.on_decode_finished(outcome) {
            DecodeApply::Applied { trim_memory } => {
                self.dirty = true;
                if trim_memory {
                    self.trim_memory(TrimLevel::Moderate);
                }
            }
            DecodeApply::Discarded => {}
            DecodeApply::ImageUnusable(error) => {
                if let Some(image) = self.image.take() {
                    image.close();
                }
                self.mark_unavailable(error);
            }
        }
    }

    fn mark_unavailable(&mut self, error: SubsamplingError) {
        self.dirty = true;
        self.set_status(SubsamplingStatus::Unavailable(error.clone()));
        if !self.unavailable_sent {
            self.unavailable_sent = true;
            self.emit(EngineEvent::Unavailable(error));
        }
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        info!("Subsampling paused");
        if self.config.release_memory_on_pause {
            if let Some(image) = &mut self.image {
                let released = image.manager.release_bitmaps();
                debug!("Released {released} tiles on pause");
                self.dirty = true;
            }
            self.pool.clear();
        }
    }

    fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        info!("Subsampling resumed");
        if let Some(image) = &mut self.image {
            image.manager.reset();
            self.dirty = true;
        }
        self.refresh();
    }

    fn trim_memory(&mut self, level: TrimLevel) {
        if let Some(cache) = &self.cache {
            cache.trim(level);
        }
        self.pool.trim(level);
        if let Some(image) = &mut self.image {
            match level {
                TrimLevel::Moderate => {
                    image.manager.trim_memory();
                }
                TrimLevel::Complete => {
                    image.manager.release_all();
                }
            }
            self.dirty = true;
        }
    }

    fn refresh(&mut self) {
        if self.image.is_none() && self.retry_prepare {
            if !self.paused {
                self.prepare();
            }
            return;
        }
        let Some(viewport) = self.viewport else {
            return;
        };
        let was_not_needed = matches!(**self.status.load(), SubsamplingStatus::NotNeeded);
        let Some(image) = &mut self.image else {
            return;
        };

        if let Err(reason) = check_can_use_subsampling(
            image.manager.image_info().size,
            viewport.content_size,
            self.config.max_aspect_ratio_delta,
        ) {
            if !was_not_needed {
                info!("Subsampling not needed for '{}': {reason:?}", image.source.key());
                image.manager.release_all();
                self.dirty = true;
                self.status.store(Arc::new(SubsamplingStatus::NotNeeded));
            }
            return;
        }
        if was_not_needed {
            let info = image.manager.image_info().clone();
            self.status.store(Arc::new(SubsamplingStatus::Ready(info)));
        }

        let allow_decode = !self.paused && !(self.transforming && self.config.pause_when_transforming);
        let outcome = image.manager.refresh(&viewport, allow_decode);
        if outcome.changed {
            self.dirty = true;
        }
        let decoder = image.decoder.clone();
        for request in outcome.requests {
            self.schedule_decode(decoder.clone(), request);
        }
    }

    fn schedule_decode(&self, decoder: Arc<dyn TileDecoder>, request: DecodeRequest) {
        debug!(
            "Decoding tile {} {} sample {}",
            request.coordinate, request.src_rect, request.sample_size
        );
        let sender = self.sender.clone();
        let image_generation = self.image_generation;
        self.workers.execute(move || {
            let result = if request.cancel.is_cancelled() {
                Err(DecodeError::Cancelled)
            } else {
                decode_catching_panics(
                    decoder.as_ref(),
                    request.src_rect,
                    request.sample_size,
                    &request.cancel,
                )
            };
            match &result {
                Ok(bitmap) => debug!(
                    "Decoded tile {} into {}x{}",
                    request.coordinate,
                    bitmap.width(),
                    bitmap.height()
                ),
                Err(DecodeError::Cancelled) => debug!("Skipped cancelled tile {}", request.coordinate),
                Err(e) => debug!("Tile {} decode error: {e}", request.coordinate),
            }
            let outcome = DecodeOutcome::for_request(&request, result);
            let _ = sender.send(EngineMessage::DecodeFinished {
                image_generation,
                outcome,
            });
        });
    }

    fn set_status(&self, status: SubsamplingStatus) {
        self.status.store(Arc::new(status));
    }

    fn emit(&mut self, event: EngineEvent) {
        self.listeners.retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn publish_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.version += 1;
        let snapshot = match &self.image {
            Some(image) => image.manager.snapshot(self.version),
            None => TileSnapshotList {
                version: self.version,
                ..TileSnapshotList::default()
            },
        };
        self.snapshot.store(Arc::new(snapshot));
        self.emit(EngineEvent::TilesChanged {
            version: self.version,
        });
    }

    fn shutdown(&mut self) {
        if let Some(image) = self.image.take() {
            image.close();
        }
        self.listeners.clear();
        debug!("Subsampling engine stopped");
    }
}
