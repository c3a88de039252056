use super::{TrimLevel, byte_count_of};
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Checkouts served by a released buffer
    pub hits: u64,
    /// Checkouts that had to allocate
    pub misses: u64,
    /// Buffers accepted back into the pool
    pub recycled: u64,
    /// Buffers refused because the pool was full or disabled
    pub dropped: u64,
}

/// Arena of released RGBA8 buffers keyed by (width, height).
///
/// `checkout` moves a buffer out of the arena; ownership only comes back through
/// `checkin`. Contents of a reused buffer are unspecified, callers overwrite it.
pub struct TileBitmapPool {
    state: Mutex<PoolState>,
    max_bytes: usize,
    enabled: bool,
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<(u32, u32), Vec<Vec<u8>>>,
    bytes: usize,
    stats: PoolStats,
}

impl TileBitmapPool {
    pub fn new(max_bytes: usize, enabled: bool) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_bytes,
            enabled,
        }
    }

    pub fn checkout(&self, width: u32, height: u32) -> Vec<u8> {
        let len = byte_count_of(width, height);
        let mut state = self.state.lock().unwrap();
        let reused = state
            .buckets
            .get_mut(&(width, height))
            .and_then(|bucket| bucket.pop());
        match reused {
            Some(buffer) => {
                state.bytes -= buffer.len();
                state.stats.hits += 1;
                buffer
            }
            None => {
                state.stats.misses += 1;
                drop(state);
                vec![0; len]
            }
        }
    }

    pub fn checkin(&self, width: u32, height: u32, buffer: Vec<u8>) {
        let len = buffer.len();
        let mut state = self.state.lock().unwrap();
        if !self.enabled || len != byte_count_of(width, height) || state.bytes + len > self.max_bytes
        {
            state.stats.dropped += 1;
            return;
        }
        state.bytes += len;
        state.stats.recycled += 1;
        state.buckets.entry((width, height)).or_default().push(buffer);
    }

    pub fn trim(&self, level: TrimLevel) {
        let mut state = self.state.lock().unwrap();
        let target = match level {
            TrimLevel::Moderate => state.bytes / 2,
            TrimLevel::Complete => 0,
        };
        let before = state.bytes;
        let mut bytes = state.bytes;
        for bucket in state.buckets.values_mut() {
            while bytes > target {
                match bucket.pop() {
                    Some(buffer) => bytes -= buffer.len(),
                    None => break,
                }
            }
        }
        state.buckets.retain(|_, bucket| !bucket.is_empty());
        state.bytes = bytes;
        debug!("Trimmed bitmap pool {level:?}: {before} -> {bytes} bytes");
    }

    pub fn clear(&self) {
        self.trim(TrimLevel::Complete);
    }

    pub fn bytes(&self) -> usize {
        self.state.lock().unwrap().bytes
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().unwrap().stats
    }
}
