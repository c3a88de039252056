use super::{TileBitmap, TrimLevel};
use crate::image_info::ImageInfo;
use log::{debug, warn};
use lru::LruCache;
use std::sync::Mutex;

/// Memory cache for decoded tiles.
///
/// Implementations synchronize internally and may evict at any time, so a miss
/// is always an expected outcome. Hosts with their own memory cache implement
/// this trait to share it with the tile engine.
pub trait TileBitmapCache: Send + Sync {
    fn get(&self, key: &str) -> Option<TileBitmap>;

    /// Store `bitmap` under `key`, returning the entry it replaced
    fn put(
        &self,
        key: &str,
        bitmap: TileBitmap,
        image_key: &str,
        image_info: &ImageInfo,
    ) -> Option<TileBitmap>;

    fn remove(&self, key: &str) -> Option<TileBitmap>;

    fn trim(&self, level: TrimLevel);

    fn clear(&self);
}

/// Byte-bounded LRU cache.
pub struct MemoryTileBitmapCache {
    state: Mutex<CacheState>,
    max_bytes: usize,
}

struct CacheState {
    entries: LruCache<String, TileBitmap>,
    bytes: usize,
    hits: u64,
    misses: u64,
}

impl MemoryTileBitmapCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
            }),
            max_bytes,
        }
    }

    pub fn bytes(&self) -> usize {
        self.state.lock().unwrap().bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn hit_stats(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.hits, state.misses)
    }
}

impl CacheState {
    fn evict_to(&mut self, target_bytes: usize) {
        while self.bytes > target_bytes {
            match self.entries.pop_lru() {
                Some((key, evicted)) => {
                    self.bytes -= evicted.byte_count();
                    debug!("Evicted tile bitmap {key} ({} bytes)", evicted.byte_count());
                }
                None => break,
            }
        }
    }
}

impl TileBitmapCache for MemoryTileBitmapCache {
    fn get(&self, key: &str) -> Option<TileBitmap> {
        let mut state = self.state.lock().unwrap();
        let found = state.entries.get(key).cloned();
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    fn put(
        &self,
        key: &str,
        bitmap: TileBitmap,
        image_key: &str,
        image_info: &ImageInfo,
    ) -> Option<TileBitmap> {
        let size = bitmap.byte_count();
        if size > self.max_bytes {
            warn!(
                "Tile bitmap of {size} bytes exceeds cache capacity {}, not cached. image={image_key} {}",
                self.max_bytes,
                image_info.to_short_string()
            );
            return None;
        }

        let mut state = self.state.lock().unwrap();
        let previous = state.entries.put(key.to_string(), bitmap);
        if let Some(previous) = &previous {
            state.bytes -= previous.byte_count();
        }
        state.bytes += size;
        let max_bytes = self.max_bytes;
        state.evict_to(max_bytes);
        previous
    }

    fn remove(&self, key: &str) -> Option<TileBitmap> {
        let mut state = self.state.lock().unwrap();
        let removed = state.entries.pop(key);
        if let Some(removed) = &removed {
            state.bytes -= removed.byte_count();
        }
        removed
    }

    fn trim(&self, level: TrimLevel) {
        let mut state = self.state.lock().unwrap();
        let target = match level {
            TrimLevel::Moderate => state.bytes / 2,
            TrimLevel::Complete => 0,
        };
        state.evict_to(target);
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::IntSize;
    use image::{Rgba, RgbaImage};

    fn info() -> ImageInfo {
        ImageInfo::new(IntSize::new(100, 100), "image/png")
    }

    fn bitmap(width: u32, height: u32, value: u8) -> TileBitmap {
        TileBitmap::from_rgba(RgbaImage::from_pixel(width, height, Rgba([value, value, value, 255])))
    }

    #[test]
    fn test_put_then_get_returns_identical_pixels() {
        let cache = MemoryTileBitmapCache::new(1024 * 1024);
        let original = bitmap(10, 10, 7);
        assert!(cache.put("a", original.clone(), "img", &info()).is_none());

        let cached = cache.get("a").unwrap();
        assert_eq!(cached.pixels(), original.pixels());
        assert_eq!(cache.hit_stats(), (1, 0));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.hit_stats(), (1, 1));
    }

    #[test]
    fn test_put_returns_previous_entry() {
        let cache = MemoryTileBitmapCache::new(1024 * 1024);
        let first = bitmap(4, 4, 1);
        cache.put("a", first.clone(), "img", &info());
        let previous = cache.put("a", bitmap(4, 4, 2), "img", &info()).unwrap();
        assert!(previous.same_allocation(&first));
        assert_eq!(cache.bytes(), 64);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        // Room for two 10x10 bitmaps
        let cache = MemoryTileBitmapCache::new(800);
        cache.put("a", bitmap(10, 10, 1), "img", &info());
        cache.put("b", bitmap(10, 10, 2), "img", &info());
        cache.get("a");
        cache.put("c", bitmap(10, 10, 3), "img", &info());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.bytes(), 800);
    }

    #[test]
    fn test_oversized_bitmap_is_not_cached() {
        let cache = MemoryTileBitmapCache::new(100);
        assert!(cache.put("big", bitmap(10, 10, 1), "img", &info()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_trim_and_remove() {
        let cache = MemoryTileBitmapCache::new(1024 * 1024);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.put(key, bitmap(10, 10, i as u8), "img", &info());
        }
        cache.trim(TrimLevel::Moderate);
        assert_eq!(cache.len(), 2);
        assert!(cache.remove("d").is_some());
        assert_eq!(cache.bytes(), 400);
        cache.trim(TrimLevel::Complete);
        assert!(cache.is_empty());
    }
}
