use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables of the subsampling engine.
///
/// Every field has a default, so a JSON file only needs the values it overrides.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SubsamplingConfig {
    /// Lower bound of the preferred tile edge, in decoded pixels
    pub min_tile_size: i32,
    /// Upper bound of a decoded tile edge; keeps tiles below texture limits
    pub max_tile_size: i32,
    /// Extra area loaded around the visible rect, as a fraction of its size per side
    pub prefetch_margin: f32,
    /// Relative slack around a sample size boundary before switching levels
    pub sample_size_hysteresis: f32,
    pub decode_threads: usize,
    pub memory_cache_max_bytes: usize,
    pub disable_memory_cache: bool,
    pub bitmap_pool_max_bytes: usize,
    pub disable_bitmap_reuse: bool,
    /// Stop scheduling decodes while a continuous gesture is running
    pub pause_when_transforming: bool,
    pub release_memory_on_pause: bool,
    pub disable_background_tiles: bool,
    /// Maximum relative difference between the horizontal and vertical
    /// image-to-content ratios
    pub max_aspect_ratio_delta: f32,
}

impl Default for SubsamplingConfig {
    fn default() -> Self {
        Self {
            min_tile_size: 256,
            max_tile_size: 2048,
            prefetch_margin: 0.25,
            sample_size_hysteresis: 0.1,
            decode_threads: default_decode_threads(),
            memory_cache_max_bytes: 128 * 1024 * 1024,
            disable_memory_cache: false,
            bitmap_pool_max_bytes: 32 * 1024 * 1024,
            disable_bitmap_reuse: false,
            pause_when_transforming: false,
            release_memory_on_pause: true,
            disable_background_tiles: false,
            max_aspect_ratio_delta: 0.1,
        }
    }
}

fn default_decode_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().clamp(1, 4))
        .unwrap_or(2)
}

impl SubsamplingConfig {
    pub fn load_or_default(file_path: Option<&str>) -> Self {
        match file_path {
            Some(path) => Self::load_from_file(path).unwrap_or_else(|e| {
                log::error!("Failed to load subsampling config from {path}: {e}");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let path = Path::new(file_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str::<Self>(&content).map_err(|e| {
            log::error!("Failed to parse subsampling config file: {e}");
            anyhow::anyhow!("Failed to parse subsampling config: {}", e)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, file_path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(file_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_tile_size <= 0 || self.max_tile_size < self.min_tile_size {
            anyhow::bail!(
                "invalid tile size bounds: min {} max {}",
                self.min_tile_size,
                self.max_tile_size
            );
        }
        if !(0.0..=4.0).contains(&self.prefetch_margin) {
            anyhow::bail!("prefetch_margin out of range: {}", self.prefetch_margin);
        }
        if !(0.0..0.5).contains(&self.sample_size_hysteresis) {
            anyhow::bail!(
                "sample_size_hysteresis out of range: {}",
                self.sample_size_hysteresis
            );
        }
        if self.decode_threads == 0 {
            anyhow::bail!("decode_threads must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("subsampling.json");
        fs::write(&path, r#"{ "prefetch_margin": 0.5, "decode_threads": 1 }"#).unwrap();

        let config = SubsamplingConfig::load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.prefetch_margin, 0.5);
        assert_eq!(config.decode_threads, 1);
        assert_eq!(config.min_tile_size, SubsamplingConfig::default().min_tile_size);
    }

    #[test]
    fn test_invalid_config_falls_back_to_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("subsampling.json");
        fs::write(&path, r#"{ "min_tile_size": 0 }"#).unwrap();

        assert!(SubsamplingConfig::load_from_file(path.to_str().unwrap()).is_err());
        let config = SubsamplingConfig::load_or_default(path.to_str());
        assert_eq!(config, SubsamplingConfig::default());
    }

    #[test]
    fn test_save_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("subsampling.json");
        let config = SubsamplingConfig {
            pause_when_transforming: true,
            ..SubsamplingConfig::default()
        };
        config.save(path.to_str().unwrap()).unwrap();
        let loaded = SubsamplingConfig::load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded, config);
    }
}
