//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a small TOML file. Every field has a
//! built-in default, so a missing or unreadable file never prevents startup.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted for the data folder
pub const ROOT_FOLDER_ENV: &str = "MATHPAD_ROOT";

/// Bootstrap configuration loaded from `mathpad.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Data folder holding `document.json` and `cache.json`
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Row pipeline tuning (optional)
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Row pipeline parameters
///
/// Defaults match the tuned values of the recognition and validation stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tile edge length in pixels
    pub tile_size: u32,
    /// Horizontal overlap between adjacent tiles in pixels
    pub tile_overlap: u32,
    /// Height of one row band in pixels
    pub row_height: u32,
    /// Concurrent recognition workers
    pub worker_count: usize,
    /// Maximum queued (not yet running) recognition tasks
    pub queue_capacity: usize,
    /// Per-tile recognition timeout
    pub tile_timeout_ms: u64,
    /// Delay between row deactivation and the OCR run
    pub ocr_debounce_ms: u64,
    /// Delay between OCR completion and validation
    pub validation_debounce_ms: u64,
    /// Hard timeout for one equivalence check
    pub validation_timeout_ms: u64,
    /// Cache entry lifetime
    pub cache_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_size: 384,
            tile_overlap: 64,
            row_height: 384,
            worker_count: 3,
            queue_capacity: 20,
            tile_timeout_ms: 10_000,
            ocr_debounce_ms: 1_000,
            validation_debounce_ms: 500,
            validation_timeout_ms: 2_000,
            cache_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl PipelineConfig {
    /// Tile stride (`tile_size - tile_overlap`)
    pub fn tile_stride(&self) -> u32 {
        self.tile_size.saturating_sub(self.tile_overlap)
    }

    /// Reject parameter combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || self.row_height == 0 {
            return Err(Error::Config("tile_size and row_height must be positive".to_string()));
        }
        if self.tile_overlap >= self.tile_size {
            return Err(Error::Config(format!(
                "tile_overlap ({}) must be smaller than tile_size ({})",
                self.tile_overlap, self.tile_size
            )));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    config.pipeline.validate()?;
    Ok(config)
}

/// Load config, falling back to defaults with a warning on any failure
pub fn load_or_default(path: Option<&Path>) -> TomlConfig {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(p) => p,
        None => {
            warn!("No config directory available, using built-in defaults");
            return TomlConfig::default();
        }
    };

    if !path.exists() {
        info!("Config file {} not found, using built-in defaults", path.display());
        return TomlConfig::default();
    }

    match load_toml_config(&path) {
        Ok(config) => {
            info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Ignoring config file {}: {}", path.display(), e);
            TomlConfig::default()
        }
    }
}

/// Write a TOML config file (used by tests and first-run setup)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Platform config file location (`<config dir>/mathpad/mathpad.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mathpad").join("mathpad.toml"))
}

/// Root folder resolution priority:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default data folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mathpad"))
        .unwrap_or_else(|| PathBuf::from("./mathpad_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.tile_size, 384);
        assert_eq!(config.tile_overlap, 64);
        assert_eq!(config.tile_stride(), 320);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue_capacity, 20);
        assert_eq!(config.cache_ttl_secs, 604_800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_tile() {
        let config = PipelineConfig {
            tile_overlap: 384,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_pipeline_table_keeps_defaults() {
        let config: TomlConfig = toml::from_str("[pipeline]\nworker_count = 5\n").unwrap();
        assert_eq!(config.pipeline.worker_count, 5);
        assert_eq!(config.pipeline.tile_size, 384);
        assert_eq!(config.logging.level, "info");
    }
}
