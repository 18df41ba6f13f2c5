//! # rvault-config
//!
//! Configuration management for reelvault.
//!
//! Loads configuration from:
//! 1. `~/.reelvault/config.toml` (global)
//! 2. `.reelvault/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recorder: RecorderConfig,
    pub cache: CacheConfig,
    pub recording: RecordingConfig,
    pub chunking: ChunkingConfig,
    pub export: ExportConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.reelvault/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.reelvault/config.toml) - overrides global
        let project_path = Path::new(".reelvault/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            config = toml::from_str(&contents)?;
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.reelvault/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".reelvault/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("RVAULT_RECORDER") {
            self.recorder.name = name;
        }
        if let Ok(dir) = std::env::var("RVAULT_CACHE_DIR") {
            self.cache.directory = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("RVAULT_STORE_FILE") {
            self.cache.store_file = PathBuf::from(path);
        }
        if let Ok(margin) = std::env::var("RVAULT_DISK_MARGIN_BYTES") {
            if let Ok(n) = margin.parse() {
                self.cache.disk_margin_bytes = n;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Identity of this recorder process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Name under which cache and session rows are keyed
    pub name: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { name: "ingest1".to_string() }
    }
}

/// Disk cache layout and safety margin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Full-quality cache directory
    pub directory: PathBuf,
    /// Browse-copy directory (survives loss of the full-quality file)
    pub browse_directory: PathBuf,
    /// PSE-report directory
    pub pse_directory: PathBuf,
    /// JSON persistence store
    pub store_file: PathBuf,
    /// Free-space floor; recording stops and chunking truncates below this
    pub disk_margin_bytes: u64,
    /// Advisory lock file held by an in-progress tape transfer
    pub transfer_lock_file: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/video/cache"),
            browse_directory: PathBuf::from("/video/browse"),
            pse_directory: PathBuf::from("/video/pse"),
            store_file: PathBuf::from("/video/store.json"),
            disk_margin_bytes: 50 * 1024 * 1024 * 1024,
            transfer_lock_file: PathBuf::from("/video/transfer.lock"),
        }
    }
}

/// Recording session timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Control loop tick
    pub tick_ms: u64,
    /// Free-space poll period while recording
    pub disk_poll_ms: u64,
    /// Bound on each VTR state-change wait
    pub vtr_timeout_ms: u64,
    /// SDI signal stabilization wait after the VTR starts playing
    pub signal_settle_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { tick_ms: 10, disk_poll_ms: 1000, vtr_timeout_ms: 5000, signal_settle_ms: 500 }
    }
}

/// Chunking worker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Sleep applied every 25 frames while a tape transfer holds the lock
    pub throttle_sleep_ms: u64,
    /// Frames per capture page file
    pub page_frames: i64,
    /// Frames per content package (disk-space check interval divisor)
    pub frames_per_package: i64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { throttle_sleep_ms: 100, page_frames: 15_000, frames_per_package: 1 }
    }
}

/// Tape-export batch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Control loop tick
    pub tick_ms: u64,
    /// A batch is only worth a tape beyond this size
    pub min_batch_bytes: u64,
    /// Tape capacity cap
    pub max_batch_bytes: u64,
    /// Cap on files per tape
    pub max_files: usize,
    /// Debug override: keep cache files after a completed transfer
    pub keep_files: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            min_batch_bytes: 10 * 1024 * 1024 * 1024,
            max_batch_bytes: 390 * 1024 * 1024 * 1024,
            max_files: 99,
            keep_files: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.recorder.name.is_empty());
        assert!(config.cache.disk_margin_bytes > 0);
        assert!(config.export.min_batch_bytes < config.export.max_batch_bytes);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[export]"));
        assert!(toml_str.contains("disk_margin_bytes"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.export.max_files, parsed.export.max_files);
        assert_eq!(config.cache.directory, parsed.cache.directory);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str("[recorder]\nname = \"ingest7\"\n").unwrap();
        assert_eq!(parsed.recorder.name, "ingest7");
        assert_eq!(parsed.recording.tick_ms, RecordingConfig::default().tick_ms);
    }
}
