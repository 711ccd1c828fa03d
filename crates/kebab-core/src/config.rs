//! Application configuration management.
//!
//! Handles loading, saving, and validating settings: the download root,
//! the default download type, and worker pool tuning.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layout::DownloadType;
use crate::pool::{DEFAULT_WORKER_COUNT, MAX_WORKER_COUNT, MIN_WORKER_COUNT};
use crate::transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROGRESS_INTERVAL, DEFAULT_STALL_TIMEOUT,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, TransferOptions,
};

const fn default_true() -> bool {
    true
}

const fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

const fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL.as_millis() as u64
}

#[allow(clippy::unnecessary_wraps)]
const fn default_stall_timeout_secs() -> Option<u64> {
    Some(DEFAULT_STALL_TIMEOUT.as_secs())
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

/// Worker pool and transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrent workers (1-8).
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Write buffer size in bytes (4 KiB - 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Minimum spacing between progress reports, in milliseconds.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Fail a transfer after this many seconds without data. `None` disables.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: Option<u64>,
    /// Keep partial files on failure and resume them on retry.
    #[serde(default = "default_true")]
    pub resume_partial: bool,
    /// Seconds to wait for response headers.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            resume_partial: true,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl PoolConfig {
    /// Worker count clamped to the supported range.
    #[must_use]
    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.clamp(MIN_WORKER_COUNT, MAX_WORKER_COUNT)
    }

    /// Transfer options derived from this configuration.
    ///
    /// Out-of-range values are clamped.
    #[must_use]
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            stall_timeout: self
                .stall_timeout_secs
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            resume_partial: self.resume_partial,
        }
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate settings without clamping.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WORKER_COUNT..=MAX_WORKER_COUNT).contains(&self.worker_count) {
            return Err(Error::Configuration(format!(
                "worker_count must be between {MIN_WORKER_COUNT} and {MAX_WORKER_COUNT}"
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Configuration(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        TransferOptions {
            chunk_size: self.chunk_size,
            stall_timeout: self.stall_timeout_secs.map(Duration::from_secs),
            ..self.transfer_options()
        }
        .validate()
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Root directory that receives `Audio/`, `Video/` and `Playlist/`.
    pub download_root: PathBuf,
    /// Download type used when none is given.
    #[serde(default)]
    pub default_download_type: DownloadType,
    /// Worker pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            default_download_type: DownloadType::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, or create defaults if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, writing defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {}, using defaults", path.display());
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| Error::FileSystem {
            path: path.to_path_buf(),
            message: format!("Failed to read config file: {e}"),
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        info!("Loaded config from {}", path.display());
        debug!("Download root: {}", config.download_root.display());

        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to `path` as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| Error::FileSystem {
                path: parent.to_path_buf(),
                message: format!("Failed to create config directory: {e}"),
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| Error::FileSystem {
            path: path.to_path_buf(),
            message: format!("Failed to write config file: {e}"),
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Update the download root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or isn't writable.
    pub fn set_download_root(&mut self, path: PathBuf) -> Result<()> {
        validate_storage_directory(&path)?;

        self.download_root = path;
        info!("Updated download root to: {}", self.download_root.display());
        Ok(())
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Default download root: `<downloads>/Kebab`.
#[must_use]
pub fn default_download_root() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Kebab")
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("kebab")
        .join("config.json")
}

/// Validate that a directory is suitable as a download root.
///
/// The directory is created if missing.
pub fn validate_storage_directory(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Configuration(
            "Download root must be an absolute path".to_string(),
        ));
    }

    if path.exists() {
        if !path.is_dir() {
            return Err(Error::Configuration(format!(
                "Path exists but is not a directory: {}",
                path.display()
            )));
        }

        let marker = path.join(".kebab_write_test");
        match fs::write(&marker, "test") {
            Ok(()) => {
                let _ = fs::remove_file(&marker);
            }
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "Directory is not writable: {} ({})",
                    path.display(),
                    e
                )));
            }
        }
    } else {
        fs::create_dir_all(path).map_err(|e| {
            Error::Configuration(format!("Cannot create directory {}: {}", path.display(), e))
        })?;
    }

    Ok(())
}

/// Holds the active configuration and where it is persisted.
#[derive(Debug)]
pub struct ConfigManager {
    config: AppConfig,
    path: PathBuf,
}

impl ConfigManager {
    /// Create a config manager, loading config from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded.
    pub fn new() -> Result<Self> {
        Self::with_path(config_file_path())
    }

    /// Create a config manager backed by a specific file.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let config = AppConfig::load_from(&path)?;
        Ok(Self { config, path })
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace and persist the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the config cannot be saved.
    pub fn update(&mut self, config: AppConfig) -> Result<()> {
        validate_storage_directory(&config.download_root)?;
        config.pool.validate()?;

        self.config = config;
        self.config.save_to(&self.path)
    }

    /// Reset to default configuration.
    pub fn reset(&mut self) -> Result<()> {
        self.config = AppConfig::default();
        self.config.save_to(&self.path)
    }
}
