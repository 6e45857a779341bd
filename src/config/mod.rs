//! Configuration module for facelive-rs
//!
//! Runtime tunables for the heap, the cooperative scheduler, stage loops and
//! shutdown. Stored as TOML next to the state database.
//!
//! # App Data Location
//!
//! - **Linux**: `~/.local/share/dev.facelive.facelive-rs/`
//! - **macOS**: `~/Library/Application Support/dev.facelive.facelive-rs/`
//! - **Windows**: `%APPDATA%\dev.facelive.facelive-rs\`
//!
//! # Files
//!
//! - `config.toml` - This configuration
//! - `states.json` - Per-stage persisted state (see [`crate::state`])
//! - `logs/` - Daily rolling log files

use crate::error::{FaceliveError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.facelive.facelive-rs";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default frame heap capacity in megabytes
pub const DEFAULT_HEAP_CAPACITY_MB: usize = 512;

/// Default cooperative pump cadence
pub const DEFAULT_PUMP_INTERVAL_MS: u64 = 5;

/// Default bound on unread envelopes per connection
pub const DEFAULT_BACKPRESSURE_DEPTH: u64 = 1;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure `dir` exists
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| {
            FaceliveError::Config(format!("Failed to create directory {:?}: {}", dir, e))
        })?;
    }
    Ok(())
}

// ==================== Sections ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapSettings {
    pub capacity_mb: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            capacity_mb: DEFAULT_HEAP_CAPACITY_MB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Interval between `process_messages()` pumps
    pub pump_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pump_interval_ms: DEFAULT_PUMP_INTERVAL_MS,
        }
    }
}

/// Timing shared by every stage worker loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Upper bound on a single connection read inside a tick
    pub read_timeout_ms: u64,
    /// Unread envelopes allowed per output before a producer defers. 0 disables gating.
    pub backpressure_depth: u64,
    /// Sleep before retrying a backpressured write
    pub backpressure_retry_ms: u64,
    /// Sleep between loop iterations while a stage is stopped
    pub idle_sleep_ms: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5,
            backpressure_depth: DEFAULT_BACKPRESSURE_DEPTH,
            backpressure_retry_ms: 5,
            idle_sleep_ms: 10,
        }
    }
}

impl StageSettings {
    pub fn timing(&self) -> StageTiming {
        StageTiming {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            backpressure_depth: self.backpressure_depth,
            backpressure_retry: Duration::from_millis(self.backpressure_retry_ms),
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
        }
    }
}

/// [`StageSettings`] as durations, handed to each worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub read_timeout: Duration,
    pub backpressure_depth: u64,
    pub backpressure_retry: Duration,
    pub idle_sleep: Duration,
}

impl Default for StageTiming {
    fn default() -> Self {
        StageSettings::default().timing()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

// ==================== App Config ====================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Overrides the platform data directory
    pub userdata_dir: Option<PathBuf>,
    pub heap: HeapSettings,
    pub scheduler: SchedulerSettings,
    pub stages: StageSettings,
    pub shutdown: ShutdownSettings,
}

impl AppConfig {
    /// Resolved user data directory
    pub fn userdata_dir(&self) -> Result<PathBuf> {
        self.userdata_dir
            .clone()
            .or_else(app_data_dir)
            .ok_or_else(|| {
                FaceliveError::Config("Could not determine app data directory".to_string())
            })
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        Ok(self.userdata_dir()?.join(crate::state::STATE_FILE))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.userdata_dir()?.join("logs"))
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.pump_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.timeout_ms)
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        app_data_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load config from `path`. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| FaceliveError::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| FaceliveError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            tracing::warn!("Could not determine config path, using defaults");
            return Self::default();
        };
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FaceliveError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| FaceliveError::Config(format!("Failed to write config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.heap.capacity_mb, 512);
        assert_eq!(cfg.stages.backpressure_depth, 1);
        assert_eq!(cfg.pump_interval(), Duration::from_millis(5));
        assert_eq!(cfg.stages.timing().read_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[stages]\nbackpressure_depth = 3\n").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.stages.backpressure_depth, 3);
        assert_eq!(cfg.stages.read_timeout_ms, 5);
        assert_eq!(cfg.heap, HeapSettings::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(CONFIG_FILE);
        let mut cfg = AppConfig::default();
        cfg.userdata_dir = Some(dir.path().to_path_buf());
        cfg.heap.capacity_mb = 64;
        cfg.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), cfg);
        assert_eq!(cfg.state_path().unwrap(), dir.path().join("states.json"));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "heap = 3").unwrap();
        assert!(matches!(
            AppConfig::load(&path),
            Err(FaceliveError::Config(_))
        ));
    }
}
