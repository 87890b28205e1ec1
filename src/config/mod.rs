//! Configuration module for emucam
//!
//! [`ProcessorConfig`] controls the request worker, the simulated sensor and
//! buffer allocation. It is stored as TOML; every field has a default so a
//! partial file (or no file at all) is valid.
//!
//! # Config Location
//!
//! The default config file lives in the platform data directory:
//! - **Linux**: `~/.local/share/dev.hxyulin.emucam/emucam.toml`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.emucam/emucam.toml`
//! - **Windows**: `%APPDATA%\dev.hxyulin.emucam\emucam.toml`
//!
//! # Example
//!
//! ```toml
//! [worker]
//! thread_name = "emucam-worker"
//! max_pending_requests = 8
//!
//! [sensor]
//! test_pattern = "color_bars"
//! simulate_exposure = false
//! fail_frames = [3]
//!
//! [buffers]
//! base_alignment = 64
//! ```

use crate::backend::buffers::DEFAULT_BASE_ALIGNMENT;
use crate::error::{EmuCamError, Result, ResultExt};
use crate::types::TestPattern;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.emucam";

/// Config filename
pub const CONFIG_FILE: &str = "emucam.toml";

/// Default frame duration when a request does not set one (30 fps)
pub const DEFAULT_FRAME_DURATION_US: u64 = 33_333;

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Complete processor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub buffers: BufferConfig,
}

/// Request worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name of the worker thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,

    /// Most requests that may wait in the queue (0 = unbounded)
    #[serde(default)]
    pub max_pending_requests: usize,
}

fn default_thread_name() -> String {
    "emucam-worker".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            max_pending_requests: 0,
        }
    }
}

/// Simulated sensor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Image content written into output buffers
    #[serde(default)]
    pub test_pattern: TestPattern,

    /// Sleep for the frame duration of every capture
    #[serde(default = "default_true")]
    pub simulate_exposure: bool,

    /// Frame duration used when settings do not specify one
    #[serde(default = "default_frame_duration_us")]
    pub default_frame_duration_us: u64,

    /// Frame numbers the sensor reports as failed
    #[serde(default)]
    pub fail_frames: Vec<u32>,
}

fn default_true() -> bool {
    true
}

fn default_frame_duration_us() -> u64 {
    DEFAULT_FRAME_DURATION_US
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            test_pattern: TestPattern::default(),
            simulate_exposure: true,
            default_frame_duration_us: DEFAULT_FRAME_DURATION_US,
            fail_frames: Vec::new(),
        }
    }
}

impl SensorConfig {
    pub fn default_frame_duration(&self) -> Duration {
        Duration::from_micros(self.default_frame_duration_us)
    }
}

/// Native buffer allocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Byte alignment of allocated buffer memory (power of two)
    #[serde(default = "default_base_alignment")]
    pub base_alignment: usize,
}

fn default_base_alignment() -> usize {
    DEFAULT_BASE_ALIGNMENT
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            base_alignment: DEFAULT_BASE_ALIGNMENT,
        }
    }
}

impl ProcessorConfig {
    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EmuCamError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            EmuCamError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| EmuCamError::Serialization(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(EmuCamError::from)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content).map_err(|e| {
            EmuCamError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.worker.thread_name.trim().is_empty() {
            return Err(EmuCamError::Config("worker thread name is empty".to_string()));
        }
        if self.worker.thread_name.contains('\0') {
            return Err(EmuCamError::Config(
                "worker thread name contains a NUL byte".to_string(),
            ));
        }
        if !self.buffers.base_alignment.is_power_of_two() {
            return Err(EmuCamError::Config(format!(
                "buffer alignment {} is not a power of two",
                self.buffers.base_alignment
            )));
        }
        if self.sensor.default_frame_duration_us == 0 {
            return Err(EmuCamError::Config(
                "default frame duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
