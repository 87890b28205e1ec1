//! Static capability table
//!
//! The table is parsed once from a JSON blob at `initialize` time, validated
//! as a whole, and never mutated afterwards. A malformed blob produces a
//! single [`EmuCamError::Config`] and no partially built table.
//!
//! # Blob format
//!
//! ```json
//! {
//!   "stream_configurations": [
//!     { "format": "YCBCR_420_888", "width": 640, "height": 480,
//!       "min_frame_duration_ns": 33333333, "stall_duration_ns": 0 }
//!   ],
//!   "supports_reprocessing": true,
//!   "input_formats": { "YCBCR_420_888": ["YCBCR_420_888", "BLOB"] },
//!   "templates": { "preview": { "sensor.frame_duration_us": 33333 } }
//! }
//! ```

use crate::error::{EmuCamError, Result};
use crate::pipeline::registry::StreamDescriptor;
use crate::types::{PixelFormat, RequestTemplate, Settings, StreamDirection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

/// Default blob describing the emulated sensor
pub const DEFAULT_CAPABILITIES_JSON: &str = include_str!("../assets/default_capabilities.json");

/// Output resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Timing limits of one (format, size) configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDurations {
    pub min_frame_duration: Duration,
    pub stall_duration: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CapabilityBlob {
    stream_configurations: Vec<StreamConfigurationEntry>,
    #[serde(default)]
    supports_reprocessing: bool,
    #[serde(default)]
    input_formats: BTreeMap<PixelFormat, Vec<PixelFormat>>,
    #[serde(default)]
    templates: BTreeMap<RequestTemplate, Settings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StreamConfigurationEntry {
    format: PixelFormat,
    width: u32,
    height: u32,
    min_frame_duration_ns: Option<u64>,
    #[serde(default)]
    stall_duration_ns: u64,
}

/// Read-only capability table of the emulated device
#[derive(Debug, Clone)]
pub struct StaticCapabilities {
    output_sizes: BTreeMap<PixelFormat, Vec<Size>>,
    durations: HashMap<(PixelFormat, Size), StreamDurations>,
    supports_reprocessing: bool,
    input_formats: BTreeMap<PixelFormat, Vec<PixelFormat>>,
    templates: BTreeMap<RequestTemplate, Settings>,
}

impl StaticCapabilities {
    /// Parse and validate a capability blob
    pub fn from_json(json: &str) -> Result<Self> {
        let blob: CapabilityBlob = serde_json::from_str(json)
            .map_err(|e| EmuCamError::Config(format!("Failed to parse capability blob: {}", e)))?;
        Self::from_blob(blob)
    }

    /// The embedded default table
    pub fn default_table() -> Result<Self> {
        Self::from_json(DEFAULT_CAPABILITIES_JSON)
    }

    fn from_blob(blob: CapabilityBlob) -> Result<Self> {
        if blob.stream_configurations.is_empty() {
            return Err(EmuCamError::Config(
                "capability blob declares no output stream configurations".to_string(),
            ));
        }

        let mut output_sizes: BTreeMap<PixelFormat, Vec<Size>> = BTreeMap::new();
        let mut durations = HashMap::new();

        for entry in &blob.stream_configurations {
            let size = Size::new(entry.width, entry.height);
            if size.width == 0 || size.height == 0 {
                return Err(EmuCamError::Config(format!(
                    "{} configuration has zero dimensions {}",
                    entry.format, size
                )));
            }
            if !entry.format.is_cpu_accessible() {
                return Err(EmuCamError::Config(format!(
                    "{} cannot be listed as a CPU-visible output",
                    entry.format
                )));
            }
            let min_frame_duration_ns = entry.min_frame_duration_ns.ok_or_else(|| {
                EmuCamError::Config(format!(
                    "{} {} is missing its minimum frame duration",
                    entry.format, size
                ))
            })?;

            let sizes = output_sizes.entry(entry.format).or_default();
            if sizes.contains(&size) {
                return Err(EmuCamError::Config(format!(
                    "{} {} declared twice",
                    entry.format, size
                )));
            }
            sizes.push(size);

            durations.insert(
                (entry.format, size),
                StreamDurations {
                    min_frame_duration: Duration::from_nanos(min_frame_duration_ns),
                    stall_duration: Duration::from_nanos(entry.stall_duration_ns),
                },
            );
        }

        for sizes in output_sizes.values_mut() {
            // Largest first, like a device would advertise them
            sizes.sort_by(|a, b| b.cmp(a));
        }

        if !blob.supports_reprocessing && !blob.input_formats.is_empty() {
            return Err(EmuCamError::Config(
                "input formats declared but reprocessing is not supported".to_string(),
            ));
        }
        for (input, outputs) in &blob.input_formats {
            if outputs.is_empty() {
                return Err(EmuCamError::Config(format!(
                    "input format {} has no valid output formats",
                    input
                )));
            }
            if let Some(undeclared) = outputs.iter().find(|f| !output_sizes.contains_key(f)) {
                return Err(EmuCamError::Config(format!(
                    "input format {} maps to undeclared output format {}",
                    input, undeclared
                )));
            }
        }
        if blob.supports_reprocessing && blob.input_formats.is_empty() {
            return Err(EmuCamError::Config(
                "reprocessing is supported but no input formats are declared".to_string(),
            ));
        }

        tracing::debug!(
            "Capability table: {} output formats, {} configurations, reprocessing={}",
            output_sizes.len(),
            durations.len(),
            blob.supports_reprocessing
        );

        Ok(Self {
            output_sizes,
            durations,
            supports_reprocessing: blob.supports_reprocessing,
            input_formats: blob.input_formats,
            templates: blob.templates,
        })
    }

    pub fn output_formats(&self) -> impl Iterator<Item = PixelFormat> + '_ {
        self.output_sizes.keys().copied()
    }

    /// Sizes advertised for a format, largest first
    pub fn output_sizes(&self, format: PixelFormat) -> &[Size] {
        self.output_sizes
            .get(&format)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn min_frame_duration(&self, format: PixelFormat, size: Size) -> Option<Duration> {
        self.durations
            .get(&(format, size))
            .map(|d| d.min_frame_duration)
    }

    pub fn stall_duration(&self, format: PixelFormat, size: Size) -> Option<Duration> {
        self.durations.get(&(format, size)).map(|d| d.stall_duration)
    }

    pub fn supports_reprocessing(&self) -> bool {
        self.supports_reprocessing
    }

    pub fn input_formats(&self) -> impl Iterator<Item = PixelFormat> + '_ {
        self.input_formats.keys().copied()
    }

    pub fn is_input_format(&self, format: PixelFormat) -> bool {
        self.input_formats.contains_key(&format)
    }

    /// Output formats a buffer of `input` format may be reprocessed into
    pub fn valid_output_formats_for_input(&self, input: PixelFormat) -> &[PixelFormat] {
        self.input_formats
            .get(&input)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Templates the table provides defaults for
    pub fn templates(&self) -> BTreeSet<RequestTemplate> {
        self.templates.keys().copied().collect()
    }

    /// Default settings for a request template
    pub fn default_request(&self, template: RequestTemplate) -> Result<Settings> {
        self.templates
            .get(&template)
            .cloned()
            .ok_or_else(|| EmuCamError::NotFound(format!("no default request for template {}", template)))
    }

    /// Longest minimum frame duration over a set of output streams
    ///
    /// Streams whose configuration is not in the table do not constrain the
    /// result; input streams are ignored.
    pub fn min_frame_duration_for<'a>(
        &self,
        streams: impl IntoIterator<Item = &'a StreamDescriptor>,
    ) -> Duration {
        streams
            .into_iter()
            .filter(|s| s.direction == StreamDirection::Output)
            .filter_map(|s| self.min_frame_duration(s.format, Size::new(s.width, s.height)))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
