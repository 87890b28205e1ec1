//! Core data types for emucam
//!
//! This module contains the value types shared by every stage of the
//! request processor: pixel formats, stream directions, opaque buffer
//! handles, per-buffer status and the settings snapshot carried by capture
//! requests.
//!
//! # Main Types
//!
//! - [`PixelFormat`] - Buffer formats the emulated sensor can produce
//! - [`StreamDirection`] - Whether a stream feeds the sensor or receives from it
//! - [`BufferHandle`] - Caller-owned opaque reference to a native buffer
//! - [`BufferStatus`] - Completion status delivered per stream buffer
//! - [`Settings`] - Key/value capture settings snapshot
//! - [`RequestTemplate`] - Keys for default request settings
//! - [`TestPattern`] - Image content produced by the simulated sensor

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known settings keys understood by the processor and simulated sensor
pub mod keys {
    /// Frame duration in microseconds
    pub const FRAME_DURATION_US: &str = "sensor.frame_duration_us";
    /// Exposure time in microseconds
    pub const EXPOSURE_TIME_US: &str = "sensor.exposure_time_us";
    /// Analog gain (ISO equivalent)
    pub const SENSITIVITY: &str = "sensor.sensitivity";
    /// Capture intent of the request
    pub const CAPTURE_INTENT: &str = "control.capture_intent";
    /// Test pattern override for the simulated sensor
    pub const TEST_PATTERN: &str = "sensor.test_pattern";
}

/// Pixel formats supported by the emulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar YCbCr 4:2:0, 8 bits per sample
    #[serde(rename = "YCBCR_420_888")]
    Ycbcr420,
    /// Single 8-bit luma plane
    #[serde(rename = "Y8")]
    Y8,
    /// Bayer raw, 16 bits per pixel
    #[serde(rename = "RAW16")]
    Raw16,
    /// Packed 8-bit RGBA
    #[serde(rename = "RGBA_8888")]
    Rgba8888,
    /// Compressed byte stream (JPEG); width carries the byte size
    #[serde(rename = "BLOB")]
    Blob,
    /// Implementation-defined layout, not CPU accessible
    #[serde(rename = "IMPLEMENTATION_DEFINED")]
    Private,
}

impl PixelFormat {
    /// Byte alignment of row strides (and of plane offsets) for this format
    pub fn stride_alignment(self) -> usize {
        match self {
            PixelFormat::Ycbcr420 | PixelFormat::Y8 | PixelFormat::Rgba8888 => 16,
            PixelFormat::Raw16 => 32,
            PixelFormat::Blob => 1,
            PixelFormat::Private => 0,
        }
    }

    /// Bytes per pixel of the first plane, `None` for compressed/opaque formats
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Ycbcr420 | PixelFormat::Y8 => Some(1),
            PixelFormat::Raw16 => Some(2),
            PixelFormat::Rgba8888 => Some(4),
            PixelFormat::Blob | PixelFormat::Private => None,
        }
    }

    /// Whether buffers of this format can be locked for CPU access
    pub fn is_cpu_accessible(self) -> bool {
        !matches!(self, PixelFormat::Private)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Ycbcr420 => "YCBCR_420_888",
            PixelFormat::Y8 => "Y8",
            PixelFormat::Raw16 => "RAW16",
            PixelFormat::Rgba8888 => "RGBA_8888",
            PixelFormat::Blob => "BLOB",
            PixelFormat::Private => "IMPLEMENTATION_DEFINED",
        };
        write!(f, "{}", name)
    }
}

/// Direction of a stream relative to the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    /// Buffers consumed by the sensor (reprocessing input)
    Input,
    /// Buffers filled by the sensor
    Output,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Input => write!(f, "input"),
            StreamDirection::Output => write!(f, "output"),
        }
    }
}

/// Opaque caller-owned reference to a native buffer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({:#x})", self.0)
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}

/// Completion status of one stream buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferStatus {
    /// Buffer filled (or consumed) successfully
    Ok,
    /// Buffer contents are invalid
    Error,
}

impl BufferStatus {
    pub fn is_ok(self) -> bool {
        self == BufferStatus::Ok
    }
}

/// Keys for default request settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

impl fmt::Display for RequestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestTemplate::Preview => "preview",
            RequestTemplate::StillCapture => "still_capture",
            RequestTemplate::VideoRecord => "video_record",
            RequestTemplate::VideoSnapshot => "video_snapshot",
            RequestTemplate::ZeroShutterLag => "zero_shutter_lag",
            RequestTemplate::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

/// A single settings value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

/// Capture settings snapshot
///
/// Keys are dotted names (`sensor.exposure_time_us`); the map is ordered so
/// snapshots compare and print deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, SettingValue>);

impl Settings {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.0.get(key)
    }

    /// Integer value of a key; floats are truncated
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            SettingValue::Int(v) => Some(*v),
            SettingValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            SettingValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Overlay every entry of `other` onto this snapshot
    pub fn merge(&mut self, other: &Settings) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.0.iter()
    }
}

/// Image content produced by the simulated sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPattern {
    /// Uniform mid-grey
    Solid,
    /// Horizontal red ramp, vertical green ramp, blue tracks the frame number
    #[default]
    Gradient,
    /// Eight vertical SMPTE-style bars
    ColorBars,
    /// 32-pixel checkerboard that shifts every frame
    Checkerboard,
}

impl TestPattern {
    /// Parse a pattern name as used in settings snapshots
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "solid" => Some(TestPattern::Solid),
            "gradient" => Some(TestPattern::Gradient),
            "color_bars" => Some(TestPattern::ColorBars),
            "checkerboard" => Some(TestPattern::Checkerboard),
            _ => None,
        }
    }
}
