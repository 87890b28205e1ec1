//! Error handling for the emulated request processor
//!
//! This module defines the crate error type and a Result alias for use
//! throughout the processor. Failures that belong to a single capture
//! request never surface here synchronously; they are reported through the
//! pipeline callback instead (see [`crate::pipeline::FailureReason`]).

use crate::pipeline::id::FrameNumber;
use crate::types::BufferHandle;
use thiserror::Error;

/// Main error type for emucam operations
#[derive(Error, Debug)]
pub enum EmuCamError {
    /// Malformed capability data or processor configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown stream, direction mismatch or otherwise malformed request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Buffer import, lock or layout failure
    #[error("Buffer error on {handle}: {message}")]
    Buffer {
        handle: BufferHandle,
        message: String,
    },

    /// Capture-time failure reported by the sensor
    #[error("Sensor error on frame {frame}: {message}")]
    Sensor { frame: FrameNumber, message: String },

    /// Submission while a flush or shutdown is in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Lookup of something the capability table does not provide
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation needs capabilities but `initialize` has not run
    #[error("Processor not initialized")]
    NotInitialized,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EmuCamError>,
    },
}

impl EmuCamError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EmuCamError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a buffer error for a handle
    pub fn buffer(handle: BufferHandle, message: impl Into<String>) -> Self {
        EmuCamError::Buffer {
            handle,
            message: message.into(),
        }
    }

    /// Create a sensor error for a frame
    pub fn sensor(frame: FrameNumber, message: impl Into<String>) -> Self {
        EmuCamError::Sensor {
            frame,
            message: message.into(),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &EmuCamError {
        match self {
            EmuCamError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for emucam operations
pub type Result<T> = std::result::Result<T, EmuCamError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
