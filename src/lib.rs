//! # EmuCam: Emulated Camera Request Processing
//!
//! The request-processing core of an emulated camera device. Callers submit
//! capture requests against one or more pipelines; a single worker thread
//! runs them in order against a simulated sensor and reports every buffer
//! back through the pipeline's result callback.
//!
//! ## Architecture
//!
//! - **Pipelines**: stream registries, capture requests and result callbacks
//! - **Backend**: the request processor, its worker thread, buffer locking
//!   and the simulated sensor
//! - **Capabilities**: the static table of stream configurations and
//!   request templates the device advertises
//! - **Communication**: results flow through [`ResultCallback`]s; the
//!   bundled [`ChannelCallback`] forwards them over crossbeam channels
//!
//! ## Configuration
//!
//! Processor settings are read from `emucam.toml` in the platform data
//! directory under `dev.hxyulin.emucam`:
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.emucam/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.emucam/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.emucam\`
//!
//! ## Example
//!
//! ```ignore
//! use emucam::{
//!     BufferHandle, CaptureRequest, ChannelCallback, FrameNumber, PipelineDescriptor,
//!     PipelineId, PixelFormat, ProcessorConfig, RequestProcessor, RequestTemplate,
//!     StreamDescriptor, StreamId,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> emucam::Result<()> {
//!     let (mut processor, _mapper) = RequestProcessor::with_simulated_sensor(ProcessorConfig::default())?;
//!     processor.initialize(emucam::capabilities::DEFAULT_CAPABILITIES_JSON)?;
//!
//!     let (callback, events) = ChannelCallback::new();
//!     let pipeline = PipelineDescriptor::new(
//!         PipelineId(0),
//!         0,
//!         vec![StreamDescriptor::output(StreamId(0), 640, 480, PixelFormat::Ycbcr420)],
//!         Arc::new(callback),
//!     )?;
//!
//!     let request = CaptureRequest::new(PipelineId(0))
//!         .with_settings(processor.get_default_request(RequestTemplate::Preview)?)
//!         .with_output(StreamId(0), BufferHandle(1));
//!     processor.process_pipeline_requests(FrameNumber(0), &[request], &[pipeline])?;
//!
//!     for event in events.iter().take(2) {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use backend::{align_to, ProcessorStats, RequestProcessor, SensorCapture, SimulatedSensor};
pub use capabilities::StaticCapabilities;
pub use config::ProcessorConfig;
pub use error::{EmuCamError, Result};
pub use pipeline::{
    CaptureEvent, CaptureRequest, ChannelCallback, FailureReason, FrameNumber,
    PipelineDescriptor, PipelineId, ResultCallback, StreamDescriptor, StreamId,
};
pub use types::{BufferHandle, BufferStatus, PixelFormat, RequestTemplate, Settings};
