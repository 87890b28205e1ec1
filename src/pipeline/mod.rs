//! Pipelines: stream registries, capture requests and result callbacks.
//!
//! A pipeline is one capture configuration (a logical camera or one of its
//! physical sub-cameras). Callers register it once as a
//! [`PipelineDescriptor`] and then reference it from [`CaptureRequest`]s.
//!
//! # Design
//!
//! - **Per-pipeline callbacks**: each descriptor owns its [`ResultCallback`];
//!   notifications carry explicit pipeline/frame/stream arguments.
//! - **Immutable registries**: stream maps never change after registration,
//!   so validation needs no locking.

pub mod callback;
pub mod id;
pub mod registry;
pub mod request;

pub use callback::{CaptureEvent, ChannelCallback, FailureReason, ResultCallback};
pub use id::{FrameNumber, PipelineId, StreamId};
pub use registry::{PipelineDescriptor, ResolvedBuffer, ResolvedRequest, StreamDescriptor};
pub use request::{CaptureRequest, StreamBuffer};
