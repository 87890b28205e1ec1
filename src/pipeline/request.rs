//! Capture requests as submitted by callers.

use crate::pipeline::id::{PipelineId, StreamId};
use crate::types::{BufferHandle, Settings};

/// One buffer reference within a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBuffer {
    pub stream_id: StreamId,
    pub handle: BufferHandle,
}

impl StreamBuffer {
    pub fn new(stream_id: StreamId, handle: BufferHandle) -> Self {
        Self { stream_id, handle }
    }
}

/// A request for the sensor to fill output buffers (and optionally consume
/// an input buffer) for one frame on one pipeline.
///
/// The frame number is supplied per `process_pipeline_requests` call and
/// shared by every request in that batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaptureRequest {
    /// Pipeline whose streams the buffers belong to
    pub pipeline_id: PipelineId,
    /// Settings for this frame; `None` repeats the last resolved settings
    pub settings: Option<Settings>,
    /// Reprocessing input buffers
    pub input_buffers: Vec<StreamBuffer>,
    /// Buffers the sensor fills
    pub output_buffers: Vec<StreamBuffer>,
}

impl CaptureRequest {
    /// Create an empty request for a pipeline
    pub fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            ..Default::default()
        }
    }

    /// Attach a settings snapshot
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Add an output buffer
    pub fn with_output(mut self, stream_id: StreamId, handle: BufferHandle) -> Self {
        self.output_buffers.push(StreamBuffer::new(stream_id, handle));
        self
    }

    /// Add an input buffer
    pub fn with_input(mut self, stream_id: StreamId, handle: BufferHandle) -> Self {
        self.input_buffers.push(StreamBuffer::new(stream_id, handle));
        self
    }

    /// Total number of buffers referenced
    pub fn buffer_count(&self) -> usize {
        self.input_buffers.len() + self.output_buffers.len()
    }

    pub fn is_reprocess(&self) -> bool {
        !self.input_buffers.is_empty()
    }
}
