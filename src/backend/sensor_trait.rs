//! SensorCapture trait and the buffer descriptors handed to it
//!
//! The worker owns exactly one [`SensorCapture`] and calls it serially, one
//! request at a time. The implementation fills every output
//! [`SensorBuffer`], consumes the input (if any), and reports per-buffer
//! completion through [`SensorBuffer::complete`]. A buffer the sensor never
//! completes is delivered as [`BufferStatus::Error`].

use crate::backend::buffers::{BufferLayout, LockedBuffer};
use crate::error::Result;
use crate::pipeline::id::{FrameNumber, PipelineId, StreamId};
use crate::types::{BufferHandle, BufferStatus, PixelFormat, Settings};
use std::time::Duration;

/// One stream buffer of one request, locked and ready for the sensor
#[derive(Debug)]
pub struct SensorBuffer {
    frame: FrameNumber,
    pipeline_id: PipelineId,
    physical_camera_id: u32,
    buffer: LockedBuffer,
    status: Option<BufferStatus>,
}

impl SensorBuffer {
    pub(crate) fn new(
        frame: FrameNumber,
        pipeline_id: PipelineId,
        physical_camera_id: u32,
        buffer: LockedBuffer,
    ) -> Self {
        Self {
            frame,
            pipeline_id,
            physical_camera_id,
            buffer,
            status: None,
        }
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn physical_camera_id(&self) -> u32 {
        self.physical_camera_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.buffer.stream().id
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.layout().format
    }

    pub fn width(&self) -> u32 {
        self.buffer.layout().width
    }

    pub fn height(&self) -> u32 {
        self.buffer.layout().height
    }

    pub fn stride(&self) -> usize {
        self.buffer.stride()
    }

    pub fn layout(&self) -> &BufferLayout {
        self.buffer.layout()
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.data_mut()
    }

    /// Report this buffer's completion status
    ///
    /// The last report wins.
    pub fn complete(&mut self, status: BufferStatus) {
        self.status = Some(status);
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_some()
    }

    /// Status to deliver; uncompleted buffers count as errors
    pub fn status(&self) -> BufferStatus {
        self.status.unwrap_or(BufferStatus::Error)
    }

    pub(crate) fn into_locked(self) -> LockedBuffer {
        self.buffer
    }
}

/// What the sensor reports for a successful capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// Start of exposure, relative to the sensor's epoch
    pub timestamp: Duration,
}

/// The simulated sensor as seen by the request worker
///
/// Implementations must be `Send` to move onto the worker thread. A
/// returned error fails the whole request; it never stops the worker.
#[cfg_attr(test, mockall::automock)]
pub trait SensorCapture: Send {
    /// Capture one frame into `outputs`, reading `inputs` for reprocessing
    ///
    /// May block for the simulated exposure time.
    fn capture(
        &mut self,
        frame: FrameNumber,
        settings: &Settings,
        inputs: &mut [SensorBuffer],
        outputs: &mut [SensorBuffer],
    ) -> Result<CaptureOutcome>;
}
