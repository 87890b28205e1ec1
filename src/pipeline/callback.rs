//! Result delivery from the request worker back to pipeline owners.
//!
//! Every [`PipelineDescriptor`](super::PipelineDescriptor) carries its own
//! [`ResultCallback`]; there is no global registry. The worker invokes it with
//! explicit (pipeline, frame, stream, status) arguments:
//!
//! - success: one `notify_shutter`, then one `process_buffer` per stream buffer
//! - failure: one `notify_request_error`, then one `process_buffer` with
//!   [`BufferStatus::Error`] per stream buffer
//!
//! Callbacks run on the worker thread (or on the thread calling `flush`, or on
//! the submitting thread for buffer acquisition failures) and must not block
//! on the processor itself.

use crate::error::EmuCamError;
use crate::pipeline::id::{FrameNumber, PipelineId, StreamId};
use crate::types::{BufferHandle, BufferStatus};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::time::Duration;

/// Why a whole request was failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Discarded by `flush` before reaching the sensor
    Flushed,
    /// Discarded because the processor is shutting down
    Shutdown,
    /// A buffer could not be imported, locked or handed to the sensor
    BufferError,
    /// The sensor reported a capture failure
    SensorError,
    /// The request settings could not be resolved
    InvalidSettings,
}

impl FailureReason {
    /// Classify an error raised while processing a request
    pub fn from_error(err: &EmuCamError) -> Self {
        match err.root() {
            EmuCamError::Buffer { .. } => FailureReason::BufferError,
            EmuCamError::Sensor { .. } => FailureReason::SensorError,
            EmuCamError::ShutdownInProgress => FailureReason::Shutdown,
            EmuCamError::InvalidArgument(_) => FailureReason::InvalidSettings,
            _ => FailureReason::SensorError,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::Flushed => "flushed",
            FailureReason::Shutdown => "shutdown",
            FailureReason::BufferError => "buffer error",
            FailureReason::SensorError => "sensor error",
            FailureReason::InvalidSettings => "invalid settings",
        };
        write!(f, "{}", text)
    }
}

/// Receiver of capture results for one pipeline
pub trait ResultCallback: Send + Sync {
    /// A stream buffer is done (filled, consumed or failed); it is unlocked
    /// once this returns
    fn process_buffer(
        &self,
        pipeline_id: PipelineId,
        frame: FrameNumber,
        stream_id: StreamId,
        handle: BufferHandle,
        status: BufferStatus,
    );

    /// Start of exposure for a successfully captured frame
    fn notify_shutter(&self, _pipeline_id: PipelineId, _frame: FrameNumber, _timestamp: Duration) {}

    /// The whole request failed; per-buffer errors follow
    fn notify_request_error(
        &self,
        _pipeline_id: PipelineId,
        _frame: FrameNumber,
        _reason: FailureReason,
    ) {
    }
}

impl<F> ResultCallback for F
where
    F: Fn(PipelineId, FrameNumber, StreamId, BufferStatus) + Send + Sync,
{
    fn process_buffer(
        &self,
        pipeline_id: PipelineId,
        frame: FrameNumber,
        stream_id: StreamId,
        _handle: BufferHandle,
        status: BufferStatus,
    ) {
        self(pipeline_id, frame, stream_id, status)
    }
}

/// Notification forwarded by [`ChannelCallback`]
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Shutter {
        pipeline_id: PipelineId,
        frame: FrameNumber,
        timestamp: Duration,
    },
    Buffer {
        pipeline_id: PipelineId,
        frame: FrameNumber,
        stream_id: StreamId,
        handle: BufferHandle,
        status: BufferStatus,
    },
    RequestError {
        pipeline_id: PipelineId,
        frame: FrameNumber,
        reason: FailureReason,
    },
}

impl CaptureEvent {
    pub fn frame(&self) -> FrameNumber {
        match self {
            CaptureEvent::Shutter { frame, .. }
            | CaptureEvent::Buffer { frame, .. }
            | CaptureEvent::RequestError { frame, .. } => *frame,
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        match self {
            CaptureEvent::Shutter { pipeline_id, .. }
            | CaptureEvent::Buffer { pipeline_id, .. }
            | CaptureEvent::RequestError { pipeline_id, .. } => *pipeline_id,
        }
    }
}

/// Callback that forwards every notification over a crossbeam channel
///
/// Sends never block; if the receiving side has been dropped the event is
/// discarded.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    sender: Sender<CaptureEvent>,
}

impl ChannelCallback {
    /// Create a callback and the receiver its events arrive on
    pub fn new() -> (Self, Receiver<CaptureEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    /// Wrap an existing sender
    pub fn from_sender(sender: Sender<CaptureEvent>) -> Self {
        Self { sender }
    }
}

impl ResultCallback for ChannelCallback {
    fn process_buffer(
        &self,
        pipeline_id: PipelineId,
        frame: FrameNumber,
        stream_id: StreamId,
        handle: BufferHandle,
        status: BufferStatus,
    ) {
        let _ = self.sender.send(CaptureEvent::Buffer {
            pipeline_id,
            frame,
            stream_id,
            handle,
            status,
        });
    }

    fn notify_shutter(&self, pipeline_id: PipelineId, frame: FrameNumber, timestamp: Duration) {
        let _ = self.sender.send(CaptureEvent::Shutter {
            pipeline_id,
            frame,
            timestamp,
        });
    }

    fn notify_request_error(&self, pipeline_id: PipelineId, frame: FrameNumber, reason: FailureReason) {
        let _ = self.sender.send(CaptureEvent::RequestError {
            pipeline_id,
            frame,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_channel_callback_forwards_events() {
        let (callback, rx) = ChannelCallback::new();
        callback.notify_shutter(PipelineId(0), FrameNumber(1), Duration::from_millis(5));
        callback.process_buffer(
            PipelineId(0),
            FrameNumber(1),
            StreamId(2),
            BufferHandle(9),
            BufferStatus::Ok,
        );
        callback.notify_request_error(PipelineId(0), FrameNumber(2), FailureReason::Flushed);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], CaptureEvent::Shutter { .. }));
        assert_eq!(
            events[1],
            CaptureEvent::Buffer {
                pipeline_id: PipelineId(0),
                frame: FrameNumber(1),
                stream_id: StreamId(2),
                handle: BufferHandle(9),
                status: BufferStatus::Ok,
            }
        );
        assert_eq!(events[2].frame(), FrameNumber(2));
    }

    #[test]
    fn test_channel_callback_survives_dropped_receiver() {
        let (callback, rx) = ChannelCallback::new();
        drop(rx);
        callback.notify_request_error(PipelineId(1), FrameNumber(0), FailureReason::Shutdown);
    }

    #[test]
    fn test_closure_callback() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let callback = move |_: PipelineId, _: FrameNumber, _: StreamId, status: BufferStatus| {
            if !status.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        };

        callback.process_buffer(
            PipelineId(0),
            FrameNumber(0),
            StreamId(0),
            BufferHandle(1),
            BufferStatus::Error,
        );
        // Defaulted notifications are no-ops for closures
        callback.notify_request_error(PipelineId(0), FrameNumber(0), FailureReason::SensorError);

        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_reason_from_error() {
        let err = EmuCamError::buffer(BufferHandle(1), "bad").with_context("acquire");
        assert_eq!(FailureReason::from_error(&err), FailureReason::BufferError);
        let err = EmuCamError::sensor(FrameNumber(1), "bad");
        assert_eq!(FailureReason::from_error(&err), FailureReason::SensorError);
    }
}
