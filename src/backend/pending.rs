//! Queued requests and their two exits
//!
//! A [`PendingRequest`] is created at submission and owns its locked
//! buffers. It leaves the system exactly once, through one of two methods
//! that both consume it:
//!
//! - [`PendingRequest::into_capture_job`] hands the buffers to the sensor;
//!   the resulting [`CaptureJob`] is then either delivered or failed.
//! - [`PendingRequest::notify_failed`] reports a request error followed by an
//!   error status for every buffer, then releases the buffers.
//!
//! Buffers are released by dropping their [`LockedBuffer`] guards, after the
//! callback for that buffer has run.

use crate::backend::buffers::{BufferAcquirer, LockedBuffer};
use crate::backend::sensor_trait::{CaptureOutcome, SensorBuffer};
use crate::error::{EmuCamError, Result};
use crate::pipeline::callback::{FailureReason, ResultCallback};
use crate::pipeline::id::{FrameNumber, PipelineId, StreamId};
use crate::pipeline::registry::{PipelineDescriptor, ResolvedBuffer, ResolvedRequest};
use crate::types::{BufferHandle, BufferStatus, Settings};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Who a request's notifications go to
#[derive(Clone)]
pub struct RequestHeader {
    pub frame: FrameNumber,
    pub pipeline_id: PipelineId,
    pub physical_camera_id: u32,
    pub callback: Arc<dyn ResultCallback>,
}

impl RequestHeader {
    pub fn new(frame: FrameNumber, pipeline: &PipelineDescriptor) -> Self {
        Self {
            frame,
            pipeline_id: pipeline.id(),
            physical_camera_id: pipeline.physical_camera_id(),
            callback: pipeline.callback().clone(),
        }
    }

    fn fail_buffer(&self, stream_id: StreamId, handle: BufferHandle) {
        self.callback
            .process_buffer(self.pipeline_id, self.frame, stream_id, handle, BufferStatus::Error);
    }
}

impl fmt::Debug for RequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHeader")
            .field("frame", &self.frame)
            .field("pipeline_id", &self.pipeline_id)
            .field("physical_camera_id", &self.physical_camera_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RequestBuffer {
    stream_id: StreamId,
    handle: BufferHandle,
    locked: Option<LockedBuffer>,
}

impl RequestBuffer {
    fn unacquired(resolved: &ResolvedBuffer) -> Self {
        Self {
            stream_id: resolved.stream.id,
            handle: resolved.handle,
            locked: None,
        }
    }
}

/// One accepted request waiting for the sensor
#[derive(Debug)]
pub struct PendingRequest {
    header: RequestHeader,
    settings: Option<Settings>,
    min_frame_duration: Duration,
    inputs: Vec<RequestBuffer>,
    outputs: Vec<RequestBuffer>,
}

impl PendingRequest {
    /// A request with no buffers locked yet
    pub fn new(
        header: RequestHeader,
        settings: Option<Settings>,
        resolved: &ResolvedRequest,
        min_frame_duration: Duration,
    ) -> Self {
        Self {
            header,
            settings,
            min_frame_duration,
            inputs: resolved.inputs.iter().map(RequestBuffer::unacquired).collect(),
            outputs: resolved.outputs.iter().map(RequestBuffer::unacquired).collect(),
        }
    }

    /// Lock every buffer of the request, or none
    pub fn acquire(&mut self, acquirer: &BufferAcquirer, resolved: &ResolvedRequest) -> Result<()> {
        let inputs = acquirer.acquire_buffers(&resolved.inputs)?;
        // Dropping `inputs` on error releases them too
        let outputs = acquirer.acquire_buffers(&resolved.outputs)?;

        for (slot, locked) in self.inputs.iter_mut().zip(inputs) {
            slot.locked = Some(locked);
        }
        for (slot, locked) in self.outputs.iter_mut().zip(outputs) {
            slot.locked = Some(locked);
        }
        Ok(())
    }

    pub fn frame(&self) -> FrameNumber {
        self.header.frame
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.header.pipeline_id
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    pub fn min_frame_duration(&self) -> Duration {
        self.min_frame_duration
    }

    pub fn buffer_count(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    /// Whether every buffer is locked
    pub fn is_acquired(&self) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .all(|b| b.locked.is_some())
    }

    /// Fail the whole request
    ///
    /// Sends one request error, then an error status for every input and
    /// output buffer, releasing each buffer after its notification.
    /// Returns the number of buffers notified.
    pub fn notify_failed(self, reason: FailureReason) -> usize {
        let header = self.header;
        header
            .callback
            .notify_request_error(header.pipeline_id, header.frame, reason);

        let mut count = 0;
        for buffer in self.inputs.into_iter().chain(self.outputs) {
            header.fail_buffer(buffer.stream_id, buffer.handle);
            drop(buffer.locked);
            count += 1;
        }

        tracing::debug!(
            "Failed frame {} on {} ({}, {} buffers)",
            header.frame,
            header.pipeline_id,
            reason,
            count
        );
        count
    }

    /// Hand the locked buffers over for capture
    ///
    /// Fails, returning the request untouched, if any buffer is not locked.
    pub fn into_capture_job(self) -> std::result::Result<CaptureJob, (PendingRequest, EmuCamError)> {
        if let Some(missing) = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|b| b.locked.is_none())
        {
            let err = EmuCamError::buffer(missing.handle, "buffer was never acquired");
            return Err((self, err));
        }

        let header = self.header;
        let wrap = |buffers: Vec<RequestBuffer>| -> Vec<SensorBuffer> {
            buffers
                .into_iter()
                .filter_map(|b| b.locked)
                .map(|locked| {
                    SensorBuffer::new(header.frame, header.pipeline_id, header.physical_camera_id, locked)
                })
                .collect()
        };
        let inputs = wrap(self.inputs);
        let outputs = wrap(self.outputs);

        Ok(CaptureJob {
            header,
            settings: self.settings,
            inputs,
            outputs,
        })
    }
}

/// Result of delivering a captured request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub buffers_ok: usize,
    pub buffers_failed: usize,
}

/// A request whose buffers are in the sensor's hands
#[derive(Debug)]
pub struct CaptureJob {
    pub header: RequestHeader,
    pub settings: Option<Settings>,
    pub inputs: Vec<SensorBuffer>,
    pub outputs: Vec<SensorBuffer>,
}

impl CaptureJob {
    pub fn frame(&self) -> FrameNumber {
        self.header.frame
    }

    /// Success path: shutter, then each buffer with the status the sensor
    /// reported, released after its notification
    pub fn deliver(self, outcome: CaptureOutcome) -> DeliveryReport {
        let header = self.header;
        header
            .callback
            .notify_shutter(header.pipeline_id, header.frame, outcome.timestamp);

        let mut report = DeliveryReport {
            buffers_ok: 0,
            buffers_failed: 0,
        };
        for buffer in self.inputs.into_iter().chain(self.outputs) {
            let status = buffer.status();
            header.callback.process_buffer(
                header.pipeline_id,
                header.frame,
                buffer.stream_id(),
                buffer.handle(),
                status,
            );
            drop(buffer.into_locked());
            match status {
                BufferStatus::Ok => report.buffers_ok += 1,
                BufferStatus::Error => report.buffers_failed += 1,
            }
        }

        tracing::trace!(
            "Delivered frame {} on {} ({} ok, {} failed)",
            header.frame,
            header.pipeline_id,
            report.buffers_ok,
            report.buffers_failed
        );
        report
    }

    /// Failure path after the buffers were handed over
    pub fn fail(self, reason: FailureReason) -> usize {
        let wrap = |buffers: Vec<SensorBuffer>| -> Vec<RequestBuffer> {
            buffers
                .into_iter()
                .map(|b| RequestBuffer {
                    stream_id: b.stream_id(),
                    handle: b.handle(),
                    locked: Some(b.into_locked()),
                })
                .collect()
        };

        PendingRequest {
            header: self.header,
            settings: self.settings,
            min_frame_duration: Duration::ZERO,
            inputs: wrap(self.inputs),
            outputs: wrap(self.outputs),
        }
        .notify_failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffers::HeapBufferMapper;
    use crate::pipeline::callback::{CaptureEvent, ChannelCallback};
    use crate::pipeline::registry::StreamDescriptor;
    use crate::pipeline::request::CaptureRequest;
    use crate::types::PixelFormat;
    use crossbeam_channel::Receiver;

    struct Fixture {
        pipeline: PipelineDescriptor,
        events: Receiver<CaptureEvent>,
        mapper: Arc<HeapBufferMapper>,
        acquirer: BufferAcquirer,
    }

    fn fixture() -> Fixture {
        let (callback, events) = ChannelCallback::new();
        let pipeline = PipelineDescriptor::new(
            PipelineId(3),
            1,
            [
                StreamDescriptor::output(StreamId(0), 16, 16, PixelFormat::Y8),
                StreamDescriptor::output(StreamId(1), 16, 16, PixelFormat::Rgba8888),
                StreamDescriptor::input(StreamId(2), 16, 16, PixelFormat::Y8),
            ],
            Arc::new(callback),
        )
        .unwrap();
        let mapper = Arc::new(HeapBufferMapper::default());
        let acquirer = BufferAcquirer::new(mapper.clone());
        Fixture {
            pipeline,
            events,
            mapper,
            acquirer,
        }
    }

    fn pending(fx: &Fixture, frame: u32) -> (PendingRequest, ResolvedRequest) {
        let request = CaptureRequest::new(PipelineId(3))
            .with_input(StreamId(2), BufferHandle(frame as u64 * 10))
            .with_output(StreamId(0), BufferHandle(frame as u64 * 10 + 1))
            .with_output(StreamId(1), BufferHandle(frame as u64 * 10 + 2));
        let resolved = fx.pipeline.validate_request(&request).unwrap();
        let header = RequestHeader::new(FrameNumber(frame), &fx.pipeline);
        (
            PendingRequest::new(header, Some(Settings::new()), &resolved, Duration::ZERO),
            resolved,
        )
    }

    #[test]
    fn test_notify_failed_reports_every_buffer_then_releases() {
        let fx = fixture();
        let (mut request, resolved) = pending(&fx, 1);
        request.acquire(&fx.acquirer, &resolved).unwrap();
        assert!(request.is_acquired());
        assert_eq!(fx.mapper.outstanding_locks(), 3);

        assert_eq!(request.notify_failed(FailureReason::Flushed), 3);
        assert_eq!(fx.mapper.outstanding_locks(), 0);

        let events: Vec<_> = fx.events.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            CaptureEvent::RequestError {
                pipeline_id: PipelineId(3),
                frame: FrameNumber(1),
                reason: FailureReason::Flushed,
            }
        );
        // Input first, then outputs in request order
        let streams: Vec<_> = events[1..]
            .iter()
            .map(|e| match e {
                CaptureEvent::Buffer {
                    stream_id, status, ..
                } => {
                    assert_eq!(*status, BufferStatus::Error);
                    *stream_id
                }
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(streams, vec![StreamId(2), StreamId(0), StreamId(1)]);
    }

    #[test]
    fn test_failed_acquisition_leaves_nothing_locked() {
        let fx = fixture();
        fx.mapper.fail_handle(BufferHandle(12));
        let (mut request, resolved) = pending(&fx, 1);

        let err = request.acquire(&fx.acquirer, &resolved).unwrap_err();
        assert!(matches!(err, EmuCamError::Buffer { .. }));
        assert!(!request.is_acquired());
        assert_eq!(fx.mapper.outstanding_locks(), 0);

        // Unacquired requests are still reported buffer by buffer
        assert_eq!(request.notify_failed(FailureReason::BufferError), 3);
        assert_eq!(fx.events.try_iter().count(), 4);
    }

    #[test]
    fn test_capture_job_requires_acquisition() {
        let fx = fixture();
        let (request, _) = pending(&fx, 1);
        let (request, err) = request.into_capture_job().unwrap_err();
        assert!(matches!(err, EmuCamError::Buffer { .. }));
        assert_eq!(request.frame(), FrameNumber(1));
    }

    #[test]
    fn test_deliver_uses_sensor_status() {
        let fx = fixture();
        let (mut request, resolved) = pending(&fx, 2);
        request.acquire(&fx.acquirer, &resolved).unwrap();

        let mut job = request.into_capture_job().unwrap();
        assert_eq!(job.inputs.len(), 1);
        assert_eq!(job.outputs.len(), 2);
        job.inputs[0].complete(BufferStatus::Ok);
        job.outputs[0].complete(BufferStatus::Ok);
        // outputs[1] never completed

        let report = job.deliver(CaptureOutcome {
            timestamp: Duration::from_millis(7),
        });
        assert_eq!(
            report,
            DeliveryReport {
                buffers_ok: 2,
                buffers_failed: 1
            }
        );
        assert_eq!(fx.mapper.outstanding_locks(), 0);

        let events: Vec<_> = fx.events.try_iter().collect();
        assert!(matches!(
            events[0],
            CaptureEvent::Shutter {
                frame: FrameNumber(2),
                ..
            }
        ));
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events[3],
            CaptureEvent::Buffer {
                stream_id: StreamId(1),
                status: BufferStatus::Error,
                ..
            }
        ));
    }

    #[test]
    fn test_capture_job_fail_releases() {
        let fx = fixture();
        let (mut request, resolved) = pending(&fx, 3);
        request.acquire(&fx.acquirer, &resolved).unwrap();

        let job = request.into_capture_job().unwrap();
        assert_eq!(job.fail(FailureReason::SensorError), 3);
        assert_eq!(fx.mapper.outstanding_locks(), 0);
        assert_eq!(fx.mapper.unlock_count(), 3);
    }
}
