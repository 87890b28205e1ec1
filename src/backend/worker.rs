//! Request worker thread
//!
//! One worker per processor drains the pending-request queue in FIFO order
//! and runs every capture serially on the sensor.
//!
//! # Loop
//!
//! 1. Sleep on `work_available` while the queue is empty and no shutdown is
//!    pending (the predicate is rechecked after every wakeup).
//! 2. On shutdown, fail everything still queued and exit.
//! 3. Otherwise pop the head, mark it in flight and release the lock.
//! 4. Resolve settings, hand the buffers to the sensor and capture.
//! 5. Deliver the result or route the request to the failure path.
//!
//! A failing request never ends the loop. Clearing the in-flight marker
//! wakes anyone waiting in `flush`.

use crate::backend::pending::PendingRequest;
use crate::backend::request_state::RequestState;
use crate::backend::sensor_trait::SensorCapture;
use crate::backend::stats::ProcessorStats;
use crate::error::{EmuCamError, Result};
use crate::pipeline::callback::FailureReason;
use crate::pipeline::id::FrameNumber;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Queue state, guarded by [`Shared::queue`]
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub pending: VecDeque<PendingRequest>,
    /// Frame currently being captured
    pub in_flight: Option<FrameNumber>,
    /// Whether the request in flight carries its own settings
    pub in_flight_has_settings: bool,
    /// Frames still acquiring buffers outside the lock, with their request count
    pub reserved: HashMap<FrameNumber, usize>,
    /// Terminal; set once by `Drop`
    pub shutting_down: bool,
    /// Number of `flush` calls currently draining
    pub active_flushes: usize,
    /// Set by the worker once a settings snapshot has been resolved
    pub settings_resolved: bool,
}

impl QueueState {
    /// Whether `frame` is queued, being captured or being submitted
    pub fn contains_frame(&self, frame: FrameNumber) -> bool {
        self.in_flight == Some(frame)
            || self.reserved.contains_key(&frame)
            || self.pending.iter().any(|p| p.frame() == frame)
    }

    /// Requests queued plus those still acquiring buffers
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.reserved.values().sum::<usize>()
    }

    /// Whether a request without settings will find a snapshot to repeat
    ///
    /// True once the worker has resolved one, or while a request carrying
    /// settings is queued or in flight.
    pub fn has_settings_source(&self) -> bool {
        self.settings_resolved
            || self.in_flight_has_settings
            || self.pending.iter().any(|p| p.settings().is_some())
    }

    pub fn accepting(&self) -> bool {
        !self.shutting_down && self.active_flushes == 0
    }
}

/// State shared between callers and the worker
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub queue: Mutex<QueueState>,
    /// Signalled on enqueue and on shutdown
    pub work_available: Condvar,
    /// Signalled whenever the worker finishes a request
    pub worker_idle: Condvar,
    pub stats: Mutex<ProcessorStats>,
}

impl Shared {
    /// Fail a batch of requests outside the queue lock
    pub fn fail_all(&self, requests: Vec<PendingRequest>, reason: FailureReason) -> usize {
        let count = requests.len();
        for request in requests {
            let buffers = request.notify_failed(reason);
            self.stats.lock().record_failure(reason, buffers);
        }
        count
    }

    /// Block until no request is in flight
    pub fn wait_idle(&self) {
        let mut queue = self.queue.lock();
        while queue.in_flight.is_some() {
            self.worker_idle.wait(&mut queue);
        }
    }
}

/// Clears the in-flight marker when a request is done, even on unwind
struct InFlightGuard<'a> {
    shared: &'a Shared,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.in_flight = None;
            queue.in_flight_has_settings = false;
        }
        self.shared.worker_idle.notify_all();
    }
}

/// The worker that runs the capture loop
pub(crate) struct RequestWorker {
    shared: Arc<Shared>,
    sensor: Box<dyn SensorCapture>,
    state: RequestState,
    default_frame_duration: Duration,
}

impl RequestWorker {
    pub fn new(
        shared: Arc<Shared>,
        sensor: Box<dyn SensorCapture>,
        default_frame_duration: Duration,
    ) -> Self {
        Self {
            shared,
            sensor,
            state: RequestState::new(),
            default_frame_duration,
        }
    }

    /// Start the loop on a named thread
    pub fn spawn(self, name: &str) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
            .map_err(|e| EmuCamError::from(e).with_context("Failed to spawn request worker"))
    }

    /// Run the main worker loop
    pub fn run(mut self) {
        tracing::info!("Request worker started");

        loop {
            let request = {
                let mut queue = self.shared.queue.lock();
                while queue.pending.is_empty() && !queue.shutting_down {
                    self.shared.work_available.wait(&mut queue);
                }

                if queue.shutting_down {
                    let leftovers: Vec<_> = queue.pending.drain(..).collect();
                    drop(queue);
                    if !leftovers.is_empty() {
                        tracing::info!("Failing {} queued requests on shutdown", leftovers.len());
                    }
                    self.shared.fail_all(leftovers, FailureReason::Shutdown);
                    break;
                }

                match queue.pending.pop_front() {
                    Some(request) => {
                        queue.in_flight = Some(request.frame());
                        queue.in_flight_has_settings = request.settings().is_some();
                        request
                    }
                    None => continue,
                }
            };

            let shared = self.shared.clone();
            let _in_flight = InFlightGuard { shared: &shared };
            self.process(request);
        }

        tracing::info!("Request worker stopped");
    }

    /// Capture one request and deliver its result
    fn process(&mut self, request: PendingRequest) {
        let frame = request.frame();
        let pipeline_id = request.pipeline_id();

        let first_snapshot = !self.state.has_settings();
        let settings = match self.state.resolve(
            request.settings(),
            request.min_frame_duration(),
            self.default_frame_duration,
        ) {
            Ok(settings) => {
                if first_snapshot {
                    self.shared.queue.lock().settings_resolved = true;
                }
                settings
            }
            Err(e) => {
                tracing::warn!("Frame {} on {}: {}", frame, pipeline_id, e);
                self.fail(request, FailureReason::InvalidSettings);
                return;
            }
        };

        let mut job = match request.into_capture_job() {
            Ok(job) => job,
            Err((request, e)) => {
                tracing::error!("Frame {} on {}: {}", frame, pipeline_id, e);
                self.fail(request, FailureReason::from_error(&e));
                return;
            }
        };

        tracing::trace!("Capturing frame {} on {}", frame, pipeline_id);
        let started = Instant::now();
        let result = self
            .sensor
            .capture(frame, &settings, &mut job.inputs, &mut job.outputs);
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) => {
                let report = job.deliver(outcome);
                self.shared
                    .stats
                    .lock()
                    .record_capture(elapsed, report.buffers_ok, report.buffers_failed);
            }
            Err(e) => {
                tracing::warn!("Capture of frame {} on {} failed: {}", frame, pipeline_id, e);
                let reason = FailureReason::from_error(&e);
                let buffers = job.fail(reason);
                self.shared.stats.lock().record_failure(reason, buffers);
            }
        }
    }

    fn fail(&self, request: PendingRequest, reason: FailureReason) {
        let buffers = request.notify_failed(reason);
        self.shared.stats.lock().record_failure(reason, buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffers::{BufferAcquirer, HeapBufferMapper};
    use crate::backend::pending::RequestHeader;
    use crate::backend::sensor_trait::{CaptureOutcome, MockSensorCapture};
    use crate::pipeline::callback::{CaptureEvent, ChannelCallback};
    use crate::pipeline::id::{PipelineId, StreamId};
    use crate::pipeline::registry::{PipelineDescriptor, StreamDescriptor};
    use crate::pipeline::request::CaptureRequest;
    use crate::types::{keys, BufferHandle, BufferStatus, PixelFormat, Settings};
    use crossbeam_channel::Receiver;

    struct Harness {
        shared: Arc<Shared>,
        pipeline: PipelineDescriptor,
        events: Receiver<CaptureEvent>,
        mapper: Arc<HeapBufferMapper>,
    }

    fn harness() -> Harness {
        let (callback, events) = ChannelCallback::new();
        let pipeline = PipelineDescriptor::new(
            PipelineId(0),
            0,
            [StreamDescriptor::output(StreamId(0), 16, 16, PixelFormat::Y8)],
            Arc::new(callback),
        )
        .unwrap();
        Harness {
            shared: Arc::new(Shared::default()),
            pipeline,
            events,
            mapper: Arc::new(HeapBufferMapper::default()),
        }
    }

    fn enqueue(h: &Harness, frame: u32, settings: Option<Settings>) {
        let request = CaptureRequest {
            settings,
            ..CaptureRequest::new(PipelineId(0)).with_output(StreamId(0), BufferHandle(frame as u64))
        };
        let resolved = h.pipeline.validate_request(&request).unwrap();
        let mut pending = PendingRequest::new(
            RequestHeader::new(FrameNumber(frame), &h.pipeline),
            request.settings.clone(),
            &resolved,
            Duration::ZERO,
        );
        pending
            .acquire(&BufferAcquirer::new(h.mapper.clone()), &resolved)
            .unwrap();
        h.shared.queue.lock().pending.push_back(pending);
    }

    fn run_until_shutdown(h: &Harness, sensor: MockSensorCapture) {
        h.shared.queue.lock().shutting_down = true;
        let worker = RequestWorker::new(h.shared.clone(), Box::new(sensor), Duration::from_micros(100));
        // Shutdown is already flagged, so the loop fails everything queued
        worker.run();
    }

    #[test]
    fn test_shutdown_fails_queued_requests() {
        let h = harness();
        enqueue(&h, 1, Some(Settings::new()));
        enqueue(&h, 2, None);

        let mut sensor = MockSensorCapture::new();
        sensor.expect_capture().never();
        run_until_shutdown(&h, sensor);

        let errors: Vec<_> = h
            .events
            .try_iter()
            .filter(|e| matches!(e, CaptureEvent::RequestError { reason: FailureReason::Shutdown, .. }))
            .collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(h.mapper.outstanding_locks(), 0);
        assert_eq!(h.shared.stats.lock().shutdown_failures, 2);
    }

    #[test]
    fn test_process_delivers_in_order() {
        let h = harness();
        enqueue(&h, 1, Some(Settings::new().with(keys::SENSITIVITY, 200i64)));
        enqueue(&h, 2, None);

        let mut sensor = MockSensorCapture::new();
        let mut seq = mockall::Sequence::new();
        for frame in [1u32, 2] {
            sensor
                .expect_capture()
                .withf(move |f, settings, inputs, outputs| {
                    *f == FrameNumber(frame)
                        && settings.get_int(keys::FRAME_DURATION_US) == Some(100)
                        && settings.get_int(keys::SENSITIVITY) == Some(200)
                        && inputs.is_empty()
                        && outputs.len() == 1
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _, outputs| {
                    for output in outputs.iter_mut() {
                        output.complete(BufferStatus::Ok);
                    }
                    Ok(CaptureOutcome {
                        timestamp: Duration::from_millis(1),
                    })
                });
        }

        let mut worker = RequestWorker::new(h.shared.clone(), Box::new(sensor), Duration::from_micros(100));
        for _ in 0..2 {
            let request = h.shared.queue.lock().pending.pop_front().unwrap();
            worker.process(request);
        }

        let frames: Vec<_> = h
            .events
            .try_iter()
            .filter(|e| matches!(e, CaptureEvent::Shutter { .. }))
            .map(|e| e.frame())
            .collect();
        assert_eq!(frames, vec![FrameNumber(1), FrameNumber(2)]);
        assert_eq!(h.shared.stats.lock().completed, 2);
        assert_eq!(h.mapper.outstanding_locks(), 0);
    }

    #[test]
    fn test_sensor_error_fails_only_that_request() {
        let h = harness();
        enqueue(&h, 1, Some(Settings::new()));
        enqueue(&h, 2, None);

        let mut sensor = MockSensorCapture::new();
        sensor
            .expect_capture()
            .withf(|f, _, _, _| *f == FrameNumber(1))
            .returning(|f, _, _, _| Err(EmuCamError::sensor(f, "exposure timeout")));
        sensor
            .expect_capture()
            .withf(|f, _, _, _| *f == FrameNumber(2))
            .returning(|_, _, _, outputs| {
                outputs[0].complete(BufferStatus::Ok);
                Ok(CaptureOutcome {
                    timestamp: Duration::ZERO,
                })
            });

        let mut worker = RequestWorker::new(h.shared.clone(), Box::new(sensor), Duration::from_micros(100));
        for _ in 0..2 {
            let request = h.shared.queue.lock().pending.pop_front().unwrap();
            worker.process(request);
        }

        let events: Vec<_> = h.events.try_iter().collect();
        assert_eq!(
            events[0],
            CaptureEvent::RequestError {
                pipeline_id: PipelineId(0),
                frame: FrameNumber(1),
                reason: FailureReason::SensorError,
            }
        );
        assert!(matches!(
            events[1],
            CaptureEvent::Buffer {
                status: BufferStatus::Error,
                ..
            }
        ));
        assert!(matches!(events[2], CaptureEvent::Shutter { frame: FrameNumber(2), .. }));

        let stats = h.shared.stats.lock();
        assert_eq!(stats.sensor_errors, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(h.mapper.outstanding_locks(), 0);
    }

    #[test]
    fn test_unresolvable_settings_skip_the_sensor() {
        let h = harness();
        enqueue(&h, 1, None);

        let mut sensor = MockSensorCapture::new();
        sensor.expect_capture().never();

        let mut worker = RequestWorker::new(h.shared.clone(), Box::new(sensor), Duration::from_micros(100));
        let request = h.shared.queue.lock().pending.pop_front().unwrap();
        worker.process(request);

        assert!(matches!(
            h.events.try_recv().unwrap(),
            CaptureEvent::RequestError {
                reason: FailureReason::InvalidSettings,
                ..
            }
        ));
        assert_eq!(h.shared.stats.lock().settings_errors, 1);
    }

    #[test]
    fn test_in_flight_guard_wakes_waiters() {
        let shared = Arc::new(Shared::default());
        shared.queue.lock().in_flight = Some(FrameNumber(5));

        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.wait_idle())
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(InFlightGuard { shared: &shared });
        waiter.join().unwrap();
        assert!(shared.queue.lock().in_flight.is_none());
    }

    #[test]
    fn test_settings_source_tracks_the_queue() {
        let h = harness();
        assert!(!h.shared.queue.lock().has_settings_source());

        enqueue(&h, 1, None);
        assert!(!h.shared.queue.lock().has_settings_source());

        enqueue(&h, 2, Some(Settings::new()));
        assert!(h.shared.queue.lock().has_settings_source());

        // A drained request no longer promises a snapshot
        let drained: Vec<_> = h.shared.queue.lock().pending.drain(..).collect();
        h.shared.fail_all(drained, FailureReason::Flushed);
        assert!(!h.shared.queue.lock().has_settings_source());

        h.shared.queue.lock().in_flight_has_settings = true;
        assert!(h.shared.queue.lock().has_settings_source());
        drop(InFlightGuard { shared: &h.shared });
        assert!(!h.shared.queue.lock().has_settings_source());
    }

    #[test]
    fn test_only_resolved_settings_are_published() {
        let h = harness();
        enqueue(&h, 1, Some(Settings::new().with(keys::FRAME_DURATION_US, -1i64)));
        enqueue(&h, 2, Some(Settings::new()));

        let mut sensor = MockSensorCapture::new();
        sensor
            .expect_capture()
            .withf(|f, _, _, _| *f == FrameNumber(2))
            .times(1)
            .returning(|_, _, _, outputs| {
                outputs[0].complete(BufferStatus::Ok);
                Ok(CaptureOutcome {
                    timestamp: Duration::ZERO,
                })
            });

        let mut worker = RequestWorker::new(h.shared.clone(), Box::new(sensor), Duration::from_micros(100));

        let request = h.shared.queue.lock().pending.pop_front().unwrap();
        worker.process(request);
        assert!(!h.shared.queue.lock().settings_resolved);

        let request = h.shared.queue.lock().pending.pop_front().unwrap();
        worker.process(request);
        assert!(h.shared.queue.lock().settings_resolved);
    }
}
