//! Backend module: the request processor and its collaborators
//!
//! [`RequestProcessor`] accepts batches of capture requests from any number
//! of threads, queues them, and runs them one at a time on a dedicated
//! worker thread against a [`SensorCapture`].
//!
//! # Architecture
//!
//! - [`RequestProcessor`] - caller-facing API, owns the worker thread
//! - `worker` - the FIFO capture loop
//! - [`buffers`] - layout, locking and atomic acquisition of request buffers
//! - [`pending`] - queued requests and their success/failure exits
//! - [`request_state`] - settings resolution
//! - [`SimulatedSensor`] - the default test-pattern sensor
//!
//! # Example
//!
//! ```ignore
//! use emucam::backend::RequestProcessor;
//! use emucam::config::ProcessorConfig;
//!
//! let (mut processor, _mapper) = RequestProcessor::with_simulated_sensor(ProcessorConfig::default())?;
//! processor.initialize(emucam::capabilities::DEFAULT_CAPABILITIES_JSON)?;
//!
//! let settings = processor.get_default_request(RequestTemplate::Preview)?;
//! let request = CaptureRequest::new(pipeline.id())
//!     .with_settings(settings)
//!     .with_output(StreamId(0), BufferHandle(1));
//! processor.process_pipeline_requests(FrameNumber(0), &[request], &[pipeline])?;
//!
//! // Results arrive on the pipeline's callback
//! processor.flush();
//! ```

pub mod buffers;
pub mod mock_sensor;
pub mod pending;
pub mod request_state;
pub mod sensor_trait;
pub mod stats;
mod worker;

pub use buffers::{
    align_to, BufferAcquirer, BufferLayout, BufferMapper, HeapBufferMapper, LayoutError,
    LockedBuffer, NativeMemory, PlaneLayout,
};
pub use mock_sensor::SimulatedSensor;
pub use pending::{PendingRequest, RequestHeader};
pub use request_state::RequestState;
pub use sensor_trait::{CaptureOutcome, SensorBuffer, SensorCapture};
pub use stats::ProcessorStats;

use crate::capabilities::StaticCapabilities;
use crate::config::ProcessorConfig;
use crate::error::{EmuCamError, Result};
use crate::pipeline::callback::FailureReason;
use crate::pipeline::id::{FrameNumber, PipelineId};
use crate::pipeline::registry::{PipelineDescriptor, ResolvedRequest};
use crate::pipeline::request::CaptureRequest;
use crate::types::{RequestTemplate, Settings};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use worker::{QueueState, RequestWorker, Shared};

/// A request that passed validation, ready for buffer acquisition
struct ValidatedRequest<'a> {
    pipeline: &'a PipelineDescriptor,
    settings: Option<Settings>,
    resolved: ResolvedRequest,
}

/// Decrements the active flush count when a flush ends
struct FlushGuard<'a> {
    shared: &'a Shared,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock();
        queue.active_flushes = queue.active_flushes.saturating_sub(1);
    }
}

/// Holds a frame number while its buffers are acquired outside the lock
struct FrameReservation<'a> {
    shared: &'a Shared,
    frame: FrameNumber,
    held: bool,
}

impl FrameReservation<'_> {
    /// Release under a lock the caller already holds
    fn release(mut self, queue: &mut QueueState) {
        queue.reserved.remove(&self.frame);
        self.held = false;
    }
}

impl Drop for FrameReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.shared.queue.lock().reserved.remove(&self.frame);
        }
    }
}

/// The emulated device's request processor
///
/// Dropping the processor shuts it down: queued requests are failed with
/// [`FailureReason::Shutdown`], the request in flight (if any) completes, and
/// the worker thread is joined before `drop` returns.
pub struct RequestProcessor {
    config: ProcessorConfig,
    capabilities: Option<Arc<StaticCapabilities>>,
    acquirer: BufferAcquirer,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_thread: ThreadId,
}

impl RequestProcessor {
    /// Create a processor and start its worker thread
    pub fn new(
        config: ProcessorConfig,
        sensor: Box<dyn SensorCapture>,
        mapper: Arc<dyn BufferMapper>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::default());
        let worker = RequestWorker::new(
            shared.clone(),
            sensor,
            config.sensor.default_frame_duration(),
        );
        let handle = worker.spawn(&config.worker.thread_name)?;
        let worker_thread = handle.thread().id();

        tracing::debug!("Request processor created (worker '{}')", config.worker.thread_name);

        Ok(Self {
            config,
            capabilities: None,
            acquirer: BufferAcquirer::new(mapper),
            shared,
            worker: Some(handle),
            worker_thread,
        })
    }

    /// Create a processor with a [`SimulatedSensor`] and a [`HeapBufferMapper`]
    ///
    /// The mapper is returned so callers can seed and inspect buffers.
    pub fn with_simulated_sensor(config: ProcessorConfig) -> Result<(Self, Arc<HeapBufferMapper>)> {
        let mapper = Arc::new(HeapBufferMapper::new(config.buffers.base_alignment));
        let sensor = Box::new(SimulatedSensor::new(config.sensor.clone()));
        let processor = Self::new(config, sensor, mapper.clone())?;
        Ok((processor, mapper))
    }

    /// Parse and install the static capability table
    ///
    /// Runs once; a malformed blob leaves the processor uninitialized.
    pub fn initialize(&mut self, capabilities_json: &str) -> Result<()> {
        let capabilities = StaticCapabilities::from_json(capabilities_json)?;
        self.initialize_with(capabilities)
    }

    /// Install an already parsed capability table
    pub fn initialize_with(&mut self, capabilities: StaticCapabilities) -> Result<()> {
        if self.capabilities.is_some() {
            return Err(EmuCamError::Config("processor is already initialized".to_string()));
        }
        self.capabilities = Some(Arc::new(capabilities));
        tracing::info!("Request processor initialized");
        Ok(())
    }

    pub fn capabilities(&self) -> Option<&StaticCapabilities> {
        self.capabilities.as_deref()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Default settings for a request template
    pub fn get_default_request(&self, template: RequestTemplate) -> Result<Settings> {
        self.capabilities
            .as_ref()
            .ok_or(EmuCamError::NotInitialized)?
            .default_request(template)
    }

    /// Submit one frame's requests across one or more pipelines
    ///
    /// Every request is validated before anything is queued; an invalid
    /// request rejects the whole call with no side effects. Accepted
    /// requests are queued in order and complete asynchronously through
    /// their pipeline's callback. A request whose buffers cannot be locked is
    /// failed through the callback without affecting the others.
    ///
    /// Buffers are locked without holding the queue lock, so a slow mapper
    /// never stalls the worker, `flush` or other submitters. The frame
    /// number is reserved meanwhile. If a flush starts or the settings
    /// source disappears before the requests are queued, the call is
    /// rejected and every lock it took is released.
    pub fn process_pipeline_requests(
        &self,
        frame: FrameNumber,
        requests: &[CaptureRequest],
        pipelines: &[PipelineDescriptor],
    ) -> Result<()> {
        let capabilities = self.capabilities.as_ref().ok_or(EmuCamError::NotInitialized)?;
        if requests.is_empty() {
            return Err(EmuCamError::InvalidArgument(format!(
                "frame {} has no requests",
                frame
            )));
        }

        let validated = {
            let mut queue = self.shared.queue.lock();
            if !queue.accepting() {
                return Err(EmuCamError::ShutdownInProgress);
            }
            if queue.contains_frame(frame) {
                return Err(EmuCamError::InvalidArgument(format!(
                    "frame {} is already queued",
                    frame
                )));
            }
            let limit = self.config.worker.max_pending_requests;
            if limit > 0 && queue.outstanding() + requests.len() > limit {
                return Err(EmuCamError::InvalidArgument(format!(
                    "{} pending requests plus {} new exceed the limit of {}",
                    queue.outstanding(),
                    requests.len(),
                    limit
                )));
            }

            let validated = Self::validate(capabilities, requests, pipelines)?;
            check_settings_source(
                queue.has_settings_source(),
                requests.iter().map(|r| r.settings.is_some()),
            )?;
            queue.reserved.insert(frame, requests.len());
            validated
        };
        let reservation = FrameReservation {
            shared: &self.shared,
            frame,
            held: true,
        };

        let mut acquired = Vec::with_capacity(validated.len());
        let mut failed = Vec::new();
        for request in validated {
            let min_frame_duration = capabilities
                .min_frame_duration_for(request.resolved.outputs.iter().map(|b| &b.stream));
            let mut pending = PendingRequest::new(
                RequestHeader::new(frame, request.pipeline),
                request.settings,
                &request.resolved,
                min_frame_duration,
            );
            match pending.acquire(&self.acquirer, &request.resolved) {
                Ok(()) => acquired.push(pending),
                Err(e) => {
                    tracing::warn!("Frame {} on {}: {}", frame, pending.pipeline_id(), e);
                    failed.push(pending);
                }
            }
        }

        let accepted = acquired.len();
        {
            let mut queue = self.shared.queue.lock();
            reservation.release(&mut queue);
            // Returning drops `acquired` and `failed` unreported, releasing their buffers
            if !queue.accepting() {
                return Err(EmuCamError::ShutdownInProgress);
            }
            check_settings_source(
                queue.has_settings_source(),
                acquired.iter().map(|p| p.settings().is_some()),
            )?;
            queue.pending.extend(acquired);
        }
        if accepted > 0 {
            self.shared.work_available.notify_one();
        }

        self.shared.stats.lock().submitted += requests.len() as u64;
        tracing::debug!(
            "Frame {}: queued {} requests ({} failed buffer acquisition)",
            frame,
            accepted,
            failed.len()
        );

        self.shared.fail_all(failed, FailureReason::BufferError);
        Ok(())
    }

    /// Check every request of a batch against its pipeline and the
    /// capability table
    fn validate<'a>(
        capabilities: &StaticCapabilities,
        requests: &[CaptureRequest],
        pipelines: &'a [PipelineDescriptor],
    ) -> Result<Vec<ValidatedRequest<'a>>> {
        let by_id: HashMap<PipelineId, &PipelineDescriptor> =
            pipelines.iter().map(|p| (p.id(), p)).collect();
        let mut targeted = HashSet::with_capacity(requests.len());
        let mut validated = Vec::with_capacity(requests.len());

        for request in requests {
            let pipeline = by_id.get(&request.pipeline_id).copied().ok_or_else(|| {
                EmuCamError::InvalidArgument(format!(
                    "{} is not among the supplied pipelines",
                    request.pipeline_id
                ))
            })?;
            if !targeted.insert(request.pipeline_id) {
                return Err(EmuCamError::InvalidArgument(format!(
                    "{} targeted twice in one frame",
                    request.pipeline_id
                )));
            }

            let resolved = pipeline.validate_request(request)?;

            if let Some(input) = resolved.inputs.first() {
                if !capabilities.supports_reprocessing() {
                    return Err(EmuCamError::InvalidArgument(
                        "reprocessing is not supported".to_string(),
                    ));
                }
                let format = input.stream.format;
                if !capabilities.is_input_format(format) {
                    return Err(EmuCamError::InvalidArgument(format!(
                        "{} is not a reprocessing input format",
                        format
                    )));
                }
                let allowed = capabilities.valid_output_formats_for_input(format);
                if let Some(output) = resolved
                    .outputs
                    .iter()
                    .find(|o| !allowed.contains(&o.stream.format))
                {
                    return Err(EmuCamError::InvalidArgument(format!(
                        "{} cannot be reprocessed into {}",
                        format, output.stream.format
                    )));
                }
            }

            validated.push(ValidatedRequest {
                pipeline,
                settings: request.settings.clone(),
                resolved,
            });
        }

        Ok(validated)
    }

    /// Fail every queued request and wait for the one in flight
    ///
    /// Submissions are rejected with `ShutdownInProgress` while a flush
    /// runs. Returns the number of requests failed. Called from a result
    /// callback it does not wait, since the callback runs on the worker.
    pub fn flush(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut queue = self.shared.queue.lock();
            queue.active_flushes += 1;
            queue.pending.drain(..).collect()
        };
        let _guard = FlushGuard {
            shared: &self.shared,
        };

        let count = self.shared.fail_all(drained, FailureReason::Flushed);

        if std::thread::current().id() == self.worker_thread {
            tracing::warn!("flush called from the worker thread; not waiting for the request in flight");
        } else {
            self.shared.wait_idle();
        }

        tracing::debug!("Flushed {} requests", count);
        count
    }

    /// Snapshot of the processing statistics
    pub fn stats(&self) -> ProcessorStats {
        let queue_depth = self.shared.queue.lock().pending.len();
        let mut stats = self.shared.stats.lock().clone();
        stats.queue_depth = queue_depth;
        stats
    }

    /// Number of requests waiting in the queue
    pub fn pending_requests(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }
}

/// Reject a batch whose settings-less requests would have no snapshot to
/// repeat
///
/// `carries_settings` yields, in queue order, whether each request brings
/// its own settings; `has_source` is whether one is already available.
fn check_settings_source(
    mut has_source: bool,
    carries_settings: impl IntoIterator<Item = bool>,
) -> Result<()> {
    for carries in carries_settings {
        if carries {
            has_source = true;
        } else if !has_source {
            return Err(EmuCamError::InvalidArgument(
                "no settings have been resolved yet; the request must carry settings".to_string(),
            ));
        }
    }
    Ok(())
}

impl Drop for RequestProcessor {
    fn drop(&mut self) {
        self.shared.queue.lock().shutting_down = true;
        self.shared.work_available.notify_all();

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("Request worker panicked");
            }
        }

        // Only non-empty if the worker died before draining
        let leftovers: Vec<_> = self.shared.queue.lock().pending.drain(..).collect();
        self.shared.fail_all(leftovers, FailureReason::Shutdown);

        tracing::info!("Request processor shut down");
    }
}
