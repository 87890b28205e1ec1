//! Stream registry and request validation.
//!
//! A [`PipelineDescriptor`] owns the stream id → [`StreamDescriptor`] map
//! for one capture configuration. Lookups are O(1). Validation of a
//! [`CaptureRequest`] against the registry never mutates anything, so a
//! failed check leaves no trace.

use crate::error::{EmuCamError, Result};
use crate::pipeline::callback::ResultCallback;
use crate::pipeline::id::{PipelineId, StreamId};
use crate::pipeline::request::{CaptureRequest, StreamBuffer};
use crate::types::{BufferHandle, PixelFormat, StreamDirection};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Fixed format and size of one input or output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Byte size for BLOB streams, 0 for formats whose size derives from the dimensions
    pub buffer_size: usize,
    pub direction: StreamDirection,
}

impl StreamDescriptor {
    /// Output stream of a sized format
    pub fn output(id: StreamId, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id,
            width,
            height,
            format,
            buffer_size: 0,
            direction: StreamDirection::Output,
        }
    }

    /// Input (reprocessing) stream of a sized format
    pub fn input(id: StreamId, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            direction: StreamDirection::Input,
            ..Self::output(id, width, height, format)
        }
    }

    /// BLOB output stream holding up to `buffer_size` bytes for a `width`x`height` image
    pub fn blob(id: StreamId, width: u32, height: u32, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Self::output(id, width, height, PixelFormat::Blob)
        }
    }

    fn check(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EmuCamError::InvalidArgument(format!(
                "{} has zero dimensions {}x{}",
                self.id, self.width, self.height
            )));
        }
        if self.format == PixelFormat::Blob && self.buffer_size == 0 {
            return Err(EmuCamError::InvalidArgument(format!(
                "BLOB {} declares no buffer size",
                self.id
            )));
        }
        Ok(())
    }
}

/// A stream reference from a request, resolved against the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBuffer {
    pub stream: StreamDescriptor,
    pub handle: BufferHandle,
}

/// A request whose every stream reference has been checked
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub inputs: Vec<ResolvedBuffer>,
    pub outputs: Vec<ResolvedBuffer>,
}

impl ResolvedRequest {
    /// Inputs first, then outputs
    pub fn all(&self) -> impl Iterator<Item = &ResolvedBuffer> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

/// One capture configuration: its streams and where its results go
#[derive(Clone)]
pub struct PipelineDescriptor {
    id: PipelineId,
    physical_camera_id: u32,
    streams: HashMap<StreamId, StreamDescriptor>,
    callback: Arc<dyn ResultCallback>,
}

impl fmt::Debug for PipelineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDescriptor")
            .field("id", &self.id)
            .field("physical_camera_id", &self.physical_camera_id)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl PipelineDescriptor {
    /// Register a pipeline
    ///
    /// Fails with `InvalidArgument` on duplicate stream ids, zero-sized
    /// streams or BLOB streams without a buffer size.
    pub fn new(
        id: PipelineId,
        physical_camera_id: u32,
        streams: impl IntoIterator<Item = StreamDescriptor>,
        callback: Arc<dyn ResultCallback>,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for stream in streams {
            stream.check()?;
            if map.contains_key(&stream.id) {
                return Err(EmuCamError::InvalidArgument(format!(
                    "{} registered twice in {}",
                    stream.id, id
                )));
            }
            map.insert(stream.id, stream);
        }

        Ok(Self {
            id,
            physical_camera_id,
            streams: map,
            callback,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn physical_camera_id(&self) -> u32 {
        self.physical_camera_id
    }

    pub fn callback(&self) -> &Arc<dyn ResultCallback> {
        &self.callback
    }

    pub fn stream(&self, id: StreamId) -> Option<&StreamDescriptor> {
        self.streams.get(&id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.values()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Look up a stream and check it is used in its declared direction
    pub fn resolve_stream(&self, id: StreamId, direction: StreamDirection) -> Result<&StreamDescriptor> {
        let stream = self.streams.get(&id).ok_or_else(|| {
            EmuCamError::InvalidArgument(format!("{} is not registered in {}", id, self.id))
        })?;

        if stream.direction != direction {
            return Err(EmuCamError::InvalidArgument(format!(
                "{} in {} is an {} stream but was referenced as {}",
                id, self.id, stream.direction, direction
            )));
        }

        Ok(stream)
    }

    /// Check every buffer reference of a request against this registry
    ///
    /// A request must reference at least one output, at most one input, and
    /// no stream more than once.
    pub fn validate_request(&self, request: &CaptureRequest) -> Result<ResolvedRequest> {
        if request.pipeline_id != self.id {
            return Err(EmuCamError::InvalidArgument(format!(
                "request for {} validated against {}",
                request.pipeline_id, self.id
            )));
        }
        if request.output_buffers.is_empty() {
            return Err(EmuCamError::InvalidArgument(format!(
                "request for {} has no output buffers",
                self.id
            )));
        }
        if request.input_buffers.len() > 1 {
            return Err(EmuCamError::InvalidArgument(format!(
                "request for {} has {} input buffers, at most one is supported",
                self.id,
                request.input_buffers.len()
            )));
        }

        let mut seen = HashSet::with_capacity(request.buffer_count());
        let mut resolve = |buffers: &[StreamBuffer], direction: StreamDirection| -> Result<Vec<ResolvedBuffer>> {
            buffers
                .iter()
                .map(|b| {
                    if !seen.insert(b.stream_id) {
                        return Err(EmuCamError::InvalidArgument(format!(
                            "{} referenced twice in one request",
                            b.stream_id
                        )));
                    }
                    let stream = self.resolve_stream(b.stream_id, direction)?;
                    Ok(ResolvedBuffer {
                        stream: stream.clone(),
                        handle: b.handle,
                    })
                })
                .collect()
        };

        let inputs = resolve(&request.input_buffers, StreamDirection::Input)?;
        let outputs = resolve(&request.output_buffers, StreamDirection::Output)?;

        Ok(ResolvedRequest { inputs, outputs })
    }
}
