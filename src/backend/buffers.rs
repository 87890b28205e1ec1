//! Buffer acquisition
//!
//! Turns the opaque [`BufferHandle`]s of a request into locked,
//! stride-aligned native memory the sensor can write into.
//!
//! - [`align_to`] and [`BufferLayout`] derive strides, plane offsets and the
//!   total size from a stream's format and dimensions.
//! - [`BufferMapper`] is the import/lock/unlock service; [`HeapBufferMapper`]
//!   is the in-process implementation.
//! - [`LockedBuffer`] owns one lock and unlocks it exactly once when dropped.
//! - [`BufferAcquirer::acquire_buffers`] locks a whole set or nothing.

use crate::error::{EmuCamError, Result};
use crate::pipeline::registry::{ResolvedBuffer, StreamDescriptor};
use crate::types::{BufferHandle, PixelFormat};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default byte alignment of memory allocated by [`HeapBufferMapper`]
pub const DEFAULT_BASE_ALIGNMENT: usize = 64;

/// Round `value` up to the next multiple of `alignment`
///
/// An alignment of 0 or 1 leaves the value unchanged.
#[inline]
pub fn align_to(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Why a layout could not be computed for a stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("format {0} is not CPU accessible")]
    UnsupportedFormat(PixelFormat),

    #[error("{format} {width}x{height} does not fit in memory")]
    Overflow {
        format: PixelFormat,
        width: u32,
        height: u32,
    },

    #[error("BLOB stream has no buffer size")]
    EmptyBlob,
}

/// One plane of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the plane from the buffer start
    pub offset: usize,
    /// Bytes between the starts of consecutive rows
    pub stride: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn end(&self) -> usize {
        self.offset + self.stride * self.rows
    }
}

/// Memory layout of one stream buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneLayout>,
    /// Total byte size
    pub size: usize,
    /// Alignment the buffer start must satisfy
    pub alignment: usize,
}

impl BufferLayout {
    /// Layout for a registered stream
    pub fn for_stream(stream: &StreamDescriptor) -> std::result::Result<Self, LayoutError> {
        Self::compute(stream.format, stream.width, stream.height, stream.buffer_size)
    }

    /// Layout for `format` at `width`x`height`
    ///
    /// `blob_size` is only used for [`PixelFormat::Blob`].
    pub fn compute(
        format: PixelFormat,
        width: u32,
        height: u32,
        blob_size: usize,
    ) -> std::result::Result<Self, LayoutError> {
        let overflow = || LayoutError::Overflow {
            format,
            width,
            height,
        };
        let alignment = format.stride_alignment();
        let w = width as usize;
        let h = height as usize;

        let plane = |offset: usize, row_bytes: usize, rows: usize| -> std::result::Result<PlaneLayout, LayoutError> {
            let stride = row_bytes
                .checked_add(alignment)
                .map(|_| align_to(row_bytes, alignment))
                .ok_or_else(overflow)?;
            stride
                .checked_mul(rows)
                .and_then(|bytes| bytes.checked_add(offset))
                .and_then(|end| end.checked_add(alignment))
                .ok_or_else(overflow)?;
            Ok(PlaneLayout {
                offset,
                stride,
                rows,
            })
        };

        let planes = match format {
            PixelFormat::Private => return Err(LayoutError::UnsupportedFormat(format)),
            PixelFormat::Blob => {
                if blob_size == 0 {
                    return Err(LayoutError::EmptyBlob);
                }
                blob_size
                    .checked_add(alignment.max(DEFAULT_BASE_ALIGNMENT))
                    .ok_or_else(overflow)?;
                vec![PlaneLayout {
                    offset: 0,
                    stride: blob_size,
                    rows: 1,
                }]
            }
            PixelFormat::Ycbcr420 => {
                let luma = plane(0, w, h)?;
                let chroma_width = w.div_ceil(2);
                let chroma_rows = h.div_ceil(2);
                let cb = plane(align_to(luma.end(), alignment), chroma_width, chroma_rows)?;
                let cr = plane(align_to(cb.end(), alignment), chroma_width, chroma_rows)?;
                vec![luma, cb, cr]
            }
            PixelFormat::Y8 | PixelFormat::Raw16 | PixelFormat::Rgba8888 => {
                let bpp = format.bytes_per_pixel().unwrap_or(1);
                let row_bytes = w.checked_mul(bpp).ok_or_else(overflow)?;
                vec![plane(0, row_bytes, h)?]
            }
        };

        let size = planes.last().map(PlaneLayout::end).unwrap_or(0);

        Ok(Self {
            format,
            width,
            height,
            planes,
            size,
            alignment: alignment.max(1),
        })
    }

    /// Row stride of the first plane
    pub fn stride(&self) -> usize {
        self.planes.first().map(|p| p.stride).unwrap_or(0)
    }
}

/// Heap memory whose first byte sits on a requested boundary
pub struct NativeMemory {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl NativeMemory {
    /// Allocate `len` zeroed bytes aligned to `alignment` (a power of two)
    ///
    /// Returns `None` when the padded size does not fit in `usize`.
    pub fn allocate(len: usize, alignment: usize) -> Option<Self> {
        let alignment = alignment.max(1);
        let padded = len.checked_add(alignment - 1)?;
        let storage = vec![0u8; padded];
        let addr = storage.as_ptr() as usize;
        let offset = align_to(addr, alignment) - addr;
        Some(Self {
            storage,
            offset,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_aligned_to(&self, alignment: usize) -> bool {
        alignment <= 1 || self.as_slice().as_ptr() as usize % alignment == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

impl fmt::Debug for NativeMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMemory")
            .field("len", &self.len)
            .field("addr", &format_args!("{:p}", self.as_slice().as_ptr()))
            .finish()
    }
}

/// Native buffer import/lock service
pub trait BufferMapper: Send + Sync {
    /// Import `handle` and lock it for CPU access with `layout`
    fn lock(&self, handle: BufferHandle, layout: &BufferLayout) -> Result<NativeMemory>;

    /// Return a locked buffer to its owner
    fn unlock(&self, handle: BufferHandle, memory: NativeMemory);
}

#[derive(Default)]
struct Slot {
    memory: Option<NativeMemory>,
    locked: bool,
}

#[derive(Default)]
struct MapperState {
    slots: HashMap<BufferHandle, Slot>,
    failing: HashSet<BufferHandle>,
    lock_count: u64,
    unlock_count: u64,
}

/// In-process [`BufferMapper`] backed by heap allocations
///
/// Each handle gets its memory on first lock; contents persist across
/// lock/unlock cycles so callers can inspect what the sensor wrote. Handles
/// can be marked as failing to simulate import errors.
pub struct HeapBufferMapper {
    alignment: usize,
    state: Mutex<MapperState>,
}

impl Default for HeapBufferMapper {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_ALIGNMENT)
    }
}

impl HeapBufferMapper {
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
            state: Mutex::new(MapperState::default()),
        }
    }

    /// Make every future lock of `handle` fail
    pub fn fail_handle(&self, handle: BufferHandle) {
        self.state.lock().failing.insert(handle);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Seed a buffer with contents, e.g. a reprocessing input
    pub fn preload(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slots.entry(handle).or_default();
        if slot.locked {
            return Err(EmuCamError::buffer(handle, "cannot preload a locked buffer"));
        }
        let mut memory = NativeMemory::allocate(data.len(), self.alignment)
            .ok_or_else(|| EmuCamError::buffer(handle, "preload size overflows"))?;
        memory.as_mut_slice().copy_from_slice(data);
        slot.memory = Some(memory);
        Ok(())
    }

    /// Copy of an unlocked buffer's contents
    pub fn contents(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let slot = state.slots.get(&handle)?;
        slot.memory.as_ref().map(|m| m.as_slice().to_vec())
    }

    pub fn is_locked(&self, handle: BufferHandle) -> bool {
        self.state
            .lock()
            .slots
            .get(&handle)
            .is_some_and(|s| s.locked)
    }

    pub fn lock_count(&self) -> u64 {
        self.state.lock().lock_count
    }

    pub fn unlock_count(&self) -> u64 {
        self.state.lock().unlock_count
    }

    /// Number of buffers currently locked
    pub fn outstanding_locks(&self) -> usize {
        self.state.lock().slots.values().filter(|s| s.locked).count()
    }
}

impl BufferMapper for HeapBufferMapper {
    fn lock(&self, handle: BufferHandle, layout: &BufferLayout) -> Result<NativeMemory> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.failing.contains(&handle) {
            return Err(EmuCamError::buffer(handle, "import failed"));
        }

        let slot = state.slots.entry(handle).or_default();
        if slot.locked {
            return Err(EmuCamError::buffer(handle, "already locked"));
        }

        let memory = match slot.memory.take() {
            Some(memory) if memory.len() != layout.size => {
                let found = memory.len();
                slot.memory = Some(memory);
                return Err(EmuCamError::buffer(
                    handle,
                    format!("size mismatch: buffer holds {} bytes, layout needs {}", found, layout.size),
                ));
            }
            Some(memory) => memory,
            None => NativeMemory::allocate(layout.size, self.alignment.max(layout.alignment))
                .ok_or_else(|| EmuCamError::buffer(handle, format!("cannot allocate {} bytes", layout.size)))?,
        };

        slot.locked = true;
        state.lock_count += 1;
        tracing::trace!("Locked {} ({} bytes)", handle, layout.size);
        Ok(memory)
    }

    fn unlock(&self, handle: BufferHandle, memory: NativeMemory) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.slots.get_mut(&handle) {
            Some(slot) if slot.locked => {
                slot.locked = false;
                slot.memory = Some(memory);
                state.unlock_count += 1;
                tracing::trace!("Unlocked {}", handle);
            }
            _ => tracing::warn!("Unlock of {} which is not locked", handle),
        }
    }
}

/// A buffer locked for the duration of one request
///
/// Dropping the guard unlocks the buffer. Every exit path of a request
/// (delivery, failure, shutdown drain) releases through here.
pub struct LockedBuffer {
    handle: BufferHandle,
    stream: StreamDescriptor,
    layout: BufferLayout,
    memory: Option<NativeMemory>,
    mapper: Arc<dyn BufferMapper>,
}

impl LockedBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn stride(&self) -> usize {
        self.layout.stride()
    }

    pub fn data(&self) -> &[u8] {
        self.memory.as_ref().map(NativeMemory::as_slice).unwrap_or(&[])
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.memory.as_mut() {
            Some(memory) => memory.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("handle", &self.handle)
            .field("stream", &self.stream.id)
            .field("format", &self.layout.format)
            .field("size", &self.layout.size)
            .finish()
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.mapper.unlock(self.handle, memory);
        }
    }
}

/// Locks request buffers through a [`BufferMapper`]
#[derive(Clone)]
pub struct BufferAcquirer {
    mapper: Arc<dyn BufferMapper>,
}

impl BufferAcquirer {
    pub fn new(mapper: Arc<dyn BufferMapper>) -> Self {
        Self { mapper }
    }

    /// Lock one buffer and check what the mapper returned
    pub fn acquire(&self, requested: &ResolvedBuffer) -> Result<LockedBuffer> {
        let handle = requested.handle;
        let layout = BufferLayout::for_stream(&requested.stream)
            .map_err(|e| EmuCamError::buffer(handle, e.to_string()))?;

        let memory = self.mapper.lock(handle, &layout)?;
        // From here on the guard owns the lock, so early returns unlock it
        let buffer = LockedBuffer {
            handle,
            stream: requested.stream.clone(),
            layout,
            memory: Some(memory),
            mapper: self.mapper.clone(),
        };

        if buffer.data().len() != buffer.layout.size {
            return Err(EmuCamError::buffer(
                handle,
                format!(
                    "size mismatch: mapped {} bytes, layout needs {}",
                    buffer.data().len(),
                    buffer.layout.size
                ),
            ));
        }
        let aligned = buffer
            .memory
            .as_ref()
            .is_some_and(|m| m.is_aligned_to(buffer.layout.alignment));
        if !aligned {
            return Err(EmuCamError::buffer(
                handle,
                format!("mapping is not {}-byte aligned", buffer.layout.alignment),
            ));
        }

        Ok(buffer)
    }

    /// Lock every requested buffer, or none
    ///
    /// On the first failure all buffers already locked by this call are
    /// unlocked before the error is returned.
    pub fn acquire_buffers(&self, requested: &[ResolvedBuffer]) -> Result<Vec<LockedBuffer>> {
        let mut locked = Vec::with_capacity(requested.len());
        for buffer in requested {
            match self.acquire(buffer) {
                Ok(guard) => locked.push(guard),
                Err(e) => {
                    if !locked.is_empty() {
                        tracing::debug!(
                            "Releasing {} buffers after failing to acquire {}",
                            locked.len(),
                            buffer.handle
                        );
                    }
                    drop(locked);
                    return Err(e);
                }
            }
        }
        Ok(locked)
    }
}
