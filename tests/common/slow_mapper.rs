//! A buffer mapper whose import of one handle blocks until released

use crossbeam_channel::{unbounded, Receiver, Sender};
use emucam::backend::{BufferLayout, BufferMapper, HeapBufferMapper, NativeMemory};
use emucam::BufferHandle;
use std::sync::Arc;

/// Wraps a [`HeapBufferMapper`]; locking `slow` announces itself on
/// `entered` and then waits for a release token
pub struct SlowMapper {
    inner: Arc<HeapBufferMapper>,
    slow: BufferHandle,
    entered: Sender<BufferHandle>,
    release: Receiver<()>,
}

/// Test-side handles for a [`SlowMapper`]
pub struct SlowImport {
    pub entered: Receiver<BufferHandle>,
    pub release: Sender<()>,
}

pub fn slow_mapper(inner: Arc<HeapBufferMapper>, slow: BufferHandle) -> (SlowMapper, SlowImport) {
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    (
        SlowMapper {
            inner,
            slow,
            entered: entered_tx,
            release: release_rx,
        },
        SlowImport {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

impl BufferMapper for SlowMapper {
    fn lock(&self, handle: BufferHandle, layout: &BufferLayout) -> emucam::Result<NativeMemory> {
        if handle == self.slow {
            let _ = self.entered.send(handle);
            let _ = self.release.recv();
        }
        self.inner.lock(handle, layout)
    }

    fn unlock(&self, handle: BufferHandle, memory: NativeMemory) {
        self.inner.unlock(handle, memory)
    }
}
