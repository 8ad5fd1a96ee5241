//! Fixed-size ring of frame buffers.
//!
//! Every buffer carries an ownership tag. The application may only touch a
//! buffer's bytes while it is [`BufferState::ReadyForConsumer`]; while it is
//! [`BufferState::QueuedToDevice`] the device may be writing into it.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{AllocStep, CaptureError, Result};
use crate::shared::{reserve_exportable, SharedBuffer};
use crate::traits::{
    BufferMemory, CaptureDevice, CaptureFormat, MemoryKind, QueueKind, Region,
    SharedMemoryExporter,
};

/// Smallest pool the capture loop can rotate through.
pub const MIN_BUFFERS: u32 = 2;

/// Who owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by nobody; not queued.
    Free,
    /// Owned by the device; may be written at any time.
    QueuedToDevice,
    /// Owned by the application; holds a completed frame.
    ReadyForConsumer,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::QueuedToDevice => f.write_str("queued-to-device"),
            Self::ReadyForConsumer => f.write_str("ready-for-consumer"),
        }
    }
}

/// Memory behind a buffer.
#[derive(Debug)]
pub enum Backing {
    /// Driver-allocated memory mapped into the process.
    Mapped(Region),
    /// Externally allocated memory imported by the device as a DMA-BUF.
    Shared(SharedBuffer),
}

impl Backing {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(region) => region.as_bytes(),
            Self::Shared(buffer) => buffer.as_bytes(),
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Mapped(region) => region.as_bytes_mut(),
            Self::Shared(buffer) => buffer.as_bytes_mut(),
        }
    }
}

/// Allocation strategy for a pool, chosen once at creation.
#[derive(Clone)]
pub enum Backend {
    /// `V4L2_MEMORY_MMAP`: the driver allocates, the pool maps.
    Mapped,
    /// `V4L2_MEMORY_DMABUF`: the exporter allocates, the device imports.
    Shared(Rc<dyn SharedMemoryExporter>),
}

impl Backend {
    /// Memory kind requested from the device.
    #[must_use]
    pub const fn memory(&self) -> MemoryKind {
        match self {
            Self::Mapped => MemoryKind::Mmap,
            Self::Shared(_) => MemoryKind::DmaBuf,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapped => f.write_str("Mapped"),
            Self::Shared(_) => f.write_str("Shared"),
        }
    }
}

/// One slot of the ring.
#[derive(Debug)]
pub struct FrameBuffer {
    index: u32,
    backing: Backing,
    length: u32,
    state: BufferState,
}

impl FrameBuffer {
    /// Pool index, stable for the buffer's lifetime.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Current owner.
    #[must_use]
    pub const fn state(&self) -> BufferState {
        self.state
    }

    /// Usable length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length as usize
    }

    /// Whether the buffer has no usable bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Memory behind the buffer.
    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Buffer contents, available only while the application owns it.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        if self.state != BufferState::ReadyForConsumer {
            return None;
        }
        let bytes = self.backing.as_bytes();
        bytes.get(..self.len().min(bytes.len()))
    }

    /// Mutable buffer contents, available only while the application owns it.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        if self.state != BufferState::ReadyForConsumer {
            return None;
        }
        let len = self.len();
        let bytes = self.backing.as_bytes_mut();
        let end = len.min(bytes.len());
        bytes.get_mut(..end)
    }

    /// Memory description for QBUF.
    pub(crate) fn memory(&self) -> BufferMemory<'_> {
        match &self.backing {
            Backing::Mapped(_) => BufferMemory::Mapped,
            Backing::Shared(buffer) => BufferMemory::DmaBuf {
                fd: buffer.export_fd(),
                length: self.length,
            },
        }
    }

    fn transition(&mut self, to: BufferState) -> Result<()> {
        let allowed = matches!(
            (self.state, to),
            (BufferState::Free | BufferState::ReadyForConsumer, BufferState::QueuedToDevice)
                | (BufferState::QueuedToDevice, BufferState::ReadyForConsumer)
        );
        if !allowed {
            return Err(CaptureError::InvalidTransition {
                index: self.index,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Ring of N buffers sharing one format and one backing strategy.
#[derive(Debug)]
pub struct BufferPool {
    queue: QueueKind,
    memory: MemoryKind,
    buffers: Vec<FrameBuffer>,
    device_buffers: bool,
}

impl BufferPool {
    /// Request `count` buffers from the device and back each one according
    /// to `backend`.
    ///
    /// Partial pools are never returned: if any buffer fails, the ones already
    /// set up are torn down before the error is returned.
    pub fn allocate<D: CaptureDevice + ?Sized>(
        device: &mut D,
        format: &CaptureFormat,
        count: u32,
        backend: &Backend,
    ) -> Result<Self> {
        if count < MIN_BUFFERS {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer pool needs at least {MIN_BUFFERS} buffers, got {count}"
            )));
        }

        let memory = backend.memory();
        let mut pool = Self {
            queue: format.queue,
            memory,
            buffers: Vec::with_capacity(count as usize),
            device_buffers: false,
        };

        let granted = device
            .request_buffers(format.queue, memory, count)
            .map_err(|source| CaptureError::RequestBuffersFailed {
                requested: count,
                memory,
                source,
            })?;
        pool.device_buffers = true;
        if granted < count {
            pool.release(&mut *device);
            return Err(CaptureError::InsufficientBuffers {
                requested: count,
                granted,
            });
        }

        for index in 0..count {
            match Self::create_buffer(&*device, format, index, backend) {
                Ok(buffer) => pool.buffers.push(buffer),
                Err(err) => {
                    pool.release(&mut *device);
                    return Err(err);
                }
            }
        }

        debug!(count, %memory, queue = %format.queue, "buffer pool allocated");
        Ok(pool)
    }

    fn create_buffer<D: CaptureDevice + ?Sized>(
        device: &D,
        format: &CaptureFormat,
        index: u32,
        backend: &Backend,
    ) -> Result<FrameBuffer> {
        let (backing, length) = match backend {
            Backend::Mapped => {
                let placement = device.query_buffer(format.queue, index).map_err(|source| {
                    CaptureError::AllocationFailed {
                        index,
                        step: AllocStep::QueryBuffer,
                        source,
                    }
                })?;
                let region = device.map_buffer(&placement).map_err(|source| {
                    CaptureError::AllocationFailed {
                        index,
                        step: AllocStep::MapBuffer,
                        source,
                    }
                })?;
                debug!(
                    index,
                    offset = placement.offset,
                    length = placement.length,
                    "mapped buffer"
                );
                (Backing::Mapped(region), placement.length)
            }
            Backend::Shared(exporter) => {
                let buffer = reserve_exportable(
                    exporter,
                    u64::from(format.size_image),
                    format.bytes_per_line,
                )
                .map_err(|err| CaptureError::AllocationFailed {
                    index,
                    step: err.step,
                    source: err.source,
                })?;
                debug!(
                    index,
                    handle = buffer.object().handle,
                    "reserved shared buffer"
                );
                (Backing::Shared(buffer), format.size_image)
            }
        };

        Ok(FrameBuffer {
            index,
            backing,
            length,
            state: BufferState::Free,
        })
    }

    /// Tear the pool down in reverse creation order and hand the driver's
    /// buffers back. Safe to call on partial or already released pools.
    pub fn release<D: CaptureDevice + ?Sized>(&mut self, device: &mut D) {
        self.unmap_all();
        if self.device_buffers {
            if let Err(err) = device.request_buffers(self.queue, self.memory, 0) {
                warn!(error = %err, "failed to free device buffers");
            }
            self.device_buffers = false;
        }
    }

    fn unmap_all(&mut self) {
        while let Some(buffer) = self.buffers.pop() {
            debug!(index = buffer.index, "releasing buffer");
            drop(buffer);
        }
    }

    /// Queue the pool belongs to.
    #[must_use]
    pub const fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Memory kind of every buffer.
    #[must_use]
    pub const fn memory(&self) -> MemoryKind {
        self.memory
    }

    /// Number of buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers (only after release).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer at `index`.
    #[must_use]
    pub fn buffer(&self, index: u32) -> Option<&FrameBuffer> {
        self.buffers.get(index as usize)
    }

    /// Buffer at `index`, mutably.
    pub fn buffer_mut(&mut self, index: u32) -> Option<&mut FrameBuffer> {
        self.buffers.get_mut(index as usize)
    }

    /// All buffers in index order.
    pub fn buffers(&self) -> impl Iterator<Item = &FrameBuffer> {
        self.buffers.iter()
    }

    /// State of buffer `index`.
    #[must_use]
    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.buffer(index).map(FrameBuffer::state)
    }

    /// How many buffers are in `state`.
    #[must_use]
    pub fn count_in(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }

    pub(crate) fn transition(&mut self, index: u32, to: BufferState) -> Result<()> {
        self.buffer_mut(index)
            .ok_or(CaptureError::UnknownBuffer(index))?
            .transition(to)
    }

    /// Every buffer back to `Free`, after the device dropped its queue.
    pub(crate) fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.state = BufferState::Free;
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.unmap_all();
    }
}
