//! Core traits and types for the capture pipeline.
//!
//! The capture core never talks to the kernel directly. It drives a
//! [`CaptureDevice`] (the V4L2 control surface) and, for DMA-BUF backed pools,
//! a [`SharedMemoryExporter`] (the DRM side). Both have real implementations
//! in [`crate::device`] and [`crate::drm`] and mock implementations for tests.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

use crate::error::Result;

/// Pixel format representation (e.g., YUYV, GREY, NV12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Decode the little-endian `u32` form used by V4L2 structures.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Encode to the little-endian `u32` form used by V4L2 structures.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// YVYU pixel format (4:2:2 packed).
    pub const YVYU: Self = Self::new(b"YVYU");
    /// VYUY pixel format (4:2:2 packed).
    pub const VYUY: Self = Self::new(b"VYUY");
    /// RGB565.
    pub const RGBP: Self = Self::new(b"RGBP");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// 32-bit RGB.
    pub const RGB4: Self = Self::new(b"RGB4");
    /// 32-bit BGR.
    pub const BGR4: Self = Self::new(b"BGR4");
    /// 32-bit XRGB 8:8:8:8.
    pub const XR24: Self = Self::new(b"XR24");
    /// 32-bit ARGB 8:8:8:8.
    pub const AR24: Self = Self::new(b"AR24");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");

    /// Bytes per pixel for packed single-plane encodings, `None` for
    /// compressed or planar ones.
    #[must_use]
    pub fn packed_depth(self) -> Option<u32> {
        match self {
            Self::GREY => Some(1),
            Self::YUYV | Self::UYVY | Self::YVYU | Self::VYUY | Self::RGBP => Some(2),
            Self::RGB3 | Self::BGR3 => Some(3),
            Self::RGB4 | Self::BGR4 | Self::XR24 | Self::AR24 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Which V4L2 capture queue a device is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// `V4L2_BUF_TYPE_VIDEO_CAPTURE`.
    SinglePlanar,
    /// `V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE`.
    MultiPlanar,
}

impl QueueKind {
    /// The `v4l2_buf_type` value for this queue.
    #[must_use]
    pub const fn buf_type(self) -> u32 {
        match self {
            Self::SinglePlanar => 1,
            Self::MultiPlanar => 9,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinglePlanar => f.write_str("single-planar"),
            Self::MultiPlanar => f.write_str("multi-planar"),
        }
    }
}

/// Where the memory behind a queued buffer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Driver-allocated memory mapped into the process (`V4L2_MEMORY_MMAP`).
    Mmap,
    /// Externally allocated memory passed as a DMA-BUF fd (`V4L2_MEMORY_DMABUF`).
    DmaBuf,
}

impl MemoryKind {
    /// The `v4l2_memory` value for this kind.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Mmap => 1,
            Self::DmaBuf => 4,
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mmap => f.write_str("mmap"),
            Self::DmaBuf => f.write_str("dmabuf"),
        }
    }
}

/// Negotiated capture format. Immutable for the lifetime of a buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Queue the format was read from.
    pub queue: QueueKind,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per line (stride).
    pub bytes_per_line: u32,
    /// Total frame size in bytes.
    pub size_image: u32,
    /// Number of memory planes.
    pub planes: u8,
}

impl CaptureFormat {
    /// Format for a tightly packed single-plane encoding.
    #[must_use]
    pub fn packed(queue: QueueKind, width: u32, height: u32, fourcc: FourCC) -> Self {
        let bytes_per_line = width * fourcc.packed_depth().unwrap_or(2);
        Self {
            queue,
            fourcc,
            width,
            height,
            bytes_per_line,
            size_image: bytes_per_line * height,
            planes: 1,
        }
    }

    /// Bytes per pixel of the negotiated encoding.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> u32 {
        self.fourcc.packed_depth().unwrap_or_else(|| {
            if self.width == 0 {
                0
            } else {
                self.bytes_per_line / self.width
            }
        })
    }
}

/// Device capability summary.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Driver version as (major, minor, patch).
    pub version: (u8, u8, u8),
    /// `V4L2_CAP_*` bits of the physical device as a whole.
    pub capabilities: u32,
    /// `V4L2_CAP_*` bits of this node. Queue selection reads these.
    pub device_caps: u32,
}

impl DeviceCapabilities {
    /// `V4L2_CAP_VIDEO_CAPTURE`.
    pub const VIDEO_CAPTURE: u32 = 0x0000_0001;
    /// `V4L2_CAP_VIDEO_CAPTURE_MPLANE`.
    pub const VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
    /// `V4L2_CAP_STREAMING`.
    pub const STREAMING: u32 = 0x0400_0000;
    /// `V4L2_CAP_DEVICE_CAPS`: the driver fills `device_caps`.
    pub const DEVICE_CAPS: u32 = 0x8000_0000;

    /// Whether the device has a single-planar capture queue.
    #[must_use]
    pub const fn can_capture(&self) -> bool {
        self.device_caps & Self::VIDEO_CAPTURE != 0
    }

    /// Whether the device has a multi-planar capture queue.
    #[must_use]
    pub const fn can_capture_mplane(&self) -> bool {
        self.device_caps & Self::VIDEO_CAPTURE_MPLANE != 0
    }

    /// Whether the device supports streaming I/O.
    #[must_use]
    pub const fn can_stream(&self) -> bool {
        self.device_caps & Self::STREAMING != 0
    }
}

/// Kernel-side placement of a driver-allocated buffer, as reported by QUERYBUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    /// Buffer index.
    pub index: u32,
    /// Offset to pass to mmap.
    pub offset: u64,
    /// Length in bytes.
    pub length: u32,
}

/// Memory description handed to the device when queueing a buffer.
#[derive(Debug, Clone, Copy)]
pub enum BufferMemory<'a> {
    /// The buffer is driver-owned mmap memory; the index is enough.
    Mapped,
    /// The buffer is an imported DMA-BUF.
    DmaBuf {
        /// Exported fd of the external buffer object.
        fd: BorrowedFd<'a>,
        /// Length of the buffer object in bytes.
        length: u32,
    },
}

impl BufferMemory<'_> {
    /// The memory kind this description belongs to.
    #[must_use]
    pub const fn kind(&self) -> MemoryKind {
        match self {
            Self::Mapped => MemoryKind::Mmap,
            Self::DmaBuf { .. } => MemoryKind::DmaBuf,
        }
    }
}

/// A buffer handed back by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Buffer index.
    pub index: u32,
    /// Bytes the device wrote into the buffer.
    pub bytes_used: u32,
    /// Driver sequence number.
    pub sequence: u32,
    /// Driver timestamp.
    pub timestamp: Duration,
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A completed buffer can be dequeued.
    Ready,
    /// The timeout elapsed with no event.
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
}

/// A process-local read/write view of buffer memory.
pub trait MappedRegion {
    /// The mapped bytes.
    fn as_bytes(&self) -> &[u8];

    /// The mapped bytes, mutably.
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

impl fmt::Debug for dyn MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.as_bytes().len())
            .finish()
    }
}

/// Owned mapping, unmapped on drop.
pub type Region = Box<dyn MappedRegion>;

/// Abstraction over the V4L2 control surface of a capture device.
///
/// Methods report raw OS errors; the capture core attaches context.
pub trait CaptureDevice {
    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Read the format currently configured on `queue`.
    fn format(&self, queue: QueueKind) -> io::Result<CaptureFormat>;

    /// Request `count` buffers; returns how many the driver allocated.
    /// A count of zero frees the driver's buffers.
    fn request_buffers(
        &mut self,
        queue: QueueKind,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32>;

    /// Query offset and length of a driver-allocated buffer.
    fn query_buffer(&self, queue: QueueKind, index: u32) -> io::Result<BufferPlacement>;

    /// Map a driver-allocated buffer into the process.
    fn map_buffer(&self, placement: &BufferPlacement) -> io::Result<Region>;

    /// Hand buffer `index` to the device.
    fn enqueue(&mut self, queue: QueueKind, index: u32, memory: BufferMemory<'_>) -> io::Result<()>;

    /// Take one completed buffer back from the device.
    fn dequeue(&mut self, queue: QueueKind, memory: MemoryKind) -> io::Result<DequeuedBuffer>;

    /// Start streaming on `queue`.
    fn stream_on(&mut self, queue: QueueKind) -> io::Result<()>;

    /// Stop streaming on `queue`; the driver drops every queued buffer.
    fn stream_off(&mut self, queue: QueueKind) -> io::Result<()>;

    /// Block until a buffer is ready or `timeout` elapses.
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness>;
}

impl<T: CaptureDevice + ?Sized> CaptureDevice for &mut T {
    fn capabilities(&self) -> &DeviceCapabilities {
        (**self).capabilities()
    }

    fn format(&self, queue: QueueKind) -> io::Result<CaptureFormat> {
        (**self).format(queue)
    }

    fn request_buffers(
        &mut self,
        queue: QueueKind,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32> {
        (**self).request_buffers(queue, memory, count)
    }

    fn query_buffer(&self, queue: QueueKind, index: u32) -> io::Result<BufferPlacement> {
        (**self).query_buffer(queue, index)
    }

    fn map_buffer(&self, placement: &BufferPlacement) -> io::Result<Region> {
        (**self).map_buffer(placement)
    }

    fn enqueue(
        &mut self,
        queue: QueueKind,
        index: u32,
        memory: BufferMemory<'_>,
    ) -> io::Result<()> {
        (**self).enqueue(queue, index, memory)
    }

    fn dequeue(&mut self, queue: QueueKind, memory: MemoryKind) -> io::Result<DequeuedBuffer> {
        (**self).dequeue(queue, memory)
    }

    fn stream_on(&mut self, queue: QueueKind) -> io::Result<()> {
        (**self).stream_on(queue)
    }

    fn stream_off(&mut self, queue: QueueKind) -> io::Result<()> {
        (**self).stream_off(queue)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        (**self).wait_readable(timeout)
    }
}

/// A buffer object allocated in an external subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferObject {
    /// Subsystem-local object handle.
    pub handle: u32,
    /// Allocated size in bytes (may exceed the requested size).
    pub size: u64,
}

/// Allocation and export surface of an external memory subsystem.
pub trait SharedMemoryExporter {
    /// Create a buffer object of at least `size` bytes. `pitch` is a
    /// geometry hint for subsystems that allocate 2D surfaces.
    fn create_object(&self, size: u64, pitch: u32) -> io::Result<BufferObject>;

    /// Map an object into the process.
    fn map_object(&self, object: &BufferObject) -> io::Result<Region>;

    /// Export an object as a file descriptor another subsystem can import.
    fn export_object(&self, object: &BufferObject) -> io::Result<OwnedFd>;

    /// Destroy an object. Exported fds keep the memory alive until closed.
    fn destroy_object(&self, object: &BufferObject) -> io::Result<()>;
}

/// A completed frame, borrowed from the buffer pool for the duration of a
/// consumer callback.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Loop-assigned frame number, starting at 0.
    pub number: u64,
    /// Pool index of the buffer holding the frame.
    pub buffer: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per pixel of the encoding.
    pub bytes_per_pixel: u32,
    /// Driver sequence number.
    pub sequence: u32,
    /// Driver timestamp.
    pub timestamp: Duration,
    /// Frame bytes.
    pub data: &'a [u8],
}

impl Frame<'_> {
    /// Number of valid bytes in the frame.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Receives frames synchronously from the capture loop.
///
/// The frame's memory goes back to the device as soon as `on_frame` returns.
pub trait FrameConsumer {
    /// Consume one frame.
    fn on_frame(&mut self, frame: &Frame<'_>) -> Result<()>;
}

impl<F> FrameConsumer for F
where
    F: FnMut(&Frame<'_>) -> Result<()>,
{
    fn on_frame(&mut self, frame: &Frame<'_>) -> Result<()> {
        self(frame)
    }
}
