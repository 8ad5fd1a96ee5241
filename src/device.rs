//! V4L2 device implementation using the v4l crate.
//!
//! The single-planar format comes from the crate's safe API. Capabilities,
//! buffer management and the multi-planar queue use raw ioctls on the same
//! handle, since the crate's streams own their buffers and only speak MMAP.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_capability, v4l2_format, v4l2_plane, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CaptureError, Result};
use crate::mmap::MemoryMap;
use crate::traits::{
    BufferMemory, BufferPlacement, CaptureDevice, CaptureFormat, DequeuedBuffer,
    DeviceCapabilities, FourCC, MemoryKind, QueueKind, Readiness, Region,
};

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    fd: RawFd,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device node (e.g. `/dev/video0`).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let open_failed = |source: io::Error| CaptureError::DeviceOpenFailed {
            path: path.to_path_buf(),
            source,
        };
        let device = Device::with_path(path).map_err(open_failed)?;
        let fd = device.handle().fd();
        let capabilities = query_capabilities(fd).map_err(open_failed)?;

        Ok(Self {
            device,
            fd,
            capabilities,
        })
    }

    /// Open `/dev/video<index>`.
    pub fn with_index(index: usize) -> Result<Self> {
        Self::open(format!("/dev/video{index}"))
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        raw_ioctl(self.fd, request, arg)
    }

    fn multi_planar_format(&self) -> io::Result<CaptureFormat> {
        // SAFETY: all-zero is a valid `v4l2_format`.
        let mut raw: v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = QueueKind::MultiPlanar.buf_type();
        self.ioctl(vidioc::VIDIOC_G_FMT, &mut raw)?;

        // SAFETY: the driver fills the `pix_mp` member for MPLANE queues.
        let pix = unsafe { raw.fmt.pix_mp };
        let plane_fmt = pix.plane_fmt;
        let first = plane_fmt[0];

        Ok(CaptureFormat {
            queue: QueueKind::MultiPlanar,
            fourcc: FourCC::from_u32(pix.pixelformat),
            width: pix.width,
            height: pix.height,
            bytes_per_line: first.bytesperline,
            size_image: first.sizeimage,
            planes: pix.num_planes,
        })
    }
}

fn raw_ioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    // SAFETY: callers keep `fd` open across the call and pass the argument
    // struct matching `request`.
    unsafe { v4l2::ioctl(fd, request, (arg as *mut T).cast()) }
}

/// NUL-terminated QUERYCAP string field.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or(bytes)).into_owned()
}

fn query_capabilities(fd: RawFd) -> io::Result<DeviceCapabilities> {
    // SAFETY: all-zero is a valid `v4l2_capability`.
    let mut raw: v4l2_capability = unsafe { mem::zeroed() };
    raw_ioctl(fd, vidioc::VIDIOC_QUERYCAP, &mut raw)?;
    Ok(capabilities_from(&raw))
}

/// Decode QUERYCAP. Drivers that predate per-node caps leave `device_caps`
/// unset, so the device-wide mask stands in for it.
fn capabilities_from(raw: &v4l2_capability) -> DeviceCapabilities {
    let device_caps = if raw.capabilities & DeviceCapabilities::DEVICE_CAPS == 0 {
        raw.capabilities
    } else {
        raw.device_caps
    };
    let [patch, minor, major, _] = raw.version.to_le_bytes();
    DeviceCapabilities {
        driver: c_string(&raw.driver),
        card: c_string(&raw.card),
        bus_info: c_string(&raw.bus_info),
        version: (major, minor, patch),
        capabilities: raw.capabilities,
        device_caps,
    }
}

/// Map a `poll` result for `POLLIN` onto a readiness outcome. Error events
/// without `POLLIN` (for example, nothing queued) are failures, not readiness.
fn readiness_from(ready: i32, revents: i16) -> io::Result<Readiness> {
    if ready == 0 {
        Ok(Readiness::TimedOut)
    } else if revents & libc::POLLIN != 0 {
        Ok(Readiness::Ready)
    } else {
        Err(io::Error::other(format!(
            "poll returned events {revents:#06x} without POLLIN"
        )))
    }
}

/// Zeroed QBUF/DQBUF/QUERYBUF argument for `queue`. For multi-planar queues
/// the buffer points at `planes`, which must outlive the ioctl.
fn raw_buffer(
    queue: QueueKind,
    memory: MemoryKind,
    index: u32,
    planes: &mut [v4l2_plane; 1],
) -> v4l2_buffer {
    // SAFETY: all-zero is a valid `v4l2_buffer`.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = queue.buf_type();
    buf.memory = memory.raw();
    if queue == QueueKind::MultiPlanar {
        buf.m.planes = planes.as_mut_ptr();
        buf.length = 1;
    }
    buf
}

fn zeroed_planes() -> [v4l2_plane; 1] {
    // SAFETY: all-zero is a valid `v4l2_plane`.
    unsafe { mem::zeroed() }
}

impl CaptureDevice for V4L2Device {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self, queue: QueueKind) -> io::Result<CaptureFormat> {
        match queue {
            QueueKind::SinglePlanar => {
                let fmt = self.device.format()?;
                Ok(CaptureFormat {
                    queue,
                    fourcc: FourCC::from(fmt.fourcc),
                    width: fmt.width,
                    height: fmt.height,
                    bytes_per_line: fmt.stride,
                    size_image: fmt.size,
                    planes: 1,
                })
            }
            QueueKind::MultiPlanar => self.multi_planar_format(),
        }
    }

    fn request_buffers(
        &mut self,
        queue: QueueKind,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32> {
        // SAFETY: all-zero is a valid `v4l2_requestbuffers`.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = queue.buf_type();
        req.memory = memory.raw();
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&self, queue: QueueKind, index: u32) -> io::Result<BufferPlacement> {
        let mut planes = zeroed_planes();
        let mut buf = raw_buffer(queue, MemoryKind::Mmap, index, &mut planes);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;

        let (offset, length) = match queue {
            // SAFETY: QUERYBUF on an MMAP buffer fills `m.offset`.
            QueueKind::SinglePlanar => (unsafe { buf.m.offset }, buf.length),
            // SAFETY: QUERYBUF on an MMAP plane fills `m.mem_offset`.
            QueueKind::MultiPlanar => (unsafe { planes[0].m.mem_offset }, planes[0].length),
        };
        Ok(BufferPlacement {
            index,
            offset: u64::from(offset),
            length,
        })
    }

    fn map_buffer(&self, placement: &BufferPlacement) -> io::Result<Region> {
        let map = MemoryMap::new(self.fd, placement.offset, placement.length as usize)?;
        Ok(Box::new(map))
    }

    fn enqueue(
        &mut self,
        queue: QueueKind,
        index: u32,
        memory: BufferMemory<'_>,
    ) -> io::Result<()> {
        let mut planes = zeroed_planes();
        let mut buf = raw_buffer(queue, memory.kind(), index, &mut planes);
        if let BufferMemory::DmaBuf { fd, length } = memory {
            match queue {
                QueueKind::SinglePlanar => {
                    buf.m.fd = fd.as_raw_fd();
                    buf.length = length;
                }
                QueueKind::MultiPlanar => {
                    planes[0].m.fd = fd.as_raw_fd();
                    planes[0].length = length;
                }
            }
        }
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue(&mut self, queue: QueueKind, memory: MemoryKind) -> io::Result<DequeuedBuffer> {
        let mut planes = zeroed_planes();
        let mut buf = raw_buffer(queue, memory, 0, &mut planes);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;

        let bytes_used = match queue {
            QueueKind::SinglePlanar => buf.bytesused,
            QueueKind::MultiPlanar => planes[0].bytesused,
        };

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = buf.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used,
            sequence: buf.sequence,
            timestamp: Duration::new(secs, nanos),
        })
    }

    fn stream_on(&mut self, queue: QueueKind) -> io::Result<()> {
        let mut buf_type = queue.buf_type();
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self, queue: QueueKind) -> io::Result<()> {
        let mut buf_type = queue.buf_type();
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pollfd` is a single valid entry for the duration of the call.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(Readiness::Interrupted),
                _ => Err(err),
            };
        }
        readiness_from(ready, pollfd.revents)
    }
}
