//! DRM dumb buffers exported as DMA-BUF fds.
//!
//! A dumb buffer is a linear scanout-capable allocation any KMS driver
//! provides. PRIME turns its GEM handle into a DMA-BUF fd a V4L2 device can
//! import with `V4L2_MEMORY_DMABUF`.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::mmap::MemoryMap;
use crate::traits::{BufferObject, Region, SharedMemoryExporter};

/// Primary node of the first DRM card.
pub const DEFAULT_CARD: &str = "/dev/dri/card0";

#[repr(C)]
#[derive(Debug, Default)]
struct CreateDumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct MapDumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DestroyDumb {
    handle: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct PrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

const fn drm_iowr(nr: u64, size: usize) -> u64 {
    const IOC_READ_WRITE: u64 = 3;
    const DRM_IOCTL_BASE: u64 = b'd' as u64;
    (IOC_READ_WRITE << 30) | ((size as u64) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const DRM_IOCTL_PRIME_HANDLE_TO_FD: u64 = drm_iowr(0x2D, mem::size_of::<PrimeHandle>());
const DRM_IOCTL_MODE_CREATE_DUMB: u64 = drm_iowr(0xB2, mem::size_of::<CreateDumb>());
const DRM_IOCTL_MODE_MAP_DUMB: u64 = drm_iowr(0xB3, mem::size_of::<MapDumb>());
const DRM_IOCTL_MODE_DESTROY_DUMB: u64 = drm_iowr(0xB4, mem::size_of::<DestroyDumb>());

#[allow(clippy::cast_sign_loss)]
const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
#[allow(clippy::cast_sign_loss)]
const DRM_RDWR: u32 = libc::O_RDWR as u32;

/// Bits per pixel of the byte-addressed dumb buffers we allocate.
const DUMB_BPP: u32 = 8;

/// Width and height of an 8 bpp dumb buffer holding `size` bytes laid out
/// `pitch` bytes per row. A zero pitch allocates a single row.
fn dumb_geometry(size: u64, pitch: u32) -> io::Result<(u32, u32)> {
    if size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "dumb buffer size must be non-zero",
        ));
    }
    let width = if pitch == 0 { size } else { u64::from(pitch) };
    let height = size.div_ceil(width);
    let too_large = |_| io::Error::new(io::ErrorKind::InvalidInput, "dumb buffer too large");
    Ok((
        u32::try_from(width).map_err(too_large)?,
        u32::try_from(height).map_err(too_large)?,
    ))
}

/// A DRM card opened for dumb buffer allocation.
#[derive(Debug)]
pub struct DrmDevice {
    card: File,
    path: PathBuf,
}

impl DrmDevice {
    /// Open a DRM card node (e.g. `/dev/dri/card0`).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let card = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| CaptureError::DeviceOpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "opened DRM card");
        Ok(Self {
            card,
            path: path.to_path_buf(),
        })
    }

    /// Path the card was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue a DRM ioctl, restarting on `EINTR` and `EAGAIN`.
    fn ioctl<T>(&self, request: u64, arg: &mut T) -> io::Result<()> {
        let ptr: *mut T = arg;
        loop {
            // SAFETY: the card fd is open for the lifetime of `self` and every
            // caller passes the argument struct encoded in `request`.
            #[allow(clippy::cast_possible_truncation)]
            let ret = unsafe { libc::ioctl(self.card.as_raw_fd(), request as _, ptr) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }
    }
}

impl SharedMemoryExporter for DrmDevice {
    fn create_object(&self, size: u64, pitch: u32) -> io::Result<BufferObject> {
        let (width, height) = dumb_geometry(size, pitch)?;
        let mut create = CreateDumb {
            height,
            width,
            bpp: DUMB_BPP,
            ..CreateDumb::default()
        };
        self.ioctl(DRM_IOCTL_MODE_CREATE_DUMB, &mut create)?;
        debug!(
            handle = create.handle,
            width,
            height,
            pitch = create.pitch,
            size = create.size,
            "created dumb buffer"
        );
        Ok(BufferObject {
            handle: create.handle,
            size: create.size,
        })
    }

    fn map_object(&self, object: &BufferObject) -> io::Result<Region> {
        let mut map = MapDumb {
            handle: object.handle,
            ..MapDumb::default()
        };
        self.ioctl(DRM_IOCTL_MODE_MAP_DUMB, &mut map)?;
        let len = usize::try_from(object.size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "object too large to map"))?;
        let region = MemoryMap::new(self.card.as_raw_fd(), map.offset, len)?;
        Ok(Box::new(region))
    }

    fn export_object(&self, object: &BufferObject) -> io::Result<OwnedFd> {
        let mut prime = PrimeHandle {
            handle: object.handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut prime)?;
        // SAFETY: PRIME_HANDLE_TO_FD returned a new fd that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    fn destroy_object(&self, object: &BufferObject) -> io::Result<()> {
        let mut destroy = DestroyDumb {
            handle: object.handle,
        };
        self.ioctl(DRM_IOCTL_MODE_DESTROY_DUMB, &mut destroy)
    }
}
