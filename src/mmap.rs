//! Shared read/write memory mappings.

use std::io;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::slice;

use crate::traits::MappedRegion;

/// A `MAP_SHARED` read/write mapping of `len` bytes of a file descriptor.
///
/// The mapping is released with `munmap` on drop. It does not keep the file
/// descriptor open; the kernel holds its own reference for the mapping's
/// lifetime.
#[derive(Debug)]
pub struct MemoryMap {
    ptr: NonNull<u8>,
    len: usize,
}

impl MemoryMap {
    /// Map `len` bytes of `fd` starting at `offset`.
    pub fn new(fd: RawFd, offset: u64, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mmap offset out of range"))?;

        // SAFETY: a fresh mapping at a kernel-chosen address aliases no Rust
        // object; failure is reported through MAP_FAILED.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Never true for a constructed map.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl MappedRegion for MemoryMap {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees a unique borrow.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        // SAFETY: the region was returned by mmap with this exact length.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            tracing::warn!(
                len = self.len,
                error = %io::Error::last_os_error(),
                "munmap failed"
            );
        }
    }
}
