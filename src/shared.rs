//! Exportable buffers allocated in an external memory subsystem.
//!
//! A [`SharedBuffer`] is created in three steps: allocate an object, map it
//! locally, export it as a file descriptor. A failure at any step undoes the
//! earlier ones, so callers never see a half-exported buffer.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::AllocStep;
use crate::traits::{BufferObject, MappedRegion, Region, SharedMemoryExporter};

/// A failed reservation and the step it failed at.
#[derive(Debug, Error)]
#[error("{step} failed")]
pub struct ReserveError {
    /// Step that failed.
    pub step: AllocStep,
    /// OS error.
    pub source: io::Error,
}

/// Memory owned by an external subsystem, mapped locally and exported as an fd.
///
/// The exporter keeps the authoritative object handle. The fd only grants
/// access to the memory; dropping the buffer unmaps it, closes the fd and
/// destroys the object.
pub struct SharedBuffer {
    exporter: Rc<dyn SharedMemoryExporter>,
    object: BufferObject,
    local: Option<Region>,
    export: OwnedFd,
}

impl SharedBuffer {
    /// The object this buffer wraps.
    #[must_use]
    pub const fn object(&self) -> &BufferObject {
        &self.object
    }

    /// The exported fd, for queueing to another subsystem.
    #[must_use]
    pub fn export_fd(&self) -> BorrowedFd<'_> {
        self.export.as_fd()
    }

    /// Local view of the buffer memory.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self.local.as_ref() {
            Some(region) => region.as_bytes(),
            None => &[],
        }
    }

    /// Local view of the buffer memory, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self.local.as_mut() {
            Some(region) => region.as_bytes_mut(),
            None => &mut [],
        }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("object", &self.object)
            .field("export", &self.export)
            .finish_non_exhaustive()
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        drop(self.local.take());
        if let Err(err) = self.exporter.destroy_object(&self.object) {
            warn!(handle = self.object.handle, error = %err, "failed to destroy buffer object");
        }
    }
}

/// Reserve `size` bytes in the exporter's subsystem and export them.
///
/// `pitch` is forwarded to the exporter as a geometry hint.
pub fn reserve_exportable(
    exporter: &Rc<dyn SharedMemoryExporter>,
    size: u64,
    pitch: u32,
) -> Result<SharedBuffer, ReserveError> {
    let object = exporter
        .create_object(size, pitch)
        .map_err(|source| ReserveError {
            step: AllocStep::CreateObject,
            source,
        })?;

    let local = match exporter.map_object(&object) {
        Ok(region) => region,
        Err(source) => {
            discard(exporter.as_ref(), &object);
            return Err(ReserveError {
                step: AllocStep::MapObject,
                source,
            });
        }
    };

    let export = match exporter.export_object(&object) {
        Ok(fd) => fd,
        Err(source) => {
            drop(local);
            discard(exporter.as_ref(), &object);
            return Err(ReserveError {
                step: AllocStep::ExportObject,
                source,
            });
        }
    };

    debug!(
        handle = object.handle,
        size = object.size,
        "reserved exportable buffer"
    );
    Ok(SharedBuffer {
        exporter: Rc::clone(exporter),
        object,
        local: Some(local),
        export,
    })
}

fn discard(exporter: &dyn SharedMemoryExporter, object: &BufferObject) {
    if let Err(err) = exporter.destroy_object(object) {
        warn!(
            handle = object.handle,
            error = %err,
            "failed to destroy buffer object during unwind"
        );
    }
}
