//! V4L2-Grab: a V4L2 frame capture library.
//!
//! This library reads the format a capture device is configured for, builds
//! a fixed ring of frame buffers (driver mmap buffers or DRM dumb buffers
//! shared as DMA-BUF) and runs a blocking acquire/release loop that hands
//! each completed frame to a consumer. Devices sit behind traits, so the
//! whole pipeline also runs against mock devices.

pub mod capture;
pub mod config;
#[allow(unsafe_code)]
pub mod device;
#[allow(unsafe_code)]
pub mod drm;
pub mod error;
pub mod format;
#[allow(unsafe_code)]
pub mod mmap;
pub mod pool;
pub mod query;
pub mod shared;
pub mod sink;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use capture::{CaptureLoop, CaptureSession, InitialQueue, Iteration, StopSignal, StreamState};
pub use config::{CaptureConfig, MemoryBackend};
pub use device::V4L2Device;
pub use drm::DrmDevice;
pub use error::{CaptureError, Result};
pub use pool::{Backend, BufferPool, BufferState};
pub use sink::ImageDumper;
pub use traits::{
    CaptureDevice, CaptureFormat, DeviceCapabilities, FourCC, Frame, FrameConsumer, QueueKind,
    SharedMemoryExporter,
};
