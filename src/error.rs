//! Error type for capture operations.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pool::BufferState;
use crate::traits::{MemoryKind, QueueKind};

/// Pool allocation step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStep {
    /// QUERYBUF for a driver-allocated buffer.
    QueryBuffer,
    /// mmap of a driver-allocated buffer.
    MapBuffer,
    /// Creating the external buffer object.
    CreateObject,
    /// Mapping the external buffer object.
    MapObject,
    /// Exporting the external buffer object as an fd.
    ExportObject,
}

impl fmt::Display for AllocStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Self::QueryBuffer => "buffer query",
            Self::MapBuffer => "buffer mapping",
            Self::CreateObject => "object creation",
            Self::MapObject => "object mapping",
            Self::ExportObject => "object export",
        };
        f.write_str(step)
    }
}

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A device node could not be opened.
    #[error("failed to open {}", .path.display())]
    DeviceOpenFailed {
        /// Device node path.
        path: PathBuf,
        /// OS error.
        source: io::Error,
    },

    /// The device exposes no usable capture queue.
    #[error("device supports neither multi-planar nor single-planar capture")]
    UnsupportedDevice,

    /// Reading the current format failed.
    #[error("failed to read the {queue} capture format")]
    FormatQueryFailed {
        /// Queue the format was read from.
        queue: QueueKind,
        /// OS error.
        source: io::Error,
    },

    /// The configured format cannot be pooled.
    #[error("unsupported capture format: {0}")]
    UnsupportedFormat(String),

    /// REQBUFS was rejected.
    #[error("request for {requested} {memory} buffers failed")]
    RequestBuffersFailed {
        /// Buffers requested.
        requested: u32,
        /// Memory kind requested.
        memory: MemoryKind,
        /// OS error.
        source: io::Error,
    },

    /// The driver allocated fewer buffers than requested.
    #[error("device granted {granted} buffers, {requested} required")]
    InsufficientBuffers {
        /// Buffers requested.
        requested: u32,
        /// Buffers granted.
        granted: u32,
    },

    /// Mapping or reserving memory for a buffer failed.
    #[error("buffer {index}: {step} failed")]
    AllocationFailed {
        /// Buffer index.
        index: u32,
        /// Step that failed.
        step: AllocStep,
        /// OS error.
        source: io::Error,
    },

    /// QBUF was rejected.
    #[error("failed to enqueue buffer {index}")]
    EnqueueFailed {
        /// Buffer index.
        index: u32,
        /// OS error.
        source: io::Error,
    },

    /// DQBUF was rejected.
    #[error("failed to dequeue a buffer")]
    DequeueFailed {
        /// OS error.
        source: io::Error,
    },

    /// STREAMON was rejected.
    #[error("failed to start streaming")]
    StreamOnFailed {
        /// OS error.
        source: io::Error,
    },

    /// STREAMOFF was rejected.
    #[error("failed to stop streaming")]
    StreamOffFailed {
        /// OS error.
        source: io::Error,
    },

    /// The readiness wait failed (not a timeout).
    #[error("readiness wait failed")]
    WaitFailed {
        /// OS error.
        source: io::Error,
    },

    /// A buffer ownership transition out of order.
    #[error("buffer {index} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Buffer index.
        index: u32,
        /// Current state.
        from: BufferState,
        /// Requested state.
        to: BufferState,
    },

    /// The device returned an index outside the pool.
    #[error("device returned unknown buffer index {0}")]
    UnknownBuffer(u32),

    /// `start` was called on a streaming session.
    #[error("session is already streaming")]
    AlreadyStreaming,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Writing a frame out failed.
    #[error("failed to write frame to {}", .path.display())]
    SinkFailed {
        /// Output path.
        path: PathBuf,
        /// OS error.
        source: io::Error,
    },
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
