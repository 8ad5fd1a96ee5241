//! Capture configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::capture::{InitialQueue, DEFAULT_WAIT_TIMEOUT};
use crate::drm::DEFAULT_CARD;
use crate::error::{CaptureError, Result};
use crate::pool::MIN_BUFFERS;

/// Where buffer memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryBackend {
    /// Driver buffers mapped into the process.
    #[default]
    Mmap,
    /// DRM dumb buffers imported by the device.
    DmaBuf,
}

impl FromStr for MemoryBackend {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mmap" => Ok(Self::Mmap),
            "dmabuf" => Ok(Self::DmaBuf),
            other => Err(CaptureError::InvalidConfig(format!(
                "unknown memory backend {other:?}, expected mmap or dmabuf"
            ))),
        }
    }
}

impl fmt::Display for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mmap => f.write_str("mmap"),
            Self::DmaBuf => f.write_str("dmabuf"),
        }
    }
}

impl FromStr for InitialQueue {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip-first" => Ok(Self::SkipFirst),
            "all" => Ok(Self::All),
            other => Err(CaptureError::InvalidConfig(format!(
                "unknown initial queue policy {other:?}, expected skip-first or all"
            ))),
        }
    }
}

/// Settings for one capture run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// V4L2 device node.
    pub device: PathBuf,
    /// DRM card used for DMA-BUF pools.
    pub drm_card: PathBuf,
    /// Buffers in the pool.
    pub buffer_count: u32,
    /// Buffer memory backend.
    pub memory: MemoryBackend,
    /// Buffers queued on start.
    pub initial_queue: InitialQueue,
    /// Readiness wait per loop iteration.
    pub wait_timeout: Duration,
    /// Where frames are dumped.
    pub output_dir: PathBuf,
    /// File name prefix for dumped frames.
    pub prefix: String,
    /// Stop after this many frames.
    pub frame_limit: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            drm_card: PathBuf::from(DEFAULT_CARD),
            buffer_count: 3,
            memory: MemoryBackend::default(),
            initial_queue: InitialQueue::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            output_dir: PathBuf::from("."),
            prefix: "cap".to_owned(),
            frame_limit: None,
        }
    }
}

impl CaptureConfig {
    /// Reject settings the capture loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < MIN_BUFFERS {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer count must be at least {MIN_BUFFERS}, got {}",
                self.buffer_count
            )));
        }
        if self.wait_timeout.is_zero() {
            return Err(CaptureError::InvalidConfig(
                "wait timeout must be non-zero".to_owned(),
            ));
        }
        if self.frame_limit == Some(0) {
            return Err(CaptureError::InvalidConfig(
                "frame limit must be non-zero".to_owned(),
            ));
        }
        if self.prefix.contains('/') {
            return Err(CaptureError::InvalidConfig(format!(
                "file prefix {:?} must not contain '/'",
                self.prefix
            )));
        }
        Ok(())
    }
}
