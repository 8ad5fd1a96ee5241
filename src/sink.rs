//! Frame consumer that dumps raw frames to files.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{CaptureError, Result};
use crate::traits::{Frame, FrameConsumer};

/// Writes every frame to `<dir>/<prefix>_<nnnnn>_<FOURCC>_SIZE<w>x<h>.img`.
#[derive(Debug)]
pub struct ImageDumper {
    dir: PathBuf,
    prefix: String,
    written: u64,
}

impl ImageDumper {
    /// Create a dumper writing into `dir`, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| CaptureError::SinkFailed {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            prefix: prefix.to_owned(),
            written: 0,
        })
    }

    /// File a frame is written to.
    #[must_use]
    pub fn path_for(&self, frame: &Frame<'_>) -> PathBuf {
        self.dir.join(format!(
            "{}_{:05}_{}_SIZE{}x{}.img",
            self.prefix, frame.number, frame.fourcc, frame.width, frame.height
        ))
    }

    /// Frames written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }
}

impl FrameConsumer for ImageDumper {
    fn on_frame(&mut self, frame: &Frame<'_>) -> Result<()> {
        let path = self.path_for(frame);
        fs::write(&path, frame.data).map_err(|source| CaptureError::SinkFailed {
            path: path.clone(),
            source,
        })?;
        self.written += 1;
        info!(
            path = %path.display(),
            bytes = frame.byte_len(),
            bpp = frame.bytes_per_pixel,
            "wrote frame"
        );
        Ok(())
    }
}
