//! Capture queue selection and format negotiation.
//!
//! Negotiation is read-only: the format already configured on the device is
//! authoritative and is never changed here.

use tracing::info;

use crate::error::{CaptureError, Result};
use crate::traits::{CaptureDevice, CaptureFormat, DeviceCapabilities, QueueKind};

/// Pick the capture queue, preferring multi-planar over single-planar.
pub fn select_queue(caps: &DeviceCapabilities) -> Result<QueueKind> {
    if caps.can_capture_mplane() {
        Ok(QueueKind::MultiPlanar)
    } else if caps.can_capture() {
        Ok(QueueKind::SinglePlanar)
    } else {
        Err(CaptureError::UnsupportedDevice)
    }
}

/// Select the capture queue and read the device's current format on it.
pub fn negotiate<D: CaptureDevice + ?Sized>(device: &D) -> Result<CaptureFormat> {
    let queue = select_queue(device.capabilities())?;

    let format = device
        .format(queue)
        .map_err(|source| CaptureError::FormatQueryFailed { queue, source })?;

    if format.planes > 1 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "{} uses {} memory planes, only contiguous formats are supported",
            format.fourcc, format.planes
        )));
    }
    if format.size_image == 0 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "{} {}x{} reports a zero image size",
            format.fourcc, format.width, format.height
        )));
    }

    info!(
        %queue,
        fourcc = %format.fourcc,
        width = format.width,
        height = format.height,
        bytes_per_line = format.bytes_per_line,
        size = format.size_image,
        "negotiated capture format"
    );
    Ok(format)
}
