//! Capture device discovery and capability reporting.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::device::V4L2Device;
use crate::traits::{CaptureDevice, DeviceCapabilities};

/// `V4L2_CAP_*` bits and their names.
const CAPABILITY_NAMES: &[(u32, &str)] = &[
    (0x0000_0001, "VIDEO_CAPTURE"),
    (0x0000_0002, "VIDEO_OUTPUT"),
    (0x0000_0004, "VIDEO_OVERLAY"),
    (0x0000_0010, "VBI_CAPTURE"),
    (0x0000_0020, "VBI_OUTPUT"),
    (0x0000_0040, "SLICED_VBI_CAPTURE"),
    (0x0000_0080, "SLICED_VBI_OUTPUT"),
    (0x0000_0100, "RDS_CAPTURE"),
    (0x0000_0200, "VIDEO_OUTPUT_OVERLAY"),
    (0x0000_0400, "HW_FREQ_SEEK"),
    (0x0000_0800, "RDS_OUTPUT"),
    (0x0000_1000, "VIDEO_CAPTURE_MPLANE"),
    (0x0000_2000, "VIDEO_OUTPUT_MPLANE"),
    (0x0000_4000, "VIDEO_M2M_MPLANE"),
    (0x0000_8000, "VIDEO_M2M"),
    (0x0001_0000, "TUNER"),
    (0x0002_0000, "AUDIO"),
    (0x0004_0000, "RADIO"),
    (0x0008_0000, "MODULATOR"),
    (0x0010_0000, "SDR_CAPTURE"),
    (0x0020_0000, "EXT_PIX_FORMAT"),
    (0x0040_0000, "SDR_OUTPUT"),
    (0x0080_0000, "META_CAPTURE"),
    (0x0100_0000, "READWRITE"),
    (0x0200_0000, "ASYNCIO"),
    (0x0400_0000, "STREAMING"),
    (0x0800_0000, "META_OUTPUT"),
    (0x1000_0000, "TOUCH"),
    (0x2000_0000, "IO_MC"),
    (0x8000_0000, "DEVICE_CAPS"),
];

/// Names of the capability flags set in `bits`, lowest bit first. Unknown
/// bits are skipped.
#[must_use]
pub fn capability_names(bits: u32) -> Vec<&'static str> {
    CAPABILITY_NAMES
        .iter()
        .filter(|(flag, _)| bits & flag != 0)
        .map(|&(_, name)| name)
        .collect()
}

/// A capability mask printed as hex followed by its flag names.
struct Flags(u32);

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} {}", self.0, capability_names(self.0).join(" "))
    }
}

/// A capture device found during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device node.
    pub path: PathBuf,
    /// Reported capabilities.
    pub capabilities: DeviceCapabilities,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let caps = &self.capabilities;
        let (major, minor, patch) = caps.version;
        writeln!(f, "{}", self.path.display())?;
        writeln!(f, "  driver:       {}", caps.driver)?;
        writeln!(f, "  card:         {}", caps.card)?;
        writeln!(f, "  bus:          {}", caps.bus_info)?;
        writeln!(f, "  version:      {major}.{minor}.{patch}")?;
        writeln!(f, "  capabilities: {}", Flags(caps.capabilities))?;
        write!(f, "  device caps:  {}", Flags(caps.device_caps))
    }
}

/// Call `next` with 0, 1, 2, ... and collect results until the first `None`.
fn collect_sequential<T, F>(next: F) -> Vec<T>
where
    F: FnMut(usize) -> Option<T>,
{
    (0..).map_while(next).collect()
}

/// Open `/dev/video0`, `/dev/video1`, ... until one fails to open, and
/// report each device's capabilities.
#[must_use]
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    collect_sequential(|index| {
        let path = PathBuf::from(format!("/dev/video{index}"));
        match V4L2Device::open(&path) {
            Ok(device) => Some(DeviceInfo {
                capabilities: device.capabilities().clone(),
                path,
            }),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "stopping device enumeration");
                None
            }
        }
    })
}
