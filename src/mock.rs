//! Mock device and exporter for testing without hardware.
//!
//! Buffer memory is backed by temporary files mapped with the same
//! [`MemoryMap`] the real device uses, so "device" writes made through the
//! file show up in the pool's mappings exactly like DMA would.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::rc::Rc;
use std::time::Duration;

use crate::capture::StopSignal;
use crate::mmap::MemoryMap;
use crate::traits::{
    BufferMemory, BufferObject, BufferPlacement, CaptureDevice, CaptureFormat, DequeuedBuffer,
    DeviceCapabilities, FourCC, MappedRegion, MemoryKind, QueueKind, Readiness, Region,
    SharedMemoryExporter,
};

/// A mapping that counts itself in a shared live-mapping counter.
struct TrackedRegion {
    inner: MemoryMap,
    live: Rc<Cell<usize>>,
}

impl TrackedRegion {
    fn map(file: &File, len: usize, live: &Rc<Cell<usize>>) -> io::Result<Region> {
        let inner = MemoryMap::new(file.as_raw_fd(), 0, len)?;
        live.set(live.get() + 1);
        Ok(Box::new(Self {
            inner,
            live: Rc::clone(live),
        }))
    }
}

impl MappedRegion for TrackedRegion {
    fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.inner.as_bytes_mut()
    }
}

impl Drop for TrackedRegion {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

fn sized_tempfile(size: u64) -> io::Result<File> {
    let file = tempfile::tempfile()?;
    file.set_len(size.max(1))?;
    Ok(file)
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

struct MockSlot {
    storage: Option<File>,
    imported: Option<File>,
    queued: bool,
}

/// Injected device failures.
#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    map_at: Option<u32>,
    enqueue_at: Option<u32>,
    dequeue: bool,
    stream_on: bool,
    stream_off: bool,
    wait: bool,
}

/// Mock capture device for testing without hardware.
///
/// Frames pushed with [`MockDevice::push_frame`] are written into queued
/// buffers in queue order, the way a real driver fills them.
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: CaptureFormat,
    buffer_limit: u32,
    memory: Option<MemoryKind>,
    slots: Vec<MockSlot>,
    queue_order: VecDeque<u32>,
    pending: VecDeque<Vec<u8>>,
    scripted_waits: RefCell<VecDeque<Readiness>>,
    stop_on_wait: RefCell<Option<StopSignal>>,
    streaming: bool,
    sequence: u32,
    faults: Faults,
    live_maps: Rc<Cell<usize>>,
    enqueue_log: Vec<u32>,
    stream_off_calls: u32,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings: single-planar
    /// streaming capture, 640x480 YUYV.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                version: (1, 0, 0),
                capabilities: DeviceCapabilities::VIDEO_CAPTURE
                    | DeviceCapabilities::STREAMING
                    | DeviceCapabilities::DEVICE_CAPS,
                device_caps: DeviceCapabilities::VIDEO_CAPTURE | DeviceCapabilities::STREAMING,
            },
            format: CaptureFormat::packed(QueueKind::SinglePlanar, 640, 480, FourCC::YUYV),
            buffer_limit: 32,
            memory: None,
            slots: Vec::new(),
            queue_order: VecDeque::new(),
            pending: VecDeque::new(),
            scripted_waits: RefCell::new(VecDeque::new()),
            stop_on_wait: RefCell::new(None),
            streaming: false,
            sequence: 0,
            faults: Faults::default(),
            live_maps: Rc::new(Cell::new(0)),
            enqueue_log: Vec::new(),
            stream_off_calls: 0,
        }
    }

    /// Set the format reported by the device.
    #[must_use]
    pub fn with_format(mut self, format: CaptureFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the node capability bits.
    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.capabilities.device_caps = flags;
        self
    }

    /// Grant at most `limit` buffers.
    #[must_use]
    pub fn with_buffer_limit(mut self, limit: u32) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Fail mapping buffer `index`.
    #[must_use]
    pub fn with_map_fault(mut self, index: u32) -> Self {
        self.faults.map_at = Some(index);
        self
    }

    /// Fail queueing buffer `index`.
    #[must_use]
    pub fn with_enqueue_fault(mut self, index: u32) -> Self {
        self.faults.enqueue_at = Some(index);
        self
    }

    /// Fail every dequeue.
    #[must_use]
    pub fn with_dequeue_fault(mut self) -> Self {
        self.faults.dequeue = true;
        self
    }

    /// Fail STREAMON.
    #[must_use]
    pub fn with_stream_on_fault(mut self) -> Self {
        self.faults.stream_on = true;
        self
    }

    /// Fail STREAMOFF.
    #[must_use]
    pub fn with_stream_off_fault(mut self) -> Self {
        self.faults.stream_off = true;
        self
    }

    /// Fail every readiness wait.
    #[must_use]
    pub fn with_wait_fault(mut self) -> Self {
        self.faults.wait = true;
        self
    }

    /// Clear the STREAMOFF fault.
    pub fn heal_stream_off(&mut self) {
        self.faults.stream_off = false;
    }

    /// Queue a frame for the "sensor" to produce.
    pub fn push_frame(&mut self, data: &[u8]) {
        self.pending.push_back(data.to_vec());
    }

    /// Force the next readiness wait outcome.
    pub fn script_wait(&mut self, outcome: Readiness) {
        self.scripted_waits.get_mut().push_back(outcome);
    }

    /// Trigger `stop` during the next readiness wait, as if another thread
    /// asked for a stop while the wait was blocked.
    pub fn stop_during_wait(&mut self, stop: StopSignal) {
        *self.stop_on_wait.get_mut() = Some(stop);
    }

    /// Fail queueing buffer `index` from now on.
    pub fn fail_enqueue(&mut self, index: u32) {
        self.faults.enqueue_at = Some(index);
    }

    /// Number of live buffer mappings.
    pub fn live_maps(&self) -> usize {
        self.live_maps.get()
    }

    /// Number of buffers currently allocated by REQBUFS.
    pub fn allocated_buffers(&self) -> usize {
        self.slots.len()
    }

    /// Whether the device is streaming.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Every QBUF index in call order.
    pub fn enqueue_log(&self) -> &[u32] {
        &self.enqueue_log
    }

    /// Indices currently held by the device, in fill order.
    pub fn queued(&self) -> Vec<u32> {
        self.queue_order.iter().copied().collect()
    }

    /// Number of STREAMOFF calls, successful or not.
    pub const fn stream_off_calls(&self) -> u32 {
        self.stream_off_calls
    }

    fn slot(&self, index: u32) -> io::Result<&MockSlot> {
        self.slots.get(index as usize).ok_or_else(einval)
    }

    fn slot_mut(&mut self, index: u32) -> io::Result<&mut MockSlot> {
        self.slots.get_mut(index as usize).ok_or_else(einval)
    }
}

impl CaptureDevice for MockDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self, queue: QueueKind) -> io::Result<CaptureFormat> {
        Ok(CaptureFormat {
            queue,
            ..self.format.clone()
        })
    }

    fn request_buffers(
        &mut self,
        _queue: QueueKind,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32> {
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.slots.clear();
        self.queue_order.clear();
        if count == 0 {
            self.memory = None;
            return Ok(0);
        }

        let granted = count.min(self.buffer_limit);
        for _ in 0..granted {
            let storage = match memory {
                MemoryKind::Mmap => Some(sized_tempfile(u64::from(self.format.size_image))?),
                MemoryKind::DmaBuf => None,
            };
            self.slots.push(MockSlot {
                storage,
                imported: None,
                queued: false,
            });
        }
        self.memory = Some(memory);
        Ok(granted)
    }

    fn query_buffer(&self, _queue: QueueKind, index: u32) -> io::Result<BufferPlacement> {
        self.slot(index)?;
        Ok(BufferPlacement {
            index,
            offset: u64::from(index) * 4096,
            length: self.format.size_image,
        })
    }

    fn map_buffer(&self, placement: &BufferPlacement) -> io::Result<Region> {
        if self.faults.map_at == Some(placement.index) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let storage = self
            .slot(placement.index)?
            .storage
            .as_ref()
            .ok_or_else(einval)?;
        TrackedRegion::map(storage, placement.length as usize, &self.live_maps)
    }

    fn enqueue(
        &mut self,
        _queue: QueueKind,
        index: u32,
        memory: BufferMemory<'_>,
    ) -> io::Result<()> {
        if self.faults.enqueue_at == Some(index) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if self.memory != Some(memory.kind()) {
            return Err(einval());
        }
        let slot = self.slot_mut(index)?;
        if slot.queued {
            return Err(einval());
        }
        if let BufferMemory::DmaBuf { fd, .. } = memory {
            slot.imported = Some(File::from(fd.try_clone_to_owned()?));
        }
        slot.queued = true;
        self.queue_order.push_back(index);
        self.enqueue_log.push(index);
        Ok(())
    }

    fn dequeue(&mut self, _queue: QueueKind, _memory: MemoryKind) -> io::Result<DequeuedBuffer> {
        if self.faults.dequeue {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if !self.streaming {
            return Err(einval());
        }
        if self.pending.is_empty() || self.queue_order.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        let (Some(data), Some(index)) = (self.pending.pop_front(), self.queue_order.pop_front())
        else {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        };

        let slot = self.slot_mut(index)?;
        let target = slot
            .imported
            .as_ref()
            .or(slot.storage.as_ref())
            .ok_or_else(einval)?;
        target.write_all_at(&data, 0)?;
        slot.queued = false;

        let sequence = self.sequence;
        self.sequence += 1;
        Ok(DequeuedBuffer {
            index,
            bytes_used: u32::try_from(data.len()).map_err(|_| einval())?,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33),
        })
    }

    fn stream_on(&mut self, _queue: QueueKind) -> io::Result<()> {
        if self.faults.stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self, _queue: QueueKind) -> io::Result<()> {
        self.stream_off_calls += 1;
        if self.faults.stream_off {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = false;
        self.queue_order.clear();
        for slot in &mut self.slots {
            slot.queued = false;
        }
        Ok(())
    }

    fn wait_readable(&self, _timeout: Duration) -> io::Result<Readiness> {
        if self.faults.wait {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if let Some(stop) = self.stop_on_wait.borrow_mut().take() {
            stop.trigger();
        }
        if let Some(outcome) = self.scripted_waits.borrow_mut().pop_front() {
            return Ok(outcome);
        }
        if self.streaming && !self.pending.is_empty() && !self.queue_order.is_empty() {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::TimedOut)
        }
    }
}

/// Which exporter step to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFault {
    /// Object creation.
    Create,
    /// Local mapping.
    Map,
    /// Export as fd.
    Export,
}

/// Mock external memory subsystem backed by temporary files.
pub struct MockExporter {
    objects: RefCell<HashMap<u32, File>>,
    next_handle: Cell<u32>,
    fault: Option<(ExportFault, u32)>,
    calls: RefCell<HashMap<ExportFault, u32>>,
    live_maps: Rc<Cell<usize>>,
}

impl Default for MockExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExporter {
    /// Create an exporter that never fails.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            fault: None,
            calls: RefCell::new(HashMap::new()),
            live_maps: Rc::new(Cell::new(0)),
        }
    }

    /// Fail every call of `step`.
    #[must_use]
    pub fn with_fault(self, step: ExportFault) -> Self {
        self.with_fault_after(step, 0)
    }

    /// Let `step` succeed `successes` times, then fail.
    #[must_use]
    pub fn with_fault_after(mut self, step: ExportFault, successes: u32) -> Self {
        self.fault = Some((step, successes));
        self
    }

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.objects.borrow().len()
    }

    /// Live local mappings.
    pub fn live_maps(&self) -> usize {
        self.live_maps.get()
    }

    fn check(&self, step: ExportFault) -> io::Result<()> {
        let mut calls = self.calls.borrow_mut();
        let count = calls.entry(step).or_insert(0);
        let seen = *count;
        *count += 1;
        match self.fault {
            Some((fault, successes)) if fault == step && seen >= successes => {
                Err(io::Error::from_raw_os_error(libc::ENOMEM))
            }
            _ => Ok(()),
        }
    }

    fn with_object<T>(
        &self,
        object: &BufferObject,
        f: impl FnOnce(&File) -> io::Result<T>,
    ) -> io::Result<T> {
        let objects = self.objects.borrow();
        let file = objects
            .get(&object.handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        f(file)
    }
}

impl SharedMemoryExporter for MockExporter {
    fn create_object(&self, size: u64, _pitch: u32) -> io::Result<BufferObject> {
        self.check(ExportFault::Create)?;
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        let file = sized_tempfile(size)?;
        self.objects.borrow_mut().insert(handle, file);
        Ok(BufferObject { handle, size })
    }

    fn map_object(&self, object: &BufferObject) -> io::Result<Region> {
        self.check(ExportFault::Map)?;
        let len = usize::try_from(object.size).map_err(|_| einval())?;
        let live = &self.live_maps;
        self.with_object(object, |file| TrackedRegion::map(file, len, live))
    }

    fn export_object(&self, object: &BufferObject) -> io::Result<OwnedFd> {
        self.check(ExportFault::Export)?;
        self.with_object(object, |file| Ok(OwnedFd::from(file.try_clone()?)))
    }

    fn destroy_object(&self, object: &BufferObject) -> io::Result<()> {
        self.objects
            .borrow_mut()
            .remove(&object.handle)
            .map(drop)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey_2x2() -> CaptureFormat {
        CaptureFormat::packed(QueueKind::SinglePlanar, 2, 2, FourCC::GREY)
    }

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture());
        assert!(device.capabilities().can_stream());
    }

    #[test]
    fn test_mock_fills_buffers_in_queue_order() {
        let mut device = MockDevice::new().with_format(grey_2x2());
        let queue = QueueKind::SinglePlanar;
        device
            .request_buffers(queue, MemoryKind::Mmap, 2)
            .expect("reqbufs failed");
        let placement = device.query_buffer(queue, 1).expect("querybuf failed");
        let region = device.map_buffer(&placement).expect("map failed");

        for index in [1, 0] {
            device
                .enqueue(queue, index, BufferMemory::Mapped)
                .expect("qbuf failed");
        }
        device.stream_on(queue).expect("streamon failed");

        assert_eq!(
            device.wait_readable(Duration::ZERO).expect("wait failed"),
            Readiness::TimedOut
        );
        device.push_frame(&[1, 2, 3, 4]);
        assert_eq!(
            device.wait_readable(Duration::ZERO).expect("wait failed"),
            Readiness::Ready
        );

        let buffer = device
            .dequeue(queue, MemoryKind::Mmap)
            .expect("dqbuf failed");
        assert_eq!(buffer.index, 1);
        assert_eq!(buffer.bytes_used, 4);
        assert_eq!(region.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(device.queued(), vec![0]);
    }

    #[test]
    fn test_mock_rejects_double_enqueue() {
        let mut device = MockDevice::new();
        let queue = QueueKind::SinglePlanar;
        device
            .request_buffers(queue, MemoryKind::Mmap, 2)
            .expect("reqbufs failed");
        device
            .enqueue(queue, 0, BufferMemory::Mapped)
            .expect("qbuf failed");
        assert!(device.enqueue(queue, 0, BufferMemory::Mapped).is_err());
    }

    #[test]
    fn test_mock_exporter_tracks_objects() {
        let exporter = MockExporter::new();
        let object = exporter.create_object(64, 0).expect("create failed");
        assert_eq!(exporter.live_objects(), 1);

        let region = exporter.map_object(&object).expect("map failed");
        assert_eq!(region.as_bytes().len(), 64);
        assert_eq!(exporter.live_maps(), 1);
        drop(region);
        assert_eq!(exporter.live_maps(), 0);

        exporter.destroy_object(&object).expect("destroy failed");
        assert_eq!(exporter.live_objects(), 0);
        assert!(exporter.destroy_object(&object).is_err());
    }
}
