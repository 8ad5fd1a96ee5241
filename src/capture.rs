//! Streaming session and the acquire/release loop.
//!
//! A [`CaptureSession`] owns the device and its buffer pool and moves buffers
//! between the application and the device. A [`CaptureLoop`] drives a session:
//! wait, dequeue, hand the frame to a consumer, re-enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::{CaptureError, Result};
use crate::format::negotiate;
use crate::pool::{Backend, BufferPool, BufferState};
use crate::traits::{CaptureDevice, CaptureFormat, DequeuedBuffer, Frame, FrameConsumer, Readiness};

/// Readiness timeout used when none is configured.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Which buffers `start` hands to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialQueue {
    /// Enqueue buffers `1..N`, leaving buffer 0 free.
    #[default]
    SkipFirst,
    /// Enqueue every buffer.
    All,
}

impl InitialQueue {
    const fn first_index(self) -> u32 {
        match self {
            Self::SkipFirst => 1,
            Self::All => 0,
        }
    }
}

/// Streaming state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not streaming; every buffer is free.
    Stopped,
    /// STREAMON succeeded.
    Streaming,
}

/// A device with a negotiated format and an allocated buffer pool.
///
/// Dropping the session stops streaming and releases the pool.
pub struct CaptureSession<D: CaptureDevice> {
    device: D,
    format: CaptureFormat,
    pool: BufferPool,
    initial_queue: InitialQueue,
    state: StreamState,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Negotiate the device's format and allocate `buffer_count` buffers.
    pub fn open(
        mut device: D,
        buffer_count: u32,
        backend: &Backend,
        initial_queue: InitialQueue,
    ) -> Result<Self> {
        let format = negotiate(&device)?;
        let pool = BufferPool::allocate(&mut device, &format, buffer_count, backend)?;
        Ok(Self {
            device,
            format,
            pool,
            initial_queue,
            state: StreamState::Stopped,
        })
    }

    /// Queue the initial buffers and start streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.state == StreamState::Streaming {
            return Err(CaptureError::AlreadyStreaming);
        }

        if let Err(err) = self.queue_initial().and_then(|()| self.stream_on()) {
            self.abort_start();
            return Err(err);
        }

        self.state = StreamState::Streaming;
        info!(
            queued = self.pool.count_in(BufferState::QueuedToDevice),
            buffers = self.pool.len(),
            memory = %self.pool.memory(),
            "streaming started"
        );
        Ok(())
    }

    fn queue_initial(&mut self) -> Result<()> {
        let count = u32::try_from(self.pool.len()).unwrap_or(u32::MAX);
        for index in self.initial_queue.first_index()..count {
            self.enqueue(index)?;
        }
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.device
            .stream_on(self.format.queue)
            .map_err(|source| CaptureError::StreamOnFailed { source })
    }

    fn abort_start(&mut self) {
        if let Err(err) = self.device.stream_off(self.format.queue) {
            warn!(error = %err, "stream off after failed start");
        }
        self.pool.reclaim_all();
    }

    /// Stop streaming. Every buffer becomes free. Stopping a stopped session
    /// is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == StreamState::Stopped {
            return Ok(());
        }
        self.device
            .stream_off(self.format.queue)
            .map_err(|source| CaptureError::StreamOffFailed { source })?;
        self.pool.reclaim_all();
        self.state = StreamState::Stopped;
        info!("streaming stopped");
        Ok(())
    }

    /// Best-effort stop after a fatal error.
    fn abort(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop streaming after error");
        }
    }

    /// Block until a buffer is ready or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<Readiness> {
        self.device
            .wait_readable(timeout)
            .map_err(|source| CaptureError::WaitFailed { source })
    }

    /// Take one completed buffer from the device. The buffer becomes
    /// [`BufferState::ReadyForConsumer`].
    pub fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        let dequeued = self
            .device
            .dequeue(self.format.queue, self.pool.memory())
            .map_err(|source| CaptureError::DequeueFailed { source })?;
        self.pool
            .transition(dequeued.index, BufferState::ReadyForConsumer)?;
        trace!(
            index = dequeued.index,
            bytes_used = dequeued.bytes_used,
            sequence = dequeued.sequence,
            "dequeued buffer"
        );
        Ok(dequeued)
    }

    /// Hand a consumed buffer back to the device.
    pub fn requeue(&mut self, index: u32) -> Result<()> {
        self.enqueue(index)
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        let buffer = self
            .pool
            .buffer(index)
            .ok_or(CaptureError::UnknownBuffer(index))?;
        if buffer.state() == BufferState::QueuedToDevice {
            return Err(CaptureError::InvalidTransition {
                index,
                from: BufferState::QueuedToDevice,
                to: BufferState::QueuedToDevice,
            });
        }
        self.device
            .enqueue(self.format.queue, index, buffer.memory())
            .map_err(|source| CaptureError::EnqueueFailed { index, source })?;
        self.pool.transition(index, BufferState::QueuedToDevice)?;
        debug!(index, "enqueued buffer");
        Ok(())
    }

    /// View a dequeued buffer as frame `number`.
    ///
    /// The payload is `bytes_used` long, or the whole buffer when the driver
    /// reports zero.
    pub fn frame(&self, number: u64, dequeued: &DequeuedBuffer) -> Result<Frame<'_>> {
        let index = dequeued.index;
        let buffer = self
            .pool
            .buffer(index)
            .ok_or(CaptureError::UnknownBuffer(index))?;
        let data = buffer.data().ok_or(CaptureError::InvalidTransition {
            index,
            from: buffer.state(),
            to: BufferState::ReadyForConsumer,
        })?;
        let used = match dequeued.bytes_used as usize {
            0 => data.len(),
            n => n.min(data.len()),
        };

        Ok(Frame {
            number,
            buffer: index,
            width: self.format.width,
            height: self.format.height,
            fourcc: self.format.fourcc,
            bytes_per_pixel: self.format.bytes_per_pixel(),
            sequence: dequeued.sequence,
            timestamp: dequeued.timestamp,
            data: data.get(..used).unwrap_or(data),
        })
    }

    /// Current streaming state.
    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Whether the session is streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Streaming
    }

    /// Negotiated format.
    #[must_use]
    pub const fn format(&self) -> &CaptureFormat {
        &self.format
    }

    /// The buffer pool.
    #[must_use]
    pub const fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The underlying device.
    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// The underlying device, mutably. Queue and stream state must not be
    /// changed behind the session's back.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        self.abort();
        self.pool.release(&mut self.device);
    }
}

/// Cross-thread request to end a capture loop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop holding a clone of this signal to stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// A frame was delivered and its buffer re-enqueued.
    Delivered {
        /// Frame number.
        frame: u64,
        /// Buffer that carried it.
        buffer: u32,
    },
    /// The wait timed out.
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
    /// The stop signal is set or the session is not streaming.
    Stopped,
}

/// Acquire/release loop over a [`CaptureSession`].
#[derive(Debug)]
pub struct CaptureLoop {
    timeout: Duration,
    frames: u64,
    stop: StopSignal,
}

impl CaptureLoop {
    /// Create a loop waiting at most `timeout` per iteration.
    pub fn new(timeout: Duration, stop: StopSignal) -> Result<Self> {
        if timeout.is_zero() {
            return Err(CaptureError::InvalidConfig(
                "wait timeout must be non-zero".to_owned(),
            ));
        }
        Ok(Self {
            timeout,
            frames: 0,
            stop,
        })
    }

    /// Frames delivered so far. Survives stop and restart.
    #[must_use]
    pub const fn frames_delivered(&self) -> u64 {
        self.frames
    }

    /// The signal this loop watches.
    #[must_use]
    pub const fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Run one iteration. A fatal error stops the session before it is
    /// returned.
    pub fn step<D, C>(
        &mut self,
        session: &mut CaptureSession<D>,
        consumer: &mut C,
    ) -> Result<Iteration>
    where
        D: CaptureDevice,
        C: FrameConsumer + ?Sized,
    {
        match self.try_step(session, consumer) {
            Ok(iteration) => Ok(iteration),
            Err(err) => {
                session.abort();
                Err(err)
            }
        }
    }

    fn try_step<D, C>(
        &mut self,
        session: &mut CaptureSession<D>,
        consumer: &mut C,
    ) -> Result<Iteration>
    where
        D: CaptureDevice,
        C: FrameConsumer + ?Sized,
    {
        if self.stop.is_triggered() || !session.is_streaming() {
            return Ok(Iteration::Stopped);
        }

        match session.wait(self.timeout)? {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                trace!(timeout_ms = self.timeout.as_millis(), "wait timed out");
                return Ok(Iteration::TimedOut);
            }
            Readiness::Interrupted => {
                trace!("wait interrupted");
                return Ok(Iteration::Interrupted);
            }
        }
        if self.stop.is_triggered() {
            return Ok(Iteration::Stopped);
        }

        let dequeued = session.dequeue()?;
        let number = self.frames;
        {
            let frame = session.frame(number, &dequeued)?;
            trace!(
                frame = number,
                buffer = frame.buffer,
                bytes = frame.byte_len(),
                "delivering frame"
            );
            consumer.on_frame(&frame)?;
        }
        self.frames += 1;
        session.requeue(dequeued.index)?;

        Ok(Iteration::Delivered {
            frame: number,
            buffer: dequeued.index,
        })
    }

    /// Start the session if needed and deliver frames until the stop signal
    /// is triggered, then stop streaming. Returns the number of frames
    /// delivered by this call.
    pub fn run<D, C>(&mut self, session: &mut CaptureSession<D>, consumer: &mut C) -> Result<u64>
    where
        D: CaptureDevice,
        C: FrameConsumer + ?Sized,
    {
        if !session.is_streaming() {
            session.start()?;
        }
        let first = self.frames;
        while self.step(session, consumer)? != Iteration::Stopped {}
        session.stop()?;

        let delivered = self.frames - first;
        info!(delivered, total = self.frames, "capture loop finished");
        Ok(delivered)
    }
}
