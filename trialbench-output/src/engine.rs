use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;
use trialbench_core::HardwareError;
use trialbench_timing::Timer;

/// How a write lines up with what the engine already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMethod {
    /// Overwrite from `offset`, which may be anywhere up to the current end.
    WritePosition,
    /// Append exactly at the current end.
    SpaceAvailable,
}

/// Samples an engine holds for one output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBuffer {
    lb: u64,
    samples: VecDeque<f64>,
    capacity: usize,
}

impl ChannelBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lb: 0,
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn lb(&self) -> u64 {
        self.lb
    }

    pub fn ub(&self) -> u64 {
        self.lb + self.samples.len() as u64
    }

    pub fn get(&self, lb: u64, ub: u64) -> Option<Vec<f64>> {
        if lb < self.lb || ub > self.ub() || lb > ub {
            return None;
        }
        let start = (lb - self.lb) as usize;
        let end = (ub - self.lb) as usize;
        Some(self.samples.range(start..end).copied().collect())
    }

    fn write(&mut self, offset: u64, data: &[f64]) {
        if offset <= self.lb {
            self.samples.clear();
            self.lb = offset;
        } else {
            self.samples.truncate((offset - self.lb) as usize);
        }
        self.samples.extend(data.iter().copied());
        let overflow = self.samples.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.samples.drain(..overflow);
            self.lb += overflow as u64;
        }
    }
}

/// Write-cursor state guarded by an engine lock.
#[derive(Debug, Clone, Default)]
pub struct HwBuffer {
    channels: BTreeMap<String, ChannelBuffer>,
}

impl HwBuffer {
    pub fn add_channel(&mut self, name: impl Into<String>, capacity: usize) {
        self.channels.insert(name.into(), ChannelBuffer::new(capacity));
    }

    pub fn channel(&self, name: &str) -> Result<&ChannelBuffer, HardwareError> {
        self.channels
            .get(name)
            .ok_or_else(|| HardwareError::UnknownChannel(name.to_string()))
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// One past the last sample written to `channel`.
    pub fn ub(&self, channel: &str) -> Result<u64, HardwareError> {
        self.channel(channel).map(ChannelBuffer::ub)
    }

    /// Writes `samples` at `offset`. Fails without touching the channel if
    /// `offset` is before `earliest`, the first sample the hardware has not
    /// yet consumed.
    pub fn write(
        &mut self,
        channel: &str,
        offset: u64,
        samples: &[f64],
        method: UpdateMethod,
        earliest: u64,
    ) -> Result<(), HardwareError> {
        let buffer = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| HardwareError::UnknownChannel(channel.to_string()))?;
        let ub = buffer.ub();
        let aligned = match method {
            UpdateMethod::SpaceAvailable => offset == ub,
            UpdateMethod::WritePosition => offset <= ub,
        };
        if !aligned {
            return Err(HardwareError::OffsetMismatch {
                channel: channel.to_string(),
                offset,
                upper_bound: ub,
            });
        }
        if samples.is_empty() {
            return Ok(());
        }
        if offset < earliest {
            return Err(HardwareError::BufferUnderrun {
                channel: channel.to_string(),
                offset,
                earliest,
            });
        }
        trace!(channel, offset, n = samples.len(), "writing to hardware buffer");
        buffer.write(offset, samples);
        Ok(())
    }
}

/// Per-engine mutual exclusion with acquire/release accounting.
#[derive(Debug, Default)]
pub struct EngineLock {
    state: Mutex<HwBuffer>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl EngineLock {
    pub fn new(buffer: HwBuffer) -> Self {
        Self {
            state: Mutex::new(buffer),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> EngineGuard<'_> {
        let guard = self.state.lock();
        self.acquired.fetch_add(1, Ordering::AcqRel);
        EngineGuard { guard, lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }
}

/// Held engine lock. Dropping it releases the lock on every exit path.
pub struct EngineGuard<'a> {
    guard: MutexGuard<'a, HwBuffer>,
    lock: &'a EngineLock,
}

impl Deref for EngineGuard<'_> {
    type Target = HwBuffer;

    fn deref(&self) -> &HwBuffer {
        &self.guard
    }
}

impl DerefMut for EngineGuard<'_> {
    fn deref_mut(&mut self) -> &mut HwBuffer {
        &mut self.guard
    }
}

impl Drop for EngineGuard<'_> {
    fn drop(&mut self) {
        self.lock.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Hardware acquisition engine the outputs write through.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn fs(&self) -> f64;

    fn lock(&self) -> EngineGuard<'_>;

    /// Monotonic sample clock in seconds.
    fn get_ts(&self) -> f64;

    /// First sample index that can still be written.
    fn earliest_offset(&self) -> u64;

    /// Writes `samples` to `channel` at `offset`. Requires the engine lock.
    fn update_hw_ao(
        &self,
        guard: &mut EngineGuard<'_>,
        offset: u64,
        channel: &str,
        samples: &[f64],
        method: UpdateMethod,
    ) -> Result<(), HardwareError> {
        let earliest = self.earliest_offset();
        guard.write(channel, offset, samples, method, earliest)
    }
}

/// Engine whose hardware clock is a [`Timer`]. Once started, samples
/// before `now * fs + min_lead` count as already played.
pub struct SimulatedEngine<T: Timer> {
    name: String,
    fs: f64,
    min_lead: u64,
    timer: T,
    lock: EngineLock,
    running: AtomicBool,
}

impl<T: Timer> SimulatedEngine<T> {
    pub fn new(name: impl Into<String>, fs: f64, timer: T) -> Self {
        Self {
            name: name.into(),
            fs,
            min_lead: 0,
            timer,
            lock: EngineLock::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Starts playback. Before this every offset is writable.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn with_min_lead(mut self, samples: u64) -> Self {
        self.min_lead = samples;
        self
    }

    /// Adds an output channel retaining `buffer_size` seconds of samples.
    pub fn with_channel(self, name: impl Into<String>, buffer_size: f64) -> Self {
        let capacity = (buffer_size * self.fs).round() as usize;
        self.lock.lock().add_channel(name, capacity);
        self
    }

    pub fn engine_lock(&self) -> &EngineLock {
        &self.lock
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Copy of the samples held for `channel` in `[lb, ub)`.
    pub fn read(&self, channel: &str, lb: u64, ub: u64) -> Option<Vec<f64>> {
        self.lock.lock().channel(channel).ok()?.get(lb, ub)
    }
}

impl<T: Timer> Engine for SimulatedEngine<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fs(&self) -> f64 {
        self.fs
    }

    fn lock(&self) -> EngineGuard<'_> {
        self.lock.lock()
    }

    fn get_ts(&self) -> f64 {
        self.timer.now()
    }

    fn earliest_offset(&self) -> u64 {
        if !self.is_running() {
            return 0;
        }
        (self.timer.now() * self.fs).floor() as u64 + self.min_lead
    }
}
