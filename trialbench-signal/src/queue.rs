use crate::error::{FactoryError, QueueError};
use crate::factory::{Recorded, WaveformFactory};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use trialbench_core::{Setting, Value};

/// Uploads kept for `uploaded()` and for rewinding.
const UPLOAD_LOG_LIMIT: usize = 1024;
/// Used-up entries kept so a rewind can restore their repeats.
const RETIRED_LIMIT: usize = 64;

/// Identifies one appended setting for counting and decrementing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey(pub u64);

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which pending entry is emitted next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// Each entry runs all its repeats before the next one starts.
    Fifo,
    /// Round-robin across all entries.
    Interleaved,
    /// Round-robin within the first `n` entries until they are used up.
    Grouped(usize),
    /// Every block presents each entry once in a fresh random order.
    BlockedRandom(u64),
    /// Round-robin over the cells appended with `append_product`.
    CartesianProduct,
}

impl FromStr for QueueOrdering {
    type Err = QueueError;

    /// Accepts `fifo`, `interleaved`, `grouped:<n>`, `blocked_random[:<seed>]`
    /// and `cartesian_product`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || QueueError::UnknownOrdering(s.to_string());
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        match (name, arg) {
            ("fifo", None) => Ok(QueueOrdering::Fifo),
            ("interleaved" | "interleaved_fifo", None) => Ok(QueueOrdering::Interleaved),
            ("grouped" | "grouped_fifo", Some(n)) => match n.parse::<usize>() {
                Ok(n) if n > 0 => Ok(QueueOrdering::Grouped(n)),
                _ => Err(unknown()),
            },
            ("blocked_random", None) => Ok(QueueOrdering::BlockedRandom(0)),
            ("blocked_random", Some(seed)) => seed
                .parse()
                .map(QueueOrdering::BlockedRandom)
                .map_err(|_| unknown()),
            ("cartesian_product", None) => Ok(QueueOrdering::CartesianProduct),
            _ => Err(unknown()),
        }
    }
}

/// A waveform taken off the queue. The factory is a fresh copy with any
/// trim already consumed.
pub struct QueueItem {
    pub key: QueueKey,
    pub waveform: Box<dyn WaveformFactory>,
    pub delay: f64,
    pub metadata: Setting,
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("key", &self.key)
            .field("delay", &self.delay)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Reported when a waveform starts streaming out of `pop_buffer`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadInfo {
    pub key: QueueKey,
    /// Start time in seconds on the queue's clock.
    pub t0: f64,
    pub duration: f64,
    pub delay: f64,
    pub decrement: bool,
    pub metadata: Setting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Appended {
        key: QueueKey,
        trials: usize,
        metadata: Setting,
    },
    Uploaded(UploadInfo),
}

pub type QueueSubscriber = Box<dyn FnMut(&QueueEvent) + Send>;

struct QueueEntry {
    key: QueueKey,
    factory: Box<dyn WaveformFactory>,
    trials: usize,
    delays: Vec<f64>,
    metadata: Setting,
    trim: usize,
    emitted: usize,
}

struct InFlight {
    waveform: Box<dyn WaveformFactory>,
    delay_remaining: u64,
}

/// Pending stimulus settings with repeat counts and inter-trial delays.
pub struct SignalQueue {
    ordering: QueueOrdering,
    fs: Option<f64>,
    t0: f64,
    entries: Vec<QueueEntry>,
    retired: VecDeque<QueueEntry>,
    next_key: u64,
    cursor: usize,
    block: VecDeque<QueueKey>,
    rng: StdRng,
    subscribers: Vec<QueueSubscriber>,
    current: Option<InFlight>,
    samples_emitted: u64,
    uploaded: VecDeque<UploadInfo>,
    paused: bool,
    paused_at: Option<f64>,
}

impl QueueEntry {
    /// A copy of the waveform from its first sample, with `trim` consumed.
    fn fresh_waveform(&self) -> Box<dyn WaveformFactory> {
        let mut waveform = self.factory.clone_box();
        waveform.reset();
        if self.trim > 0 {
            waveform.next(self.trim);
        }
        waveform
    }
}

impl SignalQueue {
    pub fn new(ordering: QueueOrdering) -> Self {
        let seed = match ordering {
            QueueOrdering::BlockedRandom(seed) => seed,
            _ => 0,
        };
        Self {
            ordering,
            fs: None,
            t0: 0.0,
            entries: Vec::new(),
            retired: VecDeque::new(),
            next_key: 0,
            cursor: 0,
            block: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            subscribers: Vec::new(),
            current: None,
            samples_emitted: 0,
            uploaded: VecDeque::new(),
            paused: false,
            paused_at: None,
        }
    }

    pub fn fifo() -> Self {
        Self::new(QueueOrdering::Fifo)
    }

    pub fn ordering(&self) -> &QueueOrdering {
        &self.ordering
    }

    pub fn set_fs(&mut self, fs: f64) -> Result<(), QueueError> {
        if !(fs > 0.0 && fs.is_finite()) {
            return Err(QueueError::InvalidSampleRate(fs));
        }
        self.fs = Some(fs);
        Ok(())
    }

    pub fn fs(&self) -> Option<f64> {
        self.fs
    }

    /// Time of the next sample `pop_buffer` returns. Resets the sample count.
    pub fn set_t0(&mut self, t0: f64) {
        self.t0 = t0;
        self.samples_emitted = 0;
    }

    pub fn connect(&mut self, subscriber: QueueSubscriber) {
        self.subscribers.push(subscriber);
    }

    fn notify(&mut self, event: QueueEvent) {
        for subscriber in self.subscribers.iter_mut() {
            subscriber(&event);
        }
    }

    pub fn append(
        &mut self,
        factory: Box<dyn WaveformFactory>,
        trials: usize,
        delays: &[f64],
        metadata: Setting,
    ) -> Result<QueueKey, QueueError> {
        self.append_trimmed(factory, trials, delays, metadata, 0)
    }

    /// Appends a setting. Delays cycle across repeats; an empty list means
    /// no delay. `trim` leading samples are dropped from every repeat, and a
    /// waveform with nothing left after the trim is rejected.
    pub fn append_trimmed(
        &mut self,
        factory: Box<dyn WaveformFactory>,
        trials: usize,
        delays: &[f64],
        metadata: Setting,
        trim: usize,
    ) -> Result<QueueKey, QueueError> {
        if self.fs.is_none() {
            return Err(QueueError::FsNotSet);
        }
        let mut waveform = factory.clone_box();
        waveform.reset();
        if let Some(samples) = waveform.get_remaining_samples() {
            if samples <= trim as u64 {
                return Err(QueueError::EmptyWaveform { samples, trim });
            }
        }
        let key = QueueKey(self.next_key);
        self.next_key += 1;
        let delays = if delays.is_empty() {
            vec![0.0]
        } else {
            delays.iter().map(|d| d.max(0.0)).collect()
        };
        debug!(key = key.0, trials, ?delays, "appending to signal queue");
        if trials > 0 {
            self.entries.push(QueueEntry {
                key,
                factory,
                trials,
                delays,
                metadata: metadata.clone(),
                trim,
                emitted: 0,
            });
        }
        self.notify(QueueEvent::Appended {
            key,
            trials,
            metadata,
        });
        Ok(key)
    }

    pub fn append_samples(
        &mut self,
        samples: Arc<[f64]>,
        trials: usize,
        delays: &[f64],
        metadata: Setting,
    ) -> Result<QueueKey, QueueError> {
        let fs = self.fs.ok_or(QueueError::FsNotSet)?;
        self.append(Box::new(Recorded::new(fs, samples)), trials, delays, metadata)
    }

    /// Appends one entry per cell of the cross product of `axes`, last axis
    /// varying fastest. `build` makes the waveform for a cell's setting.
    pub fn append_product<F>(
        &mut self,
        axes: &[(String, Vec<Value>)],
        trials: usize,
        delays: &[f64],
        mut build: F,
    ) -> Result<Vec<QueueKey>, QueueError>
    where
        F: FnMut(&Setting) -> Result<Box<dyn WaveformFactory>, FactoryError>,
    {
        if axes.is_empty() || axes.iter().any(|(_, values)| values.is_empty()) {
            return Err(QueueError::EmptyProduct);
        }
        let cells: usize = axes.iter().map(|(_, values)| values.len()).product();
        let mut keys = Vec::with_capacity(cells);
        for cell in 0..cells {
            let mut setting = Setting::new();
            let mut rem = cell;
            for (name, values) in axes.iter().rev() {
                setting.insert(name.clone(), values[rem % values.len()].clone());
                rem /= values.len();
            }
            let factory = build(&setting)?;
            keys.push(self.append(factory, trials, delays, setting)?);
        }
        Ok(keys)
    }

    fn select_index(&mut self) -> Option<usize> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        match self.ordering {
            QueueOrdering::Fifo => Some(0),
            QueueOrdering::Interleaved | QueueOrdering::CartesianProduct => {
                let i = self.cursor % len;
                self.cursor = i + 1;
                Some(i)
            }
            QueueOrdering::Grouped(n) => {
                let window = n.clamp(1, len);
                let i = self.cursor % window;
                self.cursor = i + 1;
                Some(i)
            }
            QueueOrdering::BlockedRandom(_) => loop {
                if self.block.is_empty() {
                    let mut keys: Vec<QueueKey> = self.entries.iter().map(|e| e.key).collect();
                    keys.shuffle(&mut self.rng);
                    self.block.extend(keys);
                }
                let key = self.block.pop_front()?;
                if let Some(i) = self.entries.iter().position(|e| e.key == key) {
                    return Some(i);
                }
            },
        }
    }

    fn remove_index(&mut self, idx: usize) -> QueueEntry {
        let entry = self.entries.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        debug!(key = entry.key.0, "queue entry exhausted");
        entry
    }

    /// Next waveform according to the ordering, or `None` when nothing is
    /// pending. With `decrement` the entry's repeat count goes down by one.
    pub fn pop_next(&mut self, decrement: bool) -> Option<QueueItem> {
        let idx = self.select_index()?;
        let entry = &mut self.entries[idx];
        let delay = entry.delays[entry.emitted % entry.delays.len()];
        entry.emitted += 1;
        let waveform = entry.fresh_waveform();
        let item = QueueItem {
            key: entry.key,
            waveform,
            delay,
            metadata: entry.metadata.clone(),
        };
        if decrement {
            self.decrement_key(item.key, 1);
        }
        Some(item)
    }

    /// Lowers the outstanding repeats of `key`, removing it at zero.
    /// Decrementing past zero or an unknown key is tolerated and logged.
    pub fn decrement_key(&mut self, key: QueueKey, n: usize) {
        let Some(idx) = self.entries.iter().position(|e| e.key == key) else {
            warn!(key = key.0, n, "decrement of a key that is no longer queued");
            return;
        };
        let entry = &mut self.entries[idx];
        if n > entry.trials {
            warn!(
                key = key.0,
                n,
                remaining = entry.trials,
                "decrement past zero clamped"
            );
        }
        entry.trials = entry.trials.saturating_sub(n);
        if entry.trials == 0 {
            let entry = self.remove_index(idx);
            if self.retired.len() == RETIRED_LIMIT {
                self.retired.pop_front();
            }
            self.retired.push_back(entry);
        }
    }

    pub fn remove_key(&mut self, key: QueueKey) {
        if let Some(idx) = self.entries.iter().position(|e| e.key == key) {
            self.remove_index(idx);
        }
        self.retired.retain(|e| e.key != key);
    }

    /// Streams the next `n` samples. Waveforms are followed by their delay
    /// as zeros; once nothing is pending, or while paused between
    /// waveforms, the rest is zero.
    pub fn pop_buffer(&mut self, n: usize, decrement: bool) -> Vec<f64> {
        let Some(fs) = self.fs else {
            return vec![0.0; n];
        };
        let mut out = Vec::with_capacity(n);
        let mut upload_start = None;
        while out.len() < n {
            let needed = n - out.len();
            let Some(current) = self.current.as_mut() else {
                if self.paused {
                    break;
                }
                let Some(item) = self.pop_next(decrement) else {
                    break;
                };
                upload_start = Some(out.len());
                self.start_upload(item, fs, out.len() as u64, decrement);
                continue;
            };
            let take = match current.waveform.get_remaining_samples() {
                Some(remaining) => (remaining as usize).min(needed),
                None => needed,
            };
            if take > 0 {
                out.extend(current.waveform.next(take));
            } else if current.delay_remaining > 0 {
                let pad = (current.delay_remaining as usize).min(needed);
                out.resize(out.len() + pad, 0.0);
                current.delay_remaining -= pad as u64;
            } else {
                self.current = None;
                if upload_start == Some(out.len()) {
                    warn!("queued waveform produced no samples, padding with zeros");
                    break;
                }
            }
        }
        out.resize(n, 0.0);
        self.samples_emitted += n as u64;
        out
    }

    fn start_upload(&mut self, item: QueueItem, fs: f64, pending: u64, decrement: bool) {
        let t0 = self.t0 + (self.samples_emitted + pending) as f64 / fs;
        let duration = match item.waveform.get_remaining_samples() {
            Some(samples) => samples as f64 / fs,
            None => f64::INFINITY,
        };
        let info = UploadInfo {
            key: item.key,
            t0,
            duration,
            delay: item.delay,
            decrement,
            metadata: item.metadata,
        };
        debug!(key = info.key.0, t0, duration, "uploading waveform");
        if self.uploaded.len() == UPLOAD_LOG_LIMIT {
            self.uploaded.pop_front();
        }
        self.uploaded.push_back(info.clone());
        self.notify(QueueEvent::Uploaded(info));
        self.current = Some(InFlight {
            waveform: item.waveform,
            delay_remaining: (item.delay * fs).round() as u64,
        });
    }

    /// Abandons the waveform in flight so the next one starts immediately.
    pub fn next_trial(&mut self) {
        if self.current.take().is_some() {
            debug!("abandoning in-flight waveform");
        }
    }

    /// Stops new waveforms from starting. The one in flight finishes.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.paused_at = None;
    }

    /// Pauses from `t` seconds on the queue's clock: the stream is rewound
    /// to `t`, so waveforms that started after it are taken back.
    pub fn pause_at(&mut self, t: f64) {
        self.pause();
        self.rewind_to(t);
        self.paused_at = Some(t);
        debug!(t, "queue paused");
    }

    /// Resumes from `t` seconds on the queue's clock, so the next waveform
    /// can start at `t` instead of after the zeros already streamed.
    pub fn resume_at(&mut self, t: f64) {
        self.resume();
        self.rewind_to(t);
        debug!(t, "queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Time the current pause took effect.
    pub fn paused_at(&self) -> Option<f64> {
        self.paused_at
    }

    /// Sample index, counted from `t0`, where an upload began. `None` for
    /// uploads from before the last `set_t0`.
    fn upload_sample(&self, info: &UploadInfo, fs: f64) -> Option<u64> {
        let sample = ((info.t0 - self.t0) * fs).round();
        (sample >= 0.0).then_some(sample as u64)
    }

    /// Moves the stream back to `t` seconds on the queue's clock so the next
    /// `pop_buffer` continues from there. Uploads at or after `t` are undone
    /// with their repeats restored, and a waveform running at `t` picks up
    /// where it was. Times at or past the stream end are a no-op.
    pub fn rewind_to(&mut self, t: f64) {
        let Some(fs) = self.fs else {
            return;
        };
        let target = (((t - self.t0) * fs).round().max(0.0) as u64).min(self.samples_emitted);
        if target == self.samples_emitted {
            return;
        }
        debug!(t, from = self.samples_emitted, to = target, "rewinding queue");
        self.current = None;
        while let Some(info) = self.uploaded.back() {
            match self.upload_sample(info, fs) {
                Some(sample) if sample >= target => {}
                _ => break,
            }
            if let Some(info) = self.uploaded.pop_back() {
                self.undo_upload(&info);
            }
        }

        if let Some(info) = self.uploaded.back() {
            if let Some(start) = self.upload_sample(info, fs) {
                let entry = self
                    .entries
                    .iter()
                    .chain(self.retired.iter())
                    .find(|e| e.key == info.key);
                if let Some(entry) = entry {
                    let mut waveform = entry.fresh_waveform();
                    let delay = (info.delay * fs).round() as u64;
                    let elapsed = target - start;
                    let length = waveform.get_remaining_samples().unwrap_or(u64::MAX);
                    if elapsed < length.saturating_add(delay) {
                        let skip = elapsed.min(length);
                        if skip > 0 {
                            waveform.next(skip as usize);
                        }
                        self.current = Some(InFlight {
                            waveform,
                            delay_remaining: delay - (elapsed - skip),
                        });
                    }
                }
            }
        }
        self.samples_emitted = target;
    }

    /// Puts a taken-back upload's repeat into the queue again.
    fn undo_upload(&mut self, info: &UploadInfo) {
        debug!(key = info.key.0, t0 = info.t0, "taking back upload");
        if let Some(idx) = self.entries.iter().position(|e| e.key == info.key) {
            let entry = &mut self.entries[idx];
            entry.emitted = entry.emitted.saturating_sub(1);
            if info.decrement {
                entry.trials += 1;
            }
            let len = self.entries.len();
            match self.ordering {
                QueueOrdering::Fifo => {}
                QueueOrdering::Interleaved | QueueOrdering::CartesianProduct => {
                    self.cursor = (self.cursor + len - 1) % len;
                }
                QueueOrdering::Grouped(n) => {
                    let window = n.clamp(1, len);
                    self.cursor = (self.cursor + window - 1) % window;
                }
                QueueOrdering::BlockedRandom(_) => self.block.push_front(info.key),
            }
        } else if info.decrement {
            let Some(pos) = self.retired.iter().position(|e| e.key == info.key) else {
                warn!(key = info.key.0, "cannot restore a removed entry");
                return;
            };
            let Some(mut entry) = self.retired.remove(pos) else {
                return;
            };
            entry.emitted = entry.emitted.saturating_sub(1);
            entry.trials = 1;
            let idx = match self.ordering {
                QueueOrdering::Fifo | QueueOrdering::Grouped(_) => 0,
                _ => self.cursor.min(self.entries.len()),
            };
            if let QueueOrdering::BlockedRandom(_) = self.ordering {
                self.block.push_front(entry.key);
            }
            self.entries.insert(idx, entry);
        }
    }

    /// Longest waveform among pending entries, zero when empty.
    pub fn get_max_duration(&self) -> f64 {
        self.entries
            .iter()
            .map(|e| e.factory.get_duration())
            .fold(0.0, f64::max)
    }

    /// Outstanding repeats across all entries.
    pub fn count_trials(&self) -> usize {
        self.entries.iter().map(|e| e.trials).sum()
    }

    pub fn remaining(&self, key: QueueKey) -> usize {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map_or(0, |e| e.trials)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nothing pending and nothing left streaming.
    pub fn is_exhausted(&self) -> bool {
        self.entries.is_empty() && self.current.is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Most recent uploads, oldest first.
    pub fn uploaded(&self) -> &VecDeque<UploadInfo> {
        &self.uploaded
    }
}
