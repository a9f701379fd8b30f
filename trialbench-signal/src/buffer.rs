use std::collections::VecDeque;

/// Most recent samples written to a channel, indexed by absolute sample
/// number. Holds at most `capacity` samples; older ones fall off the front.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBuffer {
    fs: f64,
    capacity: usize,
    samples: VecDeque<f64>,
    lb: u64,
}

impl SignalBuffer {
    pub fn new(fs: f64, size_seconds: f64) -> Self {
        let capacity = ((fs * size_seconds).round() as usize).max(1);
        Self {
            fs,
            capacity,
            samples: VecDeque::with_capacity(capacity),
            lb: 0,
        }
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append_data(&mut self, data: &[f64]) {
        self.samples.extend(data.iter().copied());
        let overflow = self.samples.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.samples.drain(..overflow);
            self.lb += overflow as u64;
        }
    }

    /// Drops every cached sample at or after `offset`.
    pub fn invalidate_samples(&mut self, offset: u64) {
        if offset >= self.get_samples_ub() {
            return;
        }
        if offset <= self.lb {
            self.samples.clear();
            self.lb = offset;
        } else {
            self.samples.truncate((offset - self.lb) as usize);
        }
    }

    /// Empties the buffer so that the next append lands at `offset`.
    pub fn clear_at(&mut self, offset: u64) {
        self.samples.clear();
        self.lb = offset;
    }

    /// First cached sample.
    pub fn get_samples_lb(&self) -> u64 {
        self.lb
    }

    /// One past the last cached sample.
    pub fn get_samples_ub(&self) -> u64 {
        self.lb + self.samples.len() as u64
    }

    /// Samples in `[lb, ub)`, if all of them are cached.
    pub fn get_range_samples(&self, lb: u64, ub: u64) -> Option<Vec<f64>> {
        if lb < self.lb || ub > self.get_samples_ub() || lb > ub {
            return None;
        }
        let start = (lb - self.lb) as usize;
        let end = (ub - self.lb) as usize;
        Some(self.samples.range(start..end).copied().collect())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
