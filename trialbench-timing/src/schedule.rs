/// A single named deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Deadline<T> {
    pub name: String,
    pub due: f64,
    pub payload: T,
    seq: u64,
}

/// Named single-shot deadlines.
///
/// Starting a deadline under a name that is already pending replaces it, so
/// a name is pending at most once. Nothing fires by itself: the owner polls
/// `pop_due` from its own thread, which keeps delivery on the caller's
/// serialized path.
#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    entries: Vec<Deadline<T>>,
    seq: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            seq: 0,
        }
    }

    /// Schedules `payload` under `name`. Returns the payload it replaced, if any.
    pub fn start(&mut self, name: impl Into<String>, due: f64, payload: T) -> Option<T> {
        let name = name.into();
        let replaced = self.stop(&name);
        self.seq += 1;
        self.entries.push(Deadline {
            name,
            due,
            payload,
            seq: self.seq,
        });
        replaced
    }

    pub fn stop(&mut self, name: &str) -> Option<T> {
        let idx = self.entries.iter().position(|d| d.name == name)?;
        Some(self.entries.remove(idx).payload)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.entries.iter().any(|d| d.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Deadline<T>> {
        self.entries.iter().find(|d| d.name == name)
    }

    pub fn due_time(&self, name: &str) -> Option<f64> {
        self.get(name).map(|d| d.due)
    }

    pub fn next_due(&self) -> Option<f64> {
        self.entries.iter().map(|d| d.due).reduce(f64::min)
    }

    /// Removes and returns every deadline with `due <= now`, earliest first.
    /// Deadlines due at the same time come out in the order they were started.
    pub fn pop_due(&mut self, now: f64) -> Vec<Deadline<T>> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].due <= now {
                due.push(self.entries.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by(|a, b| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)));
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
