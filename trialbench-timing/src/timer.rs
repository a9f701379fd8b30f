use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for monotonic experiment clocks.
///
/// Timestamps are seconds since the clock started, the same unit the
/// hardware engines report their sample clock in.
pub trait Timer: Clone + Send + Sync {
    fn now(&self) -> f64;
    fn elapsed(&self, ts: f64) -> Duration {
        Duration::from_secs_f64((self.now() - ts).max(0.0))
    }
    fn sleep(&self, d: Duration);
}

/// Wall clock backed by `Instant`, sleeping on `CLOCK_MONOTONIC` on Linux.
#[derive(Debug, Clone)]
pub struct HighPrecisionTimer {
    pub start: Instant,
}

impl Timer for HighPrecisionTimer {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
    fn sleep(&self, d: Duration) {
        sleep_monotonic(d)
    }
}

impl HighPrecisionTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for HighPrecisionTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps until an absolute monotonic deadline, so a signal interrupting
/// the call does not stretch the total wait.
#[cfg(target_os = "linux")]
fn sleep_monotonic(d: Duration) {
    use libc::{clock_gettime, clock_nanosleep, timespec, CLOCK_MONOTONIC, EINTR, TIMER_ABSTIME};

    let mut now = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    if unsafe { clock_gettime(CLOCK_MONOTONIC, &mut now) } != 0 {
        std::thread::sleep(d);
        return;
    }
    let nanos = now.tv_nsec as u64 + u64::from(d.subsec_nanos());
    let deadline = timespec {
        tv_sec: now.tv_sec + d.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    };
    loop {
        // SAFETY: `deadline` is a valid timespec; the remainder is unused with TIMER_ABSTIME.
        let rc = unsafe { clock_nanosleep(CLOCK_MONOTONIC, TIMER_ABSTIME, &deadline, std::ptr::null_mut()) };
        if rc != EINTR {
            break;
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_monotonic(d: Duration) {
    std::thread::sleep(d);
}

/// Clock that only moves when told to. Clones share the same time, so an
/// engine and a state machine holding clones always agree on "now".
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    now_bits: Arc<AtomicU64>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::starting_at(0.0)
    }

    pub fn starting_at(t: f64) -> Self {
        Self {
            now_bits: Arc::new(AtomicU64::new(t.to_bits())),
        }
    }

    pub fn set(&self, t: f64) {
        self.now_bits.store(t.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, dt: f64) -> f64 {
        let mut current = self.now_bits.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + dt).to_bits();
            match self.now_bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return f64::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> f64 {
        f64::from_bits(self.now_bits.load(Ordering::Acquire))
    }
    fn sleep(&self, d: Duration) {
        self.advance(d.as_secs_f64());
    }
}
