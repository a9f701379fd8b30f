pub mod schedule;
pub mod timer;

pub use schedule::{Deadline, TimerQueue};
pub use timer::{HighPrecisionTimer, ManualTimer, Timer};
