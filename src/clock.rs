//! Monotonic time behind a seam, so state machines can be driven tick-by-tick
//! in tests without sleeping.

use std::cell::Cell;
use std::time::Instant;

/// Monotonic clock. Microsecond resolution is required by the spot-value rate
/// limiter; everything else runs off milliseconds.
pub trait Clock {
    fn now_us(&self) -> u64;

    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

/// Wall clock anchored at construction time.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Hand-cranked clock for deterministic tests. Optionally steps forward by a
/// fixed amount on every read, so code that polls "until deadline" terminates
/// without anybody calling `advance`.
pub struct ManualClock {
    us: Cell<u64>,
    auto_step_us: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            us: Cell::new(0),
            auto_step_us: 0,
        }
    }

    /// A clock that advances `step_us` microseconds per `now_us` call.
    pub fn auto(step_us: u64) -> Self {
        ManualClock {
            us: Cell::new(0),
            auto_step_us: step_us,
        }
    }

    pub fn advance_us(&self, us: u64) {
        self.us.set(self.us.get() + us);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        let now = self.us.get();
        self.us.set(now + self.auto_step_us);
        now
    }
}

impl<T: Clock + ?Sized> Clock for std::rc::Rc<T> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}
