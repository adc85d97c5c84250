//! Time sources for execution loops
//!
//! Time is counted in milliseconds (one scheduler tick). A clock also decides
//! how a blocked loop idles while it waits for work.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic millisecond time source
pub trait Clock: Send + Sync {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;

    /// Called by a waiting loop between two polls of its queue
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Deterministic clock driven by the caller
///
/// With a non-zero idle step, every [`Clock::relax`] call advances time by
/// that step, so a loop blocked on an empty queue reaches its deadline
/// without real time passing.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    idle_step: u64,
}

impl ManualClock {
    /// Clock frozen at zero
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            idle_step: 0,
        }
    }

    /// Clock that advances by `step` ms each time a waiter idles
    pub const fn with_idle_step(step: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            idle_step: step,
        }
    }

    /// Move time forward
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time; never moves backwards
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn relax(&self) {
        if self.idle_step == 0 {
            core::hint::spin_loop();
        } else {
            self.advance(self.idle_step);
        }
    }
}

/// Host wall clock
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    start: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Clock starting at zero now
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn relax(&self) {
        std::thread::sleep(std::time::Duration::from_micros(100));
    }
}
