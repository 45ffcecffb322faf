//! # Time
//!
//! Microsecond clock, sleep, and the bounded busy-wait used for queue space
//! and queue drain.

use core::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// CLOCK TRAIT
// =============================================================================

/// Microsecond clock and sleep primitive provided by the platform
pub trait Clock: Send + Sync {
    /// Current time in microseconds; may wrap
    fn now_us(&self) -> u64;

    /// Sleep (or spin) for roughly `us` microseconds
    fn sleep_us(&self, us: u64);
}

// =============================================================================
// BOUNDED WAIT
// =============================================================================

/// Poll `cond` until it holds or `timeout_us` elapses
///
/// The clock is sampled before the loop and after every poll. If the clock
/// goes backwards the start marker is moved to the new sample, so a wrapped
/// counter extends the wait instead of ending it early.
///
/// Returns `true` if `cond` was satisfied.
pub fn wait_until<C, F>(clock: &C, timeout_us: u64, slice_us: u64, mut cond: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let mut start = clock.now_us();
    loop {
        if cond() {
            return true;
        }

        let now = clock.now_us();
        if now < start {
            log::trace!("Time: clock went back from {} to {}, restarting wait", start, now);
            start = now;
        }
        if now - start >= timeout_us {
            return false;
        }

        clock.sleep_us(slice_us);
    }
}

// =============================================================================
// STEP CLOCK
// =============================================================================

/// Clock that only moves when slept on or advanced
///
/// Deterministic stand-in for the hardware timer in simulation and tests:
/// a bounded wait against it always terminates after
/// `timeout / slice` polls.
#[derive(Debug, Default)]
pub struct StepClock {
    now: AtomicU64,
}

impl StepClock {
    /// Create a clock at time zero
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a clock at an arbitrary time
    pub const fn starting_at(us: u64) -> Self {
        Self {
            now: AtomicU64::new(us),
        }
    }

    /// Move time forward
    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::Relaxed);
    }

    /// Jump to an absolute time (including backwards)
    pub fn set(&self, us: u64) {
        self.now.store(us, Ordering::Relaxed);
    }
}

impl Clock for StepClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn sleep_us(&self, us: u64) {
        self.advance(us);
    }
}

// =============================================================================
// STD CLOCK
// =============================================================================

/// Host clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Create a clock whose zero is now
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
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
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep_us(&self, us: u64) {
        std::thread::sleep(core::time::Duration::from_micros(us));
    }
}
