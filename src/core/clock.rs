//! Time sources for expiry timers and request deadlines.
//!
//! Everything that schedules work reads time through [`Clock`], so the whole
//! runtime can run on wall-clock time in a host and on a hand-driven clock in
//! tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source. `now()` is the time elapsed since the clock origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock (millisecond resolution).
///
/// Clones share the same counter, so a test can keep one handle and hand
/// another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `ms` milliseconds
    pub fn advance(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time (never moves backwards)
    pub fn set(&self, ms: u64) {
        self.millis.fetch_max(ms, Ordering::SeqCst);
    }

    pub fn millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis())
    }
}
