use crate::id::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the per-peer monotonic timestamp recorded on local commits.
///
/// A clock must guarantee its own monotonicity; it is read under no lock.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp;
}

/// Wall-clock backed [`Clock`] in coarse (second) units, clamped so that it
/// never runs backwards even if the system time does.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let t = self.last.fetch_max(wall, Ordering::Relaxed).max(wall);
        Timestamp::new(t)
    }
}

/// Manually driven [`Clock`] for tests and deterministic replay.
#[derive(Debug, Default)]
pub struct TestClock {
    current: AtomicU64,
}

impl TestClock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time.
    pub fn set(&self, t: u64) {
        self.current.store(t, Ordering::Relaxed);
    }

    /// Advances the current time by `amount`.
    pub fn advance(&self, amount: u64) {
        self.current.fetch_add(amount, Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current.load(Ordering::Relaxed))
    }
}
