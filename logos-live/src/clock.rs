//! Logical millisecond clocks used to stamp outgoing events.
//!
//! Timestamps order updates from the same sender, so a provider must never
//! go backwards and must never hand out `0` (reserved for initial state).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of event timestamps.
pub trait TimestampProvider: Send + Sync {
    /// Current logical time in milliseconds. Always > 0.
    fn timestamp(&self) -> u64;
}

/// Wall-clock milliseconds, forced to be strictly increasing.
///
/// If the system clock steps backwards (or two calls land in the same
/// millisecond) the previous value + 1 is returned instead.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl TimestampProvider for MonotonicClock {
    fn timestamp(&self) -> u64 {
        let now = Self::wall_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start.max(1)),
        }
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis.max(1), Ordering::Release);
    }
}

impl TimestampProvider for ManualClock {
    fn timestamp(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
