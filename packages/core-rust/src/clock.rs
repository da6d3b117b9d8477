//! Monotonic timestamps for ordering buffered writes.
//!
//! A [`LogicalClock`] combines wall-clock milliseconds with a counter so that
//! two operations enqueued within the same millisecond, or while the system
//! clock steps backwards, still receive strictly increasing timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// A logical timestamp: physical milliseconds first, then a counter.
///
/// Ordering is lexicographic over `(millis, counter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Wall-clock milliseconds since the Unix epoch.
    pub millis: u64,
    /// Tie-breaker for events within the same millisecond.
    pub counter: u32,
}

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a virtual one.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    // Millisecond timestamps fit in u64 for the next half-billion years.
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Issues strictly increasing [`Timestamp`]s.
///
/// When the clock source advances, the counter resets to 0. When it is
/// unchanged or behind, the last physical time is kept and the counter
/// increments.
pub struct LogicalClock {
    last_millis: u64,
    last_counter: u32,
    clock_source: Box<dyn ClockSource>,
}

impl LogicalClock {
    /// Creates a clock over the given source.
    #[must_use]
    pub fn new(clock_source: Box<dyn ClockSource>) -> Self {
        Self {
            last_millis: 0,
            last_counter: 0,
            clock_source,
        }
    }

    /// Returns the next timestamp, strictly greater than every earlier one.
    pub fn now(&mut self) -> Timestamp {
        let physical = self.clock_source.now();
        if physical > self.last_millis {
            self.last_millis = physical;
            self.last_counter = 0;
        } else if self.last_counter == u32::MAX {
            self.last_millis += 1;
            self.last_counter = 0;
        } else {
            self.last_counter += 1;
        }
        Timestamp {
            millis: self.last_millis,
            counter: self.last_counter,
        }
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new(Box::new(SystemClock))
    }
}

impl std::fmt::Debug for LogicalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalClock")
            .field("last_millis", &self.last_millis)
            .field("last_counter", &self.last_counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    struct ManualClock(Arc<AtomicU64>);

    impl ClockSource for ManualClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn ordering_is_millis_then_counter() {
        let a = Timestamp { millis: 100, counter: 9 };
        let b = Timestamp { millis: 101, counter: 0 };
        let c = Timestamp { millis: 101, counter: 1 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn same_millisecond_increments_counter() {
        let time = Arc::new(AtomicU64::new(1_000));
        let mut clock = LogicalClock::new(Box::new(ManualClock(time.clone())));

        let first = clock.now();
        let second = clock.now();
        assert_eq!(first, Timestamp { millis: 1_000, counter: 0 });
        assert_eq!(second, Timestamp { millis: 1_000, counter: 1 });

        time.store(1_005, Ordering::SeqCst);
        assert_eq!(clock.now(), Timestamp { millis: 1_005, counter: 0 });
    }

    #[test]
    fn backwards_clock_stays_monotonic() {
        let time = Arc::new(AtomicU64::new(5_000));
        let mut clock = LogicalClock::new(Box::new(ManualClock(time.clone())));
        let before = clock.now();

        time.store(4_000, Ordering::SeqCst);
        let after = clock.now();
        assert!(after > before);
        assert_eq!(after.millis, 5_000);
    }

    #[test]
    fn system_clock_returns_nonzero() {
        assert!(SystemClock.now() > 0);
    }
}
