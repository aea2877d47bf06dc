//! Strictly increasing nanosecond timestamps for ordering buffered mutations.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest timestamp accepted from callers. The headroom above it keeps
/// `now()` and the `t + 1` of updates from overflowing.
pub const MAX_TIMESTAMP: i64 = i64::MAX / 2;

/// Wall-clock nanoseconds, bumped by one whenever the wall clock stalls or
/// steps backwards, so no two calls return the same value.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicI64,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn now(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Record an externally supplied timestamp; later `now()` values exceed it.
    pub fn observe(&self, t: i64) {
        self.last.fetch_max(t.min(MAX_TIMESTAMP), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let clock = Clock::new();
        let future = clock.now() + 1_000_000_000_000;
        clock.observe(future);
        assert!(clock.now() > future);
    }

    #[test]
    fn test_observe_is_capped() {
        let clock = Clock::new();
        clock.observe(i64::MAX);
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, MAX_TIMESTAMP + 1);
        assert!(b > a);
    }

    #[test]
    fn test_unique_across_threads() {
        let clock = Arc::new(Clock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..1000).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for t in handle.join().unwrap() {
                assert!(seen.insert(t));
            }
        }
    }
}
