//! Rate-limited warn logging for polling loops.
//!
//! An overdue incremental polls every `duration/10` seconds and each miss is
//! identical; logging all of them drowns the interesting lines. Logs the 1st
//! occurrence and every 10th after that, and reports the run length when the
//! condition clears.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shared occurrence tracker — cheap to clone, backed by atomics.
#[derive(Clone)]
pub struct ConsecutiveTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    consecutive: AtomicU32,
    total_since_reset: AtomicU32,
}

impl ConsecutiveTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                consecutive: AtomicU32::new(0),
                total_since_reset: AtomicU32::new(0),
            }),
        }
    }

    /// Call on each occurrence. Returns true when this one should be logged
    /// (the 1st, and every 10th after that).
    pub fn record(&self) -> bool {
        let n = self.inner.consecutive.fetch_add(1, Ordering::Relaxed);
        self.inner.total_since_reset.fetch_add(1, Ordering::Relaxed);
        n == 0 || (n + 1) % 10 == 0
    }

    /// Call when the condition clears. Returns Some(run length) if a run was
    /// in progress (callers emit a recovery line).
    pub fn reset(&self) -> Option<u32> {
        let prev = self.inner.consecutive.swap(0, Ordering::Relaxed);
        if prev > 0 {
            Some(self.inner.total_since_reset.swap(0, Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn count(&self) -> u32 {
        self.inner.consecutive.load(Ordering::Relaxed)
    }
}

impl Default for ConsecutiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_first_and_every_tenth() {
        let tracker = ConsecutiveTracker::new();

        assert!(tracker.record(), "1st occurrence should log");
        for i in 1..9 {
            assert!(!tracker.record(), "occurrence {} should be suppressed", i + 1);
        }
        assert!(tracker.record(), "10th occurrence should log");
        for i in 10..19 {
            assert!(!tracker.record(), "occurrence {} should be suppressed", i + 1);
        }
        assert!(tracker.record(), "20th occurrence should log");
    }

    #[test]
    fn test_reset_reports_run_length() {
        let tracker = ConsecutiveTracker::new();
        tracker.record();
        tracker.record();
        tracker.record();

        assert_eq!(tracker.reset(), Some(3));
        assert_eq!(tracker.reset(), None, "no run in progress after reset");
    }

    #[test]
    fn test_count() {
        let tracker = ConsecutiveTracker::new();
        assert_eq!(tracker.count(), 0);
        tracker.record();
        tracker.record();
        assert_eq!(tracker.count(), 2);
    }
}
