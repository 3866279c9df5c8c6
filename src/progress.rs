//! Progress counters for downloads and imports.
//!
//! Totals grow dynamically as files are discovered (a download learns its
//! byte count late, an import learns its row-group count late), so each
//! counter carries an atomic `total` alongside `done`. Counters observe the
//! shutdown signal on every advance — a stuck progress callback is one of the
//! places a worker must notice cancellation.
//!
//! There is no terminal UI here; the daemon logs a snapshot line on a timer
//! so progress is visible in container logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::shutdown::{Shutdown, ShuttingDown};

/// One named counter: `done / total`, both monotone.
pub struct Counter {
    name: &'static str,
    done: AtomicU64,
    total: AtomicU64,
    shutdown: Shutdown,
}

impl Counter {
    fn new(name: &'static str, shutdown: Shutdown) -> Self {
        Self {
            name,
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Record `n` completed units. Surfaces the shutdown sentinel so callers
    /// deep inside a download or import loop unwind promptly.
    pub fn advance(&self, n: u64) -> Result<(), ShuttingDown> {
        self.done.fetch_add(n, Ordering::Relaxed);
        self.shutdown.check()
    }

    /// Grow the expected total by `n`. Single atomic add — concurrent growers
    /// never lose an update.
    pub fn grow_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// The fixed set of counters the pipeline reports to.
pub struct ProgressSet {
    pub full_bytes: Counter,
    pub incremental_bytes: Counter,
    pub full_steps: Counter,
    pub incremental_steps: Counter,
    pub empty_steps: Counter,
}

impl ProgressSet {
    pub fn new(shutdown: &Shutdown) -> Arc<Self> {
        Arc::new(Self {
            full_bytes: Counter::new("full_bytes", shutdown.clone()),
            incremental_bytes: Counter::new("incremental_bytes", shutdown.clone()),
            full_steps: Counter::new("full_steps", shutdown.clone()),
            incremental_steps: Counter::new("incremental_steps", shutdown.clone()),
            empty_steps: Counter::new("empty_steps", shutdown.clone()),
        })
    }

    /// Bytes counter for a file type.
    pub fn bytes_for(&self, full: bool) -> &Counter {
        if full {
            &self.full_bytes
        } else {
            &self.incremental_bytes
        }
    }

    /// Row-group steps counter for a file type.
    pub fn steps_for(&self, full: bool) -> &Counter {
        if full {
            &self.full_steps
        } else {
            &self.incremental_steps
        }
    }

    /// One log line with every counter. Called on the daemon's progress tick.
    pub fn log_snapshot(&self) {
        let counters = [
            &self.full_bytes,
            &self.incremental_bytes,
            &self.full_steps,
            &self.incremental_steps,
            &self.empty_steps,
        ];
        let mut parts = Vec::with_capacity(counters.len());
        for c in counters {
            let (done, total) = c.snapshot();
            parts.push(format!("{}={}/{}", c.name, done, total));
        }
        tracing::info!("progress: {}", parts.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_grow() {
        let shutdown = Shutdown::new();
        let progress = ProgressSet::new(&shutdown);

        progress.full_steps.grow_total(10);
        progress.full_steps.advance(3).unwrap();
        assert_eq!(progress.full_steps.snapshot(), (3, 10));

        progress.full_steps.grow_total(5);
        assert_eq!(progress.full_steps.snapshot(), (3, 15));
    }

    #[test]
    fn test_advance_observes_shutdown() {
        let shutdown = Shutdown::new();
        let progress = ProgressSet::new(&shutdown);

        assert!(progress.incremental_bytes.advance(1).is_ok());
        shutdown.trigger();
        assert!(progress.incremental_bytes.advance(1).is_err());

        // The add still lands even when the sentinel is raised.
        assert_eq!(progress.incremental_bytes.snapshot().0, 2);
    }

    #[test]
    fn test_counters_selected_by_file_type() {
        let shutdown = Shutdown::new();
        let progress = ProgressSet::new(&shutdown);

        progress.bytes_for(true).grow_total(100);
        progress.steps_for(false).grow_total(7);
        assert_eq!(progress.full_bytes.snapshot(), (0, 100));
        assert_eq!(progress.incremental_steps.snapshot(), (0, 7));
    }
}
