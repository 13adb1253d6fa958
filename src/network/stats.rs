//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the main loop, dispatch loops and workers
#[derive(Debug, Default)]
pub struct EngineStats {
    accepted: AtomicU64,
    enqueue_failures: AtomicU64,
    closed: AtomicU64,
    jobs_submitted: AtomicU64,
    replies_written: AtomicU64,
    /// Connections handed to each dispatch loop
    assigned: Box<[AtomicU64]>,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub enqueue_failures: u64,
    pub closed: u64,
    pub jobs_submitted: u64,
    pub replies_written: u64,
}

impl EngineStats {
    /// Counters for an engine with `loops` dispatch loops
    pub fn new(loops: usize) -> Self {
        Self {
            assigned: (0..loops).map(|_| AtomicU64::new(0)).collect(),
            ..Default::default()
        }
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue_failure(&self) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection queued on loop `index`; unknown loops are ignored
    pub fn record_assignment(&self, index: usize) {
        if let Some(counter) = self.assigned.get(index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Connections queued on each loop so far, in loop order
    pub fn assignments(&self) -> Vec<u64> {
        self.assigned
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .collect()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            replies_written: self.replies_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignments_per_loop() {
        let stats = EngineStats::new(2);
        stats.record_assignment(0);
        stats.record_assignment(1);
        stats.record_assignment(1);
        stats.record_assignment(5);
        assert_eq!(stats.assignments(), vec![1, 2]);
        assert!(EngineStats::default().assignments().is_empty());
    }
}
