//! Lock-free per-task run counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Per-task run counters using atomics.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    /// Total completed runs.
    pub runs: AtomicU64,
    /// Runs that returned `Ok`.
    pub successes: AtomicU64,
    /// Runs that returned `Err`.
    pub failures: AtomicU64,
    /// Duration of the last run in nanoseconds.
    pub last_run_ns: AtomicU64,
    /// Wall-clock time of the last successful run (millis since epoch, 0 = never).
    pub last_success_ms: AtomicI64,
}

impl TaskMetrics {
    /// Records a successful run.
    pub fn record_success(&self, elapsed: Duration) {
        self.record_run(elapsed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Records a failed run.
    pub fn record_failure(&self, elapsed: Duration) {
        self.record_run(elapsed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_run(&self, elapsed: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.last_run_ns.store(nanos, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> TaskMetricsSnapshot {
        TaskMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_run_ns: self.last_run_ns.load(Ordering::Relaxed),
            last_success_ms: self.last_success_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`TaskMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMetricsSnapshot {
    /// Total runs.
    pub runs: u64,
    /// Successful runs.
    pub successes: u64,
    /// Failed runs.
    pub failures: u64,
    /// Last run duration in nanoseconds.
    pub last_run_ns: u64,
    /// Last success, millis since epoch (0 = never).
    pub last_success_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = TaskMetrics::default();
        metrics.record_failure(Duration::from_millis(3));
        assert_eq!(metrics.snapshot().last_success_ms, 0);

        metrics.record_success(Duration::from_millis(5));
        let snap = metrics.snapshot();
        assert_eq!(snap.runs, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.last_run_ns, 5_000_000);
        assert!(snap.last_success_ms > 0);
    }
}
