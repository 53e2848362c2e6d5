//! # Task Scheduling
//!
//! Single-task-at-a-time execution of maintenance jobs.
//!
//! A [`TaskTimer`] is fixed at construction from the node's role:
//!
//! - `Periodic` (seed nodes): firing `k` happens at
//!   `t0 + k * base + jitter_k` with `jitter_k` drawn uniformly from
//!   `[0, base)` for every firing, so seeds launched together drift apart.
//! - `RunOnce` (non-seed nodes): a single firing at startup.
//!
//! A run always completes before the next firing is considered. Slots whose
//! start passed while a run was still going are skipped; the next firing is
//! drawn in the first slot starting after the run returns. Cancellation is
//! only observed between runs.

mod metrics;
pub use metrics::{TaskMetrics, TaskMetricsSnapshot};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTimer {
    /// Fire indefinitely at `base` intervals plus per-firing jitter.
    Periodic {
        /// Base interval; also the exclusive upper bound of the jitter.
        base: Duration,
    },
    /// Fire once at startup.
    RunOnce,
}

impl TaskTimer {
    /// Timer for a node's role: seeds run periodically, others once.
    #[must_use]
    pub const fn for_role(is_seed: bool, base: Duration) -> Self {
        if is_seed {
            Self::Periodic { base }
        } else {
            Self::RunOnce
        }
    }

    /// Returns `true` for [`TaskTimer::Periodic`].
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        matches!(self, Self::Periodic { .. })
    }

    /// Offset from `t0` of firing number `k`, or `None` when the timer
    /// never fires a `k`-th time.
    ///
    /// Periodic offsets draw a fresh jitter from `rng` on every call.
    pub fn firing_offset<R: Rng>(&self, k: u64, rng: &mut R) -> Option<Duration> {
        match *self {
            Self::RunOnce => (k == 0).then_some(Duration::ZERO),
            Self::Periodic { base } => {
                let slot = scale(base, k)?;
                slot.checked_add(jitter(base, rng))
            }
        }
    }

    /// Slot to fire after slot `k` finished `elapsed` past `t0`.
    ///
    /// Normally `k + 1`. When the run overran later slots, the first slot
    /// starting after `elapsed`, so missed firings are skipped rather
    /// than replayed.
    #[must_use]
    pub fn next_slot(&self, k: u64, elapsed: Duration) -> u64 {
        let next = k.saturating_add(1);
        match *self {
            Self::Periodic { base } if !base.is_zero() => {
                let behind = elapsed.as_nanos() / base.as_nanos();
                let first_free = u64::try_from(behind).unwrap_or(u64::MAX).saturating_add(1);
                next.max(first_free)
            }
            _ => next,
        }
    }
}

/// `base * k`, or `None` on overflow.
fn scale(base: Duration, k: u64) -> Option<Duration> {
    let nanos = base.as_nanos().checked_mul(u128::from(k))?;
    u64::try_from(nanos).ok().map(Duration::from_nanos)
}

/// Uniform draw from `[0, base)`; zero for a zero base.
fn jitter<R: Rng>(base: Duration, rng: &mut R) -> Duration {
    let bound = u64::try_from(base.as_nanos()).unwrap_or(u64::MAX);
    if bound == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(rng.random_range(0..bound))
    }
}

/// A unit of work the scheduler runs.
pub trait ScheduledTask: Send + Sync {
    /// Failure type of one run.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Task name for logging.
    fn name(&self) -> &str;

    /// Execute one run to completion.
    fn run(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Handle to a spawned task loop.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    join: JoinHandle<()>,
    cancel: CancellationToken,
    metrics: Arc<TaskMetrics>,
}

impl TaskHandle {
    /// Name of the task.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared run counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<TaskMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns `true` once the loop has exited (run-once finished,
    /// cancelled, or the timer ran out of firings).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to exit on its own.
    ///
    /// # Errors
    ///
    /// Returns the join error if the task panicked.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.join.await
    }

    /// Stop after the current run (if any) and wait for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns the join error if the task panicked.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        self.cancel.cancel();
        self.join.await
    }
}

/// Spawn `task` on the current tokio runtime, firing per `timer`.
#[must_use]
pub fn spawn_task<T: ScheduledTask + 'static>(task: T, timer: TaskTimer) -> TaskHandle {
    spawn_with_rng(task, timer, StdRng::from_os_rng())
}

/// [`spawn_task`] with a deterministic jitter sequence.
#[must_use]
pub fn spawn_task_seeded<T: ScheduledTask + 'static>(task: T, timer: TaskTimer, seed: u64) -> TaskHandle {
    spawn_with_rng(task, timer, StdRng::seed_from_u64(seed))
}

fn spawn_with_rng<T: ScheduledTask + 'static>(task: T, timer: TaskTimer, rng: StdRng) -> TaskHandle {
    let name = task.name().to_string();
    let cancel = CancellationToken::new();
    let metrics = Arc::new(TaskMetrics::default());
    let join = tokio::spawn(run_loop(task, timer, rng, cancel.clone(), Arc::clone(&metrics)));
    TaskHandle {
        name,
        join,
        cancel,
        metrics,
    }
}

async fn run_loop<T: ScheduledTask>(
    task: T,
    timer: TaskTimer,
    mut rng: StdRng,
    cancel: CancellationToken,
    metrics: Arc<TaskMetrics>,
) {
    let t0 = Instant::now();
    let mut k = 0u64;
    let mut runs = 0u64;
    tracing::debug!(task = task.name(), ?timer, "task loop started");

    while let Some(offset) = timer.firing_offset(k, &mut rng) {
        let Some(fire_at) = t0.checked_add(offset) else {
            break;
        };

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(task = task.name(), "task loop cancelled");
                break;
            }

            () = tokio::time::sleep_until(fire_at) => {}
        }

        let started = Instant::now();
        let result = task.run().await;
        let elapsed = started.elapsed();
        match result {
            Ok(()) => {
                metrics.record_success(elapsed);
                tracing::debug!(task = task.name(), slot = k, ?elapsed, "task run succeeded");
            }
            Err(e) => {
                metrics.record_failure(elapsed);
                tracing::warn!(task = task.name(), slot = k, error = %e, "task run failed");
            }
        }
        runs += 1;

        let next = timer.next_slot(k, t0.elapsed());
        if next > k.saturating_add(1) {
            tracing::warn!(task = task.name(), skipped = next - k - 1, "run overran, skipping missed firings");
        }
        k = next;
    }

    tracing::debug!(task = task.name(), runs, "task loop finished");
}
