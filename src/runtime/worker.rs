//! Bounded worker pool for user work callbacks.
//!
//! Only `do_work` and `rollback` run here; all scheduling and state logic
//! stays on the service loop. Concurrency is bounded by a semaphore sized
//! from [`WorkerConfig`](crate::config::WorkerConfig).

use crate::job::{JobHandler, WorkContext};
use crate::runtime::Command;
use crate::state::State;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info};

/// Outcome of one attempt, reported back to the service loop for validation
/// against the run policy.
#[derive(Debug)]
pub(crate) enum WorkOutcome {
    /// The work callback returned a state request.
    Requested(State),
    /// The work callback returned an error.
    Failed(String),
    /// The work callback panicked.
    Panicked(String),
}

struct PoolStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

/// Snapshot of worker pool counters.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub max_workers: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub active: usize,
    pub peak_concurrent: usize,
}

/// Semaphore-bounded pool handle. Cheap to clone.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        debug!(max_workers, "worker pool created");
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            stats: Arc::new(PoolStats {
                submitted: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                peak_concurrent: AtomicUsize::new(0),
            }),
            max_workers,
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            max_workers: self.max_workers,
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
            peak_concurrent: self.stats.peak_concurrent.load(Ordering::Relaxed),
        }
    }

    fn record_start(&self) {
        let active = self.stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.peak_concurrent.fetch_max(active, Ordering::Relaxed);
    }

    fn record_finish(&self, succeeded: bool) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        if succeeded {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Execute one attempt of a job's work callback and report the outcome to
/// the service loop. Runs as a spawned task; the service loop may abort it,
/// in which case no outcome is reported and the loop handles recovery.
pub(crate) async fn run_attempt(
    handler: Arc<Mutex<Box<dyn JobHandler>>>,
    mut ctx: WorkContext,
    commands: mpsc::UnboundedSender<Command>,
    token: u64,
    pool: WorkerPool,
    done: Arc<AtomicBool>,
) {
    pool.stats.submitted.fetch_add(1, Ordering::Relaxed);

    let Ok(_permit) = pool.semaphore.clone().acquire_owned().await else {
        done.store(true, Ordering::SeqCst);
        return;
    };
    pool.record_start();

    let id = ctx.id();
    let outcome = {
        let mut guard = handler.lock().await;
        if ctx.state() != State::Busy {
            info!(job_id = %id, state = %ctx.state(), "skipping background work, job is not BUSY");
            WorkOutcome::Requested(ctx.state())
        } else {
            match std::panic::AssertUnwindSafe(guard.do_work(&mut ctx))
                .catch_unwind()
                .await
            {
                Ok(Ok(state)) => WorkOutcome::Requested(state),
                Ok(Err(err)) => WorkOutcome::Failed(err.to_string()),
                Err(panic) => WorkOutcome::Panicked(panic_message(panic)),
            }
        }
    };

    pool.record_finish(matches!(outcome, WorkOutcome::Requested(_)));
    done.store(true, Ordering::SeqCst);
    debug!(job_id = %id, ?outcome, "background work complete");
    let _ = commands.send(Command::WorkDone { id, token, outcome });
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "work callback panicked".to_string()
    }
}
