//! The job manager: registry ownership, the service loop, the worker pool,
//! and the persistence hook.

mod service;
mod worker;

pub use worker::WorkerPoolStats;

use crate::config::RuntimeConfig;
use crate::error::{Result, TetherError};
use crate::id::JobId;
use crate::job::{DependencyFailureStrategy, Job, JobHandler, JobView};
use crate::observer::{CallbackDispatcher, JobObserver, JobShared};
use crate::persist::{HandlerRegistry, Persistor};
use crate::runtime::service::ServiceLoop;
use crate::runtime::worker::{WorkOutcome, WorkerPool};
use crate::state::State;
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Requests handled by the service loop. External callers enqueue these;
/// the loop also feeds itself (timers, worker completions).
pub(crate) enum Command {
    Submit {
        job: Job,
        reply: oneshot::Sender<Result<JobObserver>>,
    },
    Service {
        id: JobId,
    },
    AddDependency {
        depending: JobId,
        depended: JobId,
        strategy: DependencyFailureStrategy,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        id: JobId,
        reply: Option<oneshot::Sender<State>>,
    },
    ScheduleNow {
        id: JobId,
    },
    WorkDone {
        id: JobId,
        token: u64,
        outcome: WorkOutcome,
    },
    EnsureInit {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// A point-in-time picture of one registered job, including its outgoing
/// dependency edges.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub(crate) view: JobView,
    pub depends_on: Vec<JobId>,
    pub attempts: u32,
    pub total_duration: Duration,
    pub(crate) started_at: Instant,
}

impl JobSnapshot {
    pub fn id(&self) -> JobId {
        self.view.id()
    }

    pub fn state(&self) -> State {
        self.view.state()
    }

    pub fn description(&self) -> &str {
        self.view.description()
    }

    pub fn state_message(&self) -> Option<&str> {
        self.view.state_message()
    }
}

/// Order snapshots for display: terminal jobs last, dependencies before
/// their dependents, new jobs first, busy jobs late, then start time.
pub fn display_order(a: &JobSnapshot, b: &JobSnapshot) -> CmpOrdering {
    if a.id() == b.id() {
        return CmpOrdering::Equal;
    }

    match (a.state().is_terminal(), b.state().is_terminal()) {
        (true, true) => return CmpOrdering::Equal,
        (true, false) => return CmpOrdering::Greater,
        (false, true) => return CmpOrdering::Less,
        (false, false) => {}
    }

    if a.depends_on.contains(&b.id()) {
        return CmpOrdering::Greater;
    }
    if b.depends_on.contains(&a.id()) {
        return CmpOrdering::Less;
    }

    match (a.state() == State::New, b.state() == State::New) {
        (true, false) => return CmpOrdering::Less,
        (false, true) => return CmpOrdering::Greater,
        _ => {}
    }

    match (a.state() == State::Busy, b.state() == State::Busy) {
        (true, false) => return CmpOrdering::Greater,
        (false, true) => return CmpOrdering::Less,
        _ => {}
    }

    a.depends_on
        .len()
        .cmp(&b.depends_on.len())
        .then_with(|| a.started_at.cmp(&b.started_at))
}

/// Owns the job registry and the single-threaded service loop that drives
/// every job through its state machine.
///
/// Construction spawns the loop onto the current tokio runtime. Dropping
/// the manager shuts the loop down; in-flight workers are aborted.
pub struct JobManager {
    commands: mpsc::UnboundedSender<Command>,
    index: Arc<DashMap<JobId, Arc<JobShared>>>,
    initialized: Arc<AtomicBool>,
    workers: WorkerPool,
}

impl JobManager {
    /// An in-memory manager with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// A manager backed by the given persistor. Jobs are reloaded from it
    /// on first access.
    pub fn with_persistor(persistor: Arc<dyn Persistor>) -> Self {
        Self::builder().persistor(persistor).build()
    }

    pub fn builder() -> JobManagerBuilder {
        JobManagerBuilder::new()
    }

    /// Submit a job for processing. Binds the job to this manager, registers
    /// it, and schedules its first service pass. Fails if a pre-declared
    /// dependency targets a job that is not active here, or if the edges
    /// would close a cycle.
    pub async fn submit(&self, job: Job) -> Result<JobObserver> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                job,
                reply: reply_tx,
            })
            .map_err(|_| TetherError::unavailable("service loop is shut down"))?;
        reply_rx
            .await
            .map_err(|_| TetherError::unavailable("service loop is shut down"))?
    }

    /// Retrieve an observer for a registered job.
    pub async fn get_job(&self, id: JobId) -> Option<JobObserver> {
        self.ensure_init().await;
        self.index
            .get(&id)
            .map(|shared| JobObserver::new(shared.clone(), self.commands.clone()))
    }

    /// A snapshot of the current jobs in ascending order by start time.
    pub async fn get_jobs(&self) -> Vec<JobObserver> {
        self.ensure_init().await;
        let mut jobs: Vec<(Instant, Arc<JobShared>)> = self
            .index
            .iter()
            .map(|entry| (entry.value().started_at(), entry.value().clone()))
            .collect();
        jobs.sort_by_key(|(started_at, _)| *started_at);
        jobs.into_iter()
            .map(|(_, shared)| JobObserver::new(shared, self.commands.clone()))
            .collect()
    }

    /// Add a dependency edge between two registered jobs. Errors surface
    /// synchronously: inactive target, self-edge, or a would-be cycle (in
    /// which case the graph is left unchanged).
    pub async fn add_dependency(
        &self,
        depending: JobId,
        depended: JobId,
        strategy: DependencyFailureStrategy,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::AddDependency {
                depending,
                depended,
                strategy,
                reply: reply_tx,
            })
            .map_err(|_| TetherError::unavailable("service loop is shut down"))?;
        reply_rx
            .await
            .map_err(|_| TetherError::unavailable("service loop is shut down"))?
    }

    /// Cancel a job. Idempotent; returns the resulting state.
    pub async fn cancel(&self, id: JobId) -> State {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Cancel {
                id,
                reply: Some(reply_tx),
            })
            .is_err()
        {
            return State::Canceled;
        }
        reply_rx.await.unwrap_or(State::Canceled)
    }

    /// Structured snapshots of all registered jobs, ascending by start time.
    pub async fn snapshot(&self) -> Vec<JobSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Snapshot { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Drop all jobs, clear the persistor if one is configured, and reset
    /// the init flag so jobs reload on the next access.
    pub async fn clear(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Clear { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Worker pool counters.
    pub fn worker_stats(&self) -> WorkerPoolStats {
        self.workers.stats()
    }

    /// Stop the service loop. Pending jobs are not persisted beyond their
    /// last dirty write.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn ensure_init(&self) {
        if self.initialized.load(Ordering::SeqCst) {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::EnsureInit { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Builder for [`JobManager`].
pub struct JobManagerBuilder {
    persistor: Option<Arc<dyn Persistor>>,
    config: RuntimeConfig,
    registry: HandlerRegistry,
}

impl JobManagerBuilder {
    pub fn new() -> Self {
        Self {
            persistor: None,
            config: RuntimeConfig::default(),
            registry: HandlerRegistry::new(),
        }
    }

    /// Persistence backend. Without one, jobs live in memory only.
    pub fn persistor(mut self, persistor: Arc<dyn Persistor>) -> Self {
        self.persistor = Some(persistor);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a reviver for a persisted job tag. Persisted jobs with
    /// unregistered tags are skipped with a warning at reload.
    pub fn register_handler(
        mut self,
        tag: &'static str,
        reviver: impl Fn(serde_json::Value) -> Result<Box<dyn JobHandler>> + Send + Sync + 'static,
    ) -> Self {
        self.registry.register(tag, reviver);
        self
    }

    /// Spawn the service loop and hand back the manager. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> JobManager {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let index = Arc::new(DashMap::new());
        let initialized = Arc::new(AtomicBool::new(false));
        let workers = WorkerPool::new(self.config.workers.max_workers);
        let dispatcher = CallbackDispatcher::new();

        let service = ServiceLoop::new(
            index.clone(),
            commands_tx.clone(),
            commands_rx,
            self.persistor,
            self.registry,
            workers.clone(),
            self.config,
            dispatcher,
            initialized.clone(),
        );
        tokio::spawn(service.run());

        JobManager {
            commands: commands_tx,
            index,
            initialized,
            workers,
        }
    }
}

impl Default for JobManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
