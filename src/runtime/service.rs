//! The service loop: a single task that owns the job registry and serializes
//! every state transition and service pass.
//!
//! One pass over a job: enqueue on first visit, prepare, trigger execution,
//! poll progress, schedule the next visit, then persist if dirty. Execution
//! itself is handed to the worker pool; everything else happens here, which
//! is what makes per-job transition order total.

use crate::config::RuntimeConfig;
use crate::error::{Result, TetherError};
use crate::id::JobId;
use crate::job::{
    DeferredOp, DependencyFailureStrategy, Job, JobCore, JobHandler, JobView, ServiceContext,
    WorkContext,
};
use crate::observer::{CallbackDispatcher, JobObserver, JobShared, NOTIFY_KEY_STATE_CHANGE};
use crate::persist::{HandlerRegistry, PersistedJob, Persistor};
use crate::policy::CollisionStrategy;
use crate::runtime::worker::{run_attempt, WorkOutcome, WorkerPool};
use crate::runtime::{Command, JobSnapshot};
use crate::state::State;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

type TransitionQueue = VecDeque<(JobId, State, Option<String>)>;

fn dependency_fault_message(failed: &JobView) -> String {
    format!("Job failed due to upstream dependency : {failed}")
}

/// An in-flight attempt on the worker pool.
struct AttemptHandle {
    token: u64,
    abort: tokio::task::AbortHandle,
    done: Arc<AtomicBool>,
}

/// A registered job: runtime-owned lifecycle fields plus the user handler.
/// The handler sits behind an async mutex so the worker pool can run
/// `do_work` while the loop keeps servicing other jobs.
struct JobRecord {
    core: JobCore,
    handler: Arc<Mutex<Box<dyn JobHandler>>>,
    worker: Option<AttemptHandle>,
    visit: Option<tokio::task::AbortHandle>,
}

impl JobRecord {
    fn stop_tasks(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort.abort();
        }
        if let Some(visit) = self.visit.take() {
            visit.abort();
        }
    }
}

pub(crate) struct ServiceLoop {
    jobs: HashMap<JobId, JobRecord>,
    index: Arc<DashMap<JobId, Arc<JobShared>>>,
    commands: mpsc::UnboundedSender<Command>,
    inbox: mpsc::UnboundedReceiver<Command>,
    persistor: Option<Arc<dyn Persistor>>,
    registry: HandlerRegistry,
    workers: WorkerPool,
    config: RuntimeConfig,
    dispatcher: CallbackDispatcher,
    initialized: bool,
    initialized_flag: Arc<AtomicBool>,
    next_work_token: u64,
}

impl ServiceLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: Arc<DashMap<JobId, Arc<JobShared>>>,
        commands: mpsc::UnboundedSender<Command>,
        inbox: mpsc::UnboundedReceiver<Command>,
        persistor: Option<Arc<dyn Persistor>>,
        registry: HandlerRegistry,
        workers: WorkerPool,
        config: RuntimeConfig,
        dispatcher: CallbackDispatcher,
        initialized_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            jobs: HashMap::new(),
            index,
            commands,
            inbox,
            persistor,
            registry,
            workers,
            config,
            dispatcher,
            initialized: false,
            initialized_flag,
            next_work_token: 0,
        }
    }

    pub async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            match command {
                Command::Submit { job, reply } => {
                    self.ensure_init().await;
                    let _ = reply.send(self.submit(job));
                }
                Command::Service { id } => {
                    self.ensure_init().await;
                    self.service(id).await;
                }
                Command::AddDependency {
                    depending,
                    depended,
                    strategy,
                    reply,
                } => {
                    self.ensure_init().await;
                    let _ = reply.send(self.add_edge(depending, depended, strategy));
                }
                Command::Cancel { id, reply } => {
                    self.ensure_init().await;
                    let mut queue = TransitionQueue::new();
                    self.request_cancel(id, &mut queue);
                    self.drain_transitions(&mut queue).await;
                    if let Some(reply) = reply {
                        let state = self
                            .state_of(id)
                            .or_else(|| self.index.get(&id).map(|shared| shared.state()))
                            .unwrap_or(State::Canceled);
                        let _ = reply.send(state);
                    }
                }
                Command::ScheduleNow { id } => {
                    self.ensure_init().await;
                    if let Some(rec) = self.jobs.get_mut(&id) {
                        if let Some(policy) = rec.core.policy.as_mut() {
                            policy.schedule_now();
                        }
                    }
                    self.service(id).await;
                }
                Command::WorkDone { id, token, outcome } => {
                    self.work_done(id, token, outcome).await;
                }
                Command::EnsureInit { reply } => {
                    self.ensure_init().await;
                    let _ = reply.send(());
                }
                Command::Snapshot { reply } => {
                    self.ensure_init().await;
                    let _ = reply.send(self.snapshot());
                }
                Command::Clear { reply } => {
                    self.clear().await;
                    let _ = reply.send(());
                }
                Command::Shutdown => break,
            }
        }

        for record in self.jobs.values_mut() {
            record.stop_tasks();
        }
    }

    // ─── Initialization ─────────────────────────────────────────────────

    /// Load persisted jobs on first access and schedule a service pass for
    /// each of them. Work-loop states collapse to WAIT and the run policy is
    /// rebuilt via `configure_run_policy`.
    async fn ensure_init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        self.initialized_flag.store(true, Ordering::SeqCst);

        let Some(persistor) = self.persistor.clone() else {
            return;
        };

        info!("loading persisted jobs");
        let persisted = match persistor.list_jobs().await {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, "failed listing persisted jobs");
                return;
            }
        };

        for job in persisted {
            self.revive(job);
        }

        for id in self.sorted_ids() {
            let _ = self.commands.send(Command::Service { id });
        }
    }

    fn revive(&mut self, persisted: PersistedJob) {
        let Some(reviver) = self.registry.get(&persisted.tag) else {
            warn!(
                job_id = %persisted.id,
                tag = %persisted.tag,
                "no reviver registered for persisted job, skipping"
            );
            return;
        };

        let handler = match reviver(persisted.payload.clone()) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(job_id = %persisted.id, error = %err, "failed reviving persisted job");
                return;
            }
        };

        let id = persisted.id;
        let state = persisted.revival_state();
        let description = handler.description();
        let shared = Arc::new(JobShared::with_state(
            id,
            description.clone(),
            state,
            self.dispatcher.clone(),
        ));
        shared.set_state_message(persisted.state_message.clone());

        let mut core = JobCore::new(
            id,
            shared.clone(),
            description,
            self.config.service.default_poll_interval(),
        );
        let mut policy = handler.configure_run_policy();
        if let Err(err) = policy.bind(id) {
            warn!(job_id = %id, error = %err, "persisted job produced a bound policy, skipping");
            return;
        }
        core.policy = Some(policy);

        self.jobs.insert(
            id,
            JobRecord {
                core,
                handler: Arc::new(Mutex::new(handler)),
                worker: None,
                visit: None,
            },
        );
        self.index.insert(id, shared);
        debug!(job_id = %id, state = %state, "revived persisted job");
    }

    // ─── Submission ─────────────────────────────────────────────────────

    fn submit(&mut self, job: Job) -> Result<JobObserver> {
        let (id, handler, edges) = job.into_parts();

        if self.jobs.contains_key(&id) {
            return Err(TetherError::invalid_state(format!(
                "job {id} is already submitted"
            )));
        }

        let mut edge_map = HashMap::new();
        for (target, strategy) in edges {
            let target = self.resolve_assimilated(target);
            if target == id {
                return Err(TetherError::cycle(format!(
                    "job {id} cannot depend on itself"
                )));
            }
            if !self.jobs.contains_key(&target) {
                return Err(TetherError::dependency(format!(
                    "depended job {target} is not active"
                )));
            }
            edge_map.insert(target, strategy);
        }

        let description = handler.description();
        let shared = Arc::new(JobShared::new(
            id,
            description.clone(),
            self.dispatcher.clone(),
        ));
        let mut core = JobCore::new(
            id,
            shared.clone(),
            description,
            self.config.service.default_poll_interval(),
        );
        core.edges = edge_map;

        let record = JobRecord {
            core,
            handler: Arc::new(Mutex::new(handler)),
            worker: None,
            visit: None,
        };
        self.jobs.insert(id, record);

        if self.graph_has_cycle() {
            self.jobs.remove(&id);
            return Err(TetherError::cycle(format!(
                "submitting job {id} would create a dependency cycle"
            )));
        }

        self.index.insert(id, shared.clone());
        let observer = JobObserver::new(shared, self.commands.clone());
        debug!(job_id = %id, "job submitted");
        let _ = self.commands.send(Command::Service { id });
        Ok(observer)
    }

    // ─── The service pass ───────────────────────────────────────────────

    async fn service(&mut self, id: JobId) {
        let mut pending = VecDeque::from([id]);
        while let Some(next) = pending.pop_front() {
            self.service_pass(next, &mut pending).await;
        }
    }

    async fn service_pass(&mut self, id: JobId, immediate: &mut VecDeque<JobId>) {
        let Some(original_state) = self.state_of(id) else {
            return;
        };

        if let Err(err) = self.service_steps(id, original_state, immediate).await {
            error!(job_id = %id, error = %err, "service pass failed");
            self.transition(id, State::Faulted, Some(err.to_string()))
                .await;
        }

        if self
            .jobs
            .get(&id)
            .map(|rec| rec.core.dirty)
            .unwrap_or(false)
        {
            self.persist(id).await;
        }
    }

    async fn service_steps(
        &mut self,
        id: JobId,
        original_state: State,
        immediate: &mut VecDeque<JobId>,
    ) -> Result<()> {
        if self.state_of(id) == Some(State::New) {
            self.enqueue(id).await?;
        }

        if let Some(rec) = self.jobs.get(&id) {
            if rec.core.policy.is_none() {
                return Err(TetherError::invalid_state("job must have a run policy"));
            }
        }

        if matches!(self.state_of(id), Some(State::Wait) | Some(State::Ready)) {
            let (state, message) = self.do_prepare(id).await?;
            self.transition(id, state, message).await;
        }

        if self.state_of(id) == Some(State::Ready) {
            self.execute(id).await;
        }

        if self.state_of(id) == Some(State::Busy) {
            self.check_progress_step(id).await?;
        }

        if let Some(state) = self.state_of(id) {
            if !state.is_terminal() {
                self.reschedule(id, state != original_state, immediate);
            }
        }

        Ok(())
    }

    /// First visit: attach the configured run policy, resolve collisions,
    /// check for cycles, run `on_added`, and give every other active job a
    /// chance to react to the newcomer.
    async fn enqueue(&mut self, id: JobId) -> Result<()> {
        {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return Ok(());
            };
            let handler = rec.handler.clone();
            let guard = handler.try_lock().map_err(|_| {
                TetherError::invalid_state("handler is busy during enqueue")
            })?;
            let mut policy = guard.configure_run_policy();
            drop(guard);
            policy.bind(id)?;
            rec.core.shared.set_started_at(policy.time_job_started());
            rec.core.policy = Some(policy);
        }

        self.check_for_collision(id).await;

        let assimilated = self
            .jobs
            .get(&id)
            .map(|rec| rec.core.assimilated_by.is_some())
            .unwrap_or(true);
        if assimilated || self.state_of(id) != Some(State::New) {
            return Ok(());
        }

        if self.graph_has_cycle() {
            return Err(TetherError::cycle(format!(
                "job {id} is part of a dependency cycle"
            )));
        }

        let (added_state, ops) = {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return Ok(());
            };
            let handler = rec.handler.clone();
            let mut guard = handler.try_lock().map_err(|_| {
                TetherError::invalid_state("handler is busy during enqueue")
            })?;
            let mut ops = Vec::new();
            let mut ctx = ServiceContext {
                core: &mut rec.core,
                ops: &mut ops,
            };
            let state = guard.on_added(&mut ctx)?;
            drop(guard);
            (state, ops)
        };

        let mut queue = TransitionQueue::new();
        self.apply_ops(ops, &mut queue);
        self.drain_transitions(&mut queue).await;

        let state = match added_state {
            State::New => {
                return Err(TetherError::invalid_argument(
                    "on_added returned NEW, which is not a valid requested state",
                ));
            }
            // A READY return is coerced to WAIT; prepare decides readiness.
            State::Ready => State::Wait,
            other => other,
        };
        self.transition(id, state, None).await;

        // Give existing jobs a chance to react to the new job.
        for other_id in self.sorted_ids() {
            if other_id == id {
                continue;
            }
            match self.state_of(id) {
                Some(state) if state.is_terminal() => break,
                None => break,
                _ => {}
            }
            let view = match self.jobs.get(&id) {
                Some(rec) => rec.core.view(),
                None => break,
            };

            let ops = {
                let Some(other) = self.jobs.get_mut(&other_id) else {
                    continue;
                };
                let other_state = other.core.state();
                if other_state.is_terminal() || other_state == State::New {
                    continue;
                }
                let handler = other.handler.clone();
                let Ok(mut guard) = handler.try_lock() else {
                    continue;
                };
                let mut ops = Vec::new();
                let mut ctx = ServiceContext {
                    core: &mut other.core,
                    ops: &mut ops,
                };
                guard.on_new_job_added(&mut ctx, &view);
                drop(guard);
                ops
            };
            let mut queue = TransitionQueue::new();
            self.apply_ops(ops, &mut queue);
            self.drain_transitions(&mut queue).await;
        }

        Ok(())
    }

    /// Compute the state a WAIT/READY job should move to: the run policy is
    /// consulted first, then `on_prepare`, then the aggregate state of the
    /// depended jobs.
    async fn do_prepare(&mut self, id: JobId) -> Result<(State, Option<String>)> {
        {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return Ok((State::Wait, None));
            };
            let state = rec.core.state();
            if state.is_terminal() {
                return Ok((state, None));
            }
            let policy = rec
                .core
                .policy
                .as_mut()
                .ok_or_else(|| TetherError::invalid_state("job must have a run policy"))?;
            if !policy.should_start() {
                debug!(job_id = %id, "job should not start yet");
                return Ok((State::Wait, None));
            }
        }

        let (requested, ops) = {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return Ok((State::Wait, None));
            };
            let handler = rec.handler.clone();
            let Ok(mut guard) = handler.try_lock() else {
                return Ok((State::Wait, None));
            };
            let mut ops = Vec::new();
            let mut ctx = ServiceContext {
                core: &mut rec.core,
                ops: &mut ops,
            };
            let requested = guard.on_prepare(&mut ctx)?;
            drop(guard);
            (requested, ops)
        };

        let mut queue = TransitionQueue::new();
        self.apply_ops(ops, &mut queue);
        self.drain_transitions(&mut queue).await;

        match requested {
            State::New | State::Busy => Err(TetherError::invalid_state(format!(
                "invalid state {requested} returned from on_prepare"
            ))),
            State::Wait | State::Faulted => Ok((requested, None)),
            State::Ready => self.aggregate_depended(id).await,
            other => Ok((other, None)),
        }
    }

    /// A depended job in FAULTED with cascade semantics dictates this job's
    /// state; any unsatisfied depended job forces WAIT; otherwise READY.
    async fn aggregate_depended(&mut self, id: JobId) -> Result<(State, Option<String>)> {
        let edges: Vec<(JobId, DependencyFailureStrategy)> = {
            let Some(rec) = self.jobs.get(&id) else {
                return Ok((State::Wait, None));
            };
            rec.core
                .edges
                .iter()
                .map(|(target, strategy)| (*target, *strategy))
                .collect()
        };

        for (dep_id, strategy) in edges {
            // An evicted depended job was removable, hence satisfied.
            let Some((dep_state, dep_view)) = self
                .jobs
                .get(&dep_id)
                .map(|dep| (dep.core.state(), dep.core.view()))
            else {
                continue;
            };

            if dep_state == State::Faulted {
                if strategy == DependencyFailureStrategy::CascadeFailure {
                    let (next, ops) = self.dependency_failed_callback(id, &dep_view);
                    let mut queue = TransitionQueue::new();
                    self.apply_ops(ops, &mut queue);
                    self.drain_transitions(&mut queue).await;
                    return Ok((next, Some(dependency_fault_message(&dep_view))));
                }
            } else if !matches!(dep_state, State::Succeeded | State::Assimilated) {
                return Ok((State::Wait, None));
            }
        }

        Ok((State::Ready, None))
    }

    fn dependency_failed_callback(
        &mut self,
        id: JobId,
        failed: &JobView,
    ) -> (State, Vec<DeferredOp>) {
        let Some(rec) = self.jobs.get_mut(&id) else {
            return (State::Faulted, Vec::new());
        };
        let handler = rec.handler.clone();
        let Ok(mut guard) = handler.try_lock() else {
            return (State::Faulted, Vec::new());
        };
        let mut ops = Vec::new();
        let mut ctx = ServiceContext {
            core: &mut rec.core,
            ops: &mut ops,
        };
        let next = guard.on_dependency_failed(&mut ctx, failed);
        drop(guard);
        (next, ops)
    }

    /// READY: start an attempt. Clears any orphaned worker, notifies the
    /// policy, moves to BUSY, and hands the work callback to the pool.
    async fn execute(&mut self, id: JobId) {
        self.next_work_token += 1;
        let token = self.next_work_token;

        {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return;
            };
            let Some(policy) = rec.core.policy.as_mut() else {
                return;
            };
            if !policy.should_start() {
                return;
            }
            if let Some(worker) = rec.worker.take() {
                if !worker.done.load(Ordering::SeqCst) {
                    error!(job_id = %id, "canceling orphaned background task");
                    worker.abort.abort();
                }
            }
            policy.on_attempt_started();
        }

        let state = self.transition(id, State::Busy, None).await;
        if state != State::Busy {
            return;
        }

        let Some(rec) = self.jobs.get_mut(&id) else {
            return;
        };
        let done = Arc::new(AtomicBool::new(false));
        let ctx = WorkContext {
            id,
            attempt: rec.core.attempts,
            shared: rec.core.shared.clone(),
        };
        let join = tokio::spawn(run_attempt(
            rec.handler.clone(),
            ctx,
            self.commands.clone(),
            token,
            self.workers.clone(),
            done.clone(),
        ));
        rec.worker = Some(AttemptHandle {
            token,
            abort: join.abort_handle(),
            done,
        });

        // Supervise the attempt task. A join failure that is not a
        // deliberate abort means the worker died before reporting back;
        // surface it so the job does not sit in BUSY until its timeout.
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    let err = TetherError::join(err.to_string());
                    error!(job_id = %id, error = %err, "work task died without reporting");
                    let _ = commands.send(Command::WorkDone {
                        id,
                        token,
                        outcome: WorkOutcome::Failed(err.to_string()),
                    });
                }
            }
        });
    }

    /// BUSY: poll `check_progress`, enforcing the attempt timeout by
    /// canceling the worker and revalidating READY against the policy.
    async fn check_progress_step(&mut self, id: JobId) -> Result<()> {
        let (state, ops) = {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return Ok(());
            };
            let handler = rec.handler.clone();
            let result = match handler.try_lock() {
                Ok(mut guard) => {
                    let mut ops = Vec::new();
                    let mut ctx = ServiceContext {
                        core: &mut rec.core,
                        ops: &mut ops,
                    };
                    let state = guard.check_progress(&mut ctx)?;
                    drop(guard);
                    (state, ops)
                }
                // Work in progress holds the handler; progress is implicit.
                Err(_) => (rec.core.state(), Vec::new()),
            };
            result
        };

        let mut queue = TransitionQueue::new();
        self.apply_ops(ops, &mut queue);
        self.drain_transitions(&mut queue).await;

        let next = {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return Ok(());
            };
            let Some(policy) = rec.core.policy.as_mut() else {
                return Ok(());
            };
            if !state.is_terminal() && policy.should_fail_attempt() {
                if let Some(worker) = rec.worker.take() {
                    worker.abort.abort();
                }
                policy.validate_requested_state(State::Ready)
            } else {
                state
            }
        };

        self.transition(id, next, None).await;
        Ok(())
    }

    /// Completion of a worker task. The requested state is validated against
    /// the run policy before it is applied.
    async fn work_done(&mut self, id: JobId, token: u64, outcome: WorkOutcome) {
        let Some(rec) = self.jobs.get_mut(&id) else {
            return;
        };
        let current_attempt = matches!(&rec.worker, Some(worker) if worker.token == token);
        if !current_attempt {
            debug!(job_id = %id, "ignoring completion of a superseded attempt");
            return;
        }
        rec.worker = None;

        let current = rec.core.state();
        if current.is_terminal() {
            warn!(
                job_id = %id,
                state = %current,
                "work finished but job is already in a terminal state"
            );
            return;
        }

        let (next, message) = match outcome {
            WorkOutcome::Failed(message) | WorkOutcome::Panicked(message) => {
                (State::Faulted, Some(message))
            }
            WorkOutcome::Requested(requested) => {
                if current != State::Busy {
                    warn!(
                        job_id = %id,
                        state = %current,
                        "work finished but job is no longer BUSY, continuing anyway"
                    );
                }
                let Some(policy) = rec.core.policy.as_mut() else {
                    return;
                };
                let mut validated = policy.validate_requested_state(requested);
                if validated == State::Succeeded && rec.core.shared.result().is_none() {
                    validated = State::Faulted;
                    (validated, Some("job result must be set on success".to_string()))
                } else {
                    (validated, None)
                }
            }
        };

        self.transition(id, next, message).await;
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    /// Compute when this job should next be serviced, or register it to be
    /// serviced when a depended job completes.
    fn reschedule(&mut self, id: JobId, state_changed: bool, immediate: &mut VecDeque<JobId>) {
        let (state, edges) = {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return;
            };
            if state_changed {
                rec.core.reset_poll_interval();
            }
            (
                rec.core.state(),
                rec.core.edges.keys().copied().collect::<Vec<_>>(),
            )
        };

        let mut time_to_wait: Option<i64> = None;

        match state {
            State::Wait => {
                let mut scheduled = false;
                for dep_id in edges {
                    let Some(dep) = self.jobs.get_mut(&dep_id) else {
                        continue;
                    };
                    let dep_state = dep.core.state();
                    if !dep_state.is_terminal() {
                        dep.core.waiting_dependents.insert(id);
                        scheduled = true;
                        if matches!(dep_state, State::New | State::Ready) {
                            immediate.push_back(dep_id);
                        }
                    }
                }
                if !scheduled {
                    let Some(rec) = self.jobs.get_mut(&id) else {
                        return;
                    };
                    let poll = rec.core.increment_poll_interval().as_millis() as i64;
                    let until = rec
                        .core
                        .policy
                        .as_ref()
                        .map(|policy| policy.time_until_next_attempt().as_millis() as i64)
                        .unwrap_or(0);
                    time_to_wait = Some(poll.max(until));
                }
            }
            State::Ready => {
                let Some(rec) = self.jobs.get(&id) else {
                    return;
                };
                let until = rec
                    .core
                    .policy
                    .as_ref()
                    .map(|policy| policy.time_until_next_attempt().as_millis() as i64)
                    .unwrap_or(0);
                time_to_wait = Some(until.max(0));
            }
            State::Busy => {
                let Some(rec) = self.jobs.get_mut(&id) else {
                    return;
                };
                let poll = rec.core.increment_poll_interval().as_millis() as i64;
                let remaining = rec
                    .core
                    .policy
                    .as_ref()
                    .map(|policy| match policy.time_attempt_started() {
                        Some(started) => {
                            match started.checked_add(policy.attempt_timeout_value()) {
                                Some(deadline) => {
                                    let now = Instant::now();
                                    if deadline >= now {
                                        deadline.duration_since(now).as_millis() as i64
                                    } else {
                                        -(now.duration_since(deadline).as_millis() as i64)
                                    }
                                }
                                None => i64::MAX,
                            }
                        }
                        None => 0,
                    })
                    .unwrap_or(0);
                time_to_wait = Some(poll.min(remaining));
            }
            _ => {}
        }

        if let Some(ms) = time_to_wait {
            if ms >= 0 {
                let floor = self.config.service.default_poll_interval_ms as i64;
                let delay = Duration::from_millis(ms.max(floor) as u64);
                self.schedule_visit(id, delay);
                debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "service visit scheduled");
            } else {
                debug!(job_id = %id, "service visit not scheduled");
            }
        }
    }

    fn schedule_visit(&mut self, id: JobId, delay: Duration) {
        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Service { id });
        });
        if let Some(rec) = self.jobs.get_mut(&id) {
            if let Some(old) = rec.visit.replace(handle.abort_handle()) {
                old.abort();
            }
        } else {
            handle.abort();
        }
    }

    // ─── Transitions ────────────────────────────────────────────────────

    async fn transition(&mut self, id: JobId, state: State, message: Option<String>) -> State {
        let mut queue = TransitionQueue::new();
        let result = self.apply_transition(id, state, message, &mut queue).await;
        self.drain_transitions(&mut queue).await;
        result.unwrap_or(state)
    }

    async fn drain_transitions(&mut self, queue: &mut TransitionQueue) {
        while let Some((id, state, message)) = queue.pop_front() {
            self.apply_transition(id, state, message, queue).await;
        }
    }

    /// Apply one state transition: validity checks, rollback, commit,
    /// signaling, dirty marking, and cascading failure. Further transitions
    /// provoked here (cascades, deferred ops) are pushed onto `queue`.
    async fn apply_transition(
        &mut self,
        id: JobId,
        new_state: State,
        message: Option<String>,
        queue: &mut TransitionQueue,
    ) -> Option<State> {
        let Some(mut rec) = self.jobs.remove(&id) else {
            return None;
        };

        let old_state = rec.core.state();
        let mut pending_ops = Vec::new();

        let result = 'apply: {
            // Setting a redundant state is a no-op. Cancellation is special:
            // its cleanup happens on the cancel request path, not here.
            if new_state == old_state {
                break 'apply old_state;
            }

            if old_state.is_terminal() && !new_state.is_terminal() {
                break 'apply old_state;
            }

            if old_state == State::Canceled {
                error!(
                    job_id = %id,
                    requested = %new_state,
                    "invalid state change requested for a canceled job"
                );
                break 'apply old_state;
            }

            if new_state.is_failed() && old_state.is_in_work_loop() {
                self.run_rollback(&rec).await;
            }

            rec.core.record_transition(old_state, new_state);
            rec.core.shared.store_state(new_state);
            let effective_message = message.or_else(|| {
                rec.core
                    .policy
                    .as_ref()
                    .and_then(|policy| policy.message())
            });
            rec.core.shared.set_state_message(effective_message.clone());

            debug!(
                job_id = %id,
                description = %rec.core.description,
                state = %new_state,
                was = %old_state,
                message = effective_message.as_deref().unwrap_or(""),
                "state changed"
            );

            if new_state.is_terminal() {
                rec.stop_tasks();
                // The next pass over this job runs the persist step, which
                // also evicts it once nothing depends on it.
                let _ = self.commands.send(Command::Service { id });
            }

            if old_state.transition_is_persistable(new_state) {
                rec.core.dirty = true;
                let observer = JobObserver::new(rec.core.shared.clone(), self.commands.clone());
                rec.core.shared.notify_update(&observer, NOTIFY_KEY_STATE_CHANGE);
            }

            if new_state.is_terminal() {
                let observer = JobObserver::new(rec.core.shared.clone(), self.commands.clone());
                rec.core.shared.notify_complete(&observer);
                for dependent in rec.core.waiting_dependents.drain() {
                    let _ = self.commands.send(Command::Service { id: dependent });
                }
            }

            {
                let handler = rec.handler.clone();
                if let Ok(mut guard) = handler.try_lock() {
                    let mut ops = Vec::new();
                    let mut ctx = ServiceContext {
                        core: &mut rec.core,
                        ops: &mut ops,
                    };
                    guard.on_state_changed(&mut ctx, old_state);
                    drop(guard);
                    pending_ops.extend(ops);
                };
            }

            // Cascade the failure to dependents that asked for it.
            if new_state == State::Faulted && !old_state.is_terminal() {
                let failed_view = rec.core.view();
                for other_id in self.sorted_ids() {
                    if other_id == id {
                        continue;
                    }
                    let cascade = self
                        .jobs
                        .get(&other_id)
                        .map(|other| {
                            other.core.edges.get(&id)
                                == Some(&DependencyFailureStrategy::CascadeFailure)
                        })
                        .unwrap_or(false);
                    if !cascade {
                        continue;
                    }
                    let (next, ops) = self.dependency_failed_callback(other_id, &failed_view);
                    pending_ops.extend(ops);
                    queue.push_back((
                        other_id,
                        next,
                        Some(dependency_fault_message(&failed_view)),
                    ));
                }
            }

            break 'apply new_state;
        };

        self.jobs.insert(id, rec);
        self.apply_ops(pending_ops, queue);
        Some(result)
    }

    /// Run the handler's rollback on the worker side, bounded by the
    /// configured rollback timeout.
    async fn run_rollback(&self, rec: &JobRecord) {
        let handler = rec.handler.clone();
        let id = rec.core.id;
        let join = tokio::spawn(async move {
            handler.lock().await.rollback().await;
        });
        match tokio::time::timeout(self.config.service.rollback_timeout(), join).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let err = TetherError::join(err.to_string());
                warn!(job_id = %id, error = %err, "rollback task failed");
            }
            Err(_) => {
                warn!(
                    job_id = %id,
                    "rollback is taking too long, continuing anyway"
                );
            }
        }
    }

    fn apply_ops(&mut self, ops: Vec<DeferredOp>, queue: &mut TransitionQueue) {
        for op in ops {
            match op {
                DeferredOp::AddDepended {
                    depending,
                    depended,
                    strategy,
                } => {
                    if let Err(err) = self.add_edge(depending, depended, strategy) {
                        error!(
                            job_id = %depending,
                            depended = %depended,
                            error = %err,
                            "failed adding dependency from callback"
                        );
                        queue.push_back((depending, State::Faulted, Some(err.to_string())));
                    }
                }
                DeferredOp::CancelJob(id) => {
                    self.request_cancel(id, queue);
                }
            }
        }
    }

    /// Idempotent cancellation: marks the job, stops any in-flight worker,
    /// and requests CANCELED unless the job already succeeded.
    fn request_cancel(&mut self, id: JobId, queue: &mut TransitionQueue) {
        let Some(rec) = self.jobs.get_mut(&id) else {
            if let Some(shared) = self.index.get(&id) {
                shared.mark_canceled();
            }
            return;
        };

        if !rec.core.shared.mark_canceled() {
            return;
        }

        if let Some(worker) = rec.worker.take() {
            worker.abort.abort();
        }

        if rec.core.state() != State::Succeeded {
            queue.push_back((id, State::Canceled, None));
        }
    }

    // ─── Dependencies ───────────────────────────────────────────────────

    /// Add a dependency edge, rejecting self-edges, inactive targets, and
    /// edges that would close a cycle. An ASSIMILATED target is rewritten to
    /// its assimilator.
    fn add_edge(
        &mut self,
        depending: JobId,
        depended: JobId,
        strategy: DependencyFailureStrategy,
    ) -> Result<()> {
        let depended = self.resolve_assimilated(depended);

        if depending == depended {
            return Err(TetherError::cycle(format!(
                "job {depending} cannot depend on itself"
            )));
        }
        if !self.jobs.contains_key(&depended) {
            return Err(TetherError::dependency(format!(
                "depended job {depended} is not active"
            )));
        }

        let previous = {
            let rec = self.jobs.get_mut(&depending).ok_or_else(|| {
                TetherError::dependency(format!("depending job {depending} is not active"))
            })?;
            rec.core.edges.insert(depended, strategy)
        };

        if self.graph_has_cycle() {
            if let Some(rec) = self.jobs.get_mut(&depending) {
                match previous {
                    Some(previous) => {
                        rec.core.edges.insert(depended, previous);
                    }
                    None => {
                        rec.core.edges.remove(&depended);
                    }
                }
            }
            warn!(
                job_id = %depending,
                depended = %depended,
                "rejected dependency that would create a cycle"
            );
            return Err(TetherError::cycle(format!(
                "dependency {depending} -> {depended} would create a cycle"
            )));
        }

        debug!(job_id = %depending, depended = %depended, "dependency added");
        Ok(())
    }

    /// Follow the assimilation chain to the surviving job.
    fn resolve_assimilated(&self, mut id: JobId) -> JobId {
        let mut hops = 0;
        while let Some(rec) = self.jobs.get(&id) {
            match rec.core.assimilated_by {
                Some(by) if hops < 32 => {
                    id = by;
                    hops += 1;
                }
                _ => break,
            }
        }
        id
    }

    fn graph_has_cycle(&self) -> bool {
        use petgraph::algo::is_cyclic_directed;
        use petgraph::graph::DiGraph;

        let mut graph: DiGraph<JobId, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for id in self.jobs.keys() {
            nodes.insert(*id, graph.add_node(*id));
        }
        for (id, rec) in &self.jobs {
            for depended in rec.core.edges.keys() {
                if let (Some(&from), Some(&to)) = (nodes.get(id), nodes.get(depended)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        is_cyclic_directed(&graph)
    }

    // ─── Collisions and assimilation ────────────────────────────────────

    /// Compare the newly enqueued job's concurrency policy against every
    /// active job and let the existing job's strategy resolve any collision.
    async fn check_for_collision(&mut self, candidate_id: JobId) {
        let candidate_policy = self
            .jobs
            .get(&candidate_id)
            .and_then(|rec| rec.core.policy.as_ref())
            .and_then(|policy| policy.concurrency_policy().cloned());
        let Some(candidate_policy) = candidate_policy else {
            return;
        };

        for other_id in self.sorted_ids() {
            if other_id == candidate_id {
                continue;
            }
            let colliding = {
                let Some(other) = self.jobs.get_mut(&other_id) else {
                    continue;
                };
                if other.core.state().is_terminal() {
                    continue;
                }
                let Some(policy) = other.core.policy.as_mut() else {
                    continue;
                };
                if policy.should_fail_job() {
                    continue;
                }
                policy
                    .concurrency_policy()
                    .map(|other_policy| candidate_policy.collides_with(other_policy))
                    .unwrap_or(false)
            };
            if !colliding {
                continue;
            }

            warn!(
                existing = %other_id,
                candidate = %candidate_id,
                policy = %candidate_policy,
                "concurrency collision"
            );

            if let Err(err) = self
                .resolve_collision(candidate_policy.strategy(), other_id, candidate_id)
                .await
            {
                warn!(
                    job_id = %other_id,
                    error = %err,
                    "job expelled due to concurrency policy misbehavior"
                );
                let mut queue = TransitionQueue::new();
                self.request_cancel(other_id, &mut queue);
                self.drain_transitions(&mut queue).await;
            }

            let assimilated = self
                .jobs
                .get(&candidate_id)
                .map(|rec| rec.core.assimilated_by.is_some())
                .unwrap_or(true);
            if assimilated {
                return;
            }
        }
    }

    async fn resolve_collision(
        &mut self,
        strategy: CollisionStrategy,
        existing_id: JobId,
        candidate_id: JobId,
    ) -> Result<()> {
        match strategy {
            CollisionStrategy::Fifo => {
                let already_depending = self
                    .jobs
                    .get(&candidate_id)
                    .map(|rec| rec.core.edges.contains_key(&existing_id))
                    .unwrap_or(true);
                if !already_depending {
                    self.add_edge(
                        candidate_id,
                        existing_id,
                        DependencyFailureStrategy::IgnoreFailure,
                    )?;
                }
                Ok(())
            }
            CollisionStrategy::SingletonKeepExisting => {
                if self.try_assimilate(existing_id, candidate_id) {
                    self.assimilate_into(candidate_id, existing_id).await;
                    Ok(())
                } else {
                    self.add_edge(
                        candidate_id,
                        existing_id,
                        DependencyFailureStrategy::IgnoreFailure,
                    )
                }
            }
            CollisionStrategy::SingletonReplaceExisting => {
                if self.try_assimilate(candidate_id, existing_id) {
                    self.assimilate_into(existing_id, candidate_id).await;
                    Ok(())
                } else {
                    self.add_edge(
                        existing_id,
                        candidate_id,
                        DependencyFailureStrategy::IgnoreFailure,
                    )
                }
            }
        }
    }

    /// Ask `survivor` to absorb `redundant`'s work. False when either
    /// handler is busy or absorption is declined.
    fn try_assimilate(&mut self, survivor_id: JobId, redundant_id: JobId) -> bool {
        let (Some(survivor), Some(redundant)) = (
            self.jobs.get(&survivor_id).map(|rec| rec.handler.clone()),
            self.jobs.get(&redundant_id).map(|rec| rec.handler.clone()),
        ) else {
            return false;
        };

        let (Ok(mut survivor), Ok(mut redundant)) =
            (survivor.try_lock(), redundant.try_lock())
        else {
            return false;
        };

        survivor.assimilate(&mut **redundant)
    }

    /// Move `assimilated_id` to ASSIMILATED with `by_id` as its assimilator
    /// and rewrite every other job's edges from the assimilated job to the
    /// assimilator.
    async fn assimilate_into(&mut self, assimilated_id: JobId, by_id: JobId) {
        {
            let Some(rec) = self.jobs.get_mut(&assimilated_id) else {
                return;
            };
            rec.core.assimilated_by = Some(by_id);
        }
        info!(job_id = %assimilated_id, assimilator = %by_id, "job assimilated");
        self.transition(assimilated_id, State::Assimilated, None)
            .await;

        let assimilated_view = match self.jobs.get(&assimilated_id) {
            Some(rec) => rec.core.view(),
            None => return,
        };
        let Some(by_view) = self.jobs.get(&by_id).map(|rec| rec.core.view()) else {
            return;
        };

        for other_id in self.sorted_ids() {
            if other_id == assimilated_id || other_id == by_id {
                continue;
            }

            let strategy = {
                let Some(other) = self.jobs.get_mut(&other_id) else {
                    continue;
                };
                other.core.edges.remove(&assimilated_id)
            };
            if let Some(strategy) = strategy {
                if let Err(err) = self.add_edge(other_id, by_id, strategy) {
                    warn!(
                        job_id = %other_id,
                        error = %err,
                        "could not rewrite dependency to assimilator"
                    );
                    if let Some(other) = self.jobs.get_mut(&other_id) {
                        other.core.edges.insert(assimilated_id, strategy);
                    }
                }
            }

            let ops = {
                let Some(other) = self.jobs.get_mut(&other_id) else {
                    continue;
                };
                let handler = other.handler.clone();
                let Ok(mut guard) = handler.try_lock() else {
                    continue;
                };
                let mut ops = Vec::new();
                let mut ctx = ServiceContext {
                    core: &mut other.core,
                    ops: &mut ops,
                };
                guard.on_job_assimilated(&mut ctx, &by_view, &assimilated_view);
                drop(guard);
                ops
            };
            let mut queue = TransitionQueue::new();
            self.apply_ops(ops, &mut queue);
            self.drain_transitions(&mut queue).await;
        }
    }

    // ─── Persistence and removal ────────────────────────────────────────

    /// Evict removable jobs, write dirty ones. A failing persistor demotes
    /// the job: best-effort cancel and removal from storage.
    async fn persist(&mut self, id: JobId) {
        if self.is_removable(id, &mut HashSet::new()) {
            if let Some(mut rec) = self.jobs.remove(&id) {
                rec.stop_tasks();
            }
            self.index.remove(&id);
            debug!(job_id = %id, "removed terminal job from the registry");
            if let Some(persistor) = self.persistor.clone() {
                if let Err(err) = persistor.remove_job(id).await {
                    warn!(job_id = %id, error = %err, "failed removing job from persistor");
                }
            }
            return;
        }

        let Some(persistor) = self.persistor.clone() else {
            if let Some(rec) = self.jobs.get_mut(&id) {
                rec.core.dirty = false;
            }
            return;
        };

        enum Snapshot {
            Skip,
            NotPersistable,
            Ready(PersistedJob),
            Failed(TetherError),
        }

        let snapshot = {
            let Some(rec) = self.jobs.get_mut(&id) else {
                return;
            };
            let handler = rec.handler.clone();
            let result = match handler.try_lock() {
                // Work in progress; stay dirty and retry on the next pass.
                Err(_) => Snapshot::Skip,
                Ok(guard) => match guard.persist_tag() {
                    None => Snapshot::NotPersistable,
                    Some(tag) => match guard.snapshot() {
                        Err(err) => Snapshot::Failed(err),
                        Ok(payload) => Snapshot::Ready(PersistedJob {
                            id,
                            tag: tag.to_string(),
                            state: rec.core.state(),
                            state_message: rec.core.shared.state_message(),
                            payload,
                            created_at: Utc::now(),
                        }),
                    },
                },
            };
            result
        };

        match snapshot {
            Snapshot::Skip => {}
            Snapshot::NotPersistable => {
                warn!(
                    job_id = %id,
                    "job declares no persistence tag and will not be durably stored"
                );
                if let Some(rec) = self.jobs.get_mut(&id) {
                    rec.core.dirty = false;
                }
            }
            Snapshot::Failed(err) => {
                self.persist_failure(id, &persistor, err).await;
            }
            Snapshot::Ready(persisted) => match persistor.put_job(&persisted).await {
                Ok(()) => {
                    if let Some(rec) = self.jobs.get_mut(&id) {
                        rec.core.dirty = false;
                    }
                }
                Err(err) => {
                    self.persist_failure(id, &persistor, err).await;
                }
            },
        }
    }

    async fn persist_failure(&mut self, id: JobId, persistor: &Arc<dyn Persistor>, err: TetherError) {
        warn!(job_id = %id, error = %err, "persist failed, removing job");
        let mut queue = TransitionQueue::new();
        self.request_cancel(id, &mut queue);
        self.drain_transitions(&mut queue).await;
        if let Err(err) = persistor.remove_job(id).await {
            warn!(job_id = %id, error = %err, "failed removing job from persistor");
        }
    }

    /// A job is removable iff it is terminal, does not ask to be retained,
    /// and no non-removable job depends on it.
    fn is_removable(&self, id: JobId, visiting: &mut HashSet<JobId>) -> bool {
        let Some(rec) = self.jobs.get(&id) else {
            return true;
        };
        if !rec.core.state().is_terminal() {
            return false;
        }
        match rec.handler.try_lock() {
            Ok(guard) => {
                if guard.retain_when_terminal() {
                    return false;
                }
            }
            Err(_) => return false,
        }
        if !visiting.insert(id) {
            return true;
        }
        for (other_id, other) in &self.jobs {
            if *other_id == id {
                continue;
            }
            if other.core.edges.contains_key(&id) && !self.is_removable(*other_id, visiting) {
                return false;
            }
        }
        true
    }

    // ─── Introspection ──────────────────────────────────────────────────

    fn state_of(&self, id: JobId) -> Option<State> {
        self.jobs.get(&id).map(|rec| rec.core.state())
    }

    /// Registered job IDs in ascending start-time order.
    fn sorted_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<(Instant, JobId)> = self
            .jobs
            .values()
            .map(|rec| (rec.core.shared.started_at(), rec.core.id))
            .collect();
        ids.sort_by_key(|(started, _)| *started);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn snapshot(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .jobs
            .values()
            .map(|rec| JobSnapshot {
                view: rec.core.view(),
                depends_on: rec.core.edges.keys().copied().collect(),
                attempts: rec.core.attempts,
                total_duration: rec.core.total_duration(),
                started_at: rec.core.shared.started_at(),
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.started_at);
        snapshots
    }

    async fn clear(&mut self) {
        info!("clearing job manager");
        for record in self.jobs.values_mut() {
            record.stop_tasks();
        }
        self.jobs.clear();
        self.index.clear();
        if let Some(persistor) = self.persistor.clone() {
            if let Err(err) = persistor.clear().await {
                warn!(error = %err, "failed clearing persistor");
            }
        }
        self.initialized = false;
        self.initialized_flag.store(false, Ordering::SeqCst);
    }
}
