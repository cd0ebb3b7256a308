//! Job definitions: the handler trait users implement, the pre-submission
//! job value, and the contexts passed to lifecycle callbacks.
//!
//! A job is a small state machine. The runtime owns the lifecycle fields
//! (state, policy, dependency edges, attempt bookkeeping); user code owns its
//! payload inside the handler and reacts through the callbacks below. All
//! callbacks except `do_work` and `rollback` run on the service loop and must
//! not block; `do_work` and `rollback` run on the worker pool.

use crate::error::Result;
use crate::id::JobId;
use crate::observer::JobShared;
use crate::policy::RunPolicy;
use crate::state::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// How a dependent job reacts when a depended job faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailureStrategy {
    /// The dependent fails along with the depended job.
    CascadeFailure,
    /// The dependent may still attempt work after the depended job faulted.
    IgnoreFailure,
}

/// The set of lifecycle callbacks a job implements.
///
/// Only `do_work` is mandatory. Callback errors are caught at the service
/// loop boundary and translated into a FAULTED transition carrying the
/// error's message; they never escape the loop.
#[async_trait]
pub trait JobHandler: Any + Send {
    /// A friendly name for logging. Defaults to the handler's type name.
    fn description(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Produce the run policy governing this job. Called once while the job
    /// is enqueued, and again when a persisted job is revived (the policy
    /// itself is not persisted). The returned policy must not already be
    /// bound to another job.
    fn configure_run_policy(&self) -> RunPolicy {
        RunPolicy::limit_attempts(5).build()
    }

    /// Called once when the job is submitted. Useful for writing a local
    /// representation of the job to a UI or database. Returning `Ready`
    /// proceeds to `on_prepare`; terminal states are also allowed.
    fn on_added(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<State> {
        Ok(State::Ready)
    }

    /// Called when the run policy and dependencies allow the job to proceed.
    /// Last-minute checks go here; a call to `do_work` is always gated by a
    /// call to `on_prepare`. Return `Ready` to proceed, `Wait` to be polled
    /// again on a backoff schedule, or a terminal state. Does not count
    /// against the attempt budget.
    fn on_prepare(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<State> {
        Ok(State::Ready)
    }

    /// The job's main work. Runs on the worker pool while the job is BUSY.
    ///
    /// Return `Succeeded` (result must be set), `Ready`/`Wait` to retry on
    /// the policy schedule, `Faulted`/`Canceled` to fail hard, or `Busy` if
    /// the work continues asynchronously (see `check_progress`). The return
    /// value is validated against the run policy before the transition.
    async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State>;

    /// Called periodically while the job is BUSY and `do_work` has returned
    /// `Busy` for asynchronous continuation. Same return contract as
    /// `do_work`, validated against the run policy.
    fn check_progress(&mut self, ctx: &mut ServiceContext<'_>) -> Result<State> {
        Ok(ctx.state())
    }

    /// Called after any state transition; `ctx.state()` is the new state.
    fn on_state_changed(&mut self, _ctx: &mut ServiceContext<'_>, _old_state: State) {}

    /// Called after any other job has been successfully added. Any action
    /// may be taken here, including canceling the new job or this one, when
    /// concurrency-policy logic is not sufficient.
    fn on_new_job_added(&mut self, _ctx: &mut ServiceContext<'_>, _added: &JobView) {}

    /// Called after any other job is assimilated. The runtime has already
    /// rewritten dependency edges from the assimilated job to its assimilator.
    fn on_job_assimilated(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _assimilating: &JobView,
        _assimilated: &JobView,
    ) {
    }

    /// Called when a depended job has faulted. The default cascades the
    /// failure if the edge uses [`DependencyFailureStrategy::CascadeFailure`].
    fn on_dependency_failed(&mut self, ctx: &mut ServiceContext<'_>, failed: &JobView) -> State {
        if !ctx.state().is_terminal()
            && ctx.depending_mode(failed.id()) == Some(DependencyFailureStrategy::CascadeFailure)
        {
            return State::Faulted;
        }
        ctx.state()
    }

    /// Called when the job was successfully added and subsequently moves to
    /// FAULTED or CANCELED from the work loop. Clean up whatever `on_added`
    /// created. Runs on the worker pool, bounded by the rollback timeout.
    async fn rollback(&mut self) {}

    /// Called when this job's concurrency policy collided with another job's
    /// and this job wins. Absorb the redundant job's work and return true to
    /// move it to ASSIMILATED, or return false to let it continue normally.
    fn assimilate(&mut self, _redundant: &mut dyn JobHandler) -> bool {
        true
    }

    /// Keep the job registered (and persisted) after it reaches a terminal
    /// state. Override to retain faulted jobs for inspection.
    fn retain_when_terminal(&self) -> bool {
        false
    }

    /// A stable type identifier for persistence. Handlers that return `None`
    /// are not durably stored; the runtime logs a warning and carries them
    /// in memory only.
    fn persist_tag(&self) -> Option<&'static str> {
        None
    }

    /// Serialize the handler's payload for persistence. Paired with the
    /// reviver registered for [`persist_tag`](Self::persist_tag).
    fn snapshot(&self) -> Result<Value> {
        Ok(Value::Null)
    }
}

impl dyn JobHandler {
    /// Downcast a handler trait object to its concrete type.
    pub fn downcast_ref<T: JobHandler>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }

    /// Mutable downcast, typically used inside [`JobHandler::assimilate`].
    pub fn downcast_mut<T: JobHandler>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut()
    }
}

/// A job value ready for submission: a handler plus any dependency edges
/// declared up front. Submission binds it exclusively to one manager.
pub struct Job {
    id: JobId,
    handler: Box<dyn JobHandler>,
    edges: Vec<(JobId, DependencyFailureStrategy)>,
}

impl Job {
    /// Wrap a handler into a submittable job.
    pub fn new(handler: impl JobHandler) -> Self {
        Self::from_boxed(Box::new(handler))
    }

    /// Wrap an already-boxed handler.
    pub fn from_boxed(handler: Box<dyn JobHandler>) -> Self {
        Self {
            id: JobId::new(),
            handler,
            edges: Vec::new(),
        }
    }

    /// The job's identity, assigned at construction.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Declare a hard dependency with cascade-failure semantics. The target
    /// must already be submitted to the manager this job will be submitted
    /// to, or submission fails.
    pub fn depends_on(self, depended: JobId) -> Self {
        self.depends_on_with(depended, DependencyFailureStrategy::CascadeFailure)
    }

    /// Declare a dependency with an explicit failure strategy.
    pub fn depends_on_with(mut self, depended: JobId, strategy: DependencyFailureStrategy) -> Self {
        self.edges.push((depended, strategy));
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        JobId,
        Box<dyn JobHandler>,
        Vec<(JobId, DependencyFailureStrategy)>,
    ) {
        (self.id, self.handler, self.edges)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("description", &self.handler.description())
            .field("edges", &self.edges.len())
            .finish()
    }
}

/// A read-only snapshot of another job, handed to cross-job callbacks.
#[derive(Debug, Clone)]
pub struct JobView {
    id: JobId,
    state: State,
    description: String,
    state_message: Option<String>,
}

impl JobView {
    pub(crate) fn new(
        id: JobId,
        state: State,
        description: String,
        state_message: Option<String>,
    ) -> Self {
        Self {
            id,
            state,
            description,
            state_message,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state_message(&self) -> Option<&str> {
        self.state_message.as_deref()
    }
}

impl fmt::Display for JobView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.id, self.description, self.state)?;
        if let Some(msg) = &self.state_message {
            write!(f, " / {msg}")?;
        }
        Ok(())
    }
}

/// Cross-job operations requested from inside a callback, applied by the
/// service loop after the callback returns.
#[derive(Debug)]
pub(crate) enum DeferredOp {
    AddDepended {
        depending: JobId,
        depended: JobId,
        strategy: DependencyFailureStrategy,
    },
    CancelJob(JobId),
}

/// Context passed to service-loop callbacks. Gives access to this job's
/// runtime fields and queues cross-job operations.
pub struct ServiceContext<'a> {
    pub(crate) core: &'a mut JobCore,
    pub(crate) ops: &'a mut Vec<DeferredOp>,
}

impl ServiceContext<'_> {
    pub fn id(&self) -> JobId {
        self.core.id
    }

    pub fn state(&self) -> State {
        self.core.shared.state()
    }

    pub fn state_message(&self) -> Option<String> {
        self.core.shared.state_message()
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.core.attempts
    }

    pub fn run_policy(&self) -> Option<&RunPolicy> {
        self.core.policy.as_ref()
    }

    /// The job's result, if set.
    pub fn result(&self) -> Option<Value> {
        self.core.shared.result()
    }

    /// Set the job's result. Required before a SUCCEEDED transition.
    pub fn set_result(&mut self, result: Value) {
        self.core.shared.set_result(result);
    }

    /// True if cancellation has been requested for this job.
    pub fn is_canceled(&self) -> bool {
        self.core.shared.is_canceled()
    }

    /// The failure strategy of this job's edge to `depended`, if one exists.
    pub fn depending_mode(&self, depended: JobId) -> Option<DependencyFailureStrategy> {
        self.core.edges.get(&depended).copied()
    }

    /// IDs of the jobs this job depends on directly.
    pub fn depended_jobs(&self) -> Vec<JobId> {
        self.core.edges.keys().copied().collect()
    }

    /// Clamp the retry schedule so the next attempt may start immediately.
    pub fn schedule_now(&mut self) {
        if let Some(policy) = self.core.policy.as_mut() {
            policy.schedule_now();
        }
    }

    /// Queue a dependency edge from this job to `depended`. Applied after
    /// the callback returns; a rejected edge (cycle, inactive target) faults
    /// this job with the rejection message.
    pub fn add_depended(&mut self, depended: JobId, strategy: DependencyFailureStrategy) {
        self.ops.push(DeferredOp::AddDepended {
            depending: self.core.id,
            depended,
            strategy,
        });
    }

    /// Queue a cancellation of another job.
    pub fn cancel_job(&mut self, id: JobId) {
        self.ops.push(DeferredOp::CancelJob(id));
    }
}

/// Context passed to `do_work` on the worker pool.
pub struct WorkContext {
    pub(crate) id: JobId,
    pub(crate) attempt: u32,
    pub(crate) shared: Arc<JobShared>,
}

impl WorkContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The current attempt number, 1-indexed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// True if cancellation has been requested. Long-running work should
    /// poll this and bail out early.
    pub fn is_canceled(&self) -> bool {
        self.shared.is_canceled()
    }

    pub fn result(&self) -> Option<Value> {
        self.shared.result()
    }

    /// Set the job's result. Required before returning `Succeeded`.
    pub fn set_result(&mut self, result: Value) {
        self.shared.set_result(result);
    }
}

/// A handler built from a closure, for jobs that don't need the full
/// callback surface. The closure runs as `do_work`; if it succeeds without
/// setting a result, `true` is recorded as the result.
pub struct FnHandler {
    name: String,
    policy: Option<RunPolicy>,
    work: Box<dyn FnMut(&mut WorkContext) -> Result<State> + Send>,
}

impl FnHandler {
    pub fn new(
        name: impl Into<String>,
        work: impl FnMut(&mut WorkContext) -> Result<State> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            policy: None,
            work: Box::new(work),
        }
    }

    /// Use the given run policy instead of the default.
    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    fn description(&self) -> String {
        self.name.clone()
    }

    fn configure_run_policy(&self) -> RunPolicy {
        match &self.policy {
            Some(policy) => policy.build_upon().build(),
            None => RunPolicy::limit_attempts(5).build(),
        }
    }

    async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
        let state = (self.work)(ctx)?;
        if state == State::Succeeded && ctx.result().is_none() {
            ctx.set_result(Value::Bool(true));
        }
        Ok(state)
    }
}

/// Runtime-owned lifecycle fields of a registered job.
pub(crate) struct JobCore {
    pub id: JobId,
    pub policy: Option<RunPolicy>,
    pub edges: HashMap<JobId, DependencyFailureStrategy>,
    pub shared: Arc<JobShared>,
    pub dirty: bool,
    pub poll_interval: Duration,
    pub default_poll_interval: Duration,
    pub attempts: u32,
    pub assimilated_by: Option<JobId>,
    /// Jobs that asked to be serviced when this job reaches a terminal
    /// state. Not a complete list of dependents.
    pub waiting_dependents: HashSet<JobId>,
    pub state_durations: HashMap<State, Duration>,
    pub last_transition: Instant,
    pub description: String,
}

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

impl JobCore {
    pub fn new(
        id: JobId,
        shared: Arc<JobShared>,
        description: String,
        default_poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            policy: None,
            edges: HashMap::new(),
            shared,
            dirty: false,
            poll_interval: default_poll_interval,
            default_poll_interval,
            attempts: 0,
            assimilated_by: None,
            waiting_dependents: HashSet::new(),
            state_durations: HashMap::new(),
            last_transition: Instant::now(),
            description,
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn view(&self) -> JobView {
        JobView::new(
            self.id,
            self.state(),
            self.description.clone(),
            self.shared.state_message(),
        )
    }

    /// Grow the poll interval geometrically, capped at ten seconds.
    pub fn increment_poll_interval(&mut self) -> Duration {
        self.poll_interval = Duration::from_millis(
            ((self.poll_interval.as_millis() as f64 * 1.2) as u64)
                .min(MAX_POLL_INTERVAL.as_millis() as u64),
        );
        self.poll_interval
    }

    pub fn reset_poll_interval(&mut self) {
        self.poll_interval = self.default_poll_interval;
    }

    /// Accumulate time spent in `old_state` and log a summary on terminal
    /// transitions.
    pub fn record_transition(&mut self, old_state: State, new_state: State) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_transition);
        *self
            .state_durations
            .entry(old_state)
            .or_insert(Duration::ZERO) += elapsed;
        self.last_transition = now;

        if new_state == State::Busy {
            self.attempts += 1;
        }

        if new_state.is_terminal() && new_state != State::Canceled {
            let mut summary = String::new();
            for (state, duration) in &self.state_durations {
                summary.push_str(&format!("{state}:{}ms ", duration.as_millis()));
            }
            info!(
                job_id = %self.id,
                description = %self.description,
                state = %new_state,
                attempts = self.attempts,
                durations = %summary.trim_end(),
                "job reached terminal state"
            );
        }
    }

    /// Total time spent in non-terminal states.
    pub fn total_duration(&self) -> Duration {
        self.state_durations
            .iter()
            .filter(|(state, _)| !state.is_terminal())
            .map(|(_, duration)| *duration)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ProbeHandler {
        marker: u32,
    }

    #[async_trait]
    impl JobHandler for ProbeHandler {
        async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
            ctx.set_result(Value::from(self.marker));
            Ok(State::Succeeded)
        }
    }

    #[test]
    fn test_handler_downcast() {
        let mut handler: Box<dyn JobHandler> = Box::new(ProbeHandler { marker: 7 });
        assert_eq!(handler.downcast_ref::<ProbeHandler>().unwrap().marker, 7);
        handler.downcast_mut::<ProbeHandler>().unwrap().marker = 9;
        assert_eq!(handler.downcast_ref::<ProbeHandler>().unwrap().marker, 9);
        assert!(handler.downcast_ref::<FnHandler>().is_none());
    }

    #[test]
    fn test_handler_description_default() {
        let handler = ProbeHandler { marker: 0 };
        assert_eq!(handler.description(), "ProbeHandler");
    }

    #[test]
    fn test_job_builder_edges() {
        let upstream = JobId::new();
        let job = Job::new(ProbeHandler { marker: 1 })
            .depends_on(upstream)
            .depends_on_with(JobId::new(), DependencyFailureStrategy::IgnoreFailure);
        let (_, _, edges) = job.into_parts();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].0, upstream);
        assert_eq!(edges[0].1, DependencyFailureStrategy::CascadeFailure);
        assert_eq!(edges[1].1, DependencyFailureStrategy::IgnoreFailure);
    }

    fn probe_shared() -> Arc<JobShared> {
        Arc::new(JobShared::new(
            JobId::new(),
            "probe".to_string(),
            crate::observer::CallbackDispatcher::new(),
        ))
    }

    #[test]
    fn test_poll_interval_growth() {
        let shared = probe_shared();
        let mut core = JobCore::new(
            JobId::new(),
            shared,
            "probe".to_string(),
            Duration::from_millis(200),
        );

        let first = core.increment_poll_interval();
        assert_eq!(first, Duration::from_millis(240));

        for _ in 0..60 {
            core.increment_poll_interval();
        }
        assert_eq!(core.poll_interval, Duration::from_secs(10));

        core.reset_poll_interval();
        assert_eq!(core.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_duration_ledger() {
        let shared = probe_shared();
        let mut core = JobCore::new(
            JobId::new(),
            shared,
            "probe".to_string(),
            Duration::from_millis(200),
        );

        core.record_transition(State::New, State::Wait);
        std::thread::sleep(Duration::from_millis(30));
        core.record_transition(State::Wait, State::Busy);
        assert_eq!(core.attempts, 1);
        assert!(core.total_duration() >= Duration::from_millis(25));
    }
}
