//! End-to-end tests for the job manager: submission, retries, cancellation,
//! dependencies, and cycle rejection.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether::config::RuntimeConfig;
use tether::{
    DependencyFailureStrategy, FlagCondition, FnHandler, Job, JobHandler, JobManager, JobView,
    Result, RunPolicy, ServiceContext, State, TetherError, WorkContext,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_manager() -> JobManager {
    let config: RuntimeConfig =
        serde_json::from_str(r#"{"service": {"default_poll_interval_ms": 20}}"#).unwrap();
    JobManager::builder().config(config).build()
}

/// Fails a configurable number of attempts before succeeding.
struct FlakyJob {
    fail_times: u32,
    attempts_seen: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for FlakyJob {
    fn configure_run_policy(&self) -> RunPolicy {
        RunPolicy::limit_attempts(5)
            .retry_delay(Duration::from_millis(30))
            .build()
    }

    async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
        let seen = self.attempts_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen <= self.fail_times {
            return Ok(State::Ready);
        }
        ctx.set_result(json!(seen));
        Ok(State::Succeeded)
    }
}

/// Sleeps until canceled, counting rollback invocations.
struct SleepyJob {
    rollbacks: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for SleepyJob {
    async fn do_work(&mut self, _ctx: &mut WorkContext) -> Result<State> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(State::Succeeded)
    }

    async fn rollback(&mut self) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

struct BadAddJob;

#[async_trait]
impl JobHandler for BadAddJob {
    fn on_added(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<State> {
        Ok(State::New)
    }

    async fn do_work(&mut self, _ctx: &mut WorkContext) -> Result<State> {
        Ok(State::Succeeded)
    }
}

/// Starts asynchronous work and reports completion through check_progress.
struct BackgroundJob {
    polls_until_done: u32,
    polls: u32,
}

#[async_trait]
impl JobHandler for BackgroundJob {
    async fn do_work(&mut self, _ctx: &mut WorkContext) -> Result<State> {
        Ok(State::Busy)
    }

    fn check_progress(&mut self, ctx: &mut ServiceContext<'_>) -> Result<State> {
        self.polls += 1;
        if self.polls >= self.polls_until_done {
            ctx.set_result(json!(self.polls));
            return Ok(State::Succeeded);
        }
        Ok(State::Busy)
    }
}

fn quick_success(name: &str, result: &str) -> Job {
    let result = Value::String(result.to_string());
    Job::new(FnHandler::new(name, move |ctx| {
        ctx.set_result(result.clone());
        Ok(State::Succeeded)
    }))
}

/// A job that sits in WAIT until poked; keeps itself registered for
/// dependency plumbing tests.
fn parked(name: &str) -> Job {
    Job::new(
        FnHandler::new(name, |_ctx| Ok(State::Succeeded)).with_policy(
            RunPolicy::builder()
                .initial_delay(Duration::from_secs(600))
                .build(),
        ),
    )
}

/// A job held in WAIT by a gate that faults once the gate opens.
fn gated_failure(name: &str, gate: &FlagCondition) -> Job {
    Job::new(
        FnHandler::new(name, |_ctx| Ok(State::Faulted)).with_policy(
            RunPolicy::builder().gating_condition_arc(Arc::new(gate.clone())).build(),
        ),
    )
}

#[tokio::test]
async fn test_successful_single_job() {
    let manager = fast_manager();
    let observer = manager.submit(quick_success("single", "X")).await.unwrap();

    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Succeeded);
    assert_eq!(observer.result(), Some(Value::String("X".into())));
}

#[tokio::test]
async fn test_wait_until_added() {
    let manager = fast_manager();
    let observer = manager.submit(quick_success("added", "r")).await.unwrap();

    let state = observer.wait_until_added(WAIT).await;
    assert_ne!(state, State::New);
}

#[tokio::test]
async fn test_retries_until_success() {
    let manager = fast_manager();
    let attempts = Arc::new(AtomicU32::new(0));
    let observer = manager
        .submit(Job::new(FlakyJob {
            fail_times: 2,
            attempts_seen: attempts.clone(),
        }))
        .await
        .unwrap();

    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Succeeded);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(observer.result(), Some(json!(3)));
}

#[tokio::test]
async fn test_retry_exhaustion_faults() {
    let manager = fast_manager();
    let attempts = Arc::new(AtomicU32::new(0));
    let observer = manager
        .submit(Job::new(FlakyJob {
            fail_times: u32::MAX,
            attempts_seen: attempts.clone(),
        }))
        .await
        .unwrap();

    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Faulted);
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(observer.state_message().as_deref(), Some("No more retries"));
}

#[tokio::test]
async fn test_work_error_faults_with_message() {
    let manager = fast_manager();
    let observer = manager
        .submit(Job::new(FnHandler::new("broken", |_ctx| {
            Err(TetherError::InvalidState("backend rejected the upload".into()))
        })))
        .await
        .unwrap();

    // An error from do_work is a hard fault, not a retry.
    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Faulted);
    let message = observer.state_message().unwrap();
    assert!(message.contains("backend rejected the upload"));
}

#[tokio::test]
async fn test_succeeded_without_result_faults() {
    let manager = fast_manager();

    struct NoResultJob;

    #[async_trait]
    impl JobHandler for NoResultJob {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::limit_attempts(1).build()
        }

        async fn do_work(&mut self, _ctx: &mut WorkContext) -> Result<State> {
            Ok(State::Succeeded)
        }
    }

    let observer = manager.submit(Job::new(NoResultJob)).await.unwrap();
    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Faulted);
    assert!(observer.state_message().unwrap().contains("result"));
}

#[tokio::test]
async fn test_cancel_is_idempotent_with_one_rollback() {
    let manager = fast_manager();
    let rollbacks = Arc::new(AtomicU32::new(0));
    let observer = manager
        .submit(Job::new(SleepyJob {
            rollbacks: rollbacks.clone(),
        }))
        .await
        .unwrap();

    // Let the job reach BUSY before canceling.
    let deadline = tokio::time::Instant::now() + WAIT;
    while observer.state() != State::Busy {
        assert!(tokio::time::Instant::now() < deadline, "job never got busy");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first = observer.cancel().await;
    assert_eq!(first, State::Canceled);
    let second = observer.cancel().await;
    assert_eq!(second, State::Canceled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_gating_condition_holds_job_in_wait() {
    let manager = fast_manager();
    let gate = FlagCondition::unsatisfied("offline");

    struct GatedJob {
        gate: FlagCondition,
    }

    #[async_trait]
    impl JobHandler for GatedJob {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::builder()
                .gating_condition(self.gate.clone())
                .build()
        }

        async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
            ctx.set_result(json!("online"));
            Ok(State::Succeeded)
        }
    }

    let observer = manager
        .submit(Job::new(GatedJob { gate: gate.clone() }))
        .await
        .unwrap();

    observer.wait_until_added(WAIT).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(observer.state(), State::Wait);
    assert_eq!(observer.state_message().as_deref(), Some("offline"));

    gate.set(true);
    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Succeeded);
}

#[tokio::test]
async fn test_schedule_now_skips_initial_delay() {
    let manager = fast_manager();

    struct DeferredJob;

    #[async_trait]
    impl JobHandler for DeferredJob {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::builder()
                .initial_delay(Duration::from_secs(60))
                .build()
        }

        async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
            ctx.set_result(json!("poked"));
            Ok(State::Succeeded)
        }
    }

    let observer = manager.submit(Job::new(DeferredJob)).await.unwrap();
    observer.wait_until_added(WAIT).await;
    assert_eq!(observer.state(), State::Wait);

    observer.schedule_now();
    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Succeeded);
}

#[tokio::test]
async fn test_cascade_failure_names_upstream_job() {
    let manager = fast_manager();
    let gate = FlagCondition::unsatisfied("held back");

    let upstream = manager
        .submit(gated_failure("upstream", &gate))
        .await
        .unwrap();
    let downstream = manager
        .submit(parked("downstream").depends_on(upstream.id()))
        .await
        .unwrap();
    downstream.wait_until_added(WAIT).await;

    gate.set(true);
    assert_eq!(upstream.wait_for_terminal_state(WAIT).await, State::Faulted);
    assert_eq!(
        downstream.wait_for_terminal_state(WAIT).await,
        State::Faulted
    );
    let message = downstream.state_message().unwrap();
    assert!(message.contains("upstream dependency"));
    assert!(message.contains(&upstream.id().to_string()));
}

#[tokio::test]
async fn test_ignore_failure_lets_dependent_run() {
    let manager = fast_manager();
    let gate = FlagCondition::unsatisfied("held back");

    let upstream = manager
        .submit(gated_failure("failing-upstream", &gate))
        .await
        .unwrap();
    let downstream = manager
        .submit(
            quick_success("tolerant", "ran")
                .depends_on_with(upstream.id(), DependencyFailureStrategy::IgnoreFailure),
        )
        .await
        .unwrap();
    downstream.wait_until_added(WAIT).await;

    gate.set(true);
    assert_eq!(upstream.wait_for_terminal_state(WAIT).await, State::Faulted);
    assert_eq!(
        downstream.wait_for_terminal_state(WAIT).await,
        State::Succeeded
    );
    assert_eq!(downstream.result(), Some(Value::String("ran".into())));
}

#[tokio::test]
async fn test_dependent_waits_for_depended() {
    let manager = fast_manager();

    let gate = FlagCondition::unsatisfied("waiting on gate");

    struct GatedSuccess {
        gate: FlagCondition,
    }

    #[async_trait]
    impl JobHandler for GatedSuccess {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::builder()
                .gating_condition(self.gate.clone())
                .build()
        }

        async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
            ctx.set_result(json!("first"));
            Ok(State::Succeeded)
        }
    }

    let first = manager
        .submit(Job::new(GatedSuccess { gate: gate.clone() }))
        .await
        .unwrap();
    let second = manager
        .submit(quick_success("second", "second").depends_on(first.id()))
        .await
        .unwrap();

    second.wait_until_added(WAIT).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(second.state(), State::Wait);

    gate.set(true);
    assert_eq!(first.wait_for_terminal_state(WAIT).await, State::Succeeded);
    assert_eq!(second.wait_for_terminal_state(WAIT).await, State::Succeeded);
}

#[tokio::test]
async fn test_cycle_rejected_and_graph_unchanged() {
    let manager = fast_manager();

    let a = manager.submit(parked("a")).await.unwrap();
    let b_job = parked("b").depends_on(a.id());
    let b = manager.submit(b_job).await.unwrap();

    let result = manager
        .add_dependency(a.id(), b.id(), DependencyFailureStrategy::CascadeFailure)
        .await;
    assert!(matches!(result, Err(TetherError::DependencyCycle(_))));

    let snapshots = manager.snapshot().await;
    let a_snapshot = snapshots.iter().find(|s| s.id() == a.id()).unwrap();
    assert!(a_snapshot.depends_on.is_empty());

    let b_snapshot = snapshots.iter().find(|s| s.id() == b.id()).unwrap();
    assert_eq!(b_snapshot.depends_on, vec![a.id()]);
}

#[tokio::test]
async fn test_self_dependency_rejected() {
    let manager = fast_manager();
    let a = manager.submit(parked("selfish")).await.unwrap();

    let result = manager
        .add_dependency(a.id(), a.id(), DependencyFailureStrategy::CascadeFailure)
        .await;
    assert!(matches!(result, Err(TetherError::DependencyCycle(_))));
}

#[tokio::test]
async fn test_pre_submission_edge_to_unknown_job_rejected() {
    let manager = fast_manager();

    let job = parked("orphan-edge").depends_on(tether::JobId::new());
    let result = manager.submit(job).await;
    assert!(matches!(result, Err(TetherError::Dependency(_))));
}

#[tokio::test]
async fn test_dependency_on_unsubmitted_target_then_retry() {
    let manager = fast_manager();

    let a = manager.submit(parked("a")).await.unwrap();
    let phantom = tether::JobId::new();

    let result = manager
        .add_dependency(a.id(), phantom, DependencyFailureStrategy::CascadeFailure)
        .await;
    assert!(matches!(result, Err(TetherError::Dependency(_))));

    let target = manager.submit(parked("target")).await.unwrap();
    manager
        .add_dependency(a.id(), target.id(), DependencyFailureStrategy::CascadeFailure)
        .await
        .unwrap();

    let snapshots = manager.snapshot().await;
    let a_snapshot = snapshots.iter().find(|s| s.id() == a.id()).unwrap();
    assert_eq!(a_snapshot.depends_on, vec![target.id()]);
}

#[tokio::test]
async fn test_on_added_returning_new_faults() {
    let manager = fast_manager();
    let observer = manager.submit(Job::new(BadAddJob)).await.unwrap();

    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Faulted);
    assert!(observer.state_message().unwrap().contains("on_added"));
}

#[tokio::test]
async fn test_asynchronous_continuation_via_check_progress() {
    let manager = fast_manager();
    let observer = manager
        .submit(Job::new(BackgroundJob {
            polls_until_done: 2,
            polls: 0,
        }))
        .await
        .unwrap();

    let state = observer.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Succeeded);
    assert_eq!(observer.result(), Some(json!(2)));
}

#[tokio::test]
async fn test_subscriptions_fire() {
    let manager = fast_manager();
    let gate = FlagCondition::unsatisfied("subscribe gate");

    struct Gated {
        gate: FlagCondition,
    }

    #[async_trait]
    impl JobHandler for Gated {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::builder()
                .gating_condition(self.gate.clone())
                .build()
        }

        async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
            ctx.set_result(json!(true));
            Ok(State::Succeeded)
        }
    }

    let observer = manager
        .submit(Job::new(Gated { gate: gate.clone() }))
        .await
        .unwrap();
    observer.wait_until_added(WAIT).await;

    let updates = Arc::new(AtomicU32::new(0));
    let completions = Arc::new(AtomicU32::new(0));
    {
        let updates = updates.clone();
        observer.subscribe(move |_job, key| {
            assert_eq!(key, tether::NOTIFY_KEY_STATE_CHANGE);
            updates.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let completions = completions.clone();
        observer.subscribe_on_complete(move |job| {
            assert!(job.state().is_terminal());
            completions.fetch_add(1, Ordering::SeqCst);
        });
    }

    gate.set(true);
    assert_eq!(observer.wait_for_terminal_state(WAIT).await, State::Succeeded);

    let deadline = tokio::time::Instant::now() + WAIT;
    while completions.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "completion never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(updates.load(Ordering::SeqCst) >= 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_jobs_sorted_by_start_time() {
    let manager = fast_manager();

    let first = manager.submit(parked("first")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = manager.submit(parked("second")).await.unwrap();

    let jobs = manager.get_jobs().await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id(), first.id());
    assert_eq!(jobs[1].id(), second.id());

    assert!(manager.get_job(first.id()).await.is_some());
    assert!(manager.get_job(tether::JobId::new()).await.is_none());
}

#[tokio::test]
async fn test_on_new_job_added_can_cancel_newcomer() {
    let manager = fast_manager();

    struct Doorman {
        seen: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for Doorman {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::builder()
                .initial_delay(Duration::from_secs(60))
                .build()
        }

        fn on_new_job_added(&mut self, ctx: &mut ServiceContext<'_>, added: &JobView) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if added.description().contains("unwelcome") {
                ctx.cancel_job(added.id());
            }
        }

        async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
            ctx.set_result(json!(true));
            Ok(State::Succeeded)
        }
    }

    let seen = Arc::new(AtomicU32::new(0));
    let _doorman = manager
        .submit(Job::new(Doorman { seen: seen.clone() }))
        .await
        .unwrap();

    let unwelcome = manager
        .submit(quick_success("unwelcome-visitor", "nope"))
        .await
        .unwrap();

    let state = unwelcome.wait_for_terminal_state(WAIT).await;
    assert_eq!(state, State::Canceled);
    assert!(seen.load(Ordering::SeqCst) >= 1);
}
