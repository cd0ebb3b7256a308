//! Persistence tests: durable round trips, revival semantics, eviction,
//! and the warn-and-skip path for handlers without a persistence tag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether::config::RuntimeConfig;
use tether::{
    FnHandler, InMemoryPersistor, Job, JobHandler, JobManager, Persistor, Result, RunPolicy,
    State, TetherError, WorkContext,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_builder() -> tether::JobManagerBuilder {
    let config: RuntimeConfig =
        serde_json::from_str(r#"{"service": {"default_poll_interval_ms": 20}}"#).unwrap();
    JobManager::builder().config(config)
}

/// A durable job that idles before starting so tests can capture it in a
/// work-loop state.
#[derive(Serialize, Deserialize)]
struct SlowStartJob {
    label: String,
    #[serde(default)]
    start_delay_ms: u64,
}

#[async_trait]
impl JobHandler for SlowStartJob {
    fn configure_run_policy(&self) -> RunPolicy {
        RunPolicy::builder()
            .initial_delay(Duration::from_millis(self.start_delay_ms))
            .build()
    }

    async fn do_work(&mut self, ctx: &mut WorkContext) -> Result<State> {
        ctx.set_result(json!(self.label));
        Ok(State::Succeeded)
    }

    fn persist_tag(&self) -> Option<&'static str> {
        Some("slow-start")
    }

    fn snapshot(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|err| TetherError::Persist(err.to_string()))
    }
}

fn revive_slow_start(payload: Value) -> Result<Box<dyn JobHandler>> {
    let mut job: SlowStartJob =
        serde_json::from_value(payload).map_err(|err| TetherError::Persist(err.to_string()))?;
    job.start_delay_ms = 0;
    Ok(Box::new(job))
}

#[tokio::test]
async fn test_round_trip_restores_job_in_wait() {
    let persistor = Arc::new(InMemoryPersistor::new());

    let id = {
        let manager = fast_builder().persistor(persistor.clone()).build();
        let observer = manager
            .submit(Job::new(SlowStartJob {
                label: "replay me".to_string(),
                start_delay_ms: 600_000,
            }))
            .await
            .unwrap();
        observer.wait_until_added(WAIT).await;

        // The NEW -> WAIT transition is persistable.
        let deadline = tokio::time::Instant::now() + WAIT;
        while persistor.is_empty().await {
            assert!(tokio::time::Instant::now() < deadline, "job never persisted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stored = persistor.list_jobs().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, State::Wait);
        assert_eq!(stored[0].tag, "slow-start");

        manager.shutdown();
        observer.id()
    };

    // A fresh manager revives the job from the persistor and runs it.
    let manager = fast_builder()
        .persistor(persistor.clone())
        .register_handler("slow-start", revive_slow_start)
        .build();

    let jobs = manager.get_jobs().await;
    assert_eq!(jobs.len(), 1);
    let revived = &jobs[0];
    assert_eq!(revived.id(), id);

    assert_eq!(revived.wait_for_terminal_state(WAIT).await, State::Succeeded);
    assert_eq!(revived.result(), Some(json!("replay me")));

    // Terminal and unreferenced: evicted from registry and storage.
    let deadline = tokio::time::Instant::now() + WAIT;
    while !persistor.is_empty().await {
        assert!(tokio::time::Instant::now() < deadline, "job never evicted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.get_jobs().await.is_empty());
}

#[tokio::test]
async fn test_unregistered_tag_is_skipped_on_reload() {
    let persistor = Arc::new(InMemoryPersistor::new());

    {
        let manager = fast_builder().persistor(persistor.clone()).build();
        let observer = manager
            .submit(Job::new(SlowStartJob {
                label: "stranded".to_string(),
                start_delay_ms: 600_000,
            }))
            .await
            .unwrap();
        observer.wait_until_added(WAIT).await;

        let deadline = tokio::time::Instant::now() + WAIT;
        while persistor.is_empty().await {
            assert!(tokio::time::Instant::now() < deadline, "job never persisted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown();
    }

    // No reviver registered: the stored job is not materialized.
    let manager = fast_builder().persistor(persistor.clone()).build();
    assert!(manager.get_jobs().await.is_empty());
}

#[tokio::test]
async fn test_untagged_jobs_are_memory_only() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let manager = fast_builder().persistor(persistor.clone()).build();

    let observer = manager
        .submit(Job::new(
            FnHandler::new("ephemeral", |ctx| {
                ctx.set_result(json!("done"));
                Ok(State::Succeeded)
            })
            .with_policy(
                RunPolicy::builder()
                    .initial_delay(Duration::from_millis(200))
                    .build(),
            ),
        ))
        .await
        .unwrap();
    observer.wait_until_added(WAIT).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(persistor.is_empty().await);

    // The job still runs to completion in memory.
    assert_eq!(observer.wait_for_terminal_state(WAIT).await, State::Succeeded);
    assert!(persistor.is_empty().await);
}

#[tokio::test]
async fn test_clear_wipes_registry_and_persistor() {
    let persistor = Arc::new(InMemoryPersistor::new());
    let manager = fast_builder().persistor(persistor.clone()).build();

    let observer = manager
        .submit(Job::new(SlowStartJob {
            label: "to be cleared".to_string(),
            start_delay_ms: 600_000,
        }))
        .await
        .unwrap();
    observer.wait_until_added(WAIT).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while persistor.is_empty().await {
        assert!(tokio::time::Instant::now() < deadline, "job never persisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    manager.clear().await;
    assert!(persistor.is_empty().await);
    assert!(manager.get_jobs().await.is_empty());
}

#[tokio::test]
async fn test_faulted_job_survives_restart() {
    let persistor = Arc::new(InMemoryPersistor::new());

    /// Faults immediately but asks to be retained for inspection.
    #[derive(Serialize, Deserialize)]
    struct StickyFailure;

    #[async_trait]
    impl JobHandler for StickyFailure {
        fn configure_run_policy(&self) -> RunPolicy {
            RunPolicy::limit_attempts(1).build()
        }

        async fn do_work(&mut self, _ctx: &mut WorkContext) -> Result<State> {
            Ok(State::Faulted)
        }

        fn retain_when_terminal(&self) -> bool {
            true
        }

        fn persist_tag(&self) -> Option<&'static str> {
            Some("sticky-failure")
        }

        fn snapshot(&self) -> Result<Value> {
            Ok(json!({}))
        }
    }

    let id = {
        let manager = fast_builder().persistor(persistor.clone()).build();
        let observer = manager.submit(Job::new(StickyFailure)).await.unwrap();
        assert_eq!(observer.wait_for_terminal_state(WAIT).await, State::Faulted);

        let deadline = tokio::time::Instant::now() + WAIT;
        while persistor.is_empty().await {
            assert!(tokio::time::Instant::now() < deadline, "job never persisted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown();
        observer.id()
    };

    let manager = fast_builder()
        .persistor(persistor.clone())
        .register_handler("sticky-failure", |_payload| {
            Ok(Box::new(StickyFailure) as Box<dyn JobHandler>)
        })
        .build();

    let revived = manager.get_job(id).await.expect("faulted job survives");
    assert_eq!(revived.state(), State::Faulted);
}
