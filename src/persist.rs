//! Durable persistence of jobs across restarts.
//!
//! The runtime depends only on the small [`Persistor`] contract; concrete
//! backends (file, database) live outside this crate. Jobs that want to be
//! persisted declare a stable type tag plus a serializer pair: the handler's
//! `persist_tag`/`snapshot` on the way out, and a reviver registered with
//! the manager on the way back in. Handlers without a tag are carried in
//! memory only, with a warning.

use crate::error::Result;
use crate::id::JobId;
use crate::job::JobHandler;
use crate::state::State;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A job as written to durable storage.
///
/// The run policy is not persisted; it is rebuilt from the revived handler's
/// `configure_run_policy`. On reload, a job stored in a work-loop state is
/// materialized in WAIT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedJob {
    pub id: JobId,
    /// The stable type tag declared by the handler.
    pub tag: String,
    pub state: State,
    pub state_message: Option<String>,
    /// The handler's payload as produced by `snapshot`.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl PersistedJob {
    /// The state a revived job should start in: work-loop states collapse
    /// to WAIT, everything else is kept as stored.
    pub fn revival_state(&self) -> State {
        if self.state.is_in_work_loop() {
            State::Wait
        } else {
            self.state
        }
    }
}

/// Contract between the runtime and a persistence backend.
#[async_trait]
pub trait Persistor: Send + Sync {
    /// All persisted jobs. Invoked once at the manager's first access.
    async fn list_jobs(&self) -> Result<Vec<PersistedJob>>;

    /// Write or overwrite one job.
    async fn put_job(&self, job: &PersistedJob) -> Result<()>;

    /// Remove one job. Removing an absent job is not an error.
    async fn remove_job(&self, id: JobId) -> Result<()>;

    /// Drop everything.
    async fn clear(&self) -> Result<()>;
}

/// A map-backed persistor for tests and single-process use.
#[derive(Default)]
pub struct InMemoryPersistor {
    jobs: RwLock<HashMap<JobId, PersistedJob>>,
}

impl InMemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl Persistor for InMemoryPersistor {
    async fn list_jobs(&self) -> Result<Vec<PersistedJob>> {
        let jobs = self.jobs.read().await;
        let mut listed: Vec<PersistedJob> = jobs.values().cloned().collect();
        listed.sort_by_key(|job| job.created_at);
        Ok(listed)
    }

    async fn put_job(&self, job: &PersistedJob) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn remove_job(&self, id: JobId) -> Result<()> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.jobs.write().await.clear();
        Ok(())
    }
}

/// Factory that rebuilds a handler from its persisted payload.
pub type Reviver = Arc<dyn Fn(Value) -> Result<Box<dyn JobHandler>> + Send + Sync>;

/// Registry mapping persistence tags to revivers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    revivers: HashMap<&'static str, Reviver>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reviver for a tag. The last registration for a tag wins.
    pub fn register(
        &mut self,
        tag: &'static str,
        reviver: impl Fn(Value) -> Result<Box<dyn JobHandler>> + Send + Sync + 'static,
    ) {
        self.revivers.insert(tag, Arc::new(reviver));
    }

    pub fn get(&self, tag: &str) -> Option<&Reviver> {
        self.revivers.get(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.revivers.is_empty()
    }
}
