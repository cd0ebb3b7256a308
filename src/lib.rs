//! # Tether
//!
//! A client-side job orchestration runtime. Jobs are small state machines
//! driven through submission, preparation, execution, retry, dependency
//! resolution, and terminal disposition by a single serialized service loop.
//!
//! Built for application code that must run many interdependent,
//! failure-prone, possibly long-lived operations: uploads that outlive a
//! network drop, syncs that must not run twice, chains of work where a
//! failure upstream should (or should not) take the downstream with it.
//!
//! ## Architecture
//!
//! - **Service loop**: one task owns the registry and serializes every state
//!   transition, giving each job a total transition order.
//! - **Run policy**: per-job attempt budget, timeouts, static or exponential
//!   retry delay, gating conditions, and a concurrency identity.
//! - **Dependency graph**: dynamic DAG with on-line cycle detection and
//!   cascading failure along `CascadeFailure` edges.
//! - **Collision resolution**: FIFO serialization or singleton semantics
//!   (keep-existing / replace-existing) with work assimilation.
//! - **Worker pool**: a bounded pool runs only the user work callbacks.
//! - **Persistence**: a pluggable put/remove/list backend replays jobs
//!   across restarts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether::{Job, JobManager, FnHandler, State};
//! use std::time::Duration;
//!
//! let manager = JobManager::new();
//! let observer = manager
//!     .submit(Job::new(FnHandler::new("greet", |ctx| {
//!         ctx.set_result("hello".into());
//!         Ok(State::Succeeded)
//!     })))
//!     .await?;
//!
//! let state = observer.wait_for_terminal_state(Duration::from_secs(5)).await;
//! assert_eq!(state, State::Succeeded);
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod observer;
pub mod persist;
pub mod policy;
pub mod runtime;
pub mod state;
pub mod telemetry;

pub use error::{Result, TetherError};
pub use id::JobId;
pub use job::{
    DependencyFailureStrategy, FnHandler, Job, JobHandler, JobView, ServiceContext, WorkContext,
};
pub use observer::{JobObserver, NOTIFY_KEY_STATE_CHANGE};
pub use persist::{HandlerRegistry, InMemoryPersistor, PersistedJob, Persistor};
pub use policy::{
    CollisionStrategy, ConcurrencyKey, ConcurrencyPolicy, FlagCondition, GatingCondition,
    KeyComponent, RunPolicy,
};
pub use runtime::{display_order, JobManager, JobManagerBuilder, JobSnapshot, WorkerPoolStats};
pub use state::State;

/// Re-export of commonly used types.
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{Result, TetherError};
    pub use crate::id::JobId;
    pub use crate::job::{
        DependencyFailureStrategy, FnHandler, Job, JobHandler, JobView, ServiceContext,
        WorkContext,
    };
    pub use crate::observer::{JobObserver, NOTIFY_KEY_STATE_CHANGE};
    pub use crate::persist::{InMemoryPersistor, PersistedJob, Persistor};
    pub use crate::policy::{
        ConcurrencyPolicy, FlagCondition, GatingCondition, RunPolicy,
    };
    pub use crate::runtime::{JobManager, JobManagerBuilder, JobSnapshot};
    pub use crate::state::State;
}
