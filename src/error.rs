//! Error types for the tether runtime.
//!
//! Errors here are the ones that surface synchronously to callers, from
//! `submit`, `add_dependency`, and policy binding. Failures that occur inside
//! the service loop or on the worker pool never propagate as errors; they are
//! translated into FAULTED state transitions carrying a state message.

use thiserror::Error;

/// A specialized Result type for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

/// Errors surfaced by the runtime's public API.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    /// A caller passed an argument the runtime cannot accept, e.g. a NEW
    /// state to a transition request or an empty concurrency key.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted against an object in the wrong lifecycle
    /// phase, e.g. re-binding a RunPolicy or transitioning a canceled job.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A dependency edge points at a job that is not active in the owning
    /// manager, or at the job itself.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Accepting a dependency edge would close a cycle in the graph.
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// The configured persistor failed. The affected job is canceled and
    /// removed from durable storage on a best-effort basis.
    #[error("persist error: {0}")]
    Persist(String),

    /// A spawned background task (work attempt or rollback) died before
    /// reporting back, e.g. it panicked outside the user-callback guard.
    #[error("join error: {0}")]
    Join(String),

    /// The service loop is gone (manager shut down) so the request cannot
    /// be delivered.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

impl TetherError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    pub(crate) fn cycle(msg: impl Into<String>) -> Self {
        Self::DependencyCycle(msg.into())
    }

    pub(crate) fn join(msg: impl Into<String>) -> Self {
        Self::Join(msg.into())
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}
