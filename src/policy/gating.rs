//! Gating conditions: external predicates that hold a job in WAIT.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A predicate that must be satisfied before any attempt may start.
///
/// A run policy may carry zero or more gating conditions. The job will not
/// proceed past WAIT (and `on_prepare` will not be called) until every
/// condition is satisfied. Typical use: a connectivity probe for jobs that
/// need the network.
pub trait GatingCondition: Send + Sync {
    /// True if the condition is currently satisfied.
    fn is_satisfied(&self) -> bool;

    /// A human-readable description of the condition, surfaced as the job's
    /// state message while unsatisfied.
    fn message(&self) -> String;
}

/// A gating condition backed by a shared boolean flag.
///
/// Useful for wiring platform signals (network reachability, foreground
/// state) into the runtime: hold a clone of the flag and toggle it from the
/// platform callback.
#[derive(Clone)]
pub struct FlagCondition {
    flag: Arc<AtomicBool>,
    message: String,
}

impl FlagCondition {
    /// Create a condition that is satisfied while the flag is true.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
            message: message.into(),
        }
    }

    /// Create an initially-unsatisfied condition.
    pub fn unsatisfied(message: impl Into<String>) -> Self {
        let cond = Self::new(message);
        cond.set(false);
        cond
    }

    /// Toggle the condition.
    pub fn set(&self, satisfied: bool) {
        self.flag.store(satisfied, Ordering::SeqCst);
    }
}

impl GatingCondition for FlagCondition {
    fn is_satisfied(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn message(&self) -> String {
        self.message.clone()
    }
}
