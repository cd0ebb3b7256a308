//! Job lifecycle states and their predicates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job.
///
/// A job starts in `New`, cycles through the work loop (`Wait`, `Ready`,
/// `Busy`) under the control of its run policy, and ends in one of the
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Initial state. Next lifecycle callback: `on_added`.
    New,
    /// Added but blocked on some condition. Next callback: `on_prepare`.
    Wait,
    /// Ready for processing. Next callback: `do_work`.
    Ready,
    /// An attempt is actively underway. Next callback: `check_progress`.
    Busy,
    /// Job completed successfully.
    Succeeded,
    /// Job failed and will not be retried.
    Faulted,
    /// Job was deliberately canceled.
    Canceled,
    /// Job was merged into another job with a matching concurrency policy.
    Assimilated,
}

impl State {
    /// A terminal state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Faulted | Self::Canceled | Self::Assimilated
        )
    }

    /// Failed states trigger rollback when left from the work loop.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Faulted | Self::Canceled)
    }

    /// States in which the service loop actively drives the job.
    pub fn is_in_work_loop(&self) -> bool {
        matches!(self, Self::Wait | Self::Ready | Self::Busy)
    }

    /// States preceding the first execution of an attempt.
    pub fn is_pre_execute(&self) -> bool {
        matches!(self, Self::New | Self::Wait | Self::Ready)
    }

    /// Whether a transition from `self` to `new_state` should be written to
    /// durable storage. Churn inside the work loop is not persistable; only
    /// leaving it for a terminal state is. Outside the work loop any real
    /// state change is persistable.
    pub fn transition_is_persistable(&self, new_state: State) -> bool {
        if self.is_in_work_loop() {
            return new_state.is_terminal();
        }
        new_state != *self
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Wait => write!(f, "WAIT"),
            Self::Ready => write!(f, "READY"),
            Self::Busy => write!(f, "BUSY"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Faulted => write!(f, "FAULTED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Assimilated => write!(f, "ASSIMILATED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_predicate() {
        assert!(State::Succeeded.is_terminal());
        assert!(State::Faulted.is_terminal());
        assert!(State::Canceled.is_terminal());
        assert!(State::Assimilated.is_terminal());
        assert!(!State::New.is_terminal());
        assert!(!State::Wait.is_terminal());
        assert!(!State::Ready.is_terminal());
        assert!(!State::Busy.is_terminal());
    }

    #[test]
    fn test_failed_predicate() {
        assert!(State::Faulted.is_failed());
        assert!(State::Canceled.is_failed());
        assert!(!State::Succeeded.is_failed());
        assert!(!State::Assimilated.is_failed());
    }

    #[test]
    fn test_work_loop_predicate() {
        assert!(State::Wait.is_in_work_loop());
        assert!(State::Ready.is_in_work_loop());
        assert!(State::Busy.is_in_work_loop());
        assert!(!State::New.is_in_work_loop());
        assert!(!State::Succeeded.is_in_work_loop());
    }

    #[test]
    fn test_pre_execute_predicate() {
        assert!(State::New.is_pre_execute());
        assert!(State::Wait.is_pre_execute());
        assert!(State::Ready.is_pre_execute());
        assert!(!State::Busy.is_pre_execute());
        assert!(!State::Faulted.is_pre_execute());
    }

    #[test]
    fn test_persistable_transitions() {
        // Work-loop churn is not persistable.
        assert!(!State::Wait.transition_is_persistable(State::Ready));
        assert!(!State::Ready.transition_is_persistable(State::Busy));
        assert!(!State::Busy.transition_is_persistable(State::Wait));

        // Leaving the work loop for a terminal state is.
        assert!(State::Busy.transition_is_persistable(State::Succeeded));
        assert!(State::Wait.transition_is_persistable(State::Canceled));

        // Outside the work loop, any real change is persistable.
        assert!(State::New.transition_is_persistable(State::Wait));
        assert!(State::New.transition_is_persistable(State::Assimilated));
        assert!(!State::New.transition_is_persistable(State::New));
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&State::Assimilated).unwrap();
        assert_eq!(json, "\"assimilated\"");
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, State::Assimilated);
    }
}
