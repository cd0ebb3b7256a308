//! Run policies: when a job may attempt work and when it must fail.
//!
//! Every job has exactly one [`RunPolicy`] governing its lifecycle: attempt
//! budget, job and attempt timeouts, retry delay (static or exponential
//! backoff), an optional initial delay for debouncing, gating conditions,
//! and an optional concurrency policy. Policies are built with
//! [`RunPolicy::builder`] and bound to a single job at submission.

mod concurrency;
mod gating;

pub use concurrency::{
    CollisionStrategy, ConcurrencyKey, ConcurrencyPolicy, KeyComponent,
};
pub use gating::{FlagCondition, GatingCondition};

use crate::error::{Result, TetherError};
use crate::id::JobId;
use crate::state::State;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// State message set when the attempt budget is exhausted.
pub const FAILED_NO_MORE_RETRIES: &str = "No more retries";
/// State message set when the job exceeds its deadline.
pub const FAILED_TIMED_OUT: &str = "Job timed out";

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Per-job policy machine.
///
/// Times between attempts are dynamic when exponential backoff is in use.
/// All operations that consult the clock use a monotonic `Instant`.
#[derive(Clone)]
pub struct RunPolicy {
    max_attempts: u32,
    attempts_remaining: u32,
    job_timeout: Duration,
    attempt_timeout: Duration,
    /// Current delay after a failed attempt. Doubled on each failure while
    /// backoff is active.
    delay_on_failed_attempt: Duration,
    /// Backoff ceiling. `None` means the retry delay is static.
    delay_on_failed_attempt_max: Option<Duration>,
    initial_delay: Duration,
    time_job_started: Instant,
    /// `None` while no attempt is in progress.
    time_attempt_started: Option<Instant>,
    time_of_next_attempt: Instant,
    state_message: Option<String>,
    gating_conditions: Vec<Arc<dyn GatingCondition>>,
    concurrency_policy: Option<ConcurrencyPolicy>,
    job_id: Option<JobId>,
}

impl std::fmt::Debug for RunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("attempts_remaining", &self.attempts_remaining)
            .field("job_timeout", &self.job_timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("delay_on_failed_attempt", &self.delay_on_failed_attempt)
            .field(
                "delay_on_failed_attempt_max",
                &self.delay_on_failed_attempt_max,
            )
            .field("initial_delay", &self.initial_delay)
            .field("time_job_started", &self.time_job_started)
            .field("time_attempt_started", &self.time_attempt_started)
            .field("time_of_next_attempt", &self.time_of_next_attempt)
            .field("state_message", &self.state_message)
            .field("gating_conditions_count", &self.gating_conditions.len())
            .field("concurrency_policy", &self.concurrency_policy)
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl RunPolicy {
    /// A builder initialized with the defaults: 5 attempts, 24-hour job and
    /// attempt timeouts, 5-second static retry delay, no initial delay.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A builder for a limited number of attempts with the default timeouts
    /// and retry delay.
    pub fn limit_attempts(attempts: u32) -> Builder {
        Builder::new().max_attempts(attempts)
    }

    /// A builder for a job that should retry until the given deadline: 50
    /// attempts and the requested job timeout.
    pub fn job_timeout(timeout: Duration) -> Builder {
        Self::limit_attempts(50).job_timeout(timeout)
    }

    /// A builder initialized from a copy of this policy. The builder does
    /// not modify this policy; it builds new ones.
    pub fn build_upon(&self) -> Builder {
        Builder::from_policy(self.clone())
    }

    /// Bind the policy to a job. Binding is one-shot; re-binding to a
    /// different job fails.
    pub(crate) fn bind(&mut self, job_id: JobId) -> Result<()> {
        if let Some(existing) = self.job_id {
            if existing != job_id {
                return Err(TetherError::invalid_state(
                    "run policy is already assigned to another job",
                ));
            }
        }
        self.job_id = Some(job_id);
        Ok(())
    }

    /// The ID of the bound job, if any.
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    /// The policy's concurrency policy, if any.
    pub fn concurrency_policy(&self) -> Option<&ConcurrencyPolicy> {
        self.concurrency_policy.as_ref()
    }

    /// Notify the policy that a new attempt has started. The caller has
    /// already decided to start; there is no guard here.
    pub fn on_attempt_started(&mut self) {
        self.time_attempt_started = Some(Instant::now());
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        debug!(
            job_id = ?self.job_id,
            attempts_remaining = self.attempts_remaining,
            "job attempt started"
        );
    }

    /// Notify the policy of a failed attempt.
    ///
    /// Returns `Faulted` if the policy is out of attempts or the next attempt
    /// would fall past the job deadline, else `Wait`.
    pub fn on_attempt_failed(&mut self) -> State {
        let now = Instant::now();
        self.time_of_next_attempt = now + self.delay_on_failed_attempt;
        self.time_attempt_started = None;

        if let Some(max) = self.delay_on_failed_attempt_max {
            self.delay_on_failed_attempt = (self.delay_on_failed_attempt * 2).min(max);
        }

        if self.time_of_next_attempt.duration_since(self.time_job_started) >= self.job_timeout {
            debug!(job_id = ?self.job_id, "job faulting because it timed out");
            self.state_message = Some(FAILED_TIMED_OUT.to_string());
            self.time_of_next_attempt = now;
            return State::Faulted;
        }
        if self.attempts_remaining == 0 {
            debug!(job_id = ?self.job_id, "job faulting because no retries left");
            self.state_message = Some(FAILED_NO_MORE_RETRIES.to_string());
            self.time_of_next_attempt = now;
            return State::Faulted;
        }

        debug!(
            job_id = ?self.job_id,
            retries_left = self.attempts_remaining,
            next_attempt_in_ms = self.time_until_next_attempt().as_millis() as u64,
            "attempt failed, retry scheduled"
        );
        self.state_message = None;
        State::Wait
    }

    /// True if the job should fail due to excessive attempts or timeout.
    pub fn should_fail_job(&mut self) -> bool {
        if (self.time_attempt_started.is_none() || self.should_fail_attempt())
            && self.attempts_remaining == 0
        {
            debug!(job_id = ?self.job_id, "job is out of retries");
            self.state_message = Some(FAILED_NO_MORE_RETRIES.to_string());
            return true;
        }

        self.is_job_timed_out()
    }

    /// True if the current attempt should fail, due to the job timing out,
    /// no attempt actually running, or the attempt exceeding its timeout.
    /// Always false before the first attempt has been made.
    pub fn should_fail_attempt(&mut self) -> bool {
        if self.attempts_remaining == self.max_attempts {
            return false;
        }

        if self.is_job_timed_out() {
            return true;
        }

        let Some(started) = self.time_attempt_started else {
            return true;
        };

        if started.elapsed() >= self.attempt_timeout {
            debug!(
                job_id = ?self.job_id,
                attempt_timeout_ms = self.attempt_timeout.as_millis() as u64,
                "aborting attempt, it exceeded the attempt timeout"
            );
            return true;
        }

        false
    }

    fn is_job_timed_out(&mut self) -> bool {
        if self.time_job_started.elapsed() >= self.job_timeout {
            debug!(
                job_id = ?self.job_id,
                job_timeout_ms = self.job_timeout.as_millis() as u64,
                "aborting job, it exceeded the job timeout"
            );
            self.state_message = Some(FAILED_TIMED_OUT.to_string());
            return true;
        }
        false
    }

    /// Validate a requested state against the policy. Returns the requested
    /// state if legal, or a corrected one if not.
    pub fn validate_requested_state(&mut self, state: State) -> State {
        if state.is_terminal() {
            return state;
        }

        if self.should_fail_job() {
            return State::Faulted;
        }

        if state == State::Ready {
            if self.time_attempt_started.is_some() {
                return self.on_attempt_failed();
            }

            if self.time_of_next_attempt > Instant::now() {
                return State::Wait;
            }
        }

        if state == State::Busy
            && self.time_attempt_started.is_some()
            && self.should_fail_attempt()
        {
            return self.on_attempt_failed();
        }

        state
    }

    /// Check whether it's time to start an attempt: no attempt in progress,
    /// attempts remaining, the retry delay elapsed, the job not failed, and
    /// every gating condition satisfied.
    pub fn should_start(&mut self) -> bool {
        if self.time_attempt_started.is_some() {
            return false;
        }

        let mut ret = self.attempts_remaining > 0 && Instant::now() >= self.time_of_next_attempt;

        if ret {
            ret = !self.should_fail_job();
        }

        if ret {
            for condition in &self.gating_conditions {
                if !condition.is_satisfied() {
                    debug!(
                        job_id = ?self.job_id,
                        condition = %condition.message(),
                        "unsatisfied gating condition"
                    );
                    ret = false;
                    break;
                }
            }
        }

        ret
    }

    /// Reset the attempt budget and the start time to now.
    pub fn reset(&mut self) -> &mut Self {
        if let Some(job_id) = self.job_id {
            debug!(job_id = %job_id, "reset run policy");
        }
        self.attempts_remaining = self.max_attempts;
        self.time_job_started = Instant::now();
        self.time_attempt_started = None;
        self.time_of_next_attempt = self.time_job_started + self.initial_delay;
        self.state_message = None;
        self
    }

    /// Schedule an attempt to run as soon as possible, if any remain.
    pub fn schedule_now(&mut self) {
        self.time_of_next_attempt = Instant::now();
    }

    /// A message describing why the job is not proceeding: the terminal
    /// message if set, else the first unsatisfied gating condition's message.
    pub fn message(&self) -> Option<String> {
        if self.state_message.is_some() {
            return self.state_message.clone();
        }

        self.gating_conditions
            .iter()
            .find(|c| !c.is_satisfied())
            .map(|c| c.message())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    pub fn job_timeout_value(&self) -> Duration {
        self.job_timeout
    }

    pub fn attempt_timeout_value(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn retry_delay(&self) -> Duration {
        self.delay_on_failed_attempt
    }

    pub fn retry_delay_max(&self) -> Option<Duration> {
        self.delay_on_failed_attempt_max
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn time_job_started(&self) -> Instant {
        self.time_job_started
    }

    /// The start of the attempt in progress, if one is running.
    pub fn time_attempt_started(&self) -> Option<Instant> {
        self.time_attempt_started
    }

    pub fn time_of_next_attempt(&self) -> Instant {
        self.time_of_next_attempt
    }

    /// Time remaining until the next attempt is allowed. Zero when overdue.
    pub fn time_until_next_attempt(&self) -> Duration {
        self.time_of_next_attempt
            .saturating_duration_since(Instant::now())
    }
}

impl Default for RunPolicy {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempts_remaining: DEFAULT_MAX_ATTEMPTS,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            delay_on_failed_attempt: DEFAULT_RETRY_DELAY,
            delay_on_failed_attempt_max: None,
            initial_delay: Duration::ZERO,
            time_job_started: now,
            time_attempt_started: None,
            time_of_next_attempt: now,
            state_message: None,
            gating_conditions: Vec::new(),
            concurrency_policy: None,
            job_id: None,
        }
    }
}

impl std::fmt::Display for RunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timeout_in = self
            .time_job_started
            .checked_add(self.job_timeout)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(self.job_timeout);
        write!(
            f,
            "attempts_remaining:{} next try in {}ms job timeout in {}ms",
            self.attempts_remaining,
            self.time_until_next_attempt().as_millis(),
            timeout_in.as_millis(),
        )
    }
}

/// Builder for [`RunPolicy`] values. `build` produces a reset, independent
/// policy; the builder never mutates a policy it was derived from.
pub struct Builder {
    policy: RunPolicy,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            policy: RunPolicy::default(),
        }
    }

    fn from_policy(policy: RunPolicy) -> Self {
        Self { policy }
    }

    /// The maximum number of attempts before the job faults.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self.policy.attempts_remaining = attempts;
        self
    }

    /// The maximum age for the job before it faults.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.policy.job_timeout = timeout;
        self
    }

    /// The maximum age for a single attempt before it fails.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.policy.attempt_timeout = timeout;
        self
    }

    /// A static delay after a failed attempt before a new one may start.
    /// Disables exponential backoff.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.policy.delay_on_failed_attempt = delay;
        self.policy.delay_on_failed_attempt_max = None;
        self
    }

    /// Exponential backoff with a randomized initial retry delay of
    /// 500-1500 ms and a 30-second ceiling. Each delay doubles the previous.
    pub fn exponential_backoff(self) -> Self {
        let initial = Duration::from_millis(500 + jitter_ms(1000));
        self.exponential_backoff_with(initial, DEFAULT_BACKOFF_MAX)
    }

    /// Exponential backoff with explicit initial and maximum retry delays.
    pub fn exponential_backoff_with(mut self, initial: Duration, max: Duration) -> Self {
        self.policy.delay_on_failed_attempt = initial.max(Duration::from_millis(1));
        self.policy.delay_on_failed_attempt_max =
            Some(max.max(self.policy.delay_on_failed_attempt));
        self
    }

    /// A minimum delay before the job proceeds to READY. Initialization and
    /// `on_added` still happen immediately on submit. Useful for debouncing.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self.policy.time_of_next_attempt = self
            .policy
            .time_of_next_attempt
            .max(self.policy.time_job_started + delay);
        self
    }

    /// Add a gating condition. May be called repeatedly; no attempt starts
    /// until all conditions are satisfied.
    pub fn gating_condition(mut self, condition: impl GatingCondition + 'static) -> Self {
        self.policy.gating_conditions.push(Arc::new(condition));
        self
    }

    /// Add a shared gating condition.
    pub fn gating_condition_arc(mut self, condition: Arc<dyn GatingCondition>) -> Self {
        self.policy.gating_conditions.push(condition);
        self
    }

    /// Assign a concurrency policy. At most one; the last call wins.
    pub fn concurrency_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy.concurrency_policy = Some(policy);
        self
    }

    /// Produce the configured policy, reset and ready to bind.
    pub fn build(&self) -> RunPolicy {
        let mut policy = self.policy.clone();
        policy.job_id = None;
        policy.reset();
        policy
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash-based jitter in `0..range` milliseconds.
fn jitter_ms(range: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish() % range.max(1)
}
