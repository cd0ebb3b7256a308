//! External job handles: blocking waits, result access, and subscriptions.
//!
//! A [`JobObserver`] is pinned to exactly one job. It reads lock-free shared
//! state published by the service loop and signals requests (cancel, poke)
//! back through the manager's command channel.

use crate::id::JobId;
use crate::runtime::Command;
use crate::state::State;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, warn};

/// Notification key for a state-change update. Reserved; user-originated
/// notifications should use other values.
pub const NOTIFY_KEY_STATE_CHANGE: u32 = 0;

type UpdateCallback = Arc<dyn Fn(&JobObserver, u32) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn(&JobObserver) + Send + Sync>;
type DispatchJob = Box<dyn FnOnce() + Send>;

/// One task that runs observer callbacks in order.
///
/// Shared by every job of a manager; subscriptions without an explicit
/// runtime handle are funneled through it instead of spawning a task per
/// notification. A panicking callback is contained and logged.
#[derive(Clone)]
pub(crate) struct CallbackDispatcher {
    queue: mpsc::UnboundedSender<DispatchJob>,
}

impl CallbackDispatcher {
    /// Create the dispatcher and spawn its drain task. Outside a runtime
    /// (plain unit tests) the queue is created unwired and dispatches are
    /// dropped.
    pub fn new() -> Self {
        let (queue, mut jobs) = mpsc::unbounded_channel::<DispatchJob>();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                while let Some(job) = jobs.recv().await {
                    let outcome =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                    if outcome.is_err() {
                        warn!("observer callback panicked");
                    }
                }
            });
        }
        Self { queue }
    }

    fn dispatch(&self, job: DispatchJob) {
        let _ = self.queue.send(job);
    }
}

struct UpdateListener {
    callback: UpdateCallback,
    handle: Option<tokio::runtime::Handle>,
}

struct CompleteListener {
    callback: CompleteCallback,
    handle: Option<tokio::runtime::Handle>,
}

/// State of one job shared between the service loop and external handles.
/// Reads are lock-free or behind short internal locks; all writes happen on
/// the service loop.
pub(crate) struct JobShared {
    id: JobId,
    description: String,
    state_tx: watch::Sender<State>,
    state_message: RwLock<Option<String>>,
    result: RwLock<Option<Value>>,
    canceled: AtomicBool,
    started_at: RwLock<Instant>,
    dispatcher: CallbackDispatcher,
    update_listeners: Mutex<Vec<UpdateListener>>,
    complete_listeners: Mutex<Vec<CompleteListener>>,
}

impl JobShared {
    pub fn new(id: JobId, description: String, dispatcher: CallbackDispatcher) -> Self {
        Self::with_state(id, description, State::New, dispatcher)
    }

    /// Create shared state for a revived persisted job.
    pub fn with_state(
        id: JobId,
        description: String,
        state: State,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            id,
            description,
            state_tx,
            state_message: RwLock::new(None),
            result: RwLock::new(None),
            canceled: AtomicBool::new(false),
            started_at: RwLock::new(Instant::now()),
            dispatcher,
            update_listeners: Mutex::new(Vec::new()),
            complete_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    pub fn store_state(&self, state: State) {
        self.state_tx.send_replace(state);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    pub fn state_message(&self) -> Option<String> {
        self.state_message.read().clone()
    }

    pub fn set_state_message(&self, message: Option<String>) {
        *self.state_message.write() = message;
    }

    pub fn result(&self) -> Option<Value> {
        self.result.read().clone()
    }

    pub fn set_result(&self, result: Value) {
        *self.result.write() = Some(result);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.state() == State::Canceled
    }

    /// Mark cancellation requested. Returns true if this call was the first.
    pub fn mark_canceled(&self) -> bool {
        !self.canceled.swap(true, Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Instant {
        *self.started_at.read()
    }

    pub fn set_started_at(&self, at: Instant) {
        *self.started_at.write() = at;
    }

    /// Fan a state-change notification out to update subscribers. Default
    /// subscriptions run in order on the shared dispatch task; subscriptions
    /// with an explicit handle are spawned there instead.
    pub fn notify_update(&self, observer: &JobObserver, key: u32) {
        let listeners = self.update_listeners.lock();
        for listener in listeners.iter() {
            let callback = listener.callback.clone();
            let observer = observer.clone();
            match &listener.handle {
                Some(handle) => {
                    handle.spawn(async move { callback(&observer, key) });
                }
                None => {
                    self.dispatcher
                        .dispatch(Box::new(move || callback(&observer, key)));
                }
            }
        }
    }

    /// Fire completion subscribers exactly once.
    pub fn notify_complete(&self, observer: &JobObserver) {
        let listeners: Vec<CompleteListener> =
            self.complete_listeners.lock().drain(..).collect();
        for listener in listeners {
            let observer = observer.clone();
            let callback = listener.callback;
            match listener.handle {
                Some(handle) => {
                    handle.spawn(async move { callback(&observer) });
                }
                None => {
                    self.dispatcher
                        .dispatch(Box::new(move || callback(&observer)));
                }
            }
        }
    }
}

/// External handle pinned to one job.
///
/// Cheap to clone; every clone observes the same job. All blocking waits
/// take a timeout and return the job's current state on expiry rather than
/// erroring.
#[derive(Clone)]
pub struct JobObserver {
    pub(crate) shared: Arc<JobShared>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl JobObserver {
    pub(crate) fn new(shared: Arc<JobShared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    /// The observed job's ID.
    pub fn id(&self) -> JobId {
        self.shared.id()
    }

    /// The observed job's current state. Transitions happen asynchronously
    /// on the service loop, so a read immediately after a request may not
    /// reflect it yet.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// An unstructured message about the current state, for logging.
    pub fn state_message(&self) -> Option<String> {
        self.shared.state_message()
    }

    /// True if cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.shared.is_canceled()
    }

    /// The job's result, if it has been set.
    pub fn result(&self) -> Option<Value> {
        self.shared.result()
    }

    /// Block until the job has been added or the add has failed. Returns
    /// the state after adding, or the current state on timeout.
    pub async fn wait_until_added(&self, timeout: Duration) -> State {
        self.wait_while(timeout, |state| state == State::New, "added")
            .await
    }

    /// Block until the job reaches a terminal state. Returns the final
    /// state, or the current state on timeout.
    pub async fn wait_for_terminal_state(&self, timeout: Duration) -> State {
        self.wait_while(timeout, |state| !state.is_terminal(), "terminal state")
            .await
    }

    /// Combines [`wait_for_terminal_state`](Self::wait_for_terminal_state)
    /// and [`result`](Self::result).
    pub async fn result_blocking(&self, timeout: Duration) -> Option<Value> {
        self.wait_for_terminal_state(timeout).await;
        self.result()
    }

    async fn wait_while(
        &self,
        timeout: Duration,
        keep_waiting: impl Fn(State) -> bool,
        what: &str,
    ) -> State {
        let mut rx = self.shared.subscribe_state();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = *rx.borrow_and_update();
            if !keep_waiting(state) {
                return state;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return self.shared.state(),
                Err(_) => {
                    error!(job_id = %self.id(), "timed out waiting for job to reach {what}");
                    return self.shared.state();
                }
            }
        }
    }

    /// Cancel the job. Idempotent. The returned state is CANCELED in the
    /// usual case, or SUCCEEDED if the job already completed.
    pub async fn cancel(&self) -> State {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Cancel {
                id: self.id(),
                reply: Some(reply_tx),
            })
            .is_err()
        {
            warn!(job_id = %self.id(), "cancel requested but the runtime is gone");
            return self.state();
        }
        reply_rx.await.unwrap_or_else(|_| self.state())
    }

    /// Ask the run policy to allow an attempt as soon as possible and
    /// service the job.
    pub fn schedule_now(&self) {
        let _ = self.commands.send(Command::ScheduleNow { id: self.id() });
    }

    /// Notify update subscribers with a custom key. The runtime itself uses
    /// [`NOTIFY_KEY_STATE_CHANGE`]; any other value is free for callers to
    /// signal application-level progress.
    pub fn notify_update(&self, key: u32) {
        self.shared.notify_update(self, key);
    }

    /// Subscribe to update notifications. The callback fires on every
    /// persistable transition with [`NOTIFY_KEY_STATE_CHANGE`]. Callbacks
    /// run on a shared dispatch context.
    pub fn subscribe(&self, callback: impl Fn(&JobObserver, u32) + Send + Sync + 'static) {
        self.subscribe_inner(Arc::new(callback), None);
    }

    /// Subscribe with an explicit runtime handle to run the callback on.
    pub fn subscribe_with(
        &self,
        handle: tokio::runtime::Handle,
        callback: impl Fn(&JobObserver, u32) + Send + Sync + 'static,
    ) {
        self.subscribe_inner(Arc::new(callback), Some(handle));
    }

    fn subscribe_inner(&self, callback: UpdateCallback, handle: Option<tokio::runtime::Handle>) {
        self.shared
            .update_listeners
            .lock()
            .push(UpdateListener { callback, handle });
    }

    /// Subscribe a one-shot completion callback, fired when the job reaches
    /// a terminal state. Fires immediately if the job is already terminal.
    pub fn subscribe_on_complete(&self, callback: impl Fn(&JobObserver) + Send + Sync + 'static) {
        self.subscribe_on_complete_inner(Arc::new(callback), None);
    }

    /// Completion subscription with an explicit runtime handle.
    pub fn subscribe_on_complete_with(
        &self,
        handle: tokio::runtime::Handle,
        callback: impl Fn(&JobObserver) + Send + Sync + 'static,
    ) {
        self.subscribe_on_complete_inner(Arc::new(callback), Some(handle));
    }

    fn subscribe_on_complete_inner(
        &self,
        callback: CompleteCallback,
        handle: Option<tokio::runtime::Handle>,
    ) {
        if self.state().is_terminal() {
            let observer = self.clone();
            match handle {
                Some(handle) => {
                    handle.spawn(async move { callback(&observer) });
                }
                None => {
                    self.shared
                        .dispatcher
                        .dispatch(Box::new(move || callback(&observer)));
                }
            }
            return;
        }
        self.shared
            .complete_listeners
            .lock()
            .push(CompleteListener { callback, handle });
    }
}

impl fmt::Debug for JobObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobObserver")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for JobObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Observer:{} {} {}",
            self.id(),
            self.shared.description(),
            self.state()
        )
    }
}
