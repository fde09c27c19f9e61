//! Deterministic, replay-driven orchestration core.
//!
//! An orchestration is ordinary async Rust code written against an
//! [`OrchestrationContext`]. Every point where the code needs information from
//! the outside world (an activity result, a timer, a signal, an update, a child
//! orchestration) goes through the context, which records the decision as an
//! [`Event`] in an append-only history. After a restart the runtime re-runs the
//! orchestration from the beginning against the recorded history: recorded
//! decisions are matched in order and their recorded outcomes substituted, so the
//! code deterministically arrives back where it was and only genuinely new
//! decisions are executed.
//!
//! Crate layout:
//! - [`OrchestrationContext`], [`Event`], [`Action`] and the turn driver [`run_turn`]
//! - [`futures`]: `DurableFuture` plus the deterministic `select`/`join` multiplexer
//! - [`handlers`]: query and update handler registration against typed state
//! - [`retry`]: the pure retry policy engine
//! - [`runtime`]: dispatchers, step invoker, timer service, continue-as-new
//! - [`client`]: start/signal/update/query/cancel
//! - [`providers`]: the history log and work queue interface plus an in-memory provider

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

pub mod client;
pub mod futures;
pub mod handlers;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod samples;
pub mod schedule;

pub use client::{Client, ClientError, IdReusePolicy, StartOptions};
pub use self::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use handlers::{ProcessHandlers, ProcessState};
pub use retry::{RetryDecision, RetryPolicy};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{ActivityContext, OrchestrationStatus, Runtime, RuntimeOptions};

use crate::handlers::HandlerTable;

/// Execution ids start at 1 and grow by one per continue-as-new or restart.
pub const INITIAL_EXECUTION_ID: u64 = 1;
/// Event ids start at 1 within every execution.
pub const INITIAL_EVENT_ID: u64 = 1;

// Internal codec utilities for typed payloads (kept private; public API stays string based)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain JSON strings are stored raw so string payloads stay readable in history
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

/// Encode a typed payload the same way the typed helpers do.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String, String> {
    use _typed_codec::Codec;
    _typed_codec::Json::encode(value)
}

/// Decode a payload produced by [`encode_payload`] (or a raw string).
pub fn decode_payload<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, String> {
    use _typed_codec::Codec;
    _typed_codec::Json::decode(payload)
}

// ============================================================================
// Errors
// ============================================================================

/// Application-level failure kinds that orchestration code can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    /// A step exceeded its start-to-close or heartbeat timeout on its final attempt.
    StepTimeout,
    /// A step failed and the retry policy gave up.
    StepFailedTerminal,
    /// A step attempt failed and will be retried. Never surfaces to orchestration code.
    StepFailedTransient,
    /// An update was rejected by its validator.
    UpdateRejected,
    /// A child orchestration ended in a non-success terminal state.
    ChildProcessFailed,
    /// The orchestration was cancelled.
    ProcessCancelled,
    /// The orchestration exceeded its run timeout.
    ProcessTimedOut,
    /// The orchestration body returned an error.
    OrchestrationFailed,
}

/// Configuration and replay failures. These are fatal for the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    /// Replay produced a decision inconsistent with recorded history.
    HistoryDeterminismViolation,
    UnregisteredOrchestration,
    UnregisteredActivity,
    UnregisteredHandler,
}

/// Structured error persisted in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn application(kind: AppErrorKind, message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::HistoryDeterminismViolation,
            resource: String::new(),
            message: Some(message.into()),
        }
    }

    /// Application kind if this is an application error.
    pub fn app_kind(&self) -> Option<AppErrorKind> {
        match self {
            ErrorDetails::Application { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::HistoryDeterminismViolation,
                ..
            }
        )
    }

    /// Message handed to orchestration code when a future resolves with this error.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::OrchestrationFailed | AppErrorKind::StepFailedTerminal => message.clone(),
                AppErrorKind::StepTimeout => format!("timeout: {message}"),
                AppErrorKind::StepFailedTransient => format!("transient: {message}"),
                AppErrorKind::UpdateRejected => format!("update rejected: {message}"),
                AppErrorKind::ChildProcessFailed => format!("child failed: {message}"),
                AppErrorKind::ProcessCancelled => format!("canceled: {message}"),
                AppErrorKind::ProcessTimedOut => format!("timed out: {message}"),
            },
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => {
                let base = match kind {
                    ConfigErrorKind::HistoryDeterminismViolation => "nondeterministic".to_string(),
                    ConfigErrorKind::UnregisteredOrchestration => format!("unregistered orchestration: {resource}"),
                    ConfigErrorKind::UnregisteredActivity => format!("unregistered activity: {resource}"),
                    ConfigErrorKind::UnregisteredHandler => format!("unregistered handler: {resource}"),
                };
                match message {
                    Some(m) => format!("{base}: {m}"),
                    None => base,
                }
            }
            ErrorDetails::Infrastructure { operation, message, .. } => format!("infrastructure:{operation}: {message}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

// ============================================================================
// Options carried by scheduling events
// ============================================================================

/// Options for a single step (activity) invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActivityOptions {
    /// Maximum duration of a single attempt. Runtime default applies when unset.
    pub start_to_close_timeout: Option<Duration>,
    /// Maximum gap between heartbeats of a running attempt.
    pub heartbeat_timeout: Option<Duration>,
    /// Retry policy for failed attempts. Unset means a single attempt.
    pub retry_policy: Option<RetryPolicy>,
}

impl ActivityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// What happens to a running child when its parent reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ParentClosePolicy {
    /// The child keeps running independently.
    #[default]
    Abandon,
    /// The child receives a cancellation request.
    Cancel,
}

/// Options for starting a child orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubOrchestrationOptions {
    /// Explicit child instance id. Derived from the parent when unset.
    pub instance: Option<String>,
    /// Target version. Registry policy applies when unset.
    pub version: Option<String>,
    /// Restart policy for child runs that fail.
    pub retry_policy: Option<RetryPolicy>,
    pub parent_close_policy: ParentClosePolicy,
    pub run_timeout: Option<Duration>,
}

impl SubOrchestrationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_parent_close_policy(mut self, policy: ParentClosePolicy) -> Self {
        self.parent_close_policy = policy;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// Link from a child execution back to the parent decision that started it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    /// Event id of the parent's `SubOrchestrationScheduled`.
    pub event_id: u64,
    pub retry_policy: Option<RetryPolicy>,
    /// 1-based run attempt of the child under its retry policy.
    pub attempt: u32,
}

// ============================================================================
// History
// ============================================================================

/// One immutable history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    /// For completions: the event id of the scheduling event they resolve.
    pub source_event_id: Option<u64>,
    pub execution_id: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// First event of every execution.
    OrchestrationStarted {
        name: String,
        /// Pinned semver string; empty means resolve by registry policy.
        version: String,
        input: String,
        /// Logical start time recorded once, used as the base of `ctx.now_ms()`.
        started_at_ms: u64,
        parent: Option<ParentLink>,
        run_timeout_ms: Option<u64>,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        details: ErrorDetails,
    },
    OrchestrationCancelled {
        reason: String,
    },
    OrchestrationTimedOut,
    /// Terminal for this execution; the next execution starts with `input`.
    OrchestrationContinuedAsNew {
        input: String,
    },
    OrchestrationCancelRequested {
        reason: String,
    },

    ActivityScheduled {
        name: String,
        input: String,
        options: ActivityOptions,
    },
    ActivityCompleted {
        result: String,
        attempts: u32,
    },
    ActivityFailed {
        details: ErrorDetails,
        attempts: u32,
    },

    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },

    SignalReceived {
        name: String,
        payload: String,
    },

    UpdateRequested {
        update_id: String,
        name: String,
        payload: String,
    },
    UpdateAccepted {
        update_id: String,
        result: String,
    },
    UpdateRejected {
        update_id: String,
        reason: String,
    },

    SubOrchestrationScheduled {
        name: String,
        instance: String,
        input: String,
        options: SubOrchestrationOptions,
    },
    SubOrchestrationStarted {
        instance: String,
        execution_id: u64,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        details: ErrorDetails,
    },
}

impl EventKind {
    /// Decisions made by orchestration code; matched in order during replay.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::SubOrchestrationScheduled { .. }
        )
    }

    /// Inputs from outside the orchestration; revealed to the code batch by batch.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityCompleted { .. }
                | EventKind::ActivityFailed { .. }
                | EventKind::TimerFired { .. }
                | EventKind::SignalReceived { .. }
                | EventKind::UpdateRequested { .. }
                | EventKind::SubOrchestrationStarted { .. }
                | EventKind::SubOrchestrationCompleted { .. }
                | EventKind::SubOrchestrationFailed { .. }
                | EventKind::OrchestrationCancelRequested { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationCancelled { .. }
                | EventKind::OrchestrationTimedOut
                | EventKind::OrchestrationContinuedAsNew { .. }
        )
    }

    fn describe(&self) -> String {
        match self {
            EventKind::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
            EventKind::TimerCreated { fire_at_ms } => format!("TimerCreated({fire_at_ms})"),
            EventKind::SubOrchestrationScheduled { name, input, .. } => {
                format!("SubOrchestrationScheduled('{name}','{input}')")
            }
            other => format!("{other:?}"),
        }
    }
}

impl Event {
    pub fn new(event_id: u64, source_event_id: Option<u64>, execution_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            source_event_id,
            execution_id,
            kind,
        }
    }
}

/// Declarative decisions produced by a turn; the runtime materializes them
/// into work items after the turn's history is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        options: ActivityOptions,
    },
    CreateTimer {
        scheduling_event_id: u64,
        /// Logical fire time recorded in history.
        fire_at_ms: u64,
        /// Wall-clock delay from the moment the decision is dispatched.
        delay_ms: u64,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
        options: SubOrchestrationOptions,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

// ============================================================================
// Context
// ============================================================================

/// An accepted update that an update-arrival future can observe.
#[derive(Debug, Clone)]
pub(crate) struct UpdateArrival {
    /// Event id of the `UpdateRequested`; doubles as the consumption key.
    key: u64,
    name: String,
    payload: String,
}

pub(crate) struct CtxInner {
    instance: String,
    execution_id: u64,
    orchestration_name: String,
    orchestration_version: String,

    pub(crate) history: Vec<Event>,
    /// Number of events persisted before this turn; decisions below it are replays.
    persisted_len: usize,
    /// Completion events at indices below this are visible to futures.
    pub(crate) revealed: usize,
    next_event_id: u64,

    claimed_scheduling: HashSet<u64>,
    pub(crate) consumed: HashSet<u64>,
    actions: Vec<Action>,

    logical_time_ms: u64,
    guid_counter: u64,
    turn_index: u64,

    pub(crate) nondeterminism: Option<String>,
    pub(crate) cancel_requested: Option<String>,
    handlers: Option<HandlerTable>,
    pub(crate) update_arrivals: Vec<UpdateArrival>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>, persisted_len: usize) -> Self {
        let (execution_id, name, version, started_at) = match history.first() {
            Some(Event {
                execution_id,
                kind:
                    EventKind::OrchestrationStarted {
                        name,
                        version,
                        started_at_ms,
                        ..
                    },
                ..
            }) => (*execution_id, name.clone(), version.clone(), *started_at_ms),
            Some(e) => (e.execution_id, String::new(), String::new(), 0),
            None => (INITIAL_EXECUTION_ID, String::new(), String::new(), 0),
        };
        let next_event_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;
        Self {
            instance,
            execution_id,
            orchestration_name: name,
            orchestration_version: version,
            // The start event is always visible
            revealed: history.len().min(1),
            history,
            persisted_len,
            next_event_id,
            claimed_scheduling: HashSet::new(),
            consumed: HashSet::new(),
            actions: Vec::new(),
            logical_time_ms: started_at,
            guid_counter: 0,
            turn_index: 0,
            nondeterminism: None,
            cancel_requested: None,
            handlers: None,
            update_arrivals: Vec::new(),
        }
    }

    fn alloc_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    fn push_event(&mut self, source_event_id: Option<u64>, kind: EventKind) -> u64 {
        let id = self.alloc_event_id();
        self.history.push(Event::new(id, source_event_id, self.execution_id, kind));
        id
    }

    fn record_nondeterminism(&mut self, message: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.revealed < self.persisted_len
    }

    /// Claim the next recorded scheduling decision, or record a new one.
    ///
    /// Returns the scheduling event id the caller's future correlates with.
    fn claim_or_schedule(&mut self, kind: EventKind, matches: impl Fn(&EventKind) -> bool) -> (u64, bool) {
        let recorded = self
            .history
            .iter()
            .find(|e| e.kind.is_scheduling() && !self.claimed_scheduling.contains(&e.event_id))
            .map(|e| (e.event_id, e.kind.clone()));

        match recorded {
            Some((event_id, recorded_kind)) => {
                if !matches(&recorded_kind) {
                    self.record_nondeterminism(format!(
                        "schedule order mismatch: history has {} but code scheduled {}",
                        recorded_kind.describe(),
                        kind.describe()
                    ));
                }
                self.claimed_scheduling.insert(event_id);
                (event_id, false)
            }
            None => {
                let event_id = self.push_event(None, kind);
                self.claimed_scheduling.insert(event_id);
                (event_id, true)
            }
        }
    }

    /// Recorded scheduling decisions the code did not make this turn.
    fn unclaimed_scheduling(&self) -> Option<&Event> {
        self.history
            .iter()
            .find(|e| e.kind.is_scheduling() && !self.claimed_scheduling.contains(&e.event_id))
    }

    /// Make the next batch of hidden completions visible. Returns false when
    /// none remain.
    ///
    /// A batch is a contiguous run of completion events: everything delivered
    /// to one turn, up to the first decision that turn recorded. Revealing a
    /// whole batch before polling lets a `select` over simultaneously ready
    /// branches pick by registration order, and the boundaries depend on
    /// history alone so every replay sees the same batches.
    fn reveal_batch(&mut self) -> bool {
        let Some(offset) = self.history[self.revealed..]
            .iter()
            .position(|e| e.kind.is_completion())
        else {
            return false;
        };
        let start = self.revealed + offset;
        let end = self.history[start..]
            .iter()
            .position(|e| !e.kind.is_completion())
            .map_or(self.history.len(), |n| start + n);
        self.revealed = end;

        for idx in start..end {
            let event = self.history[idx].clone();
            match event.kind {
                EventKind::TimerFired { fire_at_ms } => {
                    self.logical_time_ms = self.logical_time_ms.max(fire_at_ms);
                }
                EventKind::OrchestrationCancelRequested { reason } => {
                    if self.cancel_requested.is_none() {
                        self.cancel_requested = Some(reason);
                    }
                }
                EventKind::UpdateRequested {
                    update_id,
                    name,
                    payload,
                } => self.apply_update(event.event_id, update_id, name, payload),
                _ => {}
            }
        }
        true
    }

    /// Validate and apply an update at its recorded position in the timeline.
    fn apply_update(&mut self, request_event_id: u64, update_id: String, name: String, payload: String) {
        let outcome = match &self.handlers {
            Some(table) => table.apply_update(&name, &payload),
            None => Err(format!("no update handler registered for '{name}'")),
        };

        let recorded = self.history.iter().find_map(|e| match &e.kind {
            EventKind::UpdateAccepted { update_id: u, result } if *u == update_id => Some(Ok(result.clone())),
            EventKind::UpdateRejected { update_id: u, reason } if *u == update_id => Some(Err(reason.clone())),
            _ => None,
        });

        match recorded {
            Some(recorded) => {
                if recorded != outcome {
                    self.record_nondeterminism(format!(
                        "update '{name}' ({update_id}) replayed to {outcome:?} but history recorded {recorded:?}"
                    ));
                }
            }
            None => {
                let kind = match &outcome {
                    Ok(result) => EventKind::UpdateAccepted {
                        update_id: update_id.clone(),
                        result: result.clone(),
                    },
                    Err(reason) => EventKind::UpdateRejected {
                        update_id: update_id.clone(),
                        reason: reason.clone(),
                    },
                };
                self.push_event(Some(request_event_id), kind);
            }
        }

        if outcome.is_ok() {
            self.update_arrivals.push(UpdateArrival {
                key: request_event_id,
                name,
                payload,
            });
        }
    }

    /// Index of `event_id` in history if it is currently visible.
    pub(crate) fn visible(&self, idx: usize) -> bool {
        idx < self.revealed
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: impl Into<String>, history: Vec<Event>, persisted_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, persisted_len))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration_name.clone()
    }

    pub fn orchestration_version(&self) -> String {
        self.lock().orchestration_version.clone()
    }

    /// Zero-based turn counter assigned by the runtime, for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// True while the code is re-deriving decisions that are already recorded.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Replay-safe logging is enabled only for live decisions.
    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    /// Logical time in milliseconds: the recorded start time, advanced by fired timers.
    pub fn now_ms(&self) -> u64 {
        self.lock().logical_time_ms
    }

    /// Deterministic GUID-like identifier, stable across replays of this execution.
    pub fn new_guid(&self) -> String {
        let mut inner = self.lock();
        inner.guid_counter += 1;
        format!("{}-{}-{:08x}", inner.instance, inner.execution_id, inner.guid_counter)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Schedule a step with default options.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_with_options(name, input, ActivityOptions::default())
    }

    /// Schedule a step with explicit timeout and retry options.
    pub fn schedule_activity_with_options(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: ActivityOptions,
    ) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        let kind = EventKind::ActivityScheduled {
            name: name.clone(),
            input: input.clone(),
            options: options.clone(),
        };
        let (id, fresh) = inner.claim_or_schedule(kind, |k| {
            matches!(k, EventKind::ActivityScheduled { name: n, input: i, .. } if *n == name && *i == input)
        });
        if fresh {
            inner.actions.push(Action::CallActivity {
                scheduling_event_id: id,
                name,
                input,
                options,
            });
        }
        drop(inner);
        DurableFuture::activity(self.clone(), id)
    }

    /// Typed variant of [`schedule_activity_with_options`](Self::schedule_activity_with_options).
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
        options: ActivityOptions,
    ) -> Result<DurableFuture, String> {
        let payload = encode_payload(input)?;
        Ok(self.schedule_activity_with_options(name, payload, options))
    }

    /// Schedule and await a step.
    pub async fn call_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: ActivityOptions,
    ) -> Result<String, String> {
        self.schedule_activity_with_options(name, input, options)
            .into_activity()
            .await
    }

    /// Schedule a durable timer relative to logical time.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let mut inner = self.lock();
        let delay_ms = delay.as_millis() as u64;
        let fire_at_ms = inner.logical_time_ms.saturating_add(delay_ms);
        let (id, fresh) = inner.claim_or_schedule(EventKind::TimerCreated { fire_at_ms }, |k| {
            matches!(k, EventKind::TimerCreated { .. })
        });
        if fresh {
            inner.actions.push(Action::CreateTimer {
                scheduling_event_id: id,
                fire_at_ms,
                delay_ms,
            });
        }
        drop(inner);
        DurableFuture::timer(self.clone(), id)
    }

    /// Durable sleep. Equivalent to awaiting a timer.
    pub async fn sleep(&self, delay: Duration) {
        self.schedule_timer(delay).into_timer().await
    }

    /// Receive the next signal on a named channel.
    ///
    /// Each future consumes exactly one signal; create a new one per receive.
    /// Signals that arrive before anybody waits are buffered in arrival order.
    pub fn schedule_signal(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::signal(self.clone(), name.into())
    }

    /// Resolve when an accepted update with this handler name is applied.
    pub fn schedule_update_arrival(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::update_arrival(self.clone(), name.into())
    }

    /// Resolve once cancellation of this orchestration has been requested.
    pub fn schedule_cancellation(&self) -> DurableFuture {
        DurableFuture::cancellation(self.clone())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested.is_some()
    }

    /// Start a child orchestration with default options and await nothing yet.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> SubOrchestration {
        self.schedule_sub_orchestration_with_options(name, input, SubOrchestrationOptions::default())
    }

    /// Start a child orchestration. The returned handle resolves to the child
    /// identity once started and to its terminal result once complete.
    pub fn schedule_sub_orchestration_with_options(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: SubOrchestrationOptions,
    ) -> SubOrchestration {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        // Peek the id a fresh decision would get so a derived child id is stable
        let provisional = inner.next_event_id;
        let derived = options
            .instance
            .clone()
            .unwrap_or_else(|| format!("{}::sub::{}", inner.instance, provisional));
        let recorded_instance = inner
            .history
            .iter()
            .find(|e| e.kind.is_scheduling() && !inner.claimed_scheduling.contains(&e.event_id))
            .and_then(|e| match &e.kind {
                EventKind::SubOrchestrationScheduled { instance, .. } => Some(instance.clone()),
                _ => None,
            });
        let instance = match (&options.instance, recorded_instance) {
            (None, Some(recorded)) => recorded,
            _ => derived,
        };
        let kind = EventKind::SubOrchestrationScheduled {
            name: name.clone(),
            instance: instance.clone(),
            input: input.clone(),
            options: options.clone(),
        };
        let (id, fresh) = inner.claim_or_schedule(kind, |k| {
            matches!(k, EventKind::SubOrchestrationScheduled { name: n, input: i, instance: c, .. }
                if *n == name && *i == input && *c == instance)
        });
        if fresh {
            inner.actions.push(Action::StartSubOrchestration {
                scheduling_event_id: id,
                name,
                instance: instance.clone(),
                input,
                options,
            });
        }
        drop(inner);
        SubOrchestration {
            instance,
            started: DurableFuture::sub_orchestration_started(self.clone(), id),
            completion: DurableFuture::sub_orchestration(self.clone(), id),
        }
    }

    /// End this execution and start a fresh one under the same instance id
    /// with `input` as its only state. The returned future never resolves.
    pub fn continue_as_new(&self, input: impl Into<String>) -> impl Future<Output = Result<String, String>> + Send {
        self.lock().actions.push(Action::ContinueAsNew {
            input: input.into(),
            version: None,
        });
        std::future::pending()
    }

    /// Continue-as-new into a specific orchestration version.
    pub fn continue_as_new_versioned(
        &self,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> + Send {
        self.lock().actions.push(Action::ContinueAsNew {
            input: input.into(),
            version: Some(version.into()),
        });
        std::future::pending()
    }

    /// Typed continue-as-new.
    pub fn continue_as_new_typed<In: Serialize>(
        &self,
        input: &In,
    ) -> Result<impl Future<Output = Result<String, String>> + Send, String> {
        let payload = encode_payload(input)?;
        Ok(self.continue_as_new(payload))
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Install the query/update handlers of this orchestration over `initial`
    /// state. Must be called once, at the start of the orchestration body.
    pub fn install_handlers<S>(&self, initial: S, handlers: ProcessHandlers<S>) -> Result<ProcessState<S>, String>
    where
        S: Clone + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.handlers.is_some() {
            return Err("handlers already installed for this orchestration".to_string());
        }
        let state = ProcessState::new(initial);
        inner.handlers = Some(handlers.bind(state.clone())?);
        Ok(state)
    }

    /// Run a registered query against current in-memory state.
    pub fn query(&self, name: &str) -> Result<String, ErrorDetails> {
        let inner = self.lock();
        match &inner.handlers {
            Some(table) => table.query(name),
            None => Err(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredHandler,
                resource: name.to_string(),
                message: None,
            }),
        }
    }

    /// Run only the validator of an update handler. Never mutates state.
    pub fn validate_update(&self, name: &str, payload: &str) -> Result<(), ErrorDetails> {
        let inner = self.lock();
        match &inner.handlers {
            Some(table) => table.validate_update(name, payload),
            None => Err(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredHandler,
                resource: name.to_string(),
                message: None,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Wait for exactly one of `futures`; ties resolve in registration order.
    pub fn select<F>(&self, futures: Vec<F>) -> SelectFuture<F>
    where
        F: std::borrow::BorrowMut<DurableFuture> + Unpin,
    {
        SelectFuture::new(futures)
    }

    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture<DurableFuture> {
        SelectFuture::new(vec![a, b])
    }

    /// Wait for all `futures`; outputs are returned in registration order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    // ------------------------------------------------------------------
    // Turn plumbing
    // ------------------------------------------------------------------

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// Unconsumed signals, oldest first, for carry-forward across continue-as-new.
    pub(crate) fn unconsumed_signals(&self) -> Vec<(String, String)> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter(|e| !inner.consumed.contains(&e.event_id))
            .filter_map(|e| match &e.kind {
                EventKind::SignalReceived { name, payload } => Some((name.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Handle to a started child orchestration.
pub struct SubOrchestration {
    pub instance: String,
    /// Resolves to `(instance, execution_id)` once the runtime accepted the child.
    pub started: DurableFuture,
    /// Resolves to the child's terminal result.
    pub completion: DurableFuture,
}

impl SubOrchestration {
    /// Await the child's terminal result.
    pub async fn result(self) -> Result<String, String> {
        self.completion.into_sub_orchestration().await
    }
}

// ============================================================================
// Turn driver
// ============================================================================

/// Terminal-transition result of running an orchestration against its history.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Waiting on outstanding futures.
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew { input: String, version: Option<String> },
    Cancelled(String),
}

impl TurnResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnResult::Continue)
    }
}

/// Everything a turn produced.
pub struct TurnOutcome {
    /// Full history after the turn (input history plus new decisions and outcomes).
    pub history: Vec<Event>,
    /// New decisions to dispatch.
    pub actions: Vec<Action>,
    pub result: TurnResult,
    /// The context, kept alive for queries and update validation.
    pub ctx: OrchestrationContext,
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    fut.poll(&mut cx)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "orchestration panicked".to_string()
    }
}

/// Run an orchestration against `history` where every event is already persisted.
pub fn run_turn<F, Fut>(instance: &str, history: Vec<Event>, orchestrator: F) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext, String) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let persisted_len = history.len();
    run_turn_with(instance, history, persisted_len, 0, orchestrator)
}

/// Run an orchestration from the beginning against `history`.
///
/// The first `persisted_len` events were committed by earlier turns; the rest
/// are completions delivered in this turn. Completions are revealed a batch at
/// a time, each batch followed by a poll, until the orchestration finishes or
/// nothing is left to reveal. Revealing in history order makes every `select`
/// see the same set of ready futures on every replay.
pub fn run_turn_with<F, Fut>(
    instance: &str,
    history: Vec<Event>,
    persisted_len: usize,
    turn_index: u64,
    orchestrator: F,
) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext, String) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let input = match history.first().map(|e| &e.kind) {
        Some(EventKind::OrchestrationStarted { input, .. }) => input.clone(),
        _ => {
            let ctx = OrchestrationContext::new(instance, history.clone(), persisted_len);
            return TurnOutcome {
                history,
                actions: Vec::new(),
                result: TurnResult::Failed(ErrorDetails::nondeterminism(
                    "history does not begin with OrchestrationStarted",
                )),
                ctx,
            };
        }
    };

    let ctx = OrchestrationContext::new(instance, history, persisted_len);
    ctx.set_turn_index(turn_index);
    let mut fut = Box::pin(orchestrator(ctx.clone(), input));
    let mut cancel_observed = false;

    let result = loop {
        let polled = catch_unwind(AssertUnwindSafe(|| poll_once(fut.as_mut())));
        let poll = match polled {
            Ok(p) => p,
            Err(payload) => {
                break TurnResult::Failed(ErrorDetails::application(
                    AppErrorKind::OrchestrationFailed,
                    format!("orchestration panicked: {}", panic_message(payload)),
                ));
            }
        };

        let mut inner = ctx.lock();
        if let Some(msg) = inner.nondeterminism.clone() {
            break TurnResult::Failed(ErrorDetails::nondeterminism(msg));
        }

        match poll {
            Poll::Ready(out) => {
                if let Some(reason) = inner.cancel_requested.clone() {
                    break TurnResult::Cancelled(reason);
                }
                if let Some(e) = inner.unclaimed_scheduling() {
                    break TurnResult::Failed(ErrorDetails::nondeterminism(format!(
                        "orchestration finished but history still has unmatched {}",
                        e.kind.describe()
                    )));
                }
                break match out {
                    Ok(output) => TurnResult::Completed(output),
                    Err(error) => {
                        TurnResult::Failed(ErrorDetails::application(AppErrorKind::OrchestrationFailed, error))
                    }
                };
            }
            Poll::Pending => {
                if cancel_observed {
                    let reason = inner.cancel_requested.clone().unwrap_or_default();
                    break TurnResult::Cancelled(reason);
                }
                let can = inner.actions.iter().find_map(|a| match a {
                    Action::ContinueAsNew { input, version } => Some((input.clone(), version.clone())),
                    _ => None,
                });
                if let Some((input, version)) = can {
                    break TurnResult::ContinueAsNew { input, version };
                }
                if inner.reveal_batch() {
                    if inner.nondeterminism.is_none() && inner.cancel_requested.is_some() {
                        // One more poll lets the code observe cancellation through a select
                        cancel_observed = true;
                    }
                    continue;
                }
                if let Some(e) = inner.unclaimed_scheduling() {
                    break TurnResult::Failed(ErrorDetails::nondeterminism(format!(
                        "history has {} that the orchestration did not schedule",
                        e.kind.describe()
                    )));
                }
                break TurnResult::Continue;
            }
        }
    };
    drop(fut);

    let actions = ctx.take_actions();
    let history = ctx.lock().history.clone();
    TurnOutcome {
        history,
        actions,
        result,
        ctx,
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Alternately replay one turn and let `execute_actions` append the
    /// completions those actions produced, until the orchestration is terminal.
    /// Returns the full history and the terminal result.
    pub fn drive_to_completion<F, Fut, X>(
        instance: &str,
        mut history: Vec<Event>,
        orchestrator: F,
        mut execute_actions: X,
    ) -> (Vec<Event>, TurnResult)
    where
        F: Fn(OrchestrationContext, String) -> Fut,
        Fut: Future<Output = Result<String, String>>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let persisted = history.len();
            let outcome = run_turn_with(instance, history, persisted, 0, &orchestrator);
            history = outcome.history;
            if outcome.result.is_terminal() {
                return (history, outcome.result);
            }
            let before = history.len();
            execute_actions(outcome.actions, &mut history);
            if history.len() == before {
                return (history, TurnResult::Continue);
            }
        }
    }
}
