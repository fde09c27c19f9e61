//! Storage abstraction: per-execution append-only history plus three work queues.
//!
//! The runtime never mutates history in place. Every orchestration turn is
//! committed with a single [`Provider::ack_orchestration_item`] call that
//! appends the history delta and enqueues the produced work atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ActivityOptions, ErrorDetails, Event, ParentLink};

pub mod error;
pub mod in_memory;

pub use error::ProviderError;

/// Work routed between the client, the dispatchers and the timer service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Create (if needed) and run the first turn of an execution.
    StartOrchestration {
        instance: String,
        orchestration: String,
        version: Option<String>,
        input: String,
        /// Set when the client already created the execution.
        execution_id: Option<u64>,
        parent: Option<ParentLink>,
        run_timeout_ms: Option<u64>,
    },
    /// Start the successor execution of a continued-as-new instance.
    ContinueAsNew {
        instance: String,
        orchestration: String,
        version: String,
        input: String,
        execution_id: u64,
        parent: Option<ParentLink>,
        run_timeout_ms: Option<u64>,
        /// Unconsumed signals `(name, payload)` carried into the new execution.
        carried_signals: Vec<(String, String)>,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        options: ActivityOptions,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        attempts: u32,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
        attempts: u32,
    },
    /// Timer queue envelope: deliver `item` to the orchestrator queue at `fire_at_ms`.
    TimerSchedule { fire_at_ms: u64, item: Box<WorkItem> },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    SignalRaised {
        instance: String,
        /// Only deliver to this execution; `None` routes to the current one.
        execution_id: Option<u64>,
        name: String,
        payload: String,
    },
    UpdateRequested {
        instance: String,
        execution_id: Option<u64>,
        update_id: String,
        name: String,
        payload: String,
    },
    SubOrchStarted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        child_instance: String,
        child_execution_id: u64,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    CancelInstance {
        instance: String,
        execution_id: Option<u64>,
        reason: String,
    },
    RunTimeout { instance: String, execution_id: u64 },
}

impl WorkItem {
    /// Orchestration instance this item is addressed to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::SignalRaised { instance, .. }
            | WorkItem::UpdateRequested { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::RunTimeout { instance, .. } => instance,
            WorkItem::SubOrchStarted { parent_instance, .. }
            | WorkItem::SubOrchCompleted { parent_instance, .. }
            | WorkItem::SubOrchFailed { parent_instance, .. } => parent_instance,
            WorkItem::TimerSchedule { item, .. } => item.instance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// A locked batch of orchestrator messages for one instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    /// Latest execution id at fetch time, 0 when the instance has no history.
    pub execution_id: u64,
    /// History of that execution.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Everything one orchestration turn commits.
#[derive(Debug, Clone, Default)]
pub struct TurnCommit {
    /// Execution the delta is appended to; created if it does not exist yet.
    pub execution_id: u64,
    pub history_delta: Vec<Event>,
    pub worker_items: Vec<WorkItem>,
    pub timer_items: Vec<WorkItem>,
    pub orchestrator_items: Vec<WorkItem>,
}

/// Durable history and queue storage.
///
/// Instance-level peek-lock guarantees that only one dispatcher runs a turn
/// for a given instance at a time.
#[async_trait]
pub trait Provider: Send + Sync {
    /// History of the latest execution; empty when the instance is unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Atomically create `execution_id` with `events`. Fails with a permanent
    /// error if the execution already exists or is not the next id.
    async fn create_execution(&self, instance: &str, execution_id: u64, events: Vec<Event>)
    -> Result<(), ProviderError>;

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<(), ProviderError>;

    async fn enqueue(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next instance with pending orchestrator messages and return
    /// all of its queued messages in arrival order.
    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Commit a turn and release the instance lock.
    async fn ack_orchestration_item(&self, lock_token: &str, commit: TurnCommit) -> Result<(), ProviderError>;

    /// Release the instance lock and put the messages back in front.
    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Peek-lock the next item of the worker or timer queue.
    async fn fetch_work_item(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove a locked work item, enqueueing `completion` on the orchestrator
    /// queue in the same step.
    async fn ack_work_item(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError>;
}
