//! External interface: start, signal, update, query and cancel orchestrations.
//!
//! The client talks to the runtime only through the shared [`Provider`]. Calls
//! that address an existing instance check it first and fail fast when it does
//! not exist or is already terminal. Queries and update validation replay the
//! instance's history locally, so they need the orchestration registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{Provider, ProviderError, QueueKind, WorkItem};
use crate::runtime::registry::OrchestrationRegistry;
use crate::runtime::{OrchestrationStatus, now_ms, replay};
use crate::{ConfigErrorKind, ErrorDetails, Event, EventKind, INITIAL_EVENT_ID, INITIAL_EXECUTION_ID};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long state reads wait for the successor of a continued-as-new run.
const SUCCESSOR_WAIT: Duration = Duration::from_secs(2);

/// Errors returned by [`Client`] calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The instance (or the requested run) has never existed.
    NotFound { instance: String },
    /// The addressed run already reached a terminal state.
    AlreadyTerminal { instance: String, execution_id: u64 },
    /// The requested run is no longer the active run of the instance.
    RunMismatch { requested: u64, current: u64 },
    /// Start was rejected because the instance id is in use.
    AlreadyRunning { execution_id: u64 },
    UpdateRejected(String),
    /// No query or update handler with this name is installed.
    UnknownHandler(String),
    Timeout,
    Provider(ProviderError),
    /// Local replay for a query or validation failed.
    Replay(String),
    Unsupported(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound { instance } => write!(f, "instance '{instance}' not found"),
            ClientError::AlreadyTerminal { instance, execution_id } => {
                write!(f, "instance '{instance}' execution {execution_id} is already terminal")
            }
            ClientError::RunMismatch { requested, current } => {
                write!(f, "run {requested} is not the active run (current run is {current})")
            }
            ClientError::AlreadyRunning { execution_id } => {
                write!(f, "instance is already running as execution {execution_id}")
            }
            ClientError::UpdateRejected(reason) => write!(f, "update rejected: {reason}"),
            ClientError::UnknownHandler(name) => write!(f, "unknown handler '{name}'"),
            ClientError::Timeout => f.write_str("timed out"),
            ClientError::Provider(e) => write!(f, "provider: {e}"),
            ClientError::Replay(msg) => write!(f, "replay failed: {msg}"),
            ClientError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// What `start` does when the instance id already has a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdReusePolicy {
    /// Idempotent start: return the running execution id.
    #[default]
    ReturnExisting,
    /// Fail with [`ClientError::AlreadyRunning`].
    RejectDuplicate,
}

/// Options for [`Client::start_orchestration_with`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Exact version to run. Registry policy applies when unset.
    pub version: Option<String>,
    pub id_reuse: IdReusePolicy,
    /// The run ends as `TimedOut` when it has not finished by then.
    pub run_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_id_reuse(mut self, policy: IdReusePolicy) -> Self {
        self.id_reuse = policy;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// Control-plane client bound to a provider.
pub struct Client {
    store: Arc<dyn Provider>,
    orchestrations: Option<OrchestrationRegistry>,
    seq: AtomicU64,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self {
            store,
            orchestrations: None,
            seq: AtomicU64::new(0),
        }
    }

    /// Enable queries, update validation and version pinning at start.
    pub fn with_orchestrations(mut self, registry: OrchestrationRegistry) -> Self {
        self.orchestrations = Some(registry);
        self
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Start `orchestration` under `instance`. Idempotent while the instance
    /// is running: the running execution id is returned.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<u64, ClientError> {
        self.start_orchestration_with(instance, orchestration, input, StartOptions::default())
            .await
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: In,
    ) -> Result<u64, ClientError> {
        let payload = Json::encode(&input).map_err(|e| ClientError::Unsupported(format!("encode: {e}")))?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    pub async fn start_orchestration_with(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
        options: StartOptions,
    ) -> Result<u64, ClientError> {
        if let Some(existing) = self.active_run(instance, options.id_reuse).await? {
            return Ok(existing);
        }

        let latest = self.store.latest_execution_id(instance).await?;
        let execution_id = latest.map_or(INITIAL_EXECUTION_ID, |l| l + 1);
        let version = match &self.orchestrations {
            Some(reg) => reg
                .resolve(orchestration, options.version.as_deref())
                .map(|(v, _)| v.to_string())
                .unwrap_or_else(|| options.version.clone().unwrap_or_default()),
            None => options.version.clone().unwrap_or_default(),
        };
        let run_timeout_ms = options.run_timeout.map(|d| d.as_millis() as u64);
        let input = input.into();
        let started = Event::new(
            INITIAL_EVENT_ID,
            None,
            execution_id,
            EventKind::OrchestrationStarted {
                name: orchestration.to_string(),
                version: version.clone(),
                input: input.clone(),
                started_at_ms: now_ms(),
                parent: None,
                run_timeout_ms,
            },
        );

        if let Err(e) = self.store.create_execution(instance, execution_id, vec![started]).await {
            // Lost a race with a concurrent start
            if let Some(existing) = self.active_run(instance, options.id_reuse).await? {
                return Ok(existing);
            }
            return Err(e.into());
        }

        self.store
            .enqueue(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    version: Some(version).filter(|v| !v.is_empty()),
                    input,
                    execution_id: Some(execution_id),
                    parent: None,
                    run_timeout_ms,
                },
            )
            .await?;
        tracing::debug!(
            target: "duroflow::client",
            instance_id = %instance,
            execution_id,
            orchestration_name = %orchestration,
            "orchestration start requested"
        );
        Ok(execution_id)
    }

    /// Running (or about to continue) execution of `instance`, subject to `policy`.
    async fn active_run(&self, instance: &str, policy: IdReusePolicy) -> Result<Option<u64>, ClientError> {
        let Some(latest) = self.store.latest_execution_id(instance).await? else {
            return Ok(None);
        };
        let history = self.store.read_with_execution(instance, latest).await?;
        let active = match OrchestrationStatus::from_history(&history) {
            OrchestrationStatus::Running => latest,
            OrchestrationStatus::ContinuedAsNew { .. } => latest + 1,
            _ => return Ok(None),
        };
        match policy {
            IdReusePolicy::ReturnExisting => Ok(Some(active)),
            IdReusePolicy::RejectDuplicate => Err(ClientError::AlreadyRunning { execution_id: active }),
        }
    }

    // ------------------------------------------------------------------
    // Addressing helpers
    // ------------------------------------------------------------------

    /// Validate that `(instance, run_id)` names a live run and return the
    /// latest execution's id and history.
    async fn live_target(&self, instance: &str, run_id: Option<u64>) -> Result<(u64, Vec<Event>), ClientError> {
        let latest = self
            .store
            .latest_execution_id(instance)
            .await?
            .ok_or_else(|| ClientError::NotFound {
                instance: instance.to_string(),
            })?;
        let history = self.store.read_with_execution(instance, latest).await?;
        let status = OrchestrationStatus::from_history(&history);

        if let Some(requested) = run_id {
            let current = match status {
                OrchestrationStatus::ContinuedAsNew { .. } => latest + 1,
                _ => latest,
            };
            if requested > current {
                return Err(ClientError::NotFound {
                    instance: format!("{instance}#{requested}"),
                });
            }
            if requested != current {
                return Err(ClientError::RunMismatch { requested, current });
            }
        }
        if status.is_terminal() {
            return Err(ClientError::AlreadyTerminal {
                instance: instance.to_string(),
                execution_id: latest,
            });
        }
        Ok((latest, history))
    }

    /// [`live_target`](Self::live_target) for reads of orchestration state.
    /// Between continue-as-new and the start of the next run, the finished
    /// run's state is stale, so this waits for the successor instead.
    async fn state_target(&self, instance: &str, run_id: Option<u64>) -> Result<(u64, Vec<Event>), ClientError> {
        let deadline = tokio::time::Instant::now() + SUCCESSOR_WAIT;
        loop {
            let (exec, history) = self.live_target(instance, run_id).await?;
            if !matches!(
                OrchestrationStatus::from_history(&history),
                OrchestrationStatus::ContinuedAsNew { .. }
            ) {
                return Ok((exec, history));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn registry(&self, op: &str) -> Result<&OrchestrationRegistry, ClientError> {
        self.orchestrations
            .as_ref()
            .ok_or_else(|| ClientError::Unsupported(format!("{op} needs a client built with_orchestrations")))
    }

    fn handler_error(name: &str, e: ErrorDetails) -> ClientError {
        match e {
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredHandler,
                ..
            } => ClientError::UnknownHandler(name.to_string()),
            ErrorDetails::Application { message, .. } => ClientError::UpdateRejected(message),
            other => ClientError::Replay(other.display_message()),
        }
    }

    fn next_update_id(&self, instance: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{instance}:{:x}:{:x}:{n}", std::process::id(), now_ms())
    }

    // ------------------------------------------------------------------
    // Signal / cancel
    // ------------------------------------------------------------------

    /// Deliver a fire-and-forget signal. With `run_id` set, the signal is
    /// dropped if that run is no longer active when it is processed.
    pub async fn raise_signal(
        &self,
        instance: &str,
        run_id: Option<u64>,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.live_target(instance, run_id).await?;
        self.store
            .enqueue(
                QueueKind::Orchestrator,
                WorkItem::SignalRaised {
                    instance: instance.to_string(),
                    execution_id: run_id,
                    name: name.into(),
                    payload: payload.into(),
                },
            )
            .await?;
        Ok(())
    }

    /// Request cooperative cancellation. The run ends `Cancelled` once the
    /// orchestration observes the request.
    pub async fn cancel_orchestration(
        &self,
        instance: &str,
        run_id: Option<u64>,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.live_target(instance, run_id).await?;
        self.store
            .enqueue(
                QueueKind::Orchestrator,
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    execution_id: run_id,
                    reason: reason.into(),
                },
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query / update
    // ------------------------------------------------------------------

    /// Run a read-only query handler against state rebuilt from history.
    /// Right after continue-as-new this waits for the next run to start.
    pub async fn query(&self, instance: &str, run_id: Option<u64>, name: &str) -> Result<String, ClientError> {
        let registry = self.registry("query")?;
        let (_, history) = self.state_target(instance, run_id).await?;
        let outcome = replay::replay(registry, instance, history).map_err(ClientError::Replay)?;
        outcome.ctx.query(name).map_err(|e| match e {
            ErrorDetails::Application { message, .. } => ClientError::Replay(message),
            other => Self::handler_error(name, other),
        })
    }

    /// Send a validated update and wait for the orchestration to apply it.
    ///
    /// The validator runs locally first; a rejected update appends nothing.
    /// The orchestration validates again when it consumes the update, so a
    /// rejection can still come back from the run itself.
    pub async fn update(
        &self,
        instance: &str,
        run_id: Option<u64>,
        name: &str,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, ClientError> {
        let registry = self.registry("update")?;
        let payload = payload.into();
        let (exec, history) = self.state_target(instance, run_id).await?;
        let outcome = replay::replay(registry, instance, history).map_err(ClientError::Replay)?;
        outcome
            .ctx
            .validate_update(name, &payload)
            .map_err(|e| Self::handler_error(name, e))?;

        let update_id = self.next_update_id(instance);
        self.store
            .enqueue(
                QueueKind::Orchestrator,
                WorkItem::UpdateRequested {
                    instance: instance.to_string(),
                    execution_id: run_id,
                    update_id: update_id.clone(),
                    name: name.to_string(),
                    payload,
                },
            )
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.update_outcome(instance, exec, &update_id).await? {
                return result;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Outcome of `update_id`, searching from `from_exec` through the latest run.
    async fn update_outcome(
        &self,
        instance: &str,
        from_exec: u64,
        update_id: &str,
    ) -> Result<Option<Result<String, ClientError>>, ClientError> {
        let latest = self.store.latest_execution_id(instance).await?.unwrap_or(from_exec);
        for exec in from_exec..=latest {
            let history = self.store.read_with_execution(instance, exec).await?;
            for e in &history {
                match &e.kind {
                    EventKind::UpdateAccepted { update_id: u, result } if u == update_id => {
                        return Ok(Some(Ok(result.clone())));
                    }
                    EventKind::UpdateRejected { update_id: u, reason } if u == update_id => {
                        return Ok(Some(Err(ClientError::UpdateRejected(reason.clone()))));
                    }
                    _ => {}
                }
            }
            if exec == latest && OrchestrationStatus::from_history(&history).is_terminal() {
                return Ok(Some(Err(ClientError::AlreadyTerminal {
                    instance: instance.to_string(),
                    execution_id: exec,
                })));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Status and history
    // ------------------------------------------------------------------

    /// Status of the latest execution.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let history = self.store.read(instance).await?;
        Ok(OrchestrationStatus::from_history(&history))
    }

    /// Poll until the instance reaches a terminal state, following
    /// continue-as-new into later executions.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ClientError> {
        Ok(self.store.list_executions(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_with_execution(instance, execution_id).await?)
    }
}
