//! In-process runtime: orchestration dispatcher, activity workers, timer service.
//!
//! The runtime owns no durable state of its own. Everything that must survive
//! a restart lives in the [`Provider`]; the in-memory pending-step table only
//! mirrors activity attempts in flight for heartbeats and cancellation.

use crate::OrchestrationContext;
use crate::providers::Provider;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

pub mod dispatchers;
pub mod limits;
pub mod orchestration_turn;
pub mod pending;
pub mod registry;
pub(crate) mod replay;
pub mod status;
mod timers;

pub use pending::{PendingStepInfo, PendingSteps, StepKey};
pub use registry::{OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy};
pub use status::OrchestrationStatus;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval in milliseconds when dispatcher queues are empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Number of concurrent orchestration dispatchers.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    /// How often running attempts are checked for missed heartbeats.
    pub heartbeat_check_interval_ms: u64,
    /// Start-to-close timeout for steps that do not set one.
    pub default_step_timeout: Duration,
    /// Maximum unconsumed signals carried into a continued-as-new execution.
    pub max_carry_forward_signals: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            heartbeat_check_interval_ms: 50,
            default_step_timeout: Duration::from_secs(30),
            max_carry_forward_signals: limits::MAX_CARRY_FORWARD_SIGNALS,
        }
    }
}

impl RuntimeOptions {
    /// Defaults overlaid with `DUROFLOW_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(target: "duroflow::runtime", key, value = %raw, "ignoring invalid runtime option");
                    None
                }
            }
        }

        let mut opts = Self::default();
        if let Some(v) = parse(&lookup, "DUROFLOW_IDLE_SLEEP_MS") {
            opts.dispatcher_idle_sleep_ms = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "DUROFLOW_ORCHESTRATION_CONCURRENCY").filter(|v| *v > 0) {
            opts.orchestration_concurrency = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "DUROFLOW_WORKER_CONCURRENCY").filter(|v| *v > 0) {
            opts.worker_concurrency = v;
        }
        if let Some(v) = parse(&lookup, "DUROFLOW_HEARTBEAT_CHECK_MS") {
            opts.heartbeat_check_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "DUROFLOW_STEP_TIMEOUT_MS") {
            opts.default_step_timeout = Duration::from_millis(v);
        }
        opts
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity (step) handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Context handed to a running activity attempt.
#[derive(Clone)]
pub struct ActivityContext {
    key: StepKey,
    orchestration_name: String,
    activity_name: String,
    attempt: u32,
    steps: Arc<PendingSteps>,
    cancel: watch::Receiver<bool>,
}

impl ActivityContext {
    pub(crate) fn new(
        key: StepKey,
        orchestration_name: String,
        activity_name: String,
        attempt: u32,
        steps: Arc<PendingSteps>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            key,
            orchestration_name,
            activity_name,
            attempt,
            steps,
            cancel,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.key.instance
    }

    pub fn execution_id(&self) -> u64 {
        self.key.execution_id
    }

    pub fn activity_id(&self) -> u64 {
        self.key.activity_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.orchestration_name
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-based attempt number under the step's retry policy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record liveness. Long-running steps with a heartbeat timeout must call
    /// this more often than the timeout.
    pub fn heartbeat(&self, details: impl Into<String>) {
        self.steps.heartbeat(&self.key, details.into());
    }

    /// True once the owning orchestration was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when the owning orchestration is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// In-process runtime that executes orchestrations, activities and timers and
/// persists history via a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) history_store: Arc<dyn Provider>,
    pub(crate) orchestration_registry: OrchestrationRegistry,
    pub(crate) activity_registry: Arc<registry::ActivityRegistry>,
    pub(crate) pending_steps: Arc<PendingSteps>,
    pub(crate) options: RuntimeOptions,
    pub(crate) shutdown_flag: Arc<AtomicBool>,
}

impl Runtime {
    /// Start a new runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<registry::ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<registry::ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            pending_steps: Arc::new(PendingSteps::default()),
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        });

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_work_dispatcher();
        let timer = timers::TimerService::start(
            runtime.history_store.clone(),
            runtime.options.dispatcher_idle_sleep_ms,
            runtime.shutdown_flag.clone(),
        );
        runtime.joins.lock().await.extend([orch, work, timer]);

        tracing::debug!(
            target: "duroflow::runtime",
            worker_concurrency = runtime.options.worker_concurrency,
            "runtime started"
        );
        runtime
    }

    /// Client bound to this runtime's store and orchestration registry, so
    /// it can also run queries and validate updates.
    pub fn client(&self) -> crate::Client {
        crate::Client::new(self.history_store.clone()).with_orchestrations(self.orchestration_registry.clone())
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.history_store.clone()
    }

    /// Activity attempts currently in flight.
    pub fn pending_steps(&self) -> Vec<PendingStepInfo> {
        self.pending_steps.snapshot()
    }

    /// Stop all dispatchers. In-flight turns are abandoned and redelivered on
    /// the next start.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.pending_steps.cancel_all();
        let mut joins = self.joins.lock().await;
        for j in joins.iter() {
            j.abort();
        }
        futures::future::join_all(joins.drain(..)).await;
        tracing::debug!(target: "duroflow::runtime", "runtime stopped");
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
