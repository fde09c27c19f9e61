//! Worker (activity) dispatcher: the step invoker.
//!
//! Each worker fetches `ActivityExecute` items, runs the step under its
//! start-to-close and heartbeat timeouts, retries failed attempts per the
//! step's retry policy, and acks the item together with the single terminal
//! completion. Intermediate attempts never reach history. Steps of a run that
//! already finished are acked without running.

use crate::providers::{QueueKind, WorkItem};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::runtime::{ActivityContext, ActivityHandler, Runtime, StepKey};
use crate::{ActivityOptions, AppErrorKind, ConfigErrorKind, ErrorDetails, EventKind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of one attempt.
#[derive(Debug)]
enum AttemptOutcome {
    Succeeded(String),
    Failed(String),
    TimedOut(&'static str),
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers.
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(concurrency);
            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let worker_id = format!("work-{worker_idx}");
                handles.push(tokio::spawn(async move { rt.worker_loop(worker_id).await }));
            }
            for h in handles {
                let _ = h.await;
            }
        })
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.history_store.fetch_work_item(QueueKind::Worker).await {
                Ok(Some((item, token))) => self.handle_work_item(&worker_id, item, token).await,
                Ok(None) => tokio::time::sleep(idle).await,
                Err(e) => {
                    warn!(target: "duroflow::runtime", worker_id = %worker_id, error = %e, "worker fetch failed");
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }

    async fn handle_work_item(&self, worker_id: &str, item: WorkItem, token: String) {
        let WorkItem::ActivityExecute {
            instance,
            execution_id,
            id,
            name,
            input,
            options,
        } = item
        else {
            warn!(target: "duroflow::runtime", worker_id, item = ?item, "unexpected item in worker queue");
            let _ = self
                .history_store
                .ack_work_item(QueueKind::Worker, &token, None)
                .await;
            return;
        };

        let key = StepKey {
            instance: instance.clone(),
            execution_id,
            activity_id: id,
        };
        let completion = match self.activity_registry.resolve_handler(&name) {
            Some((_, handler)) => {
                self.invoke_step(worker_id, &key, &name, input, &options, handler)
                    .await
            }
            None => {
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    worker_id,
                    "activity not registered"
                );
                Err((
                    ErrorDetails::Configuration {
                        kind: ConfigErrorKind::UnregisteredActivity,
                        resource: name.clone(),
                        message: None,
                    },
                    0,
                ))
            }
        };

        let completion = match completion {
            Ok((result, attempts)) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                execution_id,
                id,
                result,
                attempts,
            },
            Err((details, attempts)) => WorkItem::ActivityFailed {
                instance: instance.clone(),
                execution_id,
                id,
                details,
                attempts,
            },
        };

        if let Err(e) = self
            .history_store
            .ack_work_item(QueueKind::Worker, &token, Some(completion))
            .await
        {
            warn!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id,
                activity_id = id,
                worker_id,
                error = %e,
                "worker: atomic ack failed"
            );
            let _ = self.history_store.abandon_work_item(QueueKind::Worker, &token).await;
        }
    }

    /// Run attempts until success, terminal failure or policy exhaustion.
    /// Returns the result or terminal error with the number of attempts made.
    async fn invoke_step(
        &self,
        worker_id: &str,
        key: &StepKey,
        name: &str,
        input: String,
        options: &ActivityOptions,
        handler: Arc<dyn ActivityHandler>,
    ) -> Result<(String, u32), (ErrorDetails, u32)> {
        let policy = options.retry_policy.clone().unwrap_or_else(RetryPolicy::no_retry);
        let start_to_close = options
            .start_to_close_timeout
            .unwrap_or(self.options.default_step_timeout);
        // Registered before the history read: a run that ends after the read
        // still reaches this step through `cancel_execution`.
        let cancel = self.pending_steps.register(key.clone(), name, &input);
        let history = self
            .history_store
            .read_with_execution(&key.instance, key.execution_id)
            .await
            .unwrap_or_default();
        if history.iter().any(|e| e.kind.is_terminal()) {
            self.pending_steps.remove(key);
            debug!(
                target: "duroflow::runtime",
                instance_id = %key.instance,
                execution_id = key.execution_id,
                activity_name = %name,
                activity_id = key.activity_id,
                worker_id,
                "run already finished, skipping activity"
            );
            return Err((
                ErrorDetails::application(AppErrorKind::ProcessCancelled, "run finished before the activity started"),
                0,
            ));
        }
        if history
            .iter()
            .any(|e| matches!(e.kind, EventKind::OrchestrationCancelRequested { .. }))
        {
            self.pending_steps.cancel_execution(&key.instance, key.execution_id);
        }
        let orchestration_name = crate::runtime::replay::handler_name(&history);

        let result = self
            .attempt_loop(
                worker_id,
                key,
                name,
                &input,
                &orchestration_name,
                &policy,
                start_to_close,
                options.heartbeat_timeout,
                cancel,
                handler,
            )
            .await;
        self.pending_steps.remove(key);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        worker_id: &str,
        key: &StepKey,
        name: &str,
        input: &str,
        orchestration_name: &str,
        policy: &RetryPolicy,
        start_to_close: Duration,
        heartbeat_timeout: Option<Duration>,
        cancel: watch::Receiver<bool>,
        handler: Arc<dyn ActivityHandler>,
    ) -> Result<(String, u32), (ErrorDetails, u32)> {
        let mut attempt: u32 = 1;
        loop {
            debug!(
                target: "duroflow::runtime",
                instance_id = %key.instance,
                execution_id = key.execution_id,
                activity_name = %name,
                activity_id = key.activity_id,
                worker_id,
                attempt,
                "activity attempt started"
            );
            self.pending_steps
                .begin_attempt(key, attempt, Instant::now() + start_to_close);
            let ctx = ActivityContext::new(
                key.clone(),
                orchestration_name.to_string(),
                name.to_string(),
                attempt,
                self.pending_steps.clone(),
                cancel.clone(),
            );
            let outcome = self
                .run_attempt(key, &handler, ctx, input.to_string(), start_to_close, heartbeat_timeout)
                .await;

            let (kind, message) = match outcome {
                AttemptOutcome::Succeeded(result) => {
                    debug!(
                        target: "duroflow::runtime",
                        instance_id = %key.instance,
                        activity_name = %name,
                        activity_id = key.activity_id,
                        worker_id,
                        attempt,
                        "activity completed"
                    );
                    return Ok((result, attempt));
                }
                AttemptOutcome::Failed(e) => (AppErrorKind::StepFailedTerminal, e),
                AttemptOutcome::TimedOut(which) => (AppErrorKind::StepTimeout, format!("{which} timeout exceeded")),
            };

            let delay = match policy.next_delay(attempt) {
                RetryDecision::Delay(d) if !policy.is_exhausted(attempt) && !*cancel.borrow() => d,
                _ => {
                    warn!(
                        target: "duroflow::runtime",
                        instance_id = %key.instance,
                        execution_id = key.execution_id,
                        activity_name = %name,
                        activity_id = key.activity_id,
                        worker_id,
                        attempt,
                        error = %message,
                        "activity failed terminally"
                    );
                    return Err((ErrorDetails::application(kind, message), attempt));
                }
            };

            debug!(
                target: "duroflow::runtime",
                instance_id = %key.instance,
                activity_name = %name,
                activity_id = key.activity_id,
                worker_id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %ErrorDetails::application(AppErrorKind::StepFailedTransient, message.clone()),
                "activity attempt failed, retrying"
            );
            self.pending_steps.schedule_retry(key, Instant::now() + delay);

            let mut cancel_rx = cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_rx.wait_for(|c| *c) => {
                    return Err((
                        ErrorDetails::application(AppErrorKind::ProcessCancelled, "cancelled while waiting to retry"),
                        attempt,
                    ));
                }
            }
            attempt += 1;
        }
    }

    /// One attempt under start-to-close and heartbeat watchdogs. Cancellation
    /// is advisory: the handler observes it through its context.
    async fn run_attempt(
        &self,
        key: &StepKey,
        handler: &Arc<dyn ActivityHandler>,
        ctx: ActivityContext,
        input: String,
        start_to_close: Duration,
        heartbeat_timeout: Option<Duration>,
    ) -> AttemptOutcome {
        let fut = handler.invoke(ctx, input);
        tokio::pin!(fut);
        let deadline = tokio::time::sleep(start_to_close);
        tokio::pin!(deadline);
        let mut check =
            tokio::time::interval(Duration::from_millis(self.options.heartbeat_check_interval_ms.max(1)));

        loop {
            tokio::select! {
                r = &mut fut => {
                    return match r {
                        Ok(s) => AttemptOutcome::Succeeded(s),
                        Err(e) => AttemptOutcome::Failed(e),
                    };
                }
                _ = &mut deadline => return AttemptOutcome::TimedOut("start-to-close"),
                _ = check.tick(), if heartbeat_timeout.is_some() => {
                    let last = self.pending_steps.last_heartbeat(key);
                    if let (Some(limit), Some(last)) = (heartbeat_timeout, last)
                        && last.elapsed() > limit
                    {
                        return AttemptOutcome::TimedOut("heartbeat");
                    }
                }
            }
        }
    }
}
