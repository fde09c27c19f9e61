//! Orchestration dispatcher.
//!
//! Each worker locks one instance at a time, turns its queued messages into
//! history, replays the orchestration over the result, and commits the
//! history delta together with the work the turn produced in one ack.

use crate::providers::{OrchestrationItem, ProviderError, TurnCommit, WorkItem};
use crate::runtime::orchestration_turn::OrchestrationTurn;
use crate::runtime::{OrchestrationHandler, Runtime, limits, now_ms};
use crate::{
    Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, EventKind, ParentClosePolicy, ParentLink,
    RetryDecision, TurnResult,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fields of an execution's `OrchestrationStarted` event.
#[derive(Debug, Clone)]
struct StartInfo {
    name: String,
    version: String,
    input: String,
    started_at_ms: u64,
    parent: Option<ParentLink>,
    run_timeout_ms: Option<u64>,
}

impl StartInfo {
    fn from_history(history: &[Event]) -> Option<Self> {
        match history.first().map(|e| &e.kind) {
            Some(EventKind::OrchestrationStarted {
                name,
                version,
                input,
                started_at_ms,
                parent,
                run_timeout_ms,
            }) => Some(Self {
                name: name.clone(),
                version: version.clone(),
                input: input.clone(),
                started_at_ms: *started_at_ms,
                parent: parent.clone(),
                run_timeout_ms: *run_timeout_ms,
            }),
            _ => None,
        }
    }

    fn into_event_kind(self) -> EventKind {
        EventKind::OrchestrationStarted {
            name: self.name,
            version: self.version,
            input: self.input,
            started_at_ms: self.started_at_ms,
            parent: self.parent,
            run_timeout_ms: self.run_timeout_ms,
        }
    }
}

/// What the latest execution's history says about the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Missing,
    Running,
    ContinuedAsNew,
    Terminal,
}

fn exec_state(history: &[Event]) -> ExecState {
    if history.is_empty() {
        return ExecState::Missing;
    }
    match history.iter().rev().find(|e| e.kind.is_terminal()).map(|e| &e.kind) {
        Some(EventKind::OrchestrationContinuedAsNew { .. }) => ExecState::ContinuedAsNew,
        Some(_) => ExecState::Terminal,
        None => ExecState::Running,
    }
}

fn same_parent(a: &ParentLink, b: &ParentLink) -> bool {
    a.instance == b.instance && a.execution_id == b.execution_id && a.event_id == b.event_id
}

/// The execution a batch will run against.
struct Plan {
    execution_id: u64,
    baseline: Vec<Event>,
    /// Start event and carried signals for a new execution.
    new_start: Option<(StartInfo, Vec<(String, String)>)>,
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(concurrency);
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}");
                handles.push(tokio::spawn(async move { rt.orchestration_loop(worker_id).await }));
            }
            for h in handles {
                let _ = h.await;
            }
        })
    }

    async fn orchestration_loop(self: Arc<Self>, worker_id: String) {
        let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.history_store.fetch_orchestration_item().await {
                Ok(Some(item)) => {
                    let token = item.lock_token.clone();
                    let instance = item.instance.clone();
                    let execution_id = item.execution_id;
                    let Err(e) = self.process_orchestration_item(item, &worker_id).await else {
                        continue;
                    };
                    if !e.is_retryable() {
                        // Replaying would hit the same error; close the run instead
                        match self.fail_on_commit_error(&instance, execution_id, &token, &e).await {
                            Ok(()) => continue,
                            Err(e2) => warn!(
                                target: "duroflow::runtime",
                                instance_id = %instance,
                                worker_id = %worker_id,
                                error = %e2,
                                "failed to record infrastructure failure"
                            ),
                        }
                    }
                    warn!(
                        target: "duroflow::runtime",
                        instance_id = %instance,
                        worker_id = %worker_id,
                        error = %e,
                        retryable = e.is_retryable(),
                        "orchestration turn failed to commit, abandoning"
                    );
                    let _ = self.history_store.abandon_orchestration_item(&token).await;
                    tokio::time::sleep(Duration::from_millis(limits::PROVIDER_RETRY_BACKOFF_MS)).await;
                }
                Ok(None) => tokio::time::sleep(idle).await,
                Err(e) => {
                    warn!(target: "duroflow::runtime", worker_id = %worker_id, error = %e, "orchestration fetch failed");
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }

    /// Resolve the version a new execution is pinned to.
    fn pin_version(&self, name: &str, requested: Option<&str>) -> String {
        self.orchestration_registry
            .resolve(name, requested)
            .map(|(v, _)| v.to_string())
            .unwrap_or_else(|| requested.unwrap_or_default().to_string())
    }

    /// Decide which execution this batch runs against. `None` means the batch
    /// carries nothing that can run and is dropped.
    fn plan_execution(&self, item: &OrchestrationItem, commit: &mut TurnCommit) -> Option<Plan> {
        let instance = &item.instance;
        let latest = item.execution_id;
        let state = exec_state(&item.history);

        // Successor of a continued-as-new execution
        if state == ExecState::ContinuedAsNew {
            let next = item.messages.iter().find_map(|m| match m {
                WorkItem::ContinueAsNew {
                    orchestration,
                    version,
                    input,
                    execution_id,
                    parent,
                    run_timeout_ms,
                    carried_signals,
                    ..
                } if *execution_id == latest + 1 => Some((
                    StartInfo {
                        name: orchestration.clone(),
                        version: self.pin_version(orchestration, Some(version.as_str()).filter(|v| !v.is_empty())),
                        input: input.clone(),
                        started_at_ms: now_ms(),
                        parent: parent.clone(),
                        run_timeout_ms: *run_timeout_ms,
                    },
                    carried_signals.clone(),
                )),
                _ => None,
            });
            if let Some((start, mut carried)) = next {
                let cap = self.options.max_carry_forward_signals;
                if carried.len() > cap {
                    warn!(
                        target: "duroflow::runtime",
                        instance_id = %instance,
                        execution_id = latest + 1,
                        carried = carried.len(),
                        cap,
                        "dropping oldest signals carried across continue-as-new"
                    );
                    carried.drain(..carried.len() - cap);
                }
                return Some(Plan {
                    execution_id: latest + 1,
                    baseline: Vec::new(),
                    new_start: Some((start, carried)),
                });
            }
        }

        for msg in &item.messages {
            let WorkItem::StartOrchestration {
                orchestration,
                version,
                input,
                execution_id,
                parent,
                run_timeout_ms,
                ..
            } = msg
            else {
                continue;
            };

            match (state, execution_id) {
                // Created by the client; the first turn just runs
                (ExecState::Running, Some(e)) if *e == latest => {
                    return Some(Plan {
                        execution_id: latest,
                        baseline: item.history.clone(),
                        new_start: None,
                    });
                }
                (ExecState::Running, _) => {
                    // Duplicate start of a child that is already running
                    if let Some(link) = parent {
                        let running_parent = StartInfo::from_history(&item.history).and_then(|s| s.parent);
                        if running_parent.as_ref().is_some_and(|p| same_parent(p, link)) {
                            commit.orchestrator_items.push(WorkItem::SubOrchStarted {
                                parent_instance: link.instance.clone(),
                                parent_execution_id: link.execution_id,
                                parent_id: link.event_id,
                                child_instance: instance.clone(),
                                child_execution_id: latest,
                            });
                        } else {
                            commit.orchestrator_items.push(WorkItem::SubOrchFailed {
                                parent_instance: link.instance.clone(),
                                parent_execution_id: link.execution_id,
                                parent_id: link.event_id,
                                details: ErrorDetails::application(
                                    AppErrorKind::ChildProcessFailed,
                                    format!("instance '{instance}' is already running"),
                                ),
                            });
                        }
                    }
                }
                (ExecState::Missing | ExecState::Terminal, None) => {
                    if let Some(link) = parent
                        && let Some(prev) = StartInfo::from_history(&item.history).and_then(|s| s.parent)
                        && same_parent(&prev, link)
                        && prev.attempt >= link.attempt
                    {
                        debug!(
                            target: "duroflow::runtime",
                            instance_id = %instance,
                            attempt = link.attempt,
                            "ignoring redelivered child start"
                        );
                        continue;
                    }
                    let next_exec = if state == ExecState::Missing {
                        crate::INITIAL_EXECUTION_ID
                    } else {
                        latest + 1
                    };
                    if let Some(link) = parent {
                        commit.orchestrator_items.push(WorkItem::SubOrchStarted {
                            parent_instance: link.instance.clone(),
                            parent_execution_id: link.execution_id,
                            parent_id: link.event_id,
                            child_instance: instance.clone(),
                            child_execution_id: next_exec,
                        });
                    }
                    return Some(Plan {
                        execution_id: next_exec,
                        baseline: Vec::new(),
                        new_start: Some((
                            StartInfo {
                                name: orchestration.clone(),
                                version: self.pin_version(orchestration, version.as_deref()),
                                input: input.clone(),
                                started_at_ms: now_ms(),
                                parent: parent.clone(),
                                run_timeout_ms: *run_timeout_ms,
                            },
                            Vec::new(),
                        )),
                    });
                }
                _ => {}
            }
        }

        match state {
            ExecState::Running => Some(Plan {
                execution_id: latest,
                baseline: item.history.clone(),
                new_start: None,
            }),
            _ => None,
        }
    }

    pub(in crate::runtime) async fn process_orchestration_item(
        self: &Arc<Self>,
        item: OrchestrationItem,
        worker_id: &str,
    ) -> Result<(), ProviderError> {
        let instance = item.instance.clone();
        let mut commit = TurnCommit::default();

        let Some(plan) = self.plan_execution(&item, &mut commit) else {
            debug!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id = item.execution_id,
                dropped = item.messages.len(),
                "no running execution for batch, dropping messages"
            );
            commit.execution_id = item.execution_id;
            return self.history_store.ack_orchestration_item(&item.lock_token, commit).await;
        };

        let exec_id = plan.execution_id;
        let turn_index = plan.baseline.len() as u64;
        let mut turn = OrchestrationTurn::new(instance.clone(), turn_index, exec_id, plan.baseline);
        if let Some((start, carried)) = plan.new_start {
            info!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id = exec_id,
                orchestration_name = %start.name,
                orchestration_version = %start.version,
                worker_id,
                "orchestration started"
            );
            turn.stage(None, start.into_event_kind());
            for (name, payload) in carried {
                turn.stage(None, EventKind::SignalReceived { name, payload });
            }
        }
        commit.execution_id = exec_id;

        let mut history_so_far = turn.baseline_history().to_vec();
        history_so_far.extend(turn.staged_delta());
        let Some(start) = StartInfo::from_history(&history_so_far) else {
            warn!(target: "duroflow::runtime", instance_id = %instance, "history has no start event, dropping batch");
            return self.history_store.ack_orchestration_item(&item.lock_token, commit).await;
        };

        let timed_out = item
            .messages
            .iter()
            .any(|m| matches!(m, WorkItem::RunTimeout { execution_id, .. } if *execution_id == exec_id));
        if timed_out && !turn.baseline_history().is_empty() {
            warn!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id = exec_id,
                orchestration_name = %start.name,
                "orchestration exceeded its run timeout"
            );
            turn.stage(None, EventKind::OrchestrationTimedOut);
            let mut history = turn.baseline_history().to_vec();
            history.extend(turn.staged_delta());
            self.close_children(&instance, &history, &mut commit);
            self.notify_parent(
                &instance,
                &start,
                Err(ErrorDetails::application(
                    AppErrorKind::ProcessTimedOut,
                    "run timeout exceeded",
                )),
                &mut commit,
            );
            commit.history_delta = turn.staged_delta();
            self.history_store.ack_orchestration_item(&item.lock_token, commit).await?;
            self.pending_steps.cancel_execution(&instance, exec_id);
            return Ok(());
        }

        turn.prep_completions(&item.messages);

        // First turn arms the run timeout
        if turn.baseline_history().len() <= 1
            && let Some(timeout) = start.run_timeout_ms
        {
            commit.timer_items.push(WorkItem::TimerSchedule {
                fire_at_ms: start.started_at_ms.saturating_add(timeout),
                item: Box::new(WorkItem::RunTimeout {
                    instance: instance.clone(),
                    execution_id: exec_id,
                }),
            });
        }

        let handler = self
            .orchestration_registry
            .resolve(&start.name, Some(start.version.as_str()))
            .map(|(_, h)| h);
        let Some(handler) = handler else {
            warn!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id = exec_id,
                orchestration_name = %start.name,
                orchestration_version = %start.version,
                "orchestration not registered"
            );
            let details = ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredOrchestration,
                resource: format!("{}@{}", start.name, start.version),
                message: None,
            };
            turn.stage(None, EventKind::OrchestrationFailed { details: details.clone() });
            self.notify_parent(&instance, &start, Err(details), &mut commit);
            commit.history_delta = turn.staged_delta();
            return self.history_store.ack_orchestration_item(&item.lock_token, commit).await;
        };

        self.run_and_commit(&item.lock_token, &instance, worker_id, turn, handler, start, commit)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_and_commit(
        &self,
        lock_token: &str,
        instance: &str,
        worker_id: &str,
        turn: OrchestrationTurn,
        handler: Arc<dyn OrchestrationHandler>,
        start: StartInfo,
        mut commit: TurnCommit,
    ) -> Result<(), ProviderError> {
        let exec_id = turn.execution_id();
        let outcome = turn.execute(handler);
        let mut delta = turn.history_delta(&outcome);
        let mut history = outcome.history.clone();
        let next_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;

        let terminal = match &outcome.result {
            TurnResult::Continue => None,
            TurnResult::Completed(output) => Some(EventKind::OrchestrationCompleted { output: output.clone() }),
            TurnResult::Failed(details) => Some(EventKind::OrchestrationFailed { details: details.clone() }),
            TurnResult::Cancelled(reason) => Some(EventKind::OrchestrationCancelled { reason: reason.clone() }),
            TurnResult::ContinueAsNew { input, .. } => {
                Some(EventKind::OrchestrationContinuedAsNew { input: input.clone() })
            }
        };

        match &outcome.result {
            TurnResult::Continue => {
                self.dispatch_actions(instance, exec_id, outcome.actions, &mut commit);
            }
            TurnResult::Completed(output) => {
                self.notify_parent(instance, &start, Ok(output.clone()), &mut commit);
            }
            TurnResult::Failed(details) => {
                if details.is_nondeterminism() {
                    warn!(
                        target: "duroflow::runtime",
                        instance_id = %instance,
                        execution_id = exec_id,
                        orchestration_name = %start.name,
                        error = %details,
                        "nondeterministic replay, failing orchestration"
                    );
                }
                self.notify_parent(instance, &start, Err(details.clone()), &mut commit);
            }
            TurnResult::Cancelled(reason) => {
                self.notify_parent(
                    instance,
                    &start,
                    Err(ErrorDetails::application(AppErrorKind::ProcessCancelled, reason.clone())),
                    &mut commit,
                );
            }
            TurnResult::ContinueAsNew { input, version } => {
                commit.orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.to_string(),
                    orchestration: start.name.clone(),
                    version: version.clone().unwrap_or_else(|| start.version.clone()),
                    input: input.clone(),
                    execution_id: exec_id + 1,
                    parent: start.parent.clone(),
                    run_timeout_ms: start.run_timeout_ms,
                    carried_signals: outcome.ctx.unconsumed_signals(),
                });
            }
        }

        if let Some(kind) = terminal {
            let event = Event::new(next_id, None, exec_id, kind);
            history.push(event.clone());
            delta.push(event);
            self.close_children(instance, &history, &mut commit);
        }

        debug!(
            target: "duroflow::runtime",
            instance_id = %instance,
            execution_id = exec_id,
            orchestration_name = %start.name,
            worker_id,
            delta = delta.len(),
            worker_items = commit.worker_items.len(),
            timer_items = commit.timer_items.len(),
            orchestrator_items = commit.orchestrator_items.len(),
            result = ?outcome.result,
            "orchestration turn committed"
        );

        commit.history_delta = delta;
        self.history_store.ack_orchestration_item(lock_token, commit).await?;

        if outcome.result.is_terminal() {
            let cancelled = self.pending_steps.cancel_execution(instance, exec_id);
            if cancelled > 0 {
                debug!(
                    target: "duroflow::runtime",
                    instance_id = %instance,
                    execution_id = exec_id,
                    cancelled,
                    "signalled cancellation to in-flight steps"
                );
            }
            info!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id = exec_id,
                orchestration_name = %start.name,
                result = ?outcome.result,
                "orchestration execution ended"
            );
        }
        Ok(())
    }

    /// Commit an infrastructure failure for the running execution under the
    /// lock the failed turn still holds. A batch with no running execution is
    /// dropped.
    async fn fail_on_commit_error(
        &self,
        instance: &str,
        execution_id: u64,
        lock_token: &str,
        error: &ProviderError,
    ) -> Result<(), ProviderError> {
        let history = if execution_id == 0 {
            Vec::new()
        } else {
            self.history_store.read_with_execution(instance, execution_id).await?
        };
        let mut commit = TurnCommit {
            execution_id,
            ..Default::default()
        };
        let start = StartInfo::from_history(&history);
        let (Some(start), ExecState::Running) = (start, exec_state(&history)) else {
            warn!(
                target: "duroflow::runtime",
                instance_id = %instance,
                execution_id,
                error = %error,
                "no running execution to fail, dropping batch"
            );
            return self.history_store.ack_orchestration_item(lock_token, commit).await;
        };

        let details = error.to_infrastructure_error();
        let next_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;
        let failed = Event::new(
            next_id,
            None,
            execution_id,
            EventKind::OrchestrationFailed {
                details: details.clone(),
            },
        );
        let mut closed = history;
        closed.push(failed.clone());
        self.close_children(instance, &closed, &mut commit);
        self.notify_parent(instance, &start, Err(details.clone()), &mut commit);
        commit.history_delta = vec![failed];
        self.history_store.ack_orchestration_item(lock_token, commit).await?;
        self.pending_steps.cancel_execution(instance, execution_id);

        warn!(
            target: "duroflow::runtime",
            instance_id = %instance,
            execution_id,
            orchestration_name = %start.name,
            error = %details,
            "orchestration failed on a permanent storage error"
        );
        Ok(())
    }

    /// Materialize a turn's decisions into work items.
    fn dispatch_actions(&self, instance: &str, exec_id: u64, actions: Vec<Action>, commit: &mut TurnCommit) {
        for action in actions {
            match action {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                    options,
                } => commit.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id: exec_id,
                    id: scheduling_event_id,
                    name,
                    input,
                    options,
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                    delay_ms,
                } => commit.timer_items.push(WorkItem::TimerSchedule {
                    fire_at_ms: now_ms().saturating_add(delay_ms),
                    item: Box::new(WorkItem::TimerFired {
                        instance: instance.to_string(),
                        execution_id: exec_id,
                        id: scheduling_event_id,
                        fire_at_ms,
                    }),
                }),
                Action::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    instance: child,
                    input,
                    options,
                } => commit.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    version: options.version,
                    input,
                    execution_id: None,
                    parent: Some(ParentLink {
                        instance: instance.to_string(),
                        execution_id: exec_id,
                        event_id: scheduling_event_id,
                        retry_policy: options.retry_policy,
                        attempt: 1,
                    }),
                    run_timeout_ms: options.run_timeout.map(|d| d.as_millis() as u64),
                }),
                // Ends the turn; handled from the turn result
                Action::ContinueAsNew { .. } => {}
            }
        }
    }

    /// Report a terminal child result to its parent, or restart the child
    /// when its retry policy allows another run.
    fn notify_parent(
        &self,
        instance: &str,
        start: &StartInfo,
        result: Result<String, ErrorDetails>,
        commit: &mut TurnCommit,
    ) {
        let Some(link) = &start.parent else {
            return;
        };
        let details = match result {
            Ok(result) => {
                commit.orchestrator_items.push(WorkItem::SubOrchCompleted {
                    parent_instance: link.instance.clone(),
                    parent_execution_id: link.execution_id,
                    parent_id: link.event_id,
                    result,
                });
                return;
            }
            Err(details) => details,
        };

        let retryable = details.app_kind() != Some(AppErrorKind::ProcessCancelled);
        if let Some(policy) = &link.retry_policy
            && retryable
            && !policy.is_exhausted(link.attempt)
            && let RetryDecision::Delay(delay) = policy.next_delay(link.attempt)
        {
            info!(
                target: "duroflow::runtime",
                instance_id = %instance,
                parent_instance = %link.instance,
                attempt = link.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %details,
                "child orchestration failed, scheduling restart"
            );
            commit.timer_items.push(WorkItem::TimerSchedule {
                fire_at_ms: now_ms().saturating_add(delay.as_millis() as u64),
                item: Box::new(WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: start.name.clone(),
                    version: Some(start.version.clone()).filter(|v| !v.is_empty()),
                    input: start.input.clone(),
                    execution_id: None,
                    parent: Some(ParentLink {
                        attempt: link.attempt + 1,
                        ..link.clone()
                    }),
                    run_timeout_ms: start.run_timeout_ms,
                }),
            });
            return;
        }

        commit.orchestrator_items.push(WorkItem::SubOrchFailed {
            parent_instance: link.instance.clone(),
            parent_execution_id: link.execution_id,
            parent_id: link.event_id,
            details: ErrorDetails::application(AppErrorKind::ChildProcessFailed, details.display_message()),
        });
    }

    /// Request cancellation of unfinished children started with
    /// [`ParentClosePolicy::Cancel`].
    fn close_children(&self, instance: &str, history: &[Event], commit: &mut TurnCommit) {
        for e in history {
            let EventKind::SubOrchestrationScheduled {
                instance: child,
                options,
                ..
            } = &e.kind
            else {
                continue;
            };
            if options.parent_close_policy != ParentClosePolicy::Cancel {
                continue;
            }
            let finished = history.iter().any(|c| {
                c.source_event_id == Some(e.event_id)
                    && matches!(
                        c.kind,
                        EventKind::SubOrchestrationCompleted { .. } | EventKind::SubOrchestrationFailed { .. }
                    )
            });
            if !finished {
                commit.orchestrator_items.push(WorkItem::CancelInstance {
                    instance: child.clone(),
                    execution_id: None,
                    reason: format!("parent '{instance}' closed"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(parent: Option<ParentLink>) -> Event {
        Event::new(
            1,
            None,
            1,
            EventKind::OrchestrationStarted {
                name: "O".into(),
                version: "1.0.0".into(),
                input: "in".into(),
                started_at_ms: 0,
                parent,
                run_timeout_ms: None,
            },
        )
    }

    #[test]
    fn exec_state_reads_last_terminal_event() {
        assert_eq!(exec_state(&[]), ExecState::Missing);
        let mut h = vec![started(None)];
        assert_eq!(exec_state(&h), ExecState::Running);
        h.push(Event::new(2, None, 1, EventKind::OrchestrationContinuedAsNew { input: "x".into() }));
        assert_eq!(exec_state(&h), ExecState::ContinuedAsNew);
        h[1] = Event::new(2, None, 1, EventKind::OrchestrationTimedOut);
        assert_eq!(exec_state(&h), ExecState::Terminal);
    }

    #[test]
    fn parent_links_compare_by_decision_not_attempt() {
        let a = ParentLink {
            instance: "p".into(),
            execution_id: 1,
            event_id: 4,
            retry_policy: None,
            attempt: 1,
        };
        let b = ParentLink { attempt: 3, ..a.clone() };
        let c = ParentLink { event_id: 5, ..a.clone() };
        assert!(same_parent(&a, &b));
        assert!(!same_parent(&a, &c));
        let info = StartInfo::from_history(&[started(Some(a))]).unwrap();
        assert_eq!(info.name, "O");
        assert!(info.parent.is_some());
    }
}
