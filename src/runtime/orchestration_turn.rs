use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{Event, EventKind, TurnOutcome, run_turn_with};
use std::sync::Arc;
use tracing::{debug, warn};

/// One orchestration turn: stage the batch's messages as history events, then
/// replay the orchestration over baseline + staged events.
pub struct OrchestrationTurn {
    instance: String,
    turn_index: u64,
    execution_id: u64,
    /// History persisted before this turn.
    baseline_history: Vec<Event>,
    /// Events staged for this turn ahead of replay (start, carried signals, completions).
    staged: Vec<Event>,
    next_event_id: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScheduleKind {
    Activity,
    Timer,
    SubOrchestration,
}

impl OrchestrationTurn {
    pub fn new(instance: String, turn_index: u64, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;
        Self {
            instance,
            turn_index,
            execution_id,
            baseline_history,
            staged: Vec::new(),
            next_event_id,
        }
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn baseline_history(&self) -> &[Event] {
        &self.baseline_history
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.staged.iter())
    }

    /// Append a new event to this turn's staged delta.
    pub fn stage(&mut self, source_event_id: Option<u64>, kind: EventKind) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.staged
            .push(Event::new(id, source_event_id, self.execution_id, kind));
        id
    }

    fn schedule_kind(&self, id: u64) -> Option<ScheduleKind> {
        self.all_events().find(|e| e.event_id == id).and_then(|e| match e.kind {
            EventKind::ActivityScheduled { .. } => Some(ScheduleKind::Activity),
            EventKind::TimerCreated { .. } => Some(ScheduleKind::Timer),
            EventKind::SubOrchestrationScheduled { .. } => Some(ScheduleKind::SubOrchestration),
            _ => None,
        })
    }

    fn has_completion(&self, source: u64, started_only: bool) -> bool {
        self.all_events().any(|e| {
            e.source_event_id == Some(source)
                && match e.kind {
                    EventKind::SubOrchestrationStarted { .. } => started_only,
                    EventKind::ActivityCompleted { .. }
                    | EventKind::ActivityFailed { .. }
                    | EventKind::TimerFired { .. }
                    | EventKind::SubOrchestrationCompleted { .. }
                    | EventKind::SubOrchestrationFailed { .. } => !started_only,
                    _ => false,
                }
        })
    }

    /// Stage a completion for scheduling event `source`, dropping duplicates
    /// and completions whose scheduling decision has a different kind.
    fn stage_completion(&mut self, source: u64, expected: ScheduleKind, kind: EventKind) {
        match self.schedule_kind(source) {
            Some(k) if k == expected => {}
            Some(_) => {
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %self.instance,
                    execution_id = self.execution_id,
                    source_event_id = source,
                    "dropping completion whose kind does not match its scheduling event"
                );
                return;
            }
            None => {
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %self.instance,
                    execution_id = self.execution_id,
                    source_event_id = source,
                    "dropping completion with no matching scheduling event"
                );
                return;
            }
        }
        let started_only = matches!(kind, EventKind::SubOrchestrationStarted { .. });
        if self.has_completion(source, started_only) {
            debug!(
                target: "duroflow::runtime",
                instance_id = %self.instance,
                source_event_id = source,
                "ignoring duplicate completion"
            );
            return;
        }
        self.stage(Some(source), kind);
    }

    /// Convert the batch's completion messages into staged events, in arrival order.
    ///
    /// Messages addressed to another execution are dropped.
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        debug!(
            target: "duroflow::runtime",
            instance_id = %self.instance,
            turn_index = self.turn_index,
            message_count = messages.len(),
            "converting messages to events"
        );
        let exec = self.execution_id;
        for msg in messages {
            match msg {
                WorkItem::ActivityCompleted {
                    execution_id,
                    id,
                    result,
                    attempts,
                    ..
                } if *execution_id == exec => self.stage_completion(
                    *id,
                    ScheduleKind::Activity,
                    EventKind::ActivityCompleted {
                        result: result.clone(),
                        attempts: *attempts,
                    },
                ),
                WorkItem::ActivityFailed {
                    execution_id,
                    id,
                    details,
                    attempts,
                    ..
                } if *execution_id == exec => self.stage_completion(
                    *id,
                    ScheduleKind::Activity,
                    EventKind::ActivityFailed {
                        details: details.clone(),
                        attempts: *attempts,
                    },
                ),
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } if *execution_id == exec => self.stage_completion(
                    *id,
                    ScheduleKind::Timer,
                    EventKind::TimerFired {
                        fire_at_ms: *fire_at_ms,
                    },
                ),
                WorkItem::SubOrchStarted {
                    parent_execution_id,
                    parent_id,
                    child_instance,
                    child_execution_id,
                    ..
                } if *parent_execution_id == exec => self.stage_completion(
                    *parent_id,
                    ScheduleKind::SubOrchestration,
                    EventKind::SubOrchestrationStarted {
                        instance: child_instance.clone(),
                        execution_id: *child_execution_id,
                    },
                ),
                WorkItem::SubOrchCompleted {
                    parent_execution_id,
                    parent_id,
                    result,
                    ..
                } if *parent_execution_id == exec => self.stage_completion(
                    *parent_id,
                    ScheduleKind::SubOrchestration,
                    EventKind::SubOrchestrationCompleted { result: result.clone() },
                ),
                WorkItem::SubOrchFailed {
                    parent_execution_id,
                    parent_id,
                    details,
                    ..
                } if *parent_execution_id == exec => self.stage_completion(
                    *parent_id,
                    ScheduleKind::SubOrchestration,
                    EventKind::SubOrchestrationFailed {
                        details: details.clone(),
                    },
                ),
                WorkItem::SignalRaised {
                    execution_id,
                    name,
                    payload,
                    ..
                } if execution_id.is_none_or(|e| e == exec) => {
                    self.stage(
                        None,
                        EventKind::SignalReceived {
                            name: name.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
                WorkItem::UpdateRequested {
                    execution_id,
                    update_id,
                    name,
                    payload,
                    ..
                } if execution_id.is_none_or(|e| e == exec) => {
                    let duplicate = self.all_events().any(
                        |e| matches!(&e.kind, EventKind::UpdateRequested { update_id: u, .. } if u == update_id),
                    );
                    if !duplicate {
                        self.stage(
                            None,
                            EventKind::UpdateRequested {
                                update_id: update_id.clone(),
                                name: name.clone(),
                                payload: payload.clone(),
                            },
                        );
                    }
                }
                WorkItem::CancelInstance {
                    execution_id, reason, ..
                } if execution_id.is_none_or(|e| e == exec) => {
                    let already = self
                        .all_events()
                        .any(|e| matches!(e.kind, EventKind::OrchestrationCancelRequested { .. }));
                    if !already {
                        self.stage(None, EventKind::OrchestrationCancelRequested { reason: reason.clone() });
                    }
                }
                // Start items and run timeouts are handled by the dispatcher
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } | WorkItem::RunTimeout { .. } => {}
                other => {
                    warn!(
                        target: "duroflow::runtime",
                        instance_id = %self.instance,
                        execution_id = exec,
                        message = ?other,
                        "dropping message addressed to another execution"
                    );
                }
            }
        }
    }

    /// Replay the orchestration over baseline + staged events.
    pub fn execute(&self, handler: Arc<dyn OrchestrationHandler>) -> TurnOutcome {
        let mut history = self.baseline_history.clone();
        history.extend(self.staged.iter().cloned());
        run_turn_with(
            &self.instance,
            history,
            self.baseline_history.len(),
            self.turn_index,
            |ctx, input| {
                let handler = Arc::clone(&handler);
                async move { handler.invoke(ctx, input).await }
            },
        )
    }

    /// Events to persist for `outcome`: everything past the baseline.
    pub fn history_delta(&self, outcome: &TurnOutcome) -> Vec<Event> {
        outcome.history[self.baseline_history.len()..].to_vec()
    }

    /// Staged events only, for turns that end without running the orchestration.
    pub fn staged_delta(&self) -> Vec<Event> {
        self.staged.clone()
    }

    pub fn next_event_id(&self) -> u64 {
        self.next_event_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FnOrchestration;
    use crate::{OrchestrationContext, TurnResult};

    fn baseline() -> Vec<Event> {
        vec![
            Event::new(
                1,
                None,
                1,
                EventKind::OrchestrationStarted {
                    name: "O".into(),
                    version: "1.0.0".into(),
                    input: "x".into(),
                    started_at_ms: 0,
                    parent: None,
                    run_timeout_ms: None,
                },
            ),
            Event::new(
                2,
                None,
                1,
                EventKind::ActivityScheduled {
                    name: "A".into(),
                    input: "x".into(),
                    options: Default::default(),
                },
            ),
        ]
    }

    fn completed(exec: u64, id: u64) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: "i".into(),
            execution_id: exec,
            id,
            result: "done".into(),
            attempts: 1,
        }
    }

    #[test]
    fn duplicate_and_stale_completions_are_dropped() {
        let mut turn = OrchestrationTurn::new("i".into(), 1, 1, baseline());
        turn.prep_completions(&[completed(1, 2), completed(1, 2), completed(0, 2), completed(1, 99)]);
        assert_eq!(turn.staged_delta().len(), 1);
    }

    #[test]
    fn execute_produces_delta_past_baseline() {
        let mut turn = OrchestrationTurn::new("i".into(), 1, 1, baseline());
        turn.prep_completions(&[completed(1, 2)]);
        let handler: Arc<dyn OrchestrationHandler> =
            Arc::new(FnOrchestration(|ctx: OrchestrationContext, input: String| async move {
                let r = ctx.schedule_activity("A", input).into_activity().await?;
                Ok(format!("got {r}"))
            }));
        let outcome = turn.execute(handler);
        assert_eq!(outcome.result, TurnResult::Completed("got done".into()));
        let delta = turn.history_delta(&outcome);
        assert_eq!(delta.len(), 1);
        assert!(matches!(delta[0].kind, EventKind::ActivityCompleted { .. }));
    }
}
