use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

use super::{OrchestrationItem, Provider, ProviderError, QueueKind, TurnCommit, WorkItem};
use crate::{Event, EventKind};

/// Maximum events per execution. Long-lived orchestrations are expected to
/// continue-as-new well before this.
const HISTORY_CAP: usize = 10_000;

#[derive(Default)]
struct State {
    // instance -> execution_id -> events
    histories: HashMap<String, BTreeMap<u64, Vec<Event>>>,
    orchestrator_q: VecDeque<WorkItem>,
    worker_q: VecDeque<WorkItem>,
    timer_q: VecDeque<WorkItem>,
    // Peek-lock state: items here are invisible until ack/abandon.
    locked_instances: HashMap<String, (String, Vec<WorkItem>)>,
    locked_work: HashMap<String, (QueueKind, WorkItem)>,
    next_token: u64,
    history_cap: Option<usize>,
}

impl State {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}:{}", self.next_token)
    }

    fn queue(&mut self, kind: QueueKind) -> &mut VecDeque<WorkItem> {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator_q,
            QueueKind::Worker => &mut self.worker_q,
            QueueKind::Timer => &mut self.timer_q,
        }
    }

    fn is_locked(&self, instance: &str) -> bool {
        self.locked_instances.values().any(|(i, _)| i == instance)
    }

    /// Append with idempotent completion handling: a completion for a
    /// scheduling event that already has one is dropped. With `create`, a
    /// missing execution is created when it is next in sequence. A rejected
    /// append leaves the state untouched.
    fn append(
        &mut self,
        instance: &str,
        execution_id: u64,
        events: Vec<Event>,
        create: bool,
    ) -> Result<(), ProviderError> {
        let execs = self.histories.get(instance);
        let have = match execs.and_then(|e| e.get(&execution_id)) {
            Some(cur) => cur.len(),
            None if create => {
                let expected = execs
                    .and_then(|e| e.keys().next_back())
                    .map_or(crate::INITIAL_EXECUTION_ID, |l| l + 1);
                if execution_id != expected {
                    return Err(ProviderError::permanent(
                        "ack_orchestration_item",
                        format!("cannot create execution {instance}#{execution_id}"),
                    ));
                }
                0
            }
            None => {
                return Err(ProviderError::permanent(
                    "append",
                    format!("execution not found: {instance}#{execution_id}"),
                ));
            }
        };

        // A lone terminal event may always close the history
        let closing = matches!(events.as_slice(), [e] if e.kind.is_terminal());
        let cap = self.history_cap.unwrap_or(HISTORY_CAP);
        if !closing && have + events.len() > cap {
            return Err(ProviderError::permanent(
                "append",
                format!("history cap exceeded (cap={cap}, have={have}, append={})", events.len()),
            ));
        }

        let cur = self
            .histories
            .entry(instance.to_string())
            .or_default()
            .entry(execution_id)
            .or_default();
        let mut seen: HashSet<(u64, &'static str)> = cur.iter().filter_map(completion_key).collect();
        for e in events {
            match completion_key(&e) {
                Some(key) if !seen.insert(key) => {}
                _ => cur.push(e),
            }
        }
        Ok(())
    }
}

fn completion_key(e: &Event) -> Option<(u64, &'static str)> {
    let tag = match &e.kind {
        EventKind::ActivityCompleted { .. } | EventKind::ActivityFailed { .. } => "activity",
        EventKind::TimerFired { .. } => "timer",
        EventKind::SubOrchestrationStarted { .. } => "sub-started",
        EventKind::SubOrchestrationCompleted { .. } | EventKind::SubOrchestrationFailed { .. } => "sub-done",
        _ => return None,
    };
    e.source_event_id.map(|src| (src, tag))
}

/// In-memory provider for tests, samples and single-process use.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose executions hold at most `cap` events.
    pub fn with_history_cap(cap: usize) -> Self {
        let state = State {
            history_cap: Some(cap),
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Pretty-printed dump of every execution, for debugging.
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.state.lock().await;
        let mut out = String::new();
        for (inst, execs) in g.histories.iter() {
            for (exec, events) in execs {
                out.push_str(&format!("instance={inst} execution={exec}\n"));
                for e in events {
                    out.push_str(&format!("  {e:?}\n"));
                }
            }
        }
        out
    }

    /// Number of items visible in a queue (locked items excluded).
    pub async fn queue_len(&self, kind: QueueKind) -> usize {
        self.state.lock().await.queue(kind).len()
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.histories
            .get(instance)
            .and_then(|execs| execs.values().next_back().cloned())
            .unwrap_or_default())
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.histories
            .get(instance)
            .and_then(|execs| execs.get(&execution_id).cloned())
            .unwrap_or_default())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.histories.get(instance).and_then(|execs| execs.keys().next_back().copied()))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.histories
            .get(instance)
            .map(|execs| execs.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let g = self.state.lock().await;
        let mut out: Vec<String> = g.histories.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn create_execution(
        &self,
        instance: &str,
        execution_id: u64,
        events: Vec<Event>,
    ) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let execs = g.histories.entry(instance.to_string()).or_default();
        let expected = execs.keys().next_back().map_or(crate::INITIAL_EXECUTION_ID, |l| l + 1);
        if execution_id != expected {
            return Err(ProviderError::permanent(
                "create_execution",
                format!("execution {instance}#{execution_id} cannot be created, next id is {expected}"),
            ));
        }
        execs.insert(execution_id, events);
        Ok(())
    }

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<(), ProviderError> {
        self.state.lock().await.append(instance, execution_id, events, false)
    }

    async fn enqueue(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.state.lock().await.queue(kind).push_back(item);
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut g = self.state.lock().await;
        let Some(instance) = g
            .orchestrator_q
            .iter()
            .map(|w| w.instance().to_string())
            .find(|i| !g.is_locked(i))
        else {
            return Ok(None);
        };

        let (messages, rest): (Vec<WorkItem>, Vec<WorkItem>) =
            g.orchestrator_q.drain(..).partition(|w| w.instance() == instance);
        g.orchestrator_q = rest.into();

        let (execution_id, history) = g
            .histories
            .get(&instance)
            .and_then(|execs| execs.iter().next_back().map(|(id, h)| (*id, h.clone())))
            .unwrap_or((0, Vec::new()));

        let lock_token = g.token("o");
        g.locked_instances
            .insert(lock_token.clone(), (instance.clone(), messages.clone()));
        Ok(Some(OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(&self, lock_token: &str, commit: TurnCommit) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let (instance, _) = g
            .locked_instances
            .get(lock_token)
            .cloned()
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "invalid lock token"))?;

        if !commit.history_delta.is_empty() {
            g.append(&instance, commit.execution_id, commit.history_delta, true)?;
        }

        g.worker_q.extend(commit.worker_items);
        g.timer_q.extend(commit.timer_items);
        g.orchestrator_q.extend(commit.orchestrator_items);
        g.locked_instances.remove(lock_token);
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let (_, messages) = g
            .locked_instances
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "invalid lock token"))?;
        for m in messages.into_iter().rev() {
            g.orchestrator_q.push_front(m);
        }
        Ok(())
    }

    async fn fetch_work_item(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let Some(item) = g.queue(kind).pop_front() else {
            return Ok(None);
        };
        let token = g.token(match kind {
            QueueKind::Worker => "w",
            QueueKind::Timer => "t",
            QueueKind::Orchestrator => "q",
        });
        g.locked_work.insert(token.clone(), (kind, item.clone()));
        Ok(Some((item, token)))
    }

    async fn ack_work_item(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match g.locked_work.get(lock_token) {
            Some((k, _)) if *k == kind => {}
            _ => return Err(ProviderError::permanent("ack_work_item", "invalid lock token")),
        }
        g.locked_work.remove(lock_token);
        if let Some(item) = completion {
            g.orchestrator_q.push_back(item);
        }
        Ok(())
    }

    async fn abandon_work_item(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match g.locked_work.remove(lock_token) {
            Some((k, item)) if k == kind => {
                g.queue(kind).push_front(item);
                Ok(())
            }
            Some(entry) => {
                g.locked_work.insert(lock_token.to_string(), entry);
                Err(ProviderError::permanent("abandon_work_item", "lock token belongs to another queue"))
            }
            None => Err(ProviderError::permanent("abandon_work_item", "invalid lock token")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Event {
        Event::new(
            1,
            None,
            1,
            EventKind::OrchestrationStarted {
                name: "O".into(),
                version: "1.0.0".into(),
                input: "".into(),
                started_at_ms: 0,
                parent: None,
                run_timeout_ms: None,
            },
        )
    }

    fn signal(instance: &str, name: &str) -> WorkItem {
        WorkItem::SignalRaised {
            instance: instance.into(),
            execution_id: None,
            name: name.into(),
            payload: "".into(),
        }
    }

    #[tokio::test]
    async fn create_execution_enforces_sequence() {
        let p = InMemoryProvider::new();
        p.create_execution("i", 1, vec![started()]).await.unwrap();
        assert!(p.create_execution("i", 1, vec![started()]).await.is_err());
        assert!(p.create_execution("i", 3, vec![started()]).await.is_err());
        p.create_execution("i", 2, vec![started()]).await.unwrap();
        assert_eq!(p.list_executions("i").await.unwrap(), vec![1, 2]);
        assert_eq!(p.latest_execution_id("i").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn instance_lock_batches_messages_and_blocks_second_fetch() {
        let p = InMemoryProvider::new();
        p.enqueue(QueueKind::Orchestrator, signal("a", "x")).await.unwrap();
        p.enqueue(QueueKind::Orchestrator, signal("b", "y")).await.unwrap();
        p.enqueue(QueueKind::Orchestrator, signal("a", "z")).await.unwrap();

        let first = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(first.instance, "a");
        assert_eq!(first.messages.len(), 2);

        p.enqueue(QueueKind::Orchestrator, signal("a", "late")).await.unwrap();
        let second = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(second.instance, "b");
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());

        p.abandon_orchestration_item(&first.lock_token).await.unwrap();
        let again = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(again.instance, "a");
        assert_eq!(again.messages.len(), 3);
    }

    #[tokio::test]
    async fn ack_appends_and_enqueues_atomically() {
        let p = InMemoryProvider::new();
        p.enqueue(QueueKind::Orchestrator, signal("i", "s")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let commit = TurnCommit {
            execution_id: 1,
            history_delta: vec![started()],
            worker_items: vec![WorkItem::ActivityExecute {
                instance: "i".into(),
                execution_id: 1,
                id: 2,
                name: "A".into(),
                input: "".into(),
                options: Default::default(),
            }],
            ..Default::default()
        };
        p.ack_orchestration_item(&item.lock_token, commit).await.unwrap();
        assert_eq!(p.read("i").await.unwrap().len(), 1);
        assert_eq!(p.queue_len(QueueKind::Worker).await, 1);
        assert!(p.ack_orchestration_item(&item.lock_token, TurnCommit::default()).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_completions_are_dropped() {
        let p = InMemoryProvider::new();
        p.create_execution("i", 1, vec![started()]).await.unwrap();
        let done = |id| {
            Event::new(
                id,
                Some(2),
                1,
                EventKind::ActivityCompleted {
                    result: "r".into(),
                    attempts: 1,
                },
            )
        };
        p.append("i", 1, vec![done(3)]).await.unwrap();
        p.append("i", 1, vec![done(4)]).await.unwrap();
        assert_eq!(p.read("i").await.unwrap().len(), 2);
    }

    fn timer(id: u64) -> Event {
        Event::new(id, None, 1, EventKind::TimerCreated { fire_at_ms: 0 })
    }

    #[tokio::test]
    async fn history_cap_rejects_appends_but_a_terminal_event_still_closes() {
        let p = InMemoryProvider::with_history_cap(2);
        p.create_execution("i", 1, vec![started()]).await.unwrap();
        p.append("i", 1, vec![timer(2)]).await.unwrap();

        let err = p.append("i", 1, vec![timer(3)]).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(p.read("i").await.unwrap().len(), 2);

        p.append("i", 1, vec![Event::new(3, None, 1, EventKind::OrchestrationTimedOut)])
            .await
            .unwrap();
        assert_eq!(p.read("i").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejected_ack_leaves_no_partial_state_and_keeps_the_lock() {
        let p = InMemoryProvider::with_history_cap(1);
        p.enqueue(QueueKind::Orchestrator, signal("i", "s")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let commit = TurnCommit {
            execution_id: 1,
            history_delta: vec![started(), timer(2)],
            worker_items: vec![signal("i", "w")],
            ..Default::default()
        };
        assert!(p.ack_orchestration_item(&item.lock_token, commit).await.is_err());
        assert!(p.list_executions("i").await.unwrap().is_empty());
        assert_eq!(p.queue_len(QueueKind::Worker).await, 0);

        // The same lock can still commit a smaller delta
        let commit = TurnCommit {
            execution_id: 1,
            history_delta: vec![started()],
            ..Default::default()
        };
        p.ack_orchestration_item(&item.lock_token, commit).await.unwrap();
        assert_eq!(p.list_executions("i").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn work_item_ack_moves_completion_to_orchestrator_queue() {
        let p = InMemoryProvider::new();
        p.enqueue(QueueKind::Worker, signal("i", "w")).await.unwrap();
        let (_, token) = p.fetch_work_item(QueueKind::Worker).await.unwrap().unwrap();
        assert!(p.ack_work_item(QueueKind::Timer, &token, None).await.is_err());
        p.ack_work_item(QueueKind::Worker, &token, Some(signal("i", "done")))
            .await
            .unwrap();
        assert_eq!(p.queue_len(QueueKind::Orchestrator).await, 1);
    }
}
