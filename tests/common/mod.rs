#![allow(dead_code)]

use duroflow::providers::Provider;
use duroflow::providers::in_memory::InMemoryProvider;
use duroflow::runtime::registry::ActivityRegistry;
use duroflow::{
    Action, Client, Event, EventKind, OrchestrationRegistry, OrchestrationStatus, Runtime, RuntimeOptions,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const STARTED_AT_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Hand-built histories for turn-level tests
// ----------------------------------------------------------------------------

pub fn started(name: &str, input: &str) -> Event {
    Event::new(
        1,
        None,
        1,
        EventKind::OrchestrationStarted {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            input: input.to_string(),
            started_at_ms: STARTED_AT_MS,
            parent: None,
            run_timeout_ms: None,
        },
    )
}

pub fn next_id(history: &[Event]) -> u64 {
    history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1
}

pub fn push(history: &mut Vec<Event>, source: Option<u64>, kind: EventKind) -> u64 {
    let id = next_id(history);
    let execution_id = history.first().map_or(1, |e| e.execution_id);
    history.push(Event::new(id, source, execution_id, kind));
    id
}

pub fn complete_activity(history: &mut Vec<Event>, scheduling_id: u64, result: &str) {
    push(
        history,
        Some(scheduling_id),
        EventKind::ActivityCompleted {
            result: result.to_string(),
            attempts: 1,
        },
    );
}

pub fn fire_timer(history: &mut Vec<Event>, scheduling_id: u64) {
    let fire_at_ms = history
        .iter()
        .find_map(|e| match e.kind {
            EventKind::TimerCreated { fire_at_ms } if e.event_id == scheduling_id => Some(fire_at_ms),
            _ => None,
        })
        .expect("timer was scheduled");
    push(history, Some(scheduling_id), EventKind::TimerFired { fire_at_ms });
}

pub fn raise(history: &mut Vec<Event>, name: &str, payload: &str) {
    push(
        history,
        None,
        EventKind::SignalReceived {
            name: name.to_string(),
            payload: payload.to_string(),
        },
    );
}

/// Name of the activity each action calls, in action order.
pub fn activity_names(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::CallActivity { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

pub fn count_scheduled(history: &[Event], activity: &str) -> usize {
    history
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == activity))
        .count()
}

// ----------------------------------------------------------------------------
// Runtime harness
// ----------------------------------------------------------------------------

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 2,
        heartbeat_check_interval_ms: 10,
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryProvider>,
    pub rt: Arc<Runtime>,
    pub client: Client,
}

pub async fn start_runtime(orchestrations: OrchestrationRegistry, activities: ActivityRegistry) -> Harness {
    start_runtime_with(orchestrations, activities, fast_options()).await
}

pub async fn start_runtime_with(
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    options: RuntimeOptions,
) -> Harness {
    let store = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), orchestrations, options).await;
    let client = rt.client();
    Harness { store, rt, client }
}

pub async fn wait_for_history<F>(store: Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the latest execution records a `TimerCreated`, i.e. the
/// orchestration reached its first wait.
pub async fn wait_until_waiting(store: Arc<dyn Provider>, instance: &str) -> bool {
    wait_for_history(
        store,
        instance,
        |h| h.iter().any(|e| matches!(e.kind, EventKind::TimerCreated { .. })),
        5_000,
    )
    .await
}

pub async fn wait_completed(client: &Client, instance: &str) -> String {
    match client
        .wait_for_orchestration(instance, Duration::from_secs(10))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => output,
        OrchestrationStatus::Failed { details } => {
            panic!("{instance} failed: {}", details.display_message())
        }
        other => panic!("{instance} ended with unexpected status {other:?}"),
    }
}

/// Handler of a registered sample, for driving it turn by turn.
pub fn sample_handler(name: &str) -> Arc<dyn duroflow::runtime::OrchestrationHandler> {
    duroflow::samples::orchestrations()
        .resolve(name, None)
        .map(|(_, h)| h)
        .expect("sample is registered")
}
