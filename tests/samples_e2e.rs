#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use duroflow::samples::greetings::{
    ERROR_HANDLING, ERROR_PRONE_ACTIVITY, GREETING, LONG_RUNNING, PARALLEL, SEQUENTIAL, SIGNAL_CHANNEL,
    SIGNAL_COLLECTOR, SignalData,
};
use duroflow::samples::{activities, orchestrations};
use duroflow::{EventKind, OrchestrationStatus, decode_payload, encode_payload};
use std::time::Duration;
mod common;

#[tokio::test]
async fn greeting_calls_one_step() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client.start_orchestration("greet-1", GREETING, "World").await.unwrap();
    assert_eq!(common::wait_completed(&h.client, "greet-1").await, "Hello, World!");
    h.rt.shutdown().await;
}

#[tokio::test]
async fn sequential_and_parallel_produce_the_same_pair() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client.start_orchestration("seq-1", SEQUENTIAL, "Ada").await.unwrap();
    h.client.start_orchestration("par-1", PARALLEL, "Ada").await.unwrap();

    let expected = vec!["Hello, Ada!".to_string(), "Goodbye, Ada!".to_string()];
    for instance in ["seq-1", "par-1"] {
        let output: Vec<String> = decode_payload(&common::wait_completed(&h.client, instance).await).unwrap();
        assert_eq!(output, expected, "{instance}");
    }

    // Parallel schedules both steps in the same turn
    let history = h.client.read_execution_history("par-1", 1).await.unwrap();
    let scheduled: Vec<u64> = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ActivityScheduled { .. }))
        .map(|e| e.event_id)
        .collect();
    assert_eq!(scheduled, vec![2, 3]);
    h.rt.shutdown().await;
}

#[tokio::test]
async fn error_handling_reports_success_and_exhausted_failure() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client
        .start_orchestration("err-ok", ERROR_HANDLING, encode_payload(&false).unwrap())
        .await
        .unwrap();
    h.client
        .start_orchestration("err-fail", ERROR_HANDLING, encode_payload(&true).unwrap())
        .await
        .unwrap();

    assert_eq!(
        common::wait_completed(&h.client, "err-ok").await,
        "Activity completed successfully"
    );
    match h
        .client
        .wait_for_orchestration("err-fail", Duration::from_secs(10))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => {
            assert_eq!(details.display_message(), "activity failed as requested")
        }
        other => panic!("unexpected status {other:?}"),
    }
    let history = h.client.read_execution_history("err-fail", 1).await.unwrap();
    assert_eq!(common::count_scheduled(&history, ERROR_PRONE_ACTIVITY), 1);
    assert!(
        history
            .iter()
            .any(|e| matches!(e.kind, EventKind::ActivityFailed { attempts: 3, .. }))
    );
    h.rt.shutdown().await;
}

#[tokio::test]
async fn long_running_step_heartbeats_to_completion() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client.start_orchestration("long-1", LONG_RUNNING, "300").await.unwrap();
    assert_eq!(
        common::wait_completed(&h.client, "long-1").await,
        "Completed long-running activity after 300ms"
    );
    h.rt.shutdown().await;
}

#[tokio::test]
async fn signal_collector_gathers_until_its_window_closes() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client
        .start_orchestration("collector-1", SIGNAL_COLLECTOR, "1500")
        .await
        .unwrap();
    assert!(common::wait_until_waiting(h.store.clone(), "collector-1").await);

    for (message, sent_at) in [("first", "t1"), ("second", "t2")] {
        let data = SignalData {
            message: message.into(),
            sent_at: sent_at.into(),
        };
        h.client
            .raise_signal("collector-1", None, SIGNAL_CHANNEL, encode_payload(&data).unwrap())
            .await
            .unwrap();
    }
    h.client
        .raise_signal("collector-1", None, SIGNAL_CHANNEL, "not json")
        .await
        .unwrap();

    assert!(
        common::wait_for_history(
            h.store.clone(),
            "collector-1",
            |hist| hist
                .iter()
                .filter(|e| matches!(e.kind, EventKind::SignalReceived { .. }))
                .count()
                == 3,
            5_000
        )
        .await
    );
    let seen: Vec<SignalData> =
        decode_payload(&h.client.query("collector-1", None, "get_signals").await.unwrap()).unwrap();
    assert_eq!(seen.len(), 2);

    let output: Vec<String> = decode_payload(&common::wait_completed(&h.client, "collector-1").await).unwrap();
    assert_eq!(
        output,
        vec![
            "Signal received at t1: first".to_string(),
            "Signal received at t2: second".to_string()
        ]
    );
    h.rt.shutdown().await;
}
