#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use duroflow::providers::Provider;
use duroflow::providers::in_memory::InMemoryProvider;
use duroflow::runtime::registry::VersionPolicy;
use duroflow::samples::greetings::{CONTINUE_AS_NEW_COUNTER, CounterProgress};
use duroflow::samples::interactive::{COUNTER, FINISH_SIGNAL};
use duroflow::samples::{activities, orchestrations};
use duroflow::{
    ActivityRegistry, Client, ClientError, Event, EventKind, IdReusePolicy, OrchestrationContext, OrchestrationRegistry,
    OrchestrationStatus, StartOptions,
};
use semver::Version;
use std::sync::Arc;
use std::time::Duration;
mod common;

fn versioned() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_versioned("Pinned", "1.0.0", |_ctx: OrchestrationContext, _input: String| async move {
            Ok("v1".to_string())
        })
        .register_versioned("Pinned", "2.0.0", |_ctx: OrchestrationContext, _input: String| async move {
            Ok("v2".to_string())
        })
        .register_versioned("Upgrader", "1.0.0", |ctx: OrchestrationContext, input: String| async move {
            ctx.continue_as_new_versioned("2.0.0", format!("{input}+1")).await
        })
        .register_versioned("Upgrader", "2.0.0", |ctx: OrchestrationContext, input: String| async move {
            Ok(format!("{input} on {}", ctx.orchestration_version()))
        })
        .build()
}

fn pinned_version(history: &[Event]) -> String {
    match &history[0].kind {
        EventKind::OrchestrationStarted { version, .. } => version.clone(),
        other => panic!("unexpected first event {other:?}"),
    }
}

#[tokio::test]
async fn unknown_instances_are_not_found() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    assert_eq!(
        h.client.get_orchestration_status("ghost").await.unwrap(),
        OrchestrationStatus::NotFound
    );
    assert!(matches!(
        h.client.query("ghost", None, "get_counter").await,
        Err(ClientError::NotFound { .. })
    ));
    assert!(matches!(
        h.client
            .update("ghost", None, "increment", "1", Duration::from_secs(1))
            .await,
        Err(ClientError::NotFound { .. })
    ));
    assert!(matches!(
        h.client.cancel_orchestration("ghost", None, "x").await,
        Err(ClientError::NotFound { .. })
    ));
    h.rt.shutdown().await;
}

#[tokio::test]
async fn stale_run_ids_are_rejected_after_continue_as_new() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client
        .start_orchestration_typed("can-client", CONTINUE_AS_NEW_COUNTER, CounterProgress { count: 0, max_count: 1 })
        .await
        .unwrap();
    common::wait_completed(&h.client, "can-client").await;

    // Run 2 finished; run 1 is neither current nor live
    let err = h.client.raise_signal("can-client", Some(1), "s", "").await.unwrap_err();
    assert_eq!(err, ClientError::RunMismatch { requested: 1, current: 2 });
    let err = h.client.raise_signal("can-client", Some(2), "s", "").await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyTerminal { execution_id: 2, .. }), "{err:?}");
    h.rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_starts_follow_the_id_reuse_policy() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    assert_eq!(h.client.start_orchestration("dup-1", COUNTER, "0").await.unwrap(), 1);
    assert_eq!(h.client.start_orchestration("dup-1", COUNTER, "5").await.unwrap(), 1);
    let err = h
        .client
        .start_orchestration_with(
            "dup-1",
            COUNTER,
            "5",
            StartOptions::new().with_id_reuse(IdReusePolicy::RejectDuplicate),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::AlreadyRunning { execution_id: 1 });

    assert!(common::wait_until_waiting(h.store.clone(), "dup-1").await);
    h.client.raise_signal("dup-1", None, FINISH_SIGNAL, "").await.unwrap();
    assert_eq!(common::wait_completed(&h.client, "dup-1").await, "0");

    // A finished instance id starts over as a new run
    assert_eq!(h.client.start_orchestration("dup-1", COUNTER, "7").await.unwrap(), 2);
    assert!(
        common::wait_for_history(
            h.store.clone(),
            "dup-1",
            |hist| hist.first().is_some_and(|e| e.execution_id == 2)
                && hist.iter().any(|e| matches!(e.kind, EventKind::TimerCreated { .. })),
            5_000
        )
        .await
    );
    assert_eq!(h.client.query("dup-1", None, "get_counter").await.unwrap(), "7");
    h.rt.shutdown().await;
}

#[tokio::test]
async fn update_times_out_when_nothing_applies_it() {
    // A client with a registry but no runtime behind the store
    let store = Arc::new(InMemoryProvider::new());
    let client = Client::new(store).with_orchestrations(orchestrations());
    client.start_orchestration("idle-1", COUNTER, "1").await.unwrap();

    let err = client
        .update("idle-1", None, "increment", "1", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Timeout);
}

#[tokio::test]
async fn queries_read_the_next_run_after_continue_as_new() {
    // Run 1 has ended and run 2 is not there yet
    let store = Arc::new(InMemoryProvider::new());
    let client = Client::new(store.clone()).with_orchestrations(orchestrations());
    let first = vec![
        common::started(COUNTER, "1"),
        Event::new(2, None, 1, EventKind::OrchestrationContinuedAsNew { input: "9".into() }),
    ];
    store.create_execution("gap-1", 1, first).await.unwrap();

    let successor = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut start = common::started(COUNTER, "9");
            start.execution_id = 2;
            store.create_execution("gap-1", 2, vec![start]).await.unwrap();
        })
    };
    assert_eq!(client.query("gap-1", None, "get_counter").await.unwrap(), "9");
    successor.await.unwrap();
}

#[tokio::test]
async fn new_runs_pin_a_version_and_replay_keeps_it() {
    let registry = versioned();
    registry.set_version_policy("Pinned", VersionPolicy::Exact(Version::new(1, 0, 0)));
    let h = common::start_runtime(registry, ActivityRegistry::builder().build()).await;

    h.client.start_orchestration("pin-1", "Pinned", "").await.unwrap();
    assert_eq!(common::wait_completed(&h.client, "pin-1").await, "v1");
    let history = h.client.read_execution_history("pin-1", 1).await.unwrap();
    assert_eq!(pinned_version(&history), "1.0.0");

    h.client
        .start_orchestration_with("pin-2", "Pinned", "", StartOptions::new().with_version("2.0.0"))
        .await
        .unwrap();
    assert_eq!(common::wait_completed(&h.client, "pin-2").await, "v2");
    h.rt.shutdown().await;
}

#[tokio::test]
async fn latest_version_is_the_default() {
    let h = common::start_runtime(versioned(), ActivityRegistry::builder().build()).await;
    h.client.start_orchestration("pin-3", "Pinned", "").await.unwrap();
    assert_eq!(common::wait_completed(&h.client, "pin-3").await, "v2");
    h.rt.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_can_move_to_another_version() {
    let h = common::start_runtime(versioned(), ActivityRegistry::builder().build()).await;
    h.client
        .start_orchestration_with("upgrade-1", "Upgrader", "x", StartOptions::new().with_version("1.0.0"))
        .await
        .unwrap();
    assert_eq!(common::wait_completed(&h.client, "upgrade-1").await, "x+1 on 2.0.0");

    let first = h.client.read_execution_history("upgrade-1", 1).await.unwrap();
    let second = h.client.read_execution_history("upgrade-1", 2).await.unwrap();
    assert_eq!(pinned_version(&first), "1.0.0");
    assert_eq!(pinned_version(&second), "2.0.0");
    h.rt.shutdown().await;
}

#[tokio::test]
async fn instances_are_listed() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    for id in ["list-a", "list-b"] {
        h.client.start_orchestration(id, COUNTER, "0").await.unwrap();
    }
    let mut listed = h.client.list_instances().await.unwrap();
    listed.sort();
    assert_eq!(listed, vec!["list-a".to_string(), "list-b".to_string()]);
    h.rt.shutdown().await;
}
