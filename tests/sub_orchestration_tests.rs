#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use duroflow::samples::greetings::{ChildParams, PARENT};
use duroflow::samples::interactive::COUNTER;
use duroflow::samples::{activities, orchestrations};
use duroflow::{
    ActivityRegistry, AppErrorKind, EventKind, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
    ParentClosePolicy, RetryPolicy, StartOptions, SubOrchestrationOptions,
};
use std::time::Duration;
mod common;

fn family() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Guardian", |ctx: OrchestrationContext, input: String| async move {
            let child = ctx.schedule_sub_orchestration("Failer", input);
            match child.result().await {
                Ok(r) => Ok(format!("child ok: {r}")),
                Err(e) => Ok(format!("handled: {e}")),
            }
        })
        .register("Failer", |_ctx: OrchestrationContext, input: String| async move {
            Err(format!("bad input '{input}'"))
        })
        .register("Retrier", |ctx: OrchestrationContext, _input: String| async move {
            let options = SubOrchestrationOptions::new().with_retry(
                RetryPolicy::new(3)
                    .with_initial_interval(Duration::from_millis(10))
                    .with_maximum_interval(Duration::from_millis(20)),
            );
            ctx.schedule_sub_orchestration_with_options("SecondTimeLucky", "", options)
                .result()
                .await
        })
        .register("SecondTimeLucky", |ctx: OrchestrationContext, _input: String| async move {
            if ctx.execution_id() == 1 {
                Err("first run fails".to_string())
            } else {
                Ok(format!("recovered on run {}", ctx.execution_id()))
            }
        })
        .register("Owner", |ctx: OrchestrationContext, _input: String| async move {
            let options = SubOrchestrationOptions::new()
                .with_instance("owned-child")
                .with_parent_close_policy(ParentClosePolicy::Cancel);
            let child = ctx.schedule_sub_orchestration_with_options("Sleeper", "", options);
            child.started.into_started().await?;
            Ok("owner done".to_string())
        })
        .register("Sleeper", |ctx: OrchestrationContext, _input: String| async move {
            ctx.sleep(Duration::from_secs(3600)).await;
            Ok("woke".to_string())
        })
        .build()
}

#[tokio::test]
async fn parent_receives_the_child_result() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client
        .start_orchestration_typed(
            "parent-1",
            PARENT,
            ChildParams {
                name: "Ada".into(),
                duration_ms: 50,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        common::wait_completed(&h.client, "parent-1").await,
        "Parent completed for Ada. Child result: Hello, Ada from child orchestration! (took 50ms)"
    );

    // The child ran under its own instance and points back at the parent
    let child = h.client.read_execution_history("parent-1-child", 1).await.unwrap();
    match &child[0].kind {
        EventKind::OrchestrationStarted { parent: Some(link), .. } => {
            assert_eq!(link.instance, "parent-1");
            assert_eq!(link.attempt, 1);
        }
        other => panic!("unexpected first event {other:?}"),
    }
    h.rt.shutdown().await;
}

#[tokio::test]
async fn failed_child_surfaces_as_an_error_the_parent_can_handle() {
    let h = common::start_runtime(family(), ActivityRegistry::builder().build()).await;
    h.client.start_orchestration("guardian-1", "Guardian", "x").await.unwrap();
    assert_eq!(
        common::wait_completed(&h.client, "guardian-1").await,
        "handled: child failed: bad input 'x'"
    );

    let history = h.client.read_execution_history("guardian-1", 1).await.unwrap();
    let child_instance = history
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::SubOrchestrationScheduled { instance, .. } => Some(instance.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(child_instance, "guardian-1::sub::2");
    assert!(matches!(
        h.client.get_orchestration_status(&child_instance).await.unwrap(),
        OrchestrationStatus::Failed { .. }
    ));
    h.rt.shutdown().await;
}

#[tokio::test]
async fn child_retry_policy_restarts_failed_runs() {
    let h = common::start_runtime(family(), ActivityRegistry::builder().build()).await;
    h.client.start_orchestration("retrier-1", "Retrier", "").await.unwrap();
    assert_eq!(common::wait_completed(&h.client, "retrier-1").await, "recovered on run 2");
    assert_eq!(
        h.client.list_executions("retrier-1::sub::2").await.unwrap(),
        vec![1, 2]
    );
    h.rt.shutdown().await;
}

#[tokio::test]
async fn cancel_close_policy_stops_running_children() {
    let h = common::start_runtime(family(), ActivityRegistry::builder().build()).await;
    h.client.start_orchestration("owner-1", "Owner", "").await.unwrap();
    assert_eq!(common::wait_completed(&h.client, "owner-1").await, "owner done");

    let status = h
        .client
        .wait_for_orchestration("owned-child", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(
        matches!(status, OrchestrationStatus::Cancelled { ref reason } if reason.contains("owner-1")),
        "{status:?}"
    );
    h.rt.shutdown().await;
}

#[tokio::test]
async fn run_timeout_ends_a_waiting_instance() {
    let h = common::start_runtime(orchestrations(), activities()).await;
    h.client
        .start_orchestration_with(
            "timeout-1",
            COUNTER,
            "1",
            StartOptions::new().with_run_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    let status = h
        .client
        .wait_for_orchestration("timeout-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::TimedOut);
    h.rt.shutdown().await;
}

#[tokio::test]
async fn timed_out_child_fails_its_parent_step() {
    let registry = OrchestrationRegistry::builder()
        .register("Impatient", |ctx: OrchestrationContext, _input: String| async move {
            let options = SubOrchestrationOptions::new().with_run_timeout(Duration::from_millis(100));
            match ctx
                .schedule_sub_orchestration_with_options("Sleeper", "", options)
                .result()
                .await
            {
                Ok(r) => Ok(r),
                Err(e) => Ok(e),
            }
        })
        .register("Sleeper", |ctx: OrchestrationContext, _input: String| async move {
            ctx.sleep(Duration::from_secs(3600)).await;
            Ok("woke".to_string())
        })
        .build();
    let h = common::start_runtime(registry, ActivityRegistry::builder().build()).await;
    h.client.start_orchestration("impatient-1", "Impatient", "").await.unwrap();
    let output = common::wait_completed(&h.client, "impatient-1").await;
    assert_eq!(output, "child failed: timed out: run timeout exceeded");

    let history = h.client.read_execution_history("impatient-1", 1).await.unwrap();
    let failure = history
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::SubOrchestrationFailed { details } => Some(details.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(failure.app_kind(), Some(AppErrorKind::ChildProcessFailed));
    h.rt.shutdown().await;
}
