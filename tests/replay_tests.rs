#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use duroflow::{Action, DurableOutput, Event, EventKind, Executor, OrchestrationContext, TurnResult, run_turn};
use std::time::Duration;
mod common;

use common::{complete_activity, fire_timer, push, raise, started};

async fn order_flow(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let reserved = ctx.schedule_activity("Reserve", input).into_activity().await?;
    ctx.sleep(Duration::from_secs(5)).await;
    let approval = ctx.schedule_signal("approve").into_signal().await?;
    let outputs = ctx
        .join(vec![
            ctx.schedule_activity("Ship", reserved.clone()),
            ctx.schedule_activity("Bill", reserved.clone()),
        ])
        .await;
    let guid = ctx.new_guid();
    Ok(format!("{reserved}|{approval}|{}|{guid}|t={}", outputs.len(), ctx.now_ms()))
}

/// Completes every action immediately; the approval signal arrives with the timer.
fn host(actions: Vec<Action>, history: &mut Vec<Event>) {
    for action in actions {
        match action {
            Action::CallActivity {
                scheduling_event_id,
                name,
                input,
                ..
            } => complete_activity(history, scheduling_event_id, &format!("{name}:{input}")),
            Action::CreateTimer {
                scheduling_event_id, ..
            } => {
                fire_timer(history, scheduling_event_id);
                raise(history, "approve", "yes");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}

#[test]
fn replaying_a_finished_history_rederives_the_same_result() {
    let (history, result) =
        Executor::drive_to_completion("order-1", vec![started("Order", "42")], order_flow, host);
    let TurnResult::Completed(output) = &result else {
        panic!("unexpected result {result:?}");
    };
    assert!(output.starts_with("Reserve:42|yes|2|order-1-1-"), "{output}");
    assert!(output.ends_with(&format!("t={}", common::STARTED_AT_MS + 5_000)), "{output}");

    for _ in 0..3 {
        let replay = run_turn("order-1", history.clone(), order_flow);
        assert_eq!(replay.result, result);
        assert!(replay.actions.is_empty(), "replay must not issue new work");
        assert_eq!(replay.history, history);
    }
}

#[test]
fn each_decision_is_recorded_once() {
    let (history, _) = Executor::drive_to_completion("order-2", vec![started("Order", "7")], order_flow, host);
    for name in ["Reserve", "Ship", "Bill"] {
        assert_eq!(common::count_scheduled(&history, name), 1, "{name}");
    }
    let timers = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TimerCreated { .. }))
        .count();
    assert_eq!(timers, 1);
}

#[test]
fn changed_code_is_reported_as_nondeterminism() {
    let mut history = vec![started("Order", "1")];
    push(
        &mut history,
        None,
        EventKind::ActivityScheduled {
            name: "Reserve".into(),
            input: "1".into(),
            options: Default::default(),
        },
    );
    let outcome = run_turn("nd-1", history, |ctx, input| async move {
        ctx.schedule_activity("Charge", input).into_activity().await
    });
    match outcome.result {
        TurnResult::Failed(details) => assert!(details.is_nondeterminism(), "{details:?}"),
        other => panic!("expected nondeterminism, got {other:?}"),
    }
}

#[test]
fn recorded_decision_the_code_no_longer_makes_is_nondeterminism() {
    let mut history = vec![started("Order", "1")];
    push(&mut history, None, EventKind::TimerCreated { fire_at_ms: 2_000 });
    let outcome = run_turn("nd-2", history, |_ctx, input| async move { Ok(input) });
    match outcome.result {
        TurnResult::Failed(details) => assert!(details.is_nondeterminism()),
        other => panic!("expected nondeterminism, got {other:?}"),
    }
}

/// Timer and signal are both ready by the time the select is created.
fn both_ready_history() -> Vec<Event> {
    let mut history = vec![started("Sel", "")];
    let gate = push(
        &mut history,
        None,
        EventKind::ActivityScheduled {
            name: "Gate".into(),
            input: "".into(),
            options: Default::default(),
        },
    );
    let timer = push(&mut history, None, EventKind::TimerCreated { fire_at_ms: 2_000 });
    fire_timer(&mut history, timer);
    raise(&mut history, "b", "payload-b");
    complete_activity(&mut history, gate, "open");
    history
}

#[test]
fn select_resolves_simultaneously_ready_branches_in_registration_order() {
    for _ in 0..3 {
        let outcome = run_turn("sel-1", both_ready_history(), |ctx, _| async move {
            let gate = ctx.schedule_activity("Gate", "");
            let mut timer = ctx.schedule_timer(Duration::from_secs(1));
            let mut signal = ctx.schedule_signal("b");
            gate.into_activity().await?;
            let (first, _) = ctx.select(vec![&mut timer, &mut signal]).await;
            let (second, out) = ctx.select(vec![&mut signal]).await;
            assert_eq!(out, DurableOutput::Signal("payload-b".into()));
            Ok(format!("{first},{second}"))
        });
        assert_eq!(outcome.result, TurnResult::Completed("0,0".into()));
    }

    let outcome = run_turn("sel-2", both_ready_history(), |ctx, _| async move {
        let gate = ctx.schedule_activity("Gate", "");
        let timer = ctx.schedule_timer(Duration::from_secs(1));
        gate.into_activity().await?;
        let signal = ctx.schedule_signal("b");
        let (idx, _) = ctx.select(vec![signal, timer]).await;
        Ok(idx.to_string())
    });
    assert_eq!(outcome.result, TurnResult::Completed("0".into()));
}

#[test]
fn panics_fail_the_run() {
    let outcome = run_turn("panic-1", vec![started("P", "")], |_ctx, _| async move {
        if true {
            panic!("boom");
        }
        Ok(String::new())
    });
    match outcome.result {
        TurnResult::Failed(details) => assert!(details.display_message().contains("boom")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn cancellation_is_observable_through_select() {
    let mut history = vec![started("C", "")];
    push(&mut history, None, EventKind::TimerCreated { fire_at_ms: 61_000 });
    push(
        &mut history,
        None,
        EventKind::OrchestrationCancelRequested {
            reason: "user".into(),
        },
    );
    let outcome = run_turn("cancel-1", history.clone(), |ctx, _| async move {
        let timer = ctx.schedule_timer(Duration::from_secs(60));
        let (idx, _) = ctx.select2(timer, ctx.schedule_cancellation()).await;
        Ok(format!("winner={idx}"))
    });
    assert_eq!(outcome.result, TurnResult::Cancelled("user".into()));

    // Code that never looks at cancellation still ends cancelled
    let outcome = run_turn("cancel-2", history, |ctx, _| async move {
        ctx.sleep(Duration::from_secs(60)).await;
        Ok("slept".to_string())
    });
    assert_eq!(outcome.result, TurnResult::Cancelled("user".into()));
}

#[test]
fn waiting_turn_returns_new_actions_only() {
    let outcome = run_turn("wait-1", vec![started("Order", "5")], order_flow);
    assert_eq!(outcome.result, TurnResult::Continue);
    assert_eq!(common::activity_names(&outcome.actions), vec!["Reserve"]);

    let mut history = outcome.history;
    complete_activity(&mut history, 2, "r");
    let outcome = run_turn("wait-1", history, order_flow);
    assert_eq!(outcome.result, TurnResult::Continue);
    assert!(matches!(
        outcome.actions.as_slice(),
        [Action::CreateTimer { fire_at_ms, delay_ms: 5_000, .. }] if *fire_at_ms == common::STARTED_AT_MS + 5_000
    ));
}
