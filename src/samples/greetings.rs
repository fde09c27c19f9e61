//! Basic samples: single and multiple steps, heartbeats, retries, child
//! orchestrations, signals and continue-as-new.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use crate::{
    ActivityContext, ActivityOptions, DurableOutput, OrchestrationContext, ProcessHandlers, RetryPolicy,
    SubOrchestrationOptions, decode_payload, durable_info, durable_warn, encode_payload,
};

pub const GREETING: &str = "Greeting";
pub const SEQUENTIAL: &str = "Sequential";
pub const PARALLEL: &str = "Parallel";
pub const LONG_RUNNING: &str = "LongRunning";
pub const ERROR_HANDLING: &str = "ErrorHandling";
pub const PARENT: &str = "Parent";
pub const CHILD: &str = "Child";
pub const SIGNAL_COLLECTOR: &str = "SignalCollector";
pub const CONTINUE_AS_NEW_COUNTER: &str = "ContinueAsNewCounter";

pub const GREETING_ACTIVITY: &str = "GreetingActivity";
pub const FAREWELL_ACTIVITY: &str = "FarewellActivity";
pub const LONG_RUNNING_ACTIVITY: &str = "LongRunningActivity";
pub const ERROR_PRONE_ACTIVITY: &str = "ErrorProneActivity";

/// Channel name the signal collector listens on.
pub const SIGNAL_CHANNEL: &str = "signal-channel";

fn default_retry() -> RetryPolicy {
    RetryPolicy::new(3)
        .with_initial_interval(Duration::from_secs(1))
        .with_backoff_coefficient(2.0)
        .with_maximum_interval(Duration::from_secs(60))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildParams {
    pub name: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResult {
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    pub message: String,
    pub sent_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterProgress {
    pub count: u32,
    pub max_count: u32,
}

async fn greeting(ctx: OrchestrationContext, name: String) -> Result<String, String> {
    durable_info!(ctx, name = %name, "greeting started");
    let result = ctx.schedule_activity(GREETING_ACTIVITY, name).into_activity().await?;
    durable_info!(ctx, result = %result, "greeting completed");
    Ok(result)
}

async fn sequential(ctx: OrchestrationContext, name: String) -> Result<String, String> {
    let options = ActivityOptions::new()
        .with_start_to_close_timeout(Duration::from_secs(10))
        .with_retry(default_retry());
    let hello = ctx
        .call_activity(GREETING_ACTIVITY, name.clone(), options.clone())
        .await?;
    let bye = ctx.call_activity(FAREWELL_ACTIVITY, name, options).await?;
    encode_payload(&vec![hello, bye])
}

async fn parallel(ctx: OrchestrationContext, name: String) -> Result<String, String> {
    let options = ActivityOptions::new().with_start_to_close_timeout(Duration::from_secs(10));
    let outputs = ctx
        .join(vec![
            ctx.schedule_activity_with_options(GREETING_ACTIVITY, name.clone(), options.clone()),
            ctx.schedule_activity_with_options(FAREWELL_ACTIVITY, name, options),
        ])
        .await;
    let mut results = Vec::with_capacity(outputs.len());
    for out in outputs {
        match out {
            DurableOutput::Activity(r) => results.push(r?),
            other => return Err(format!("unexpected output {other:?}")),
        }
    }
    encode_payload(&results)
}

async fn long_running(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let duration_ms: u64 = decode_payload(&input)?;
    let options = ActivityOptions::new()
        .with_start_to_close_timeout(Duration::from_millis(duration_ms) + Duration::from_secs(5))
        .with_heartbeat_timeout(Duration::from_secs(5));
    ctx.call_activity(LONG_RUNNING_ACTIVITY, input, options).await
}

async fn error_handling(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let options = ActivityOptions::new()
        .with_start_to_close_timeout(Duration::from_secs(10))
        .with_retry(default_retry().with_initial_interval(Duration::from_millis(100)));
    match ctx.call_activity(ERROR_PRONE_ACTIVITY, input, options).await {
        Ok(r) => Ok(r),
        Err(e) => {
            durable_warn!(ctx, error = %e, "error-prone activity failed");
            Err(e)
        }
    }
}

async fn parent(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let params: ChildParams = decode_payload(&input)?;
    let options = SubOrchestrationOptions::new()
        .with_instance(format!("{}-child", ctx.instance_id()))
        .with_run_timeout(Duration::from_secs(60))
        .with_retry(default_retry());
    let child = ctx.schedule_sub_orchestration_with_options(CHILD, input, options);
    let raw = child.result().await?;
    let result: ChildResult = decode_payload(&raw)?;
    durable_info!(ctx, child_message = %result.message, "child finished");
    Ok(format!(
        "Parent completed for {}. Child result: {} (took {}ms)",
        params.name, result.message, result.elapsed_ms
    ))
}

async fn child(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let params: ChildParams = decode_payload(&input)?;
    let started = ctx.now_ms();
    ctx.sleep(Duration::from_millis(params.duration_ms)).await;
    encode_payload(&ChildResult {
        message: format!("Hello, {} from child orchestration!", params.name),
        elapsed_ms: ctx.now_ms() - started,
    })
}

async fn signal_collector(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let wait_ms: u64 = decode_payload(&input)?;
    let received = ctx.install_handlers(
        Vec::<SignalData>::new(),
        ProcessHandlers::new().query("get_signals", |signals: &Vec<SignalData>| encode_payload(signals)),
    )?;

    let mut timer = ctx.schedule_timer(Duration::from_millis(wait_ms));
    loop {
        let mut signal = ctx.schedule_signal(SIGNAL_CHANNEL);
        let (idx, out) = ctx.select(vec![&mut signal, &mut timer]).await;
        match (idx, out) {
            (0, DurableOutput::Signal(payload)) => match decode_payload::<SignalData>(&payload) {
                Ok(data) => {
                    durable_info!(ctx, message = %data.message, "signal received");
                    received.write(|s| s.push(data));
                }
                Err(e) => durable_warn!(ctx, error = %e, "ignoring malformed signal"),
            },
            _ => break,
        }
    }

    let messages: Vec<String> = received
        .get()
        .into_iter()
        .map(|s| format!("Signal received at {}: {}", s.sent_at, s.message))
        .collect();
    encode_payload(&messages)
}

async fn continue_as_new_counter(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let progress: CounterProgress = decode_payload(&input)?;
    durable_info!(ctx, count = progress.count, max_count = progress.max_count, "counter execution");
    if progress.count >= progress.max_count {
        return encode_payload(&progress.count);
    }
    let next = CounterProgress {
        count: progress.count + 1,
        ..progress
    };
    ctx.continue_as_new_typed(&next)?.await
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register(GREETING, greeting)
        .register(SEQUENTIAL, sequential)
        .register(PARALLEL, parallel)
        .register(LONG_RUNNING, long_running)
        .register(ERROR_HANDLING, error_handling)
        .register(PARENT, parent)
        .register(CHILD, child)
        .register(SIGNAL_COLLECTOR, signal_collector)
        .register(CONTINUE_AS_NEW_COUNTER, continue_as_new_counter)
}

async fn long_running_activity(ctx: ActivityContext, input: String) -> Result<String, String> {
    let duration_ms: u64 = decode_payload(&input)?;
    let tick = Duration::from_millis(duration_ms.clamp(1, 200));
    let deadline = tokio::time::Instant::now() + Duration::from_millis(duration_ms);
    let mut progress = 0u64;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Ok(format!("Completed long-running activity after {duration_ms}ms"));
        }
        tokio::select! {
            _ = ctx.cancelled() => return Err("activity was cancelled".to_string()),
            _ = tokio::time::sleep(tick) => {
                progress += 1;
                ctx.heartbeat(progress.to_string());
            }
        }
    }
}

pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    builder
        .register(GREETING_ACTIVITY, |_ctx: ActivityContext, name: String| async move {
            Ok(format!("Hello, {name}!"))
        })
        .register(FAREWELL_ACTIVITY, |_ctx: ActivityContext, name: String| async move {
            Ok(format!("Goodbye, {name}!"))
        })
        .register(LONG_RUNNING_ACTIVITY, long_running_activity)
        .register(ERROR_PRONE_ACTIVITY, |_ctx: ActivityContext, input: String| async move {
            let should_fail: bool = decode_payload(&input)?;
            if should_fail {
                Err("activity failed as requested".to_string())
            } else {
                Ok("Activity completed successfully".to_string())
            }
        })
}
