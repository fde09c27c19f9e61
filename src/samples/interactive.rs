//! Samples driven by updates and queries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::registry::OrchestrationRegistryBuilder;
use crate::{OrchestrationContext, ProcessHandlers, decode_payload, durable_info, encode_payload};

pub const COUNTER: &str = "Counter";
pub const UPDATEABLE: &str = "Updateable";

/// Signal that ends the interactive samples before their idle timeout.
pub const FINISH_SIGNAL: &str = "finish";

const IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
}

fn positive_amount(payload: &str) -> Result<i64, String> {
    let amount: i64 = decode_payload(payload)?;
    if amount <= 0 {
        return Err(format!("amount must be positive, got {amount}"));
    }
    Ok(amount)
}

/// Handlers of the counter sample. `decrement` and `set` refuse to make the
/// counter negative.
pub fn counter_handlers() -> ProcessHandlers<CounterState> {
    ProcessHandlers::new()
        .update(
            "increment",
            |_s: &CounterState, p: &str| positive_amount(p).map(|_| ()),
            |s: &mut CounterState, p: &str| {
                s.value += positive_amount(p)?;
                encode_payload(&s.value)
            },
        )
        .update(
            "decrement",
            |s: &CounterState, p: &str| {
                let amount = positive_amount(p)?;
                if s.value - amount < 0 {
                    return Err(format!("cannot decrement {} by {amount}", s.value));
                }
                Ok(())
            },
            |s: &mut CounterState, p: &str| {
                s.value -= positive_amount(p)?;
                encode_payload(&s.value)
            },
        )
        .update(
            "set",
            |_s: &CounterState, p: &str| {
                let value: i64 = decode_payload(p)?;
                if value < 0 {
                    return Err(format!("value must not be negative, got {value}"));
                }
                Ok(())
            },
            |s: &mut CounterState, p: &str| {
                s.value = decode_payload(p)?;
                encode_payload(&s.value)
            },
        )
        .query("get_counter", |s: &CounterState| encode_payload(&s.value))
}

async fn counter(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let initial: i64 = decode_payload(&input)?;
    durable_info!(ctx, initial, "counter started");
    let state = ctx.install_handlers(CounterState { value: initial }, counter_handlers())?;

    let finish = ctx.schedule_signal(FINISH_SIGNAL);
    let idle = ctx.schedule_timer(IDLE_TIMEOUT);
    ctx.select2(finish, idle).await;

    let value = state.read(|s| s.value);
    durable_info!(ctx, value, "counter completed");
    encode_payload(&value)
}

/// State of the updateable sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at_ms: u64,
    /// Number of accepted updates.
    pub revision: u64,
}

/// Partial update of [`DocumentState`]; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

fn parse_patch(payload: &str) -> Result<DocumentPatch, String> {
    let patch: DocumentPatch = decode_payload(payload)?;
    if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err("name must not be empty".to_string());
    }
    Ok(patch)
}

pub fn document_handlers() -> ProcessHandlers<DocumentState> {
    ProcessHandlers::new()
        .update(
            "update_state",
            |_s: &DocumentState, p: &str| parse_patch(p).map(|_| ()),
            |s: &mut DocumentState, p: &str| {
                let patch = parse_patch(p)?;
                if let Some(name) = patch.name {
                    s.name = name;
                }
                if let Some(description) = patch.description {
                    s.description = description;
                }
                if let Some(tags) = patch.tags {
                    s.tags = tags;
                }
                s.revision += 1;
                encode_payload(s)
            },
        )
        .query("get_state", |s: &DocumentState| encode_payload(s))
}

async fn updateable(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    let state = ctx.install_handlers(
        DocumentState {
            name: "Initial State".to_string(),
            description: "This is the initial state of the orchestration".to_string(),
            tags: vec!["initial".to_string(), "orchestration".to_string()],
            created_at_ms: ctx.now_ms(),
            revision: 0,
        },
        document_handlers(),
    )?;

    let finish = ctx.schedule_signal(FINISH_SIGNAL);
    let idle = ctx.schedule_timer(IDLE_TIMEOUT);
    ctx.select2(finish, idle).await;

    Ok(format!("Completed: {}", state.read(|s| s.name.clone())))
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register(COUNTER, counter).register(UPDATEABLE, updateable)
}
