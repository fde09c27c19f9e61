//! Side-effect-free replays used by the client for queries and update validation.

use crate::runtime::OrchestrationHandler;
use crate::runtime::registry::OrchestrationRegistry;
use crate::{Event, EventKind, TurnOutcome, run_turn};
use std::sync::Arc;

/// Orchestration name recorded in `history`, empty when there is none.
pub(crate) fn handler_name(history: &[Event]) -> String {
    match history.first().map(|e| &e.kind) {
        Some(EventKind::OrchestrationStarted { name, .. }) => name.clone(),
        _ => String::new(),
    }
}

/// Handler that owns `history`, resolved by its pinned name and version.
pub(crate) fn handler_for(
    registry: &OrchestrationRegistry,
    history: &[Event],
) -> Result<Arc<dyn OrchestrationHandler>, String> {
    match history.first().map(|e| &e.kind) {
        Some(EventKind::OrchestrationStarted { name, version, .. }) => registry
            .resolve(name, Some(version.as_str()))
            .map(|(_, h)| h)
            .ok_or_else(|| format!("orchestration '{name}@{version}' is not registered")),
        _ => Err("history does not begin with OrchestrationStarted".to_string()),
    }
}

/// Re-run the orchestration over its recorded history without persisting or
/// dispatching anything. The returned context holds the rebuilt state.
pub(crate) fn replay(
    registry: &OrchestrationRegistry,
    instance: &str,
    history: Vec<Event>,
) -> Result<TurnOutcome, String> {
    let handler = handler_for(registry, &history)?;
    let outcome = run_turn(instance, history, |ctx, input| async move { handler.invoke(ctx, input).await });
    if let crate::TurnResult::Failed(details) = &outcome.result
        && details.is_nondeterminism()
    {
        return Err(details.display_message());
    }
    Ok(outcome)
}
