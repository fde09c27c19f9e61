//! Ready-to-run orchestrations and activities.
//!
//! Used by the demo binary and the end-to-end tests. Each submodule exposes
//! `register_orchestrations` (and `register_activities` where it has steps) so
//! the samples can be composed into a single registry.

pub mod billing;
pub mod greetings;
pub mod interactive;

use crate::{ActivityRegistry, OrchestrationRegistry};

/// Every sample orchestration.
pub fn orchestrations() -> OrchestrationRegistry {
    let builder = OrchestrationRegistry::builder();
    let builder = greetings::register_orchestrations(builder);
    let builder = interactive::register_orchestrations(builder);
    billing::register_orchestrations(builder).build()
}

/// Every sample activity.
pub fn activities() -> ActivityRegistry {
    let builder = ActivityRegistry::builder();
    let builder = greetings::register_activities(builder);
    billing::register_activities(builder).build()
}
