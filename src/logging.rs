//! Tracing setup and replay-safe logging macros for orchestration code.
//!
//! Orchestration bodies run again from the top on every turn. The
//! `durable_*` macros only emit while the context makes live decisions, so a
//! message appears once per real decision instead of once per replay.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a compact `fmt` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init();
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(
                target: "duroflow::orchestration",
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(
                target: "duroflow::orchestration",
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(
                target: "duroflow::orchestration",
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}
