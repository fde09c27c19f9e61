//! Runtime limits and constants.

/// Default cap on unconsumed signals carried across a continue-as-new
/// boundary. When exceeded the oldest signals are dropped with a warning.
pub const MAX_CARRY_FORWARD_SIGNALS: usize = 20;

/// Delay before a dispatcher retries after a retryable provider error.
pub const PROVIDER_RETRY_BACKOFF_MS: u64 = 50;
