//! Dispatcher loops of the runtime.
//!
//! - `orchestration`: runs orchestration turns and commits them
//! - `worker`: executes activity steps with timeouts and retries

mod orchestration;
mod worker;
