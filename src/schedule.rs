//! External schedule trigger.
//!
//! A recurring process has two shapes. The canonical one keeps a single
//! instance alive and loops on a durable timer, continuing as new each cycle
//! (see `samples::billing`). The alternative lives outside the engine: a
//! trigger that issues a fresh `Start` at every occurrence, each under its own
//! instance id `{prefix}-{n}`. This module is that trigger. It owns no durable
//! state; a restarted trigger resumes numbering from `first_run`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{Client, ClientError};

/// When a [`ScheduleTrigger`] fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Immediately, then once per period. Missed occurrences are skipped.
    Every(Duration),
}

impl Schedule {
    fn period(&self) -> Duration {
        match self {
            Schedule::Every(d) => (*d).max(Duration::from_millis(1)),
        }
    }
}

/// Starts a new orchestration instance at every occurrence of a schedule.
pub struct ScheduleTrigger {
    client: Arc<Client>,
    prefix: String,
    orchestration: String,
    input: String,
    schedule: Schedule,
    first_run: u64,
    max_runs: Option<u64>,
}

/// Stops a spawned trigger.
pub struct ScheduleHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<u64>,
}

impl ScheduleHandle {
    /// Stop firing and return the number of runs started.
    pub async fn stop(self) -> u64 {
        let _ = self.stop.send(true);
        self.join.await.unwrap_or(0)
    }
}

impl ScheduleTrigger {
    pub fn new(
        client: Arc<Client>,
        prefix: impl Into<String>,
        orchestration: impl Into<String>,
        input: impl Into<String>,
        schedule: Schedule,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            orchestration: orchestration.into(),
            input: input.into(),
            schedule,
            first_run: 1,
            max_runs: None,
        }
    }

    /// Number the next run `n` instead of 1.
    pub fn with_first_run(mut self, n: u64) -> Self {
        self.first_run = n;
        self
    }

    /// Stop after starting this many runs.
    pub fn with_max_runs(mut self, n: u64) -> Self {
        self.max_runs = Some(n);
        self
    }

    pub fn instance_id(&self, run: u64) -> String {
        format!("{}-{run}", self.prefix)
    }

    /// Start run `run`. Starting is idempotent per instance id, so firing the
    /// same occurrence twice does not create a second run.
    pub async fn fire(&self, run: u64) -> Result<u64, ClientError> {
        let instance = self.instance_id(run);
        let execution_id = self
            .client
            .start_orchestration(&instance, &self.orchestration, self.input.clone())
            .await?;
        tracing::info!(
            target: "duroflow::schedule",
            instance_id = %instance,
            execution_id,
            orchestration_name = %self.orchestration,
            "scheduled run started"
        );
        Ok(execution_id)
    }

    /// Fire on schedule until `stop` flips to true or `max_runs` is reached.
    /// Returns the number of runs started. A failed start is logged and the
    /// occurrence is skipped.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> u64 {
        let mut ticker = tokio::time::interval(self.schedule.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut run = self.first_run;
        let mut started = 0u64;

        loop {
            if self.max_runs.is_some_and(|max| started >= max) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.fire(run).await {
                Ok(_) => started += 1,
                Err(e) => tracing::warn!(
                    target: "duroflow::schedule",
                    instance_id = %self.instance_id(run),
                    error = %e,
                    "scheduled start failed, skipping occurrence"
                ),
            }
            run += 1;
        }
        started
    }

    /// Run the trigger on a background task.
    pub fn spawn(self) -> ScheduleHandle {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        ScheduleHandle { stop: tx, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryProvider;
    use crate::providers::{Provider, QueueKind};

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_period_with_numbered_instances() {
        let store = Arc::new(InMemoryProvider::new());
        let client = Arc::new(Client::new(store.clone()));
        let trigger = ScheduleTrigger::new(client, "billing", "BillingCycle", "{}", Schedule::Every(Duration::from_secs(60)))
            .with_max_runs(3);

        let (_tx, rx) = watch::channel(false);
        assert_eq!(trigger.run(rx).await, 3);

        let mut instances = store.list_instances().await.unwrap();
        instances.sort();
        assert_eq!(instances, vec!["billing-1", "billing-2", "billing-3"]);
        assert_eq!(store.queue_len(QueueKind::Orchestrator).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop() {
        let store = Arc::new(InMemoryProvider::new());
        let client = Arc::new(Client::new(store));
        let handle =
            ScheduleTrigger::new(client, "job", "Greeting", "x", Schedule::Every(Duration::from_secs(3600))).spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.stop().await, 1);
    }
}
