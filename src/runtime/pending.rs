//! In-flight activity attempts.
//!
//! An entry is created when a worker picks up a step and removed when the
//! step resolves (success, terminal failure or final timeout). Entries are not
//! durable: after a crash the unacked work item is redelivered and the step
//! starts over at attempt 1.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub instance: String,
    pub execution_id: u64,
    /// Event id of the `ActivityScheduled` decision.
    pub activity_id: u64,
}

#[derive(Debug, Clone)]
pub struct PendingStepInfo {
    pub key: StepKey,
    pub name: String,
    pub input: String,
    pub attempt_count: u32,
    pub next_retry_at: Option<Instant>,
    pub timeout_at: Option<Instant>,
    pub last_heartbeat_at: Option<Instant>,
    pub last_heartbeat_details: Option<String>,
    pub cancel_requested: bool,
}

struct Entry {
    info: PendingStepInfo,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
pub struct PendingSteps {
    inner: Mutex<HashMap<StepKey, Entry>>,
}

impl PendingSteps {
    fn lock(&self) -> MutexGuard<'_, HashMap<StepKey, Entry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a step and return its cancellation receiver.
    pub fn register(&self, key: StepKey, name: &str, input: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        let info = PendingStepInfo {
            key: key.clone(),
            name: name.to_string(),
            input: input.to_string(),
            attempt_count: 0,
            next_retry_at: None,
            timeout_at: None,
            last_heartbeat_at: None,
            last_heartbeat_details: None,
            cancel_requested: false,
        };
        self.lock().insert(key, Entry { info, cancel: tx });
        rx
    }

    pub fn begin_attempt(&self, key: &StepKey, attempt: u32, timeout_at: Instant) {
        if let Some(e) = self.lock().get_mut(key) {
            e.info.attempt_count = attempt;
            e.info.next_retry_at = None;
            e.info.timeout_at = Some(timeout_at);
            e.info.last_heartbeat_at = Some(Instant::now());
        }
    }

    pub fn schedule_retry(&self, key: &StepKey, at: Instant) {
        if let Some(e) = self.lock().get_mut(key) {
            e.info.next_retry_at = Some(at);
            e.info.timeout_at = None;
        }
    }

    pub fn heartbeat(&self, key: &StepKey, details: String) {
        if let Some(e) = self.lock().get_mut(key) {
            e.info.last_heartbeat_at = Some(Instant::now());
            e.info.last_heartbeat_details = Some(details);
        }
    }

    pub fn last_heartbeat(&self, key: &StepKey) -> Option<Instant> {
        self.lock().get(key).and_then(|e| e.info.last_heartbeat_at)
    }

    pub fn remove(&self, key: &StepKey) {
        self.lock().remove(key);
    }

    fn cancel_where(&self, pred: impl Fn(&StepKey) -> bool) -> usize {
        let mut g = self.lock();
        let mut n = 0;
        for (k, e) in g.iter_mut() {
            if pred(k) && !e.info.cancel_requested {
                e.info.cancel_requested = true;
                let _ = e.cancel.send(true);
                n += 1;
            }
        }
        n
    }

    /// Advise every step of one execution to stop. Returns how many were told.
    pub fn cancel_execution(&self, instance: &str, execution_id: u64) -> usize {
        self.cancel_where(|k| k.instance == instance && k.execution_id == execution_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    pub fn snapshot(&self) -> Vec<PendingStepInfo> {
        let mut out: Vec<PendingStepInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        out.sort_by(|a, b| {
            (&a.key.instance, a.key.execution_id, a.key.activity_id).cmp(&(
                &b.key.instance,
                b.key.execution_id,
                b.key.activity_id,
            ))
        });
        out
    }
}
