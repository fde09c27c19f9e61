use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::providers::{Provider, QueueKind, WorkItem};

use super::now_ms;

/// Delivers `TimerSchedule` envelopes from the timer queue to the
/// orchestrator queue once they are due.
///
/// Items stay peek-locked in the provider until they fire, so an envelope is
/// removed from the timer queue in the same step that delivers its payload.
pub(crate) struct TimerService {
    store: Arc<dyn Provider>,
    // lock token -> payload
    items: HashMap<String, WorkItem>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
    poller_idle_ms: u64,
    shutdown: Arc<AtomicBool>,
}

impl TimerService {
    pub(crate) fn start(
        store: Arc<dyn Provider>,
        poller_idle_ms: u64,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let mut svc = TimerService {
            store,
            items: HashMap::new(),
            min_heap: BinaryHeap::new(),
            poller_idle_ms,
            shutdown,
        };
        tokio::spawn(async move { svc.run().await })
    }

    async fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            // Pull every newly scheduled timer
            loop {
                match self.store.fetch_work_item(QueueKind::Timer).await {
                    Ok(Some((item, token))) => self.insert_item(item, token).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(target: "duroflow::runtime::timers", error = %e, "timer fetch failed");
                        break;
                    }
                }
            }

            self.fire_due().await;

            let idle = self.poller_idle_ms.max(1);
            let sleep_ms = match self.min_heap.peek() {
                Some(Reverse((ts, _))) => ts.saturating_sub(now_ms()).clamp(1, idle),
                None => idle,
            };
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    async fn insert_item(&mut self, item: WorkItem, token: String) {
        match item {
            WorkItem::TimerSchedule { fire_at_ms, item } => {
                self.min_heap.push(Reverse((fire_at_ms, token.clone())));
                self.items.insert(token, *item);
            }
            other => {
                tracing::error!(target: "duroflow::runtime::timers", item = ?other, "unexpected item in timer queue");
                let _ = self.store.ack_work_item(QueueKind::Timer, &token, None).await;
            }
        }
    }

    async fn fire_due(&mut self) {
        let now = now_ms();
        while let Some(Reverse((ts, token))) = self.min_heap.peek().cloned() {
            if ts > now {
                break;
            }
            self.min_heap.pop();
            let Some(payload) = self.items.remove(&token) else {
                continue;
            };
            if let Err(e) = self
                .store
                .ack_work_item(QueueKind::Timer, &token, Some(payload.clone()))
                .await
            {
                tracing::warn!(target: "duroflow::runtime::timers", error = %e, "timer delivery failed, retrying");
                self.min_heap.push(Reverse((ts, token.clone())));
                self.items.insert(token, payload);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryProvider;

    fn timer(id: u64, fire_at_ms: u64) -> WorkItem {
        WorkItem::TimerSchedule {
            fire_at_ms,
            item: Box::new(WorkItem::TimerFired {
                instance: "i".into(),
                execution_id: 1,
                id,
                fire_at_ms,
            }),
        }
    }

    #[tokio::test]
    async fn fires_due_timers_in_order() {
        let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        let now = now_ms();
        store.enqueue(QueueKind::Timer, timer(1, now)).await.unwrap();
        store.enqueue(QueueKind::Timer, timer(2, now + 40)).await.unwrap();
        store.enqueue(QueueKind::Timer, timer(3, now + 20)).await.unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = TimerService::start(store.clone(), 5, shutdown.clone());

        let mut fired = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.len() < 3 && std::time::Instant::now() < deadline {
            if let Some(item) = store.fetch_orchestration_item().await.unwrap() {
                for m in &item.messages {
                    if let WorkItem::TimerFired { id, .. } = m {
                        fired.push(*id);
                    }
                }
                store
                    .ack_orchestration_item(&item.lock_token, Default::default())
                    .await
                    .unwrap();
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
        assert_eq!(fired, vec![1, 3, 2]);
    }
}
