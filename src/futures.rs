use std::borrow::BorrowMut;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{CtxInner, EventKind, OrchestrationContext};

#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    Signal(String),
    UpdateArrival { name: String, payload: String },
    SubOrchestrationStarted(Result<(String, u64), String>),
    SubOrchestration(Result<String, String>),
    Cancelled(String),
}

/// A future whose resolution comes from orchestration history.
///
/// Resolution is cached: once a future has consumed its completion, polling it
/// again yields the same output without consuming anything else.
pub struct DurableFuture {
    pub(crate) kind: Kind,
    ctx: OrchestrationContext,
    resolved: Option<DurableOutput>,
}

pub(crate) enum Kind {
    Activity { id: u64 },
    Timer { id: u64 },
    Signal { name: String },
    UpdateArrival { name: String },
    SubOrchestrationStarted { id: u64 },
    SubOrchestration { id: u64 },
    Cancellation,
}

impl DurableFuture {
    fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            kind,
            ctx,
            resolved: None,
        }
    }

    pub(crate) fn activity(ctx: OrchestrationContext, id: u64) -> Self {
        Self::new(ctx, Kind::Activity { id })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, id: u64) -> Self {
        Self::new(ctx, Kind::Timer { id })
    }

    pub(crate) fn signal(ctx: OrchestrationContext, name: String) -> Self {
        Self::new(ctx, Kind::Signal { name })
    }

    pub(crate) fn update_arrival(ctx: OrchestrationContext, name: String) -> Self {
        Self::new(ctx, Kind::UpdateArrival { name })
    }

    pub(crate) fn sub_orchestration_started(ctx: OrchestrationContext, id: u64) -> Self {
        Self::new(ctx, Kind::SubOrchestrationStarted { id })
    }

    pub(crate) fn sub_orchestration(ctx: OrchestrationContext, id: u64) -> Self {
        Self::new(ctx, Kind::SubOrchestration { id })
    }

    pub(crate) fn cancellation(ctx: OrchestrationContext) -> Self {
        Self::new(ctx, Kind::Cancellation)
    }

    /// True once this future has consumed its completion.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => Err(format!("expected activity output, got {other:?}")),
        }
    }

    pub async fn into_timer(self) {
        let _ = self.await;
    }

    pub async fn into_signal(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Signal(payload) => Ok(payload),
            DurableOutput::UpdateArrival { payload, .. } => Ok(payload),
            other => Err(format!("expected signal output, got {other:?}")),
        }
    }

    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => Err(format!("expected sub-orchestration output, got {other:?}")),
        }
    }

    pub async fn into_started(self) -> Result<(String, u64), String> {
        match self.await {
            DurableOutput::SubOrchestrationStarted(r) => r,
            other => Err(format!("expected sub-orchestration start, got {other:?}")),
        }
    }

    /// Look for this future's completion among visible history.
    fn try_resolve(&self, inner: &mut CtxInner) -> Option<DurableOutput> {
        if let Kind::Cancellation = self.kind {
            return inner.cancel_requested.clone().map(DurableOutput::Cancelled);
        }
        if let Kind::UpdateArrival { name } = &self.kind {
            let arrival = inner
                .update_arrivals
                .iter()
                .find(|a| a.name == *name && !inner.consumed.contains(&a.key))
                .cloned()?;
            inner.consumed.insert(arrival.key);
            return Some(DurableOutput::UpdateArrival {
                name: arrival.name,
                payload: arrival.payload,
            });
        }

        let (idx, output) = inner.history.iter().enumerate().find_map(|(idx, e)| {
            if !inner.visible(idx) || inner.consumed.contains(&e.event_id) {
                return None;
            }
            let out = match (&self.kind, &e.kind, e.source_event_id) {
                (Kind::Activity { id }, EventKind::ActivityCompleted { result, .. }, Some(src)) if src == *id => {
                    DurableOutput::Activity(Ok(result.clone()))
                }
                (Kind::Activity { id }, EventKind::ActivityFailed { details, .. }, Some(src)) if src == *id => {
                    DurableOutput::Activity(Err(details.display_message()))
                }
                (Kind::Timer { id }, EventKind::TimerFired { .. }, Some(src)) if src == *id => DurableOutput::Timer,
                (Kind::Signal { name }, EventKind::SignalReceived { name: n, payload }, _) if n == name => {
                    DurableOutput::Signal(payload.clone())
                }
                (
                    Kind::SubOrchestrationStarted { id },
                    EventKind::SubOrchestrationStarted { instance, execution_id },
                    Some(src),
                ) if src == *id => DurableOutput::SubOrchestrationStarted(Ok((instance.clone(), *execution_id))),
                (
                    Kind::SubOrchestrationStarted { id },
                    EventKind::SubOrchestrationFailed { details },
                    Some(src),
                ) if src == *id => DurableOutput::SubOrchestrationStarted(Err(details.display_message())),
                (Kind::SubOrchestration { id }, EventKind::SubOrchestrationCompleted { result }, Some(src))
                    if src == *id =>
                {
                    DurableOutput::SubOrchestration(Ok(result.clone()))
                }
                (Kind::SubOrchestration { id }, EventKind::SubOrchestrationFailed { details }, Some(src))
                    if src == *id =>
                {
                    DurableOutput::SubOrchestration(Err(details.display_message()))
                }
                _ => return None,
            };
            Some((idx, out))
        })?;

        // A failed start is reported to both handles, so it is never consumed
        let shared = matches!(
            (&self.kind, &inner.history[idx].kind),
            (Kind::SubOrchestrationStarted { .. }, EventKind::SubOrchestrationFailed { .. })
        );
        if !shared {
            let event_id = inner.history[idx].event_id;
            inner.consumed.insert(event_id);
        }
        Some(output)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(out) = &this.resolved {
            return Poll::Ready(out.clone());
        }
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }
        match this.try_resolve(&mut inner) {
            Some(out) => {
                this.resolved = Some(out.clone());
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

/// Deterministic multiplexer over durable futures.
///
/// Each poll checks the branches in registration order and the first ready
/// branch wins, also when several became ready in the same batch. Batches are
/// fixed by history, so the winner is the same on every replay. Losing branches are left untouched:
/// pass `&mut` futures to keep waiting on them after the select resolves.
pub struct SelectFuture<F> {
    futures: Vec<F>,
}

impl<F> SelectFuture<F>
where
    F: BorrowMut<DurableFuture> + Unpin,
{
    pub fn new(futures: Vec<F>) -> Self {
        Self { futures }
    }
}

impl<F> Future for SelectFuture<F>
where
    F: BorrowMut<DurableFuture> + Unpin,
{
    /// Index of the winning branch and its output.
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (idx, f) in this.futures.iter_mut().enumerate() {
            let fut: &mut DurableFuture = f.borrow_mut();
            if let Poll::Ready(out) = Pin::new(fut).poll(cx) {
                return Poll::Ready((idx, out));
            }
        }
        Poll::Pending
    }
}

/// Waits for every future; outputs come back in registration order.
pub struct JoinFuture {
    futures: Vec<DurableFuture>,
    outputs: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub fn new(futures: Vec<DurableFuture>) -> Self {
        let outputs = futures.iter().map(|_| None).collect();
        Self { futures, outputs }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (fut, slot) in this.futures.iter_mut().zip(this.outputs.iter_mut()) {
            if slot.is_none()
                && let Poll::Ready(out) = Pin::new(fut).poll(cx)
            {
                *slot = Some(out);
            }
        }
        if this.outputs.iter().all(Option::is_some) {
            Poll::Ready(this.outputs.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}
