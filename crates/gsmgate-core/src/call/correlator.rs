//! Call event correlator.
//!
//! Remote signaling arrives on the peer link task, while the forwarding task
//! of the call waits for it. Events are queued per call-id and per
//! [`CallSignalKind`] so a waiter only ever sees events of its own call, and
//! events that arrive before anyone waits are not lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gsmgate_common::protocol::{CallSignal, CallSignalKind};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("call {0} is not being tracked")]
    UnknownCall(String),
    #[error("call {0} was discarded")]
    Discarded(String),
    #[error("no answer or hangup for call {call_id} within {after:?}")]
    TimedOut { call_id: String, after: Duration },
}

struct SignalQueue {
    tx: mpsc::UnboundedSender<CallSignal>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<CallSignal>>>,
}

impl SignalQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        SignalQueue {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

type Queues = HashMap<CallSignalKind, SignalQueue>;

#[derive(Default)]
pub struct CallCorrelator {
    calls: Mutex<HashMap<String, Queues>>,
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, Queues>> {
        // The map stays consistent even if a holder panicked.
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking `call_id`. Must happen before the call is announced so
    /// that an early answer is queued rather than dropped.
    pub fn prepare(&self, call_id: &str) {
        let queues = CallSignalKind::ALL
            .into_iter()
            .map(|kind| (kind, SignalQueue::new()))
            .collect();
        if self.calls().insert(call_id.to_string(), queues).is_some() {
            tracing::warn!(call_id, "call prepared twice, pending events dropped");
        }
    }

    /// Route an incoming event to its call. Returns `false` if nobody tracks
    /// the call-id.
    pub fn dispatch(&self, event: CallSignal) -> bool {
        let calls = self.calls();
        let Some(queue) = calls
            .get(event.call_id())
            .and_then(|queues| queues.get(&event.kind()))
        else {
            tracing::warn!(
                call_id = event.call_id(),
                kind = %event.kind(),
                "dropping event for untracked call"
            );
            return false;
        };
        tracing::debug!(call_id = event.call_id(), kind = %event.kind(), "call event");
        queue.tx.send(event).is_ok()
    }

    fn receiver(
        &self,
        kind: CallSignalKind,
        call_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<CallSignal>>>, CorrelationError> {
        self.calls()
            .get(call_id)
            .and_then(|queues| queues.get(&kind))
            .map(|queue| queue.rx.clone())
            .ok_or_else(|| CorrelationError::UnknownCall(call_id.to_string()))
    }

    /// Wait for the next event of `kind` for `call_id`.
    pub async fn await_event(
        &self,
        kind: CallSignalKind,
        call_id: &str,
    ) -> Result<CallSignal, CorrelationError> {
        let rx = self.receiver(kind, call_id)?;
        let mut rx = rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| CorrelationError::Discarded(call_id.to_string()))
    }

    /// Race the answer and hangup queues of `call_id`. The first event wins;
    /// the other queue is left as is until the call is discarded.
    pub async fn await_answer_or_hangup(
        &self,
        call_id: &str,
        timeout: Duration,
    ) -> Result<CallSignal, CorrelationError> {
        let race = async {
            tokio::select! {
                answer = self.await_event(CallSignalKind::Answer, call_id) => answer,
                hangup = self.await_event(CallSignalKind::Hangup, call_id) => hangup,
            }
        };
        tokio::time::timeout(timeout, race)
            .await
            .map_err(|_| CorrelationError::TimedOut {
                call_id: call_id.to_string(),
                after: timeout,
            })?
    }

    /// Stop tracking `call_id`. Later events for it are dropped and current
    /// waiters fail with [`CorrelationError::Discarded`].
    pub fn discard(&self, call_id: &str) -> bool {
        // Dropping the senders closes every queue of the call.
        self.calls().remove(call_id).is_some()
    }

    pub fn is_tracked(&self, call_id: &str) -> bool {
        self.calls().contains_key(call_id)
    }

    /// Number of calls currently tracked.
    pub fn tracked(&self) -> usize {
        self.calls().len()
    }
}
