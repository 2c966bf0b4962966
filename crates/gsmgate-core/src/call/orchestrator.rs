//! Call session orchestrator.
//!
//! Owns the GSM side of the single active call: picks the incoming call out
//! of `+CLCC`, starts the forwarding task, answers with `ATA` when the
//! remote side connects and hangs up with `ATH0` once the task has ended.
//! Lives inside the dispatcher task, so in-call state has exactly one owner.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::forwarder::{CallControl, CallForwarder, CallOutcome, IncomingCall, SessionEvent};
use crate::error::ModemError;
use crate::modem::at;
use crate::modem::channel::CommandChannel;

/// Upper bound on waiting for a cancelled forwarder to clean up at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    Idle,
    Ringing,
    Forwarding,
    Connected,
    Ended,
    TimedOut,
    Cancelled,
    Rejected,
    Failed,
}

impl CallState {
    fn from_outcome(outcome: &CallOutcome) -> CallState {
        match outcome {
            CallOutcome::Completed => CallState::Ended,
            CallOutcome::Rejected => CallState::Rejected,
            CallOutcome::TimedOut => CallState::TimedOut,
            CallOutcome::Cancelled => CallState::Cancelled,
            CallOutcome::Failed(_) => CallState::Failed,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct ActiveCall {
    session: u64,
    call: IncomingCall,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct CallOrchestrator<F> {
    forwarder: Arc<F>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveCall>,
    state: CallState,
    next_session: u64,
    shutdown: CancellationToken,
}

impl<F: CallForwarder> CallOrchestrator<F> {
    pub fn new(
        forwarder: Arc<F>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        CallOrchestrator {
            forwarder,
            events_tx,
            active: None,
            state: CallState::Idle,
            next_session: 1,
            shutdown,
        }
    }

    pub fn in_call(&self) -> bool {
        self.active.is_some()
    }

    fn transition(&mut self, to: CallState) {
        tracing::debug!(from = %self.state, to = %to, "call state");
        self.state = to;
    }

    /// Handle a `RING` while idle.
    pub async fn on_ring(&mut self, commands: &CommandChannel) -> Result<(), ModemError> {
        if self.in_call() {
            tracing::debug!("RING while in call, ignoring");
            return Ok(());
        }
        self.transition(CallState::Ringing);

        let result = match commands.run_ok(at::LIST_CALLS).await {
            Ok(r) => r,
            Err(e) => {
                self.transition(CallState::Idle);
                return Err(e);
            }
        };
        let Some(row) = at::select_incoming(&result) else {
            tracing::warn!(response = %result, "RING without an incoming voice call, dropping");
            self.transition(CallState::Idle);
            return Ok(());
        };

        let call = IncomingCall {
            gsm_index: row.index,
            number: row.number.replace('"', ""),
            number_type: row.number_type,
        };
        tracing::info!(
            index = call.gsm_index,
            number = %call.number,
            number_type = ?call.number_type,
            "incoming call"
        );

        let session = self.next_session;
        self.next_session += 1;
        let control = CallControl::new(session, self.events_tx.clone(), &self.shutdown);
        let cancel = control.cancellation();

        let forwarder = self.forwarder.clone();
        let events = self.events_tx.clone();
        let forwarded = call.clone();
        let task = tokio::spawn(async move {
            let outcome = forwarder.forward(forwarded, control).await;
            // Reported after the forwarder's own cleanup, exactly once.
            let _ = events.send(SessionEvent::Ended { session, outcome });
        });

        self.active = Some(ActiveCall {
            session,
            call,
            cancel,
            task,
        });
        self.transition(CallState::Forwarding);
        Ok(())
    }

    /// The GSM caller hung up. Cancels the forwarding task; it reports
    /// `Ended` once its cleanup is done.
    pub fn on_no_carrier(&mut self) {
        match &self.active {
            Some(active) if !active.cancel.is_cancelled() => {
                tracing::info!(session = active.session, "GSM hangup, cancelling call");
                active.cancel.cancel();
            }
            Some(active) => {
                tracing::debug!(session = active.session, "call already cancelled");
            }
            None => tracing::debug!("NO CARRIER outside a call"),
        }
    }

    pub async fn on_event(
        &mut self,
        event: SessionEvent,
        commands: &CommandChannel,
    ) -> Result<(), ModemError> {
        let session = event.session();
        let Some(active) = self.active.as_ref().filter(|a| a.session == session) else {
            tracing::warn!(?event, "event for a call that is no longer active");
            return Ok(());
        };

        match event {
            SessionEvent::Connected { .. } => {
                if active.cancel.is_cancelled() {
                    tracing::warn!(session, "connected after cancellation, ignoring");
                    return Ok(());
                }
                if self.state == CallState::Connected {
                    tracing::warn!(session, "connected twice, ignoring");
                    return Ok(());
                }
                tracing::info!(session, number = %active.call.number, "call connected, answering");
                match commands.run_ok(at::ANSWER).await {
                    Ok(_) => {
                        self.transition(CallState::Connected);
                        Ok(())
                    }
                    Err(e) => {
                        // Could not pick up: tear the remote side down too.
                        active.cancel.cancel();
                        Err(e)
                    }
                }
            }
            SessionEvent::Ended { outcome, .. } => {
                self.active = None;
                self.transition(CallState::from_outcome(&outcome));
                tracing::info!(session, outcome = %outcome, "call ended, hanging up");
                commands.run_ok(at::HANGUP).await.map(|_| ())
            }
        }
    }

    /// Cancel the active call and wait (bounded) for its cleanup, then make
    /// sure the GSM side is hung up.
    pub async fn shutdown(&mut self, commands: &CommandChannel) {
        let Some(active) = self.active.take() else {
            return;
        };
        tracing::info!(session = active.session, "shutting down active call");
        // Also reached on a fatal error; the call must still see a shutdown.
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, active.task).await.is_err() {
            tracing::warn!(session = active.session, "call cleanup did not finish in time");
        }
        self.transition(CallState::Cancelled);
        if let Err(e) = commands.run_ok(at::HANGUP).await {
            tracing::warn!(error = %e, "hangup during shutdown failed");
        }
    }
}
