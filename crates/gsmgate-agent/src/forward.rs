//! Call and SMS forwarders speaking the peer signaling protocol.

use std::sync::Arc;
use std::time::Duration;

use gsmgate_common::ids;
use gsmgate_common::protocol::{
    CALL_VERSION, CallHangupPayload, CallInvitePayload, CallSignal, CallSignalKind, HangupReason,
    PeerMessage, TextMessagePayload,
};
use gsmgate_core::{
    CallControl, CallCorrelator, CallForwarder, CallOutcome, CorrelationError, IncomingCall,
    RelayError, SmsForwarder,
};

use crate::peer::PeerHandle;

/// How long a hangup or SMS waits for room in the peer queue.
const SEND_WAIT: Duration = Duration::from_secs(5);

pub struct PeerCallForwarder {
    peer: PeerHandle,
    correlator: Arc<CallCorrelator>,
    call_timeout: Duration,
}

impl PeerCallForwarder {
    pub fn new(peer: PeerHandle, correlator: Arc<CallCorrelator>, call_timeout: Duration) -> Self {
        PeerCallForwarder {
            peer,
            correlator,
            call_timeout,
        }
    }

    /// Drive one call until it ends. The flag tells whether the peer already
    /// hung up, in which case no hangup is sent back.
    async fn run_call(&self, call_id: &str, control: &CallControl) -> (CallOutcome, bool) {
        let first = tokio::select! {
            _ = control.cancelled() => return (CallOutcome::Cancelled, false),
            signal = self.correlator.await_answer_or_hangup(call_id, self.call_timeout) => signal,
        };

        match first {
            Ok(CallSignal::Answer(_)) => {}
            Ok(CallSignal::Hangup(hangup)) => {
                tracing::info!(call_id, reason = ?hangup.reason, "peer declined call");
                return (CallOutcome::Rejected, true);
            }
            Ok(other) => {
                return (
                    CallOutcome::Failed(format!("unexpected {} signal", other.kind())),
                    false,
                );
            }
            Err(CorrelationError::TimedOut { .. }) => {
                tracing::info!(call_id, "call not answered in time");
                return (CallOutcome::TimedOut, false);
            }
            Err(e) => return (CallOutcome::Failed(e.to_string()), false),
        }

        if !control.connected() {
            return (CallOutcome::Cancelled, false);
        }
        tracing::info!(call_id, "call established, waiting for hangup");

        tokio::select! {
            _ = control.cancelled() => (CallOutcome::Cancelled, false),
            hangup = self.correlator.await_event(CallSignalKind::Hangup, call_id) => match hangup {
                Ok(_) => (CallOutcome::Completed, true),
                Err(e) => (CallOutcome::Failed(e.to_string()), false),
            },
        }
    }
}

fn hangup_reason(outcome: &CallOutcome, shutdown: bool) -> HangupReason {
    match outcome {
        CallOutcome::TimedOut => HangupReason::InviteTimeout,
        CallOutcome::Cancelled if !shutdown => HangupReason::RemoteNetwork,
        CallOutcome::Cancelled | CallOutcome::Completed => HangupReason::UserHangup,
        CallOutcome::Rejected | CallOutcome::Failed(_) => HangupReason::Other,
    }
}

impl CallForwarder for PeerCallForwarder {
    async fn forward(&self, call: IncomingCall, control: CallControl) -> CallOutcome {
        let call_id = ids::call_id();
        // Registered before the invite goes out so an immediate answer queues.
        self.correlator.prepare(&call_id);
        tracing::info!(call_id = %call_id, caller = %call.label(), "forwarding call");

        let invite = PeerMessage::CallInvite(CallInvitePayload {
            call_id: call_id.clone(),
            version: CALL_VERSION,
            lifetime_ms: self.call_timeout.as_millis() as u64,
            caller: call.label(),
            offer: None,
        });
        // The invite waits for the queue as long as the call lasts. A call
        // ended before it went out leaves the peer nothing to hang up.
        let sent = tokio::select! {
            _ = control.cancelled() => None,
            sent = self.peer.send(&invite, self.call_timeout) => Some(sent),
        };
        match sent {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.correlator.discard(&call_id);
                return CallOutcome::Failed(e.to_string());
            }
            None => {
                tracing::info!(call_id = %call_id, "call ended before the invite was sent");
                self.correlator.discard(&call_id);
                return CallOutcome::Cancelled;
            }
        }

        let (outcome, peer_hung_up) = self.run_call(&call_id, &control).await;

        if !peer_hung_up {
            let hangup = PeerMessage::CallHangup(CallHangupPayload {
                call_id: call_id.clone(),
                version: CALL_VERSION,
                reason: Some(hangup_reason(&outcome, control.is_shutdown())),
            });
            if let Err(e) = self.peer.send(&hangup, SEND_WAIT).await {
                tracing::warn!(call_id = %call_id, error = %e, "could not send hangup");
            }
        }
        self.correlator.discard(&call_id);
        tracing::info!(call_id = %call_id, outcome = %outcome, "call finished");
        outcome
    }
}

pub struct PeerSmsForwarder {
    peer: PeerHandle,
}

impl PeerSmsForwarder {
    pub fn new(peer: PeerHandle) -> Self {
        PeerSmsForwarder { peer }
    }
}

impl SmsForwarder for PeerSmsForwarder {
    async fn send(&self, text: String) -> Result<(), RelayError> {
        let message = PeerMessage::Text(TextMessagePayload {
            body: text,
            sender: None,
        });
        self.peer.send(&message, SEND_WAIT).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use gsmgate_common::protocol::{CallAnswerPayload, Envelope};
    use gsmgate_core::SessionEvent;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::peer;

    struct Harness {
        correlator: Arc<CallCorrelator>,
        outgoing: mpsc::Receiver<String>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        /// Cancels this call only, as a GSM hangup does.
        cancel: CancellationToken,
        shutdown: CancellationToken,
        call: tokio::task::JoinHandle<CallOutcome>,
    }

    fn start() -> Harness {
        start_on(peer::channel())
    }

    fn start_on((handle, outgoing): (PeerHandle, mpsc::Receiver<String>)) -> Harness {
        let correlator = Arc::new(CallCorrelator::new());
        let forwarder = PeerCallForwarder::new(handle, correlator.clone(), Duration::from_secs(90));
        let (events_tx, events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let control = CallControl::new(1, events_tx, &shutdown);
        let cancel = control.cancellation();
        let incoming = IncomingCall {
            gsm_index: 1,
            number: "+15551234567".into(),
            number_type: Some(129),
        };
        let call = tokio::spawn(async move { forwarder.forward(incoming, control).await });
        Harness {
            correlator,
            outgoing,
            events,
            cancel,
            shutdown,
            call,
        }
    }

    /// A peer link that is down with its queue already full.
    async fn full_channel() -> (PeerHandle, mpsc::Receiver<String>) {
        let (handle, outgoing) = peer::channel();
        let filler = PeerMessage::Text(TextMessagePayload {
            body: "queued".into(),
            sender: None,
        });
        while handle.send(&filler, Duration::from_millis(1)).await.is_ok() {}
        (handle, outgoing)
    }

    async fn next_message(rx: &mut mpsc::Receiver<String>) -> PeerMessage {
        let raw = rx.recv().await.unwrap();
        let envelope: Envelope = serde_json::from_str(&raw).unwrap();
        PeerMessage::from_envelope(&envelope).unwrap()
    }

    async fn invite(h: &mut Harness) -> CallInvitePayload {
        match next_message(&mut h.outgoing).await {
            PeerMessage::CallInvite(invite) => invite,
            other => panic!("expected invite, got {other:?}"),
        }
    }

    fn answer(call_id: &str) -> CallSignal {
        CallSignal::Answer(CallAnswerPayload {
            call_id: call_id.into(),
            version: 0,
            answer: None,
        })
    }

    fn hangup(call_id: &str) -> CallSignal {
        CallSignal::Hangup(CallHangupPayload {
            call_id: call_id.into(),
            version: 0,
            reason: Some(HangupReason::UserHangup),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn answered_call_completes_on_peer_hangup() {
        let mut h = start();
        let invite = invite(&mut h).await;
        assert_eq!(invite.caller, "GSM +15551234567");
        assert_eq!(invite.lifetime_ms, 90_000);
        assert!(invite.call_id.starts_with("call_"));

        h.correlator.dispatch(answer(&invite.call_id));
        assert_eq!(
            h.events.recv().await,
            Some(SessionEvent::Connected { session: 1 })
        );

        h.correlator.dispatch(hangup(&invite.call_id));
        assert_eq!(h.call.await.unwrap(), CallOutcome::Completed);

        // The peer hung up itself, so nothing is sent back.
        assert!(h.outgoing.try_recv().is_err());
        assert!(!h.correlator.is_tracked(&invite.call_id));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_and_hangs_up() {
        let mut h = start();
        let invite = invite(&mut h).await;

        assert_eq!(h.call.await.unwrap(), CallOutcome::TimedOut);
        match next_message(&mut h.outgoing).await {
            PeerMessage::CallHangup(p) => {
                assert_eq!(p.call_id, invite.call_id);
                assert_eq!(p.reason, Some(HangupReason::InviteTimeout));
            }
            other => panic!("expected hangup, got {other:?}"),
        }
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn gsm_hangup_cancels_and_signals_peer() {
        let mut h = start();
        let invite = invite(&mut h).await;

        h.cancel.cancel();
        assert_eq!(h.call.await.unwrap(), CallOutcome::Cancelled);
        assert!(matches!(
            next_message(&mut h.outgoing).await,
            PeerMessage::CallHangup(p)
                if p.call_id == invite.call_id && p.reason == Some(HangupReason::RemoteNetwork)
        ));

        // A late answer is dropped and never reported as connected.
        assert!(!h.correlator.dispatch(answer(&invite.call_id)));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_hangs_up_as_user_hangup() {
        let mut h = start();
        let invite = invite(&mut h).await;

        h.shutdown.cancel();
        assert_eq!(h.call.await.unwrap(), CallOutcome::Cancelled);
        match next_message(&mut h.outgoing).await {
            PeerMessage::CallHangup(p) => {
                assert_eq!(p.call_id, invite.call_id);
                assert_eq!(p.reason, Some(HangupReason::UserHangup));
            }
            other => panic!("expected hangup, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gsm_hangup_interrupts_invite_stuck_on_full_queue() {
        let mut h = start_on(full_channel().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!h.call.is_finished());

        h.cancel.cancel();
        assert_eq!(h.call.await.unwrap(), CallOutcome::Cancelled);
        assert!(h.events.try_recv().is_err());

        // Only the filler is queued: neither the invite nor a hangup went out.
        let mut queued = 0;
        while let Ok(raw) = h.outgoing.try_recv() {
            let envelope: Envelope = serde_json::from_str(&raw).unwrap();
            assert_eq!(envelope.msg_type, "message.text");
            queued += 1;
        }
        assert!(queued > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_decline_is_rejected_without_echo() {
        let mut h = start();
        let invite = invite(&mut h).await;

        h.correlator.dispatch(hangup(&invite.call_id));
        assert_eq!(h.call.await.unwrap(), CallOutcome::Rejected);
        assert!(h.outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn sms_is_sent_as_text_message() {
        let (handle, mut outgoing) = peer::channel();
        let sms = PeerSmsForwarder::new(handle);
        sms.send("SMS from +1555:\nhi".into()).await.unwrap();
        match next_message(&mut outgoing).await {
            PeerMessage::Text(t) => assert_eq!(t.body, "SMS from +1555:\nhi"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sms_fails_instead_of_blocking_on_full_queue() {
        let (handle, _outgoing) = full_channel().await;
        let sms = PeerSmsForwarder::new(handle);
        let started = tokio::time::Instant::now();
        let err = sms.send("x".into()).await.unwrap_err();
        assert_eq!(err.to_string(), "peer queue full");
        assert!(started.elapsed() >= SEND_WAIT);
    }

    #[tokio::test]
    async fn sms_fails_when_peer_link_is_gone() {
        let (handle, outgoing) = peer::channel();
        drop(outgoing);
        let sms = PeerSmsForwarder::new(handle);
        assert!(sms.send("x".into()).await.is_err());
    }
}
