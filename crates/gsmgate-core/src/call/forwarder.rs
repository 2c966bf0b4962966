//! Seams between the modem engine and whatever relays calls and SMS.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type RelayError = Box<dyn Error + Send + Sync>;

/// An incoming GSM call that qualified for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    /// Call index reported by `+CLCC`.
    pub gsm_index: u32,
    pub number: String,
    pub number_type: Option<u16>,
}

impl IncomingCall {
    /// Caller label shown to the remote peer.
    pub fn label(&self) -> String {
        format!("GSM {}", self.number)
    }
}

/// How a forwarded call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Answered remotely, then hung up by either side.
    Completed,
    /// Declined by the remote peer before answering.
    Rejected,
    /// Nobody answered in time.
    TimedOut,
    /// The GSM caller hung up, or the engine is shutting down. Tell the two
    /// apart with [`CallControl::is_shutdown`].
    Cancelled,
    Failed(String),
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Completed => f.write_str("completed"),
            CallOutcome::Rejected => f.write_str("rejected"),
            CallOutcome::TimedOut => f.write_str("timed out"),
            CallOutcome::Cancelled => f.write_str("cancelled"),
            CallOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Events a call session reports back to the dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The remote side answered; the GSM call should be picked up.
    Connected { session: u64 },
    /// The forwarding task finished, cleanup included.
    Ended { session: u64, outcome: CallOutcome },
}

impl SessionEvent {
    pub fn session(&self) -> u64 {
        match self {
            SessionEvent::Connected { session } | SessionEvent::Ended { session, .. } => *session,
        }
    }
}

/// Handle given to a [`CallForwarder`] for one call.
#[derive(Debug, Clone)]
pub struct CallControl {
    session: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl CallControl {
    /// The call is cancelled on its own token, a child of `shutdown`.
    pub fn new(
        session: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: &CancellationToken,
    ) -> Self {
        CallControl {
            session,
            events,
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Report that the remote side answered. Returns `false` when the call
    /// was already reported connected or has been cancelled.
    pub fn connected(&self) -> bool {
        if self.cancel.is_cancelled() || self.connected.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.events
            .send(SessionEvent::Connected {
                session: self.session,
            })
            .is_ok()
    }

    /// Resolves once the GSM side hung up or the engine is stopping.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The whole engine is stopping, not just this call.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token that cancels this call only.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Relays an incoming GSM call to the remote peer.
///
/// `forward` runs in its own task and owns the whole remote side of the call:
/// announcing it, waiting for an answer, and cleaning up. It must return once
/// [`CallControl::cancelled`] resolves, after its own cleanup.
pub trait CallForwarder: Send + Sync + 'static {
    fn forward(
        &self,
        call: IncomingCall,
        control: CallControl,
    ) -> impl Future<Output = CallOutcome> + Send;
}

/// Relays SMS text to the remote peer.
pub trait SmsForwarder: Send + Sync + 'static {
    fn send(&self, text: String) -> impl Future<Output = Result<(), RelayError>> + Send;
}
