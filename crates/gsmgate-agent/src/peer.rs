//! WebSocket signaling link to the remote peer.
//!
//! Handles:
//! - Connection with exponential backoff reconnect
//! - Authentication (`auth.login`)
//! - Incoming call signaling, routed to the [`CallCorrelator`] by call-id
//! - Outgoing messages queued by the call and SMS forwarders

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use gsmgate_common::protocol::{AuthLoginPayload, Envelope, PeerMessage};
use gsmgate_core::CallCorrelator;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::PeerSettings;

const OUTGOING_QUEUE: usize = 128;

/// Cloneable sender for messages to the peer. Messages queue while the link
/// is reconnecting.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<String>,
}

pub fn channel() -> (PeerHandle, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(OUTGOING_QUEUE);
    (PeerHandle { tx }, rx)
}

impl PeerHandle {
    /// Queue a message, waiting at most `wait` for room while the link is
    /// down and the queue is full.
    pub async fn send(&self, message: &PeerMessage, wait: Duration) -> anyhow::Result<()> {
        let envelope = message.to_envelope()?;
        let json = serde_json::to_string(&envelope)?;
        self.tx.send_timeout(json, wait).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => anyhow::anyhow!("peer queue full"),
            SendTimeoutError::Closed(_) => anyhow::anyhow!("peer link stopped"),
        })
    }
}

/// Run the peer link: connect, authenticate, then pump messages both ways.
/// Reconnects on failure with exponential backoff until `shutdown`.
pub async fn run(
    settings: PeerSettings,
    correlator: Arc<CallCorrelator>,
    mut outgoing_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    loop {
        tracing::info!(url = %settings.url, has_token = settings.token.is_some(), "connecting to peer");

        match connect_and_run(&settings, &correlator, &mut outgoing_rx, &shutdown).await {
            Ok(()) => {
                tracing::info!("peer connection closed cleanly");
                backoff = Duration::from_secs(1);
            }
            Err(e) => tracing::warn!(error = %e, "peer connection failed"),
        }

        if shutdown.is_cancelled() || outgoing_rx.is_closed() {
            return Ok(());
        }

        tracing::info!(backoff_s = backoff.as_secs(), "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn connect_and_run(
    settings: &PeerSettings,
    correlator: &CallCorrelator,
    outgoing_rx: &mut mpsc::Receiver<String>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let (ws, _response) = tokio_tungstenite::connect_async(settings.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", settings.url))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    tracing::info!("WebSocket connected");

    // ── Authenticate ────────────────────────────────────────────
    let login = PeerMessage::AuthLogin(AuthLoginPayload {
        token: settings.token.clone(),
        gateway_version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: settings.hostname.clone(),
    });
    let json = serde_json::to_string(&login.to_envelope()?)?;
    ws_tx.send(Message::Text(json.into())).await?;

    let response = match ws_rx.next().await {
        Some(Ok(Message::Text(text))) => {
            let envelope: Envelope = serde_json::from_str(&text)?;
            PeerMessage::from_envelope(&envelope)?
        }
        Some(Ok(Message::Close(_))) | None => anyhow::bail!("connection closed during auth"),
        Some(Err(e)) => anyhow::bail!("WebSocket error during auth: {e}"),
        _ => anyhow::bail!("unexpected message type during auth"),
    };

    let auth = match response {
        PeerMessage::AuthLoginResponse(auth) => auth,
        other => anyhow::bail!("expected auth.login.response, got {}", other.msg_type()),
    };
    if !auth.success {
        let err = auth.error.unwrap_or_default();
        anyhow::bail!("authentication failed: {err}");
    }
    tracing::info!(peer_id = auth.peer_id.as_deref().unwrap_or("-"), "authenticated");

    // ── Message loop ────────────────────────────────────────────
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_peer_message(correlator, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("peer closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read error");
                        break;
                    }
                    _ => {} // Ping/Pong handled by tungstenite
                }
            }

            msg = outgoing_rx.recv() => {
                match msg {
                    Some(text) => ws_tx.send(Message::Text(text.into())).await?,
                    // Every handle dropped: nothing left to relay.
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            _ = shutdown.cancelled() => {
                tracing::info!("shutdown signal received, closing WebSocket");
                // Flush what the call cleanup queued (hangups) before closing.
                while let Ok(text) = outgoing_rx.try_recv() {
                    let _ = ws_tx.send(Message::Text(text.into())).await;
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}

/// Handle one text frame from the peer.
pub(crate) fn handle_peer_message(correlator: &CallCorrelator, raw: &str) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("invalid message from peer: {e}");
            return;
        }
    };

    let message = match PeerMessage::from_envelope(&envelope) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(msg_type = %envelope.msg_type, error = %e, "unusable message from peer");
            return;
        }
    };

    match message.into_call_signal() {
        Ok(signal) => {
            correlator.dispatch(signal);
        }
        Err(PeerMessage::Text(text)) => {
            tracing::info!(
                sender = text.sender.as_deref().unwrap_or("-"),
                body = %text.body,
                "text from peer"
            );
        }
        Err(other) => {
            tracing::debug!(msg_type = other.msg_type(), "ignoring peer message");
        }
    }
}
