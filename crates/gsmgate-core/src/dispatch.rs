//! Notification dispatcher: the main loop once the modem is ready.
//!
//! Handles one notification at a time, in the order the modem printed them,
//! interleaved with the session events of the active call.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::call::forwarder::{CallForwarder, SessionEvent, SmsForwarder};
use crate::call::orchestrator::CallOrchestrator;
use crate::error::ModemError;
use crate::modem::channel::CommandChannel;
use crate::modem::urc::Notification;
use crate::sms::SmsRelay;

pub struct Dispatcher<C, S> {
    commands: CommandChannel,
    notifications: mpsc::UnboundedReceiver<Notification>,
    calls: CallOrchestrator<C>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    sms: SmsRelay<S>,
    shutdown: CancellationToken,
}

impl<C: CallForwarder, S: SmsForwarder> Dispatcher<C, S> {
    pub fn new(
        commands: CommandChannel,
        notifications: mpsc::UnboundedReceiver<Notification>,
        call_forwarder: Arc<C>,
        sms_forwarder: Arc<S>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, session_events) = mpsc::unbounded_channel();
        Dispatcher {
            calls: CallOrchestrator::new(call_forwarder, events_tx, shutdown.child_token()),
            commands,
            notifications,
            session_events,
            sms: SmsRelay::new(sms_forwarder),
            shutdown,
        }
    }

    /// Run until shutdown or a fatal error. The active call, if any, is torn
    /// down before returning.
    pub async fn run(mut self) -> Result<(), ModemError> {
        let result = self.run_loop().await;
        self.calls.shutdown(&self.commands).await;
        result
    }

    async fn run_loop(&mut self) -> Result<(), ModemError> {
        loop {
            let step = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return Ok(()),

                notification = self.notifications.recv() => match notification {
                    Some(n) => self.on_notification(n).await,
                    None => return Err(ModemError::LinkClosed),
                },

                // The orchestrator holds a sender, so this never yields None.
                Some(event) = self.session_events.recv() => {
                    self.calls.on_event(event, &self.commands).await
                }
            };

            if let Err(e) = step {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!(error = %e, "notification handling failed");
            }
        }
    }

    async fn on_notification(&mut self, notification: Notification) -> Result<(), ModemError> {
        tracing::info!(urc = %notification, "URC");
        match notification {
            Notification::Ring => {
                if self.calls.in_call() {
                    tracing::debug!("RING during active call");
                    Ok(())
                } else {
                    self.calls.on_ring(&self.commands).await
                }
            }
            Notification::NoCarrier => {
                if self.calls.in_call() {
                    self.calls.on_no_carrier();
                }
                Ok(())
            }
            Notification::NewSms { .. } => {
                let relayed = self.sms.relay_stored(&self.commands).await?;
                tracing::debug!(relayed, "SMS relay done");
                Ok(())
            }
            Notification::SimNotReady => Err(ModemError::ProtocolState(
                "SIM reported NOT READY".into(),
            )),
            other => {
                tracing::warn!(urc = %other, "unhandled URC");
                Ok(())
            }
        }
    }
}
