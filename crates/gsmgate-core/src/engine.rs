//! Engine runner: wires the reader, link and dispatcher tasks together over
//! any duplex byte stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::call::forwarder::{CallForwarder, SmsForwarder};
use crate::dispatch::Dispatcher;
use crate::error::ModemError;
use crate::modem::at::NetworkMode;
use crate::modem::channel::CommandChannel;
use crate::modem::provision::Provisioner;
use crate::modem::{AtTimeouts, link};

/// Queue depth between the line reader and the link task.
const LINE_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct ModemConfig {
    pub sim_pin: Option<String>,
    pub preferred_network: Option<NetworkMode>,
    pub timeouts: AtTimeouts,
}

pub struct ModemEngine<C, S> {
    config: ModemConfig,
    call_forwarder: Arc<C>,
    sms_forwarder: Arc<S>,
    shutdown: CancellationToken,
}

impl<C: CallForwarder, S: SmsForwarder> ModemEngine<C, S> {
    pub fn new(config: ModemConfig, call_forwarder: Arc<C>, sms_forwarder: Arc<S>) -> Self {
        ModemEngine {
            config,
            call_forwarder,
            sms_forwarder,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the engine when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Reset and provision the modem, then dispatch notifications until
    /// shutdown or a fatal error.
    pub async fn run<T>(self, stream: T) -> Result<(), ModemError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let timeouts = self.config.timeouts;
        let (mut reader, mut writer) = tokio::io::split(stream);

        link::reset_at(&mut reader, &mut writer, timeouts).await?;
        tracing::info!("AT interface attached, resetting modem");

        let (lines_tx, lines_rx) = mpsc::channel(LINE_QUEUE);
        let (requests_tx, requests_rx) = mpsc::channel(COMMAND_QUEUE);
        let (notifications_tx, mut notifications_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(link::read_lines(reader, lines_tx));
        let mut link_task = tokio::spawn(link::run(
            writer,
            lines_rx,
            requests_rx,
            notifications_tx,
            timeouts,
        ));

        let commands = CommandChannel::new(requests_tx, timeouts.long);

        let session = async {
            let provision = Provisioner::new(&commands, &mut notifications_rx, timeouts)
                .with_sim_pin(self.config.sim_pin.as_deref())
                .with_preferred_network(self.config.preferred_network)
                .run();
            let status = tokio::select! {
                status = provision => status?,
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown during provisioning");
                    return Ok(());
                }
            };
            tracing::info!(
                operator = status.operator.as_ref().and_then(|o| o.name.as_deref()).unwrap_or("<none>"),
                "modem ready"
            );

            // Observes the shutdown token itself so the active call is torn
            // down before it returns.
            Dispatcher::new(
                commands.clone(),
                notifications_rx,
                self.call_forwarder.clone(),
                self.sms_forwarder.clone(),
                self.shutdown.clone(),
            )
            .run()
            .await
        };

        let result = tokio::select! {
            result = session => result,
            joined = &mut link_task => match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(ModemError::LinkClosed),
                Err(e) => Err(ModemError::ProtocolState(format!("link task failed: {e}"))),
            },
        };

        reader_task.abort();
        link_task.abort();
        match &result {
            Ok(()) => tracing::info!("modem engine stopped"),
            Err(e) => tracing::error!(error = %e, "modem engine failed"),
        }
        result
    }
}
