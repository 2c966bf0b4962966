//! gsmgate daemon
//!
//! Runs next to a Quectel GSM modem and relays it to a remote peer.
//!
//! - Provisions the modem over its AT tty (reset, SIM unlock, SMS text mode)
//! - Forwards incoming GSM calls to the peer as `call.invite` and answers
//!   the GSM side once the peer accepts
//! - Relays stored SMS as `message.text` and deletes them once sent
//! - Holds a QMI voice client for the whole run when a QMI device is set

mod config;
mod forward;
mod peer;
mod serial;
mod voice;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gsmgate_core::{CallCorrelator, ModemEngine, ModemError, NetworkMode};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::{GatewayConfigInput, Overrides};
use forward::{PeerCallForwarder, PeerSmsForwarder};

/// How long a stopping engine gets to hang up and send its last signals.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// GSM modem to WebSocket peer gateway.
#[derive(Parser, Debug)]
#[command(name = "gsmgate", about = "Relay GSM calls and SMS to a WebSocket peer")]
struct Cli {
    /// TOML config file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer WebSocket URL (ws:// or wss://).
    #[arg(long)]
    peer_url: Option<String>,

    /// Peer access token.
    #[arg(long, env = "GSMGATE_TOKEN")]
    token: Option<String>,

    /// Device hostname override.
    #[arg(long)]
    hostname: Option<String>,

    /// Modem AT command tty.
    #[arg(long)]
    modem_tty: Option<String>,

    /// Serial baud rate.
    #[arg(long)]
    modem_baud: Option<u32>,

    /// QMI control device for the voice client, e.g. /dev/cdc-wdm0.
    #[arg(long)]
    modem_dev: Option<String>,

    /// SIM PIN, used only when the SIM asks for it.
    #[arg(long, env = "GSMGATE_SIM_PIN", hide_env_values = true)]
    sim_pin: Option<String>,

    /// Preferred radio access: auto, gsm, umts or lte.
    #[arg(long)]
    preferred_network: Option<NetworkMode>,

    /// Seconds to ring the peer before giving up on a call.
    #[arg(long)]
    call_timeout: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            peer_url: self.peer_url.clone(),
            token: self.token.clone(),
            hostname: self.hostname.clone(),
            modem_tty: self.modem_tty.clone(),
            modem_baud: self.modem_baud,
            modem_dev: self.modem_dev.clone(),
            sim_pin: self.sim_pin.clone(),
            preferred_network: self.preferred_network,
            call_timeout_s: self.call_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let input = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            GatewayConfigInput::from_toml_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => GatewayConfigInput::default(),
    };
    let default_hostname = gethostname().unwrap_or_else(|| "gsmgate".into());
    let config = input.apply(cli.overrides()).resolve(&default_hostname)?;

    tracing::info!(
        hostname = %config.peer.hostname,
        peer_url = %config.peer.url,
        tty = %config.modem.tty,
        call_timeout_s = config.call_timeout.as_secs(),
        "gsmgate starting"
    );

    // Held until main returns; dropping it releases the CID.
    let _voice = match &config.modem.device {
        Some(device) => Some(voice::QmiVoice::new(device.as_str()).alloc_cid()?),
        None => {
            tracing::warn!("no QMI device configured, call audio will not be routed");
            None
        }
    };

    let stream = serial::open(&config.modem.tty, config.modem.baud)?;

    // ── Peer link ───────────────────────────────────────────────
    let correlator = Arc::new(CallCorrelator::new());
    let (peer_handle, peer_rx) = peer::channel();
    let peer_shutdown = CancellationToken::new();
    let mut peer_task = tokio::spawn(peer::run(
        config.peer.clone(),
        correlator.clone(),
        peer_rx,
        peer_shutdown.clone(),
    ));

    // ── Modem engine ────────────────────────────────────────────
    let call_forwarder = Arc::new(PeerCallForwarder::new(
        peer_handle.clone(),
        correlator,
        config.call_timeout,
    ));
    let sms_forwarder = Arc::new(PeerSmsForwarder::new(peer_handle));
    let engine_shutdown = CancellationToken::new();
    let engine = ModemEngine::new(config.modem_config(), call_forwarder, sms_forwarder)
        .with_shutdown(engine_shutdown.clone());
    let mut engine_task = tokio::spawn(engine.run(stream));

    // ── Shutdown handling ───────────────────────────────────────
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            stop_engine(&engine_shutdown, &mut engine_task).await
        }
        joined = &mut engine_task => engine_result(joined),
        joined = &mut peer_task => {
            let peer_result = match joined {
                Ok(Ok(())) => Err(anyhow::anyhow!("peer link stopped")),
                Ok(Err(e)) => Err(e.context("peer link failed")),
                Err(e) => Err(anyhow::anyhow!("peer link task failed: {e}")),
            };
            if let Err(e) = stop_engine(&engine_shutdown, &mut engine_task).await {
                tracing::warn!(error = %e, "modem engine failed while stopping");
            }
            peer_result
        }
    };

    // The engine is done; let the peer link flush the final hangups.
    peer_shutdown.cancel();
    if !peer_task.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut peer_task).await;
    }

    tracing::info!("gsmgate stopped");
    result
}

async fn stop_engine(
    shutdown: &CancellationToken,
    task: &mut JoinHandle<Result<(), ModemError>>,
) -> anyhow::Result<()> {
    shutdown.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut *task).await {
        Ok(joined) => engine_result(joined),
        Err(_) => {
            tracing::warn!("modem engine did not stop in time");
            task.abort();
            Ok(())
        }
    }
}

fn engine_result(joined: Result<Result<(), ModemError>, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result.context("modem engine failed"),
        Err(e) => Err(anyhow::anyhow!("modem engine task failed: {e}")),
    }
}

fn gethostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
