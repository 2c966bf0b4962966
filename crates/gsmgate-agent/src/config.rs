//! Gateway configuration: an optional TOML file, overridden by CLI flags.

use std::time::Duration;

use anyhow::{Context, bail};
use gsmgate_core::{ModemConfig, NetworkMode};
use serde::Deserialize;

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfigInput {
    pub peer: PeerConfigInput,
    pub modem: ModemConfigInput,
    pub call: CallConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerConfigInput {
    pub url: Option<String>,
    pub token: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModemConfigInput {
    /// AT command tty, e.g. `/dev/ttyUSB2`.
    pub tty: Option<String>,
    pub baud: Option<u32>,
    /// QMI control device, e.g. `/dev/cdc-wdm0`.
    pub device: Option<String>,
    pub sim_pin: Option<String>,
    pub preferred_network: Option<NetworkMode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CallConfigInput {
    /// Seconds to ring the remote peer before giving up.
    pub timeout_s: Option<u64>,
}

/// Values given on the command line. Each one replaces the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub peer_url: Option<String>,
    pub token: Option<String>,
    pub hostname: Option<String>,
    pub modem_tty: Option<String>,
    pub modem_baud: Option<u32>,
    pub modem_dev: Option<String>,
    pub sim_pin: Option<String>,
    pub preferred_network: Option<NetworkMode>,
    pub call_timeout_s: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    pub url: String,
    pub token: Option<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemSettings {
    pub tty: String,
    pub baud: u32,
    pub device: Option<String>,
    pub sim_pin: Option<String>,
    pub preferred_network: Option<NetworkMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub peer: PeerSettings,
    pub modem: ModemSettings,
    pub call_timeout: Duration,
}

impl GatewayConfigInput {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(GatewayConfigInput::default());
        }
        toml::from_str(input).context("invalid config TOML")
    }

    pub fn apply(mut self, o: Overrides) -> Self {
        fn replace<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        replace(&mut self.peer.url, o.peer_url);
        replace(&mut self.peer.token, o.token);
        replace(&mut self.peer.hostname, o.hostname);
        replace(&mut self.modem.tty, o.modem_tty);
        replace(&mut self.modem.baud, o.modem_baud);
        replace(&mut self.modem.device, o.modem_dev);
        replace(&mut self.modem.sim_pin, o.sim_pin);
        replace(&mut self.modem.preferred_network, o.preferred_network);
        replace(&mut self.call.timeout_s, o.call_timeout_s);
        self
    }

    pub fn resolve(self, default_hostname: &str) -> anyhow::Result<GatewayConfig> {
        let url = non_empty(self.peer.url).context("peer URL is required (--peer-url or [peer] url)")?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            bail!("peer URL must be ws:// or wss://, got {url}");
        }

        let tty =
            non_empty(self.modem.tty).context("modem tty is required (--modem-tty or [modem] tty)")?;

        let baud = self.modem.baud.unwrap_or(DEFAULT_BAUD);
        if baud == 0 {
            bail!("modem baud rate must be positive");
        }

        let sim_pin = non_empty(self.modem.sim_pin);
        if let Some(pin) = &sim_pin {
            if !(4..=8).contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
                bail!("SIM PIN must be 4 to 8 digits");
            }
        }

        let call_timeout = match self.call.timeout_s {
            Some(0) => bail!("call timeout must be positive"),
            Some(s) => Duration::from_secs(s),
            None => DEFAULT_CALL_TIMEOUT,
        };

        Ok(GatewayConfig {
            peer: PeerSettings {
                url,
                token: non_empty(self.peer.token),
                hostname: non_empty(self.peer.hostname)
                    .unwrap_or_else(|| default_hostname.to_string()),
            },
            modem: ModemSettings {
                tty,
                baud,
                device: non_empty(self.modem.device),
                sim_pin,
                preferred_network: self.modem.preferred_network,
            },
            call_timeout,
        })
    }
}

impl GatewayConfig {
    pub fn modem_config(&self) -> ModemConfig {
        ModemConfig {
            sim_pin: self.modem.sim_pin.clone(),
            preferred_network: self.modem.preferred_network,
            ..Default::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
