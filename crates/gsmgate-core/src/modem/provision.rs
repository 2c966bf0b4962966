//! Reset and provisioning state machine.
//!
//! Runs once, after the link has been drained by `ATE` (echo off), and leaves
//! the modem with all URCs routed to our port, the radio freshly restarted,
//! the SIM unlocked and SMS in text mode. Nothing else talks to the modem until
//! it finishes.

use std::fmt;

use tokio::sync::mpsc;
use tokio::time::timeout;

use super::AtTimeouts;
use super::at::{self, NetworkMode, OperatorInfo};
use super::channel::CommandChannel;
use super::urc::Notification;
use crate::error::ModemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProvisionState {
    Draining,
    AtEchoOff,
    UrcRoutingSet,
    RadioOff,
    RadioOn,
    SimLocked,
    SimUnlocking,
    Ready,
    Configured,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What provisioning learned about the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemStatus {
    pub operator: Option<OperatorInfo>,
}

pub struct Provisioner<'a> {
    commands: &'a CommandChannel,
    notifications: &'a mut mpsc::UnboundedReceiver<Notification>,
    sim_pin: Option<&'a str>,
    preferred_network: Option<NetworkMode>,
    timeouts: AtTimeouts,
    state: ProvisionState,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        commands: &'a CommandChannel,
        notifications: &'a mut mpsc::UnboundedReceiver<Notification>,
        timeouts: AtTimeouts,
    ) -> Self {
        Provisioner {
            commands,
            notifications,
            sim_pin: None,
            preferred_network: None,
            timeouts,
            state: ProvisionState::Draining,
        }
    }

    pub fn with_sim_pin(mut self, pin: Option<&'a str>) -> Self {
        self.sim_pin = pin;
        self
    }

    pub fn with_preferred_network(mut self, mode: Option<NetworkMode>) -> Self {
        self.preferred_network = mode;
        self
    }

    fn enter(&mut self, state: ProvisionState) {
        tracing::debug!(from = %self.state, to = %state, "provisioning");
        self.state = state;
    }

    pub async fn run(mut self) -> Result<ModemStatus, ModemError> {
        self.commands.run_ok(at::ATTENTION).await?;
        self.enter(ProvisionState::AtEchoOff);

        self.commands.run_ok(at::URC_ROUTE_ALL).await?;
        self.enter(ProvisionState::UrcRoutingSet);

        // Drop any call left over from a previous run.
        self.commands.run_ok(at::HANGUP).await?;

        self.commands.run_ok(at::RADIO_OFF).await?;
        self.enter(ProvisionState::RadioOff);

        self.commands.run_ok(at::RADIO_ON).await?;
        self.enter(ProvisionState::RadioOn);

        self.await_sim().await?;
        self.enter(ProvisionState::Ready);

        self.commands.run_ok(at::SMS_TEXT_MODE).await?;
        if let Some(mode) = self.preferred_network {
            self.commands.run_ok(&at::set_scan_mode(mode)).await?;
            tracing::info!(mode = %mode, "preferred network mode set");
        }

        let cops = self.commands.run(at::OPERATOR_QUERY).await?;
        let operator = at::parse_operator(&cops);
        match &operator {
            Some(op) => tracing::info!(
                operator = op.name.as_deref().unwrap_or("<none>"),
                technology = op.technology_name(),
                "registered"
            ),
            None => tracing::info!(response = %cops, "operator"),
        }

        self.enter(ProvisionState::Configured);
        Ok(ModemStatus { operator })
    }

    /// Wait for the SIM and phonebook to come up after the radio restart.
    async fn await_sim(&mut self) -> Result<(), ModemError> {
        loop {
            let notification = match timeout(self.timeouts.long, self.notifications.recv()).await
            {
                Ok(Some(n)) => n,
                Ok(None) => return Err(ModemError::LinkClosed),
                Err(_) => {
                    return Err(ModemError::ProtocolState(format!(
                        "no SIM status within {:?} of radio on ({})",
                        self.timeouts.long, self.state
                    )));
                }
            };
            tracing::info!(urc = %notification, "URC during provisioning");

            match notification {
                Notification::SimPin => {
                    self.enter(ProvisionState::SimLocked);
                    self.unlock_sim().await?;
                }
                Notification::PhonebookReady => return Ok(()),
                _ => {}
            }
        }
    }

    async fn unlock_sim(&mut self) -> Result<(), ModemError> {
        let Some(pin) = self.sim_pin else {
            return Err(ModemError::ProtocolState(
                "SIM unlock needed but no PIN configured".into(),
            ));
        };
        self.enter(ProvisionState::SimUnlocking);

        let result = self.commands.run(at::PIN_COUNTERS).await?;
        let counters =
            at::parse_pin_counters(&result).ok_or_else(|| ModemError::UnexpectedResponse {
                command: at::PIN_COUNTERS.into(),
                response: result.text(),
            })?;

        if !counters.unlock_is_safe() {
            return Err(ModemError::ProtocolState(format!(
                "refusing SIM unlock with {}/{} attempts left",
                counters.left, counters.total
            )));
        }

        self.commands.run_ok(&at::enter_pin(pin)).await?;
        tracing::info!(left = counters.left, total = counters.total, "SIM unlocked");
        Ok(())
    }
}
