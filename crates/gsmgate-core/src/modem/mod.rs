//! # Modem protocol layer
//!
//! Turns the serial byte stream into command results and classified
//! notifications, and drives the modem from power-on to ready.

pub mod at;
pub mod channel;
pub mod framer;
pub(crate) mod link;
pub mod provision;
pub mod urc;

use std::time::Duration;

/// Timing used to frame AT responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtTimeouts {
    /// Quiet period after which a response is probed for completion.
    pub short: Duration,
    /// Settle time used while draining the link at startup.
    pub medium: Duration,
    /// Upper bound for a single command and for each provisioning wait.
    pub long: Duration,
}

impl Default for AtTimeouts {
    fn default() -> Self {
        AtTimeouts {
            short: Duration::from_millis(200),
            medium: Duration::from_millis(500),
            long: Duration::from_secs(5),
        }
    }
}
