use std::time::Duration;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ModemError {
    /// The framer could not resolve a complete response within the long timeout.
    #[error("no complete response to `{command}` within {after:?}")]
    FramingTimeout { command: String, after: Duration },
    /// The issuer gave up waiting for its result.
    #[error("timed out after {after:?} waiting for `{command}`")]
    CommandTimeout { command: String, after: Duration },
    /// The response did not end in `OK`.
    #[error("`{command}` failed: {response}")]
    Command { command: String, response: String },
    /// The modem is in a state the gateway cannot proceed from.
    #[error("modem state error: {0}")]
    ProtocolState(String),
    #[error("unexpected response to `{command}`: {response}")]
    UnexpectedResponse { command: String, response: String },
    #[error("modem link closed")]
    LinkClosed,
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModemError {
    /// Whether the error ends the engine run, as opposed to failing one
    /// command, call or SMS.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModemError::ProtocolState(_) | ModemError::LinkClosed | ModemError::Io(_)
        )
    }
}
