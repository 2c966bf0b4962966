//! # gsmgate core
//!
//! Protocol engine for a Quectel GSM modem driven over a serial AT link, and
//! the call-session orchestration that relays incoming calls and SMS to a
//! remote signaling peer.
//!
//! - [`modem`]: line framing, command channel, AT vocabulary, provisioning
//! - [`dispatch`]: unsolicited notification routing
//! - [`call`]: call orchestration and per-call-id signal correlation
//! - [`sms`]: stored SMS relay
//! - [`engine`]: wires the tasks together over any async byte stream

pub mod call;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod modem;
pub mod sms;

pub use call::correlator::{CallCorrelator, CorrelationError};
pub use call::forwarder::{
    CallControl, CallForwarder, CallOutcome, IncomingCall, RelayError, SessionEvent, SmsForwarder,
};
pub use engine::{ModemConfig, ModemEngine};
pub use error::ModemError;
pub use modem::AtTimeouts;
pub use modem::at::NetworkMode;
