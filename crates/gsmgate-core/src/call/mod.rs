//! Call-session orchestration.
//!
//! The [`orchestrator`] owns the GSM side of at most one call. The
//! [`forwarder`] traits are the seam to whatever relays the call remotely,
//! and the [`correlator`] matches the remote side's asynchronous signaling
//! to the call it belongs to.

pub mod correlator;
pub mod forwarder;
pub mod orchestrator;
