//! Shared types for the gsmgate GSM gateway.
//!
//! This crate contains:
//! - **Protocol messages**: WebSocket signaling between the gateway and the remote peer
//! - **ID generation**: Prefixed UUIDv7 helpers (`call_`)

pub mod ids;
pub mod protocol;
