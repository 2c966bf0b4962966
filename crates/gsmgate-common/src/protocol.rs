//! WebSocket signaling messages between the gateway and the remote peer.
//!
//! All messages are JSON-encoded and follow a common envelope format. Call
//! signaling payloads carry the `call_id` they belong to; the gateway uses it
//! to route answers and hangups to the call in progress.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Signaling version announced in call payloads.
pub const CALL_VERSION: u32 = 0;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

// ── Envelope ────────────────────────────────────────────────────────

/// The outer envelope for all WebSocket messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID (UUIDv7, time-ordered).
    pub id: String,
    /// Message type (dotted namespace, e.g. "call.invite").
    #[serde(rename = "type")]
    pub msg_type: String,
    /// ISO 8601 timestamp.
    pub ts: DateTime<Utc>,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope with a fresh UUIDv7 and current timestamp.
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: Uuid::now_v7().to_string(),
            msg_type: msg_type.into(),
            ts: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse the payload into a concrete type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ── Auth ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLoginPayload {
    pub token: Option<String>,
    pub gateway_version: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLoginResponsePayload {
    pub success: bool,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Call signaling ──────────────────────────────────────────────────

/// An SDP offer or answer, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInvitePayload {
    pub call_id: String,
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u32,
    /// How long the invite stays valid, in milliseconds.
    pub lifetime_ms: u64,
    /// Display label of the caller, e.g. `GSM +15551234567`.
    pub caller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAnswerPayload {
    pub call_id: String,
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallCandidatesPayload {
    pub call_id: String,
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u32,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHangupPayload {
    pub call_id: String,
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<HangupReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// Hung up on purpose, or the gateway is shutting down.
    UserHangup,
    InviteTimeout,
    /// The GSM side dropped the call.
    RemoteNetwork,
    /// Anything else, including reasons this gateway does not know.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessagePayload {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Some peers send `version` as a string (`"0"`) despite the schema saying
/// integer. Accept both.
fn lenient_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Int(u32),
        Str(String),
    }

    match Version::deserialize(deserializer)? {
        Version::Int(v) => Ok(v),
        Version::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ── Tagged messages ─────────────────────────────────────────────────

/// All message types exchanged with the remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PeerMessage {
    #[serde(rename = "auth.login")]
    AuthLogin(AuthLoginPayload),

    #[serde(rename = "auth.login.response")]
    AuthLoginResponse(AuthLoginResponsePayload),

    #[serde(rename = "call.invite")]
    CallInvite(CallInvitePayload),

    #[serde(rename = "call.answer")]
    CallAnswer(CallAnswerPayload),

    #[serde(rename = "call.candidates")]
    CallCandidates(CallCandidatesPayload),

    #[serde(rename = "call.hangup")]
    CallHangup(CallHangupPayload),

    /// Plain text message (relayed SMS, or text typed by the peer).
    #[serde(rename = "message.text")]
    Text(TextMessagePayload),
}

impl PeerMessage {
    /// Wire name of this message type.
    pub fn msg_type(&self) -> &'static str {
        match self {
            PeerMessage::AuthLogin(_) => "auth.login",
            PeerMessage::AuthLoginResponse(_) => "auth.login.response",
            PeerMessage::CallInvite(_) => "call.invite",
            PeerMessage::CallAnswer(_) => "call.answer",
            PeerMessage::CallCandidates(_) => "call.candidates",
            PeerMessage::CallHangup(_) => "call.hangup",
            PeerMessage::Text(_) => "message.text",
        }
    }

    /// Wrap the message in a fresh envelope.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        match self {
            PeerMessage::AuthLogin(p) => Envelope::new(self.msg_type(), p),
            PeerMessage::AuthLoginResponse(p) => Envelope::new(self.msg_type(), p),
            PeerMessage::CallInvite(p) => Envelope::new(self.msg_type(), p),
            PeerMessage::CallAnswer(p) => Envelope::new(self.msg_type(), p),
            PeerMessage::CallCandidates(p) => Envelope::new(self.msg_type(), p),
            PeerMessage::CallHangup(p) => Envelope::new(self.msg_type(), p),
            PeerMessage::Text(p) => Envelope::new(self.msg_type(), p),
        }
    }

    /// Decode an envelope by its `type` field.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let msg = match envelope.msg_type.as_str() {
            "auth.login" => PeerMessage::AuthLogin(envelope.parse_payload()?),
            "auth.login.response" => PeerMessage::AuthLoginResponse(envelope.parse_payload()?),
            "call.invite" => PeerMessage::CallInvite(envelope.parse_payload()?),
            "call.answer" => PeerMessage::CallAnswer(envelope.parse_payload()?),
            "call.candidates" => PeerMessage::CallCandidates(envelope.parse_payload()?),
            "call.hangup" => PeerMessage::CallHangup(envelope.parse_payload()?),
            "message.text" => PeerMessage::Text(envelope.parse_payload()?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }

    /// Split off call signaling; other messages are handed back unchanged.
    pub fn into_call_signal(self) -> Result<CallSignal, PeerMessage> {
        match self {
            PeerMessage::CallInvite(p) => Ok(CallSignal::Invite(p)),
            PeerMessage::CallAnswer(p) => Ok(CallSignal::Answer(p)),
            PeerMessage::CallCandidates(p) => Ok(CallSignal::Candidates(p)),
            PeerMessage::CallHangup(p) => Ok(CallSignal::Hangup(p)),
            other => Err(other),
        }
    }
}

// ── Call signal view ────────────────────────────────────────────────

/// Kind of a call signaling event, used as the correlation queue key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSignalKind {
    Invite,
    Answer,
    Candidates,
    Hangup,
}

impl CallSignalKind {
    pub const ALL: [CallSignalKind; 4] = [
        CallSignalKind::Invite,
        CallSignalKind::Answer,
        CallSignalKind::Candidates,
        CallSignalKind::Hangup,
    ];
}

impl fmt::Display for CallSignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallSignalKind::Invite => "invite",
            CallSignalKind::Answer => "answer",
            CallSignalKind::Candidates => "candidates",
            CallSignalKind::Hangup => "hangup",
        };
        f.write_str(s)
    }
}

/// A call signaling event received from (or echoed back by) the peer.
#[derive(Debug, Clone)]
pub enum CallSignal {
    Invite(CallInvitePayload),
    Answer(CallAnswerPayload),
    Candidates(CallCandidatesPayload),
    Hangup(CallHangupPayload),
}

impl CallSignal {
    pub fn call_id(&self) -> &str {
        match self {
            CallSignal::Invite(p) => &p.call_id,
            CallSignal::Answer(p) => &p.call_id,
            CallSignal::Candidates(p) => &p.call_id,
            CallSignal::Hangup(p) => &p.call_id,
        }
    }

    pub fn kind(&self) -> CallSignalKind {
        match self {
            CallSignal::Invite(_) => CallSignalKind::Invite,
            CallSignal::Answer(_) => CallSignalKind::Answer,
            CallSignal::Candidates(_) => CallSignalKind::Candidates,
            CallSignal::Hangup(_) => CallSignalKind::Hangup,
        }
    }
}
