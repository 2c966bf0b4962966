//! AT command vocabulary and response parsers for Quectel modems.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::channel::CommandResult;

pub const ATTENTION: &str = "AT";
/// Route every URC to the port the gateway listens on.
pub const URC_ROUTE_ALL: &str = "AT+QURCCFG=\"urcport\",\"all\"";
pub const HANGUP: &str = "ATH0";
pub const ANSWER: &str = "ATA";
pub const RADIO_OFF: &str = "AT+CFUN=0";
pub const RADIO_ON: &str = "AT+CFUN=1";
pub const SMS_TEXT_MODE: &str = "AT+CMGF=1";
pub const OPERATOR_QUERY: &str = "AT+COPS?";
pub const PIN_COUNTERS: &str = "AT+QPINC?";
pub const LIST_CALLS: &str = "AT+CLCC";
/// Read and unread alike: listing marks unread messages read, and one that
/// failed to relay must show up again.
pub const LIST_SMS: &str = "AT+CMGL=\"ALL\"";

/// Raw bytes written before framing starts: a fresh line, then `ATE`, which
/// is `ATE0` and turns command echo off.
pub(crate) const ECHO_RESET: &[u8] = b"\rATE\r";

pub fn enter_pin(pin: &str) -> String {
    format!("AT+CPIN={pin}")
}

pub fn delete_sms(index: u32) -> String {
    format!("AT+CMGD={index}")
}

pub fn set_scan_mode(mode: NetworkMode) -> String {
    format!("AT+QCFG=\"nwscanmode\",{}", mode.scan_mode())
}

/// Mask secrets before a command reaches logs or errors.
pub fn redact(command: &str) -> Cow<'_, str> {
    match command.strip_prefix("AT+CPIN=") {
        Some(_) => Cow::Borrowed("AT+CPIN=****"),
        None => Cow::Borrowed(command),
    }
}

/// Split the parameter part of an information response on commas,
/// honouring double quotes. Quotes are stripped from the returned fields.
pub fn split_fields(params: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in params.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Parameters of an information line with the given prefix, e.g. `+CLCC:`.
fn params<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).map(str::trim_start)
}

// ── Call list (+CLCC) ───────────────────────────────────────────────

pub const DIR_MOBILE_TERMINATED: u8 = 1;
pub const STATE_INCOMING: u8 = 4;
pub const MODE_VOICE: u8 = 0;

/// One row of `AT+CLCC`: `idx,dir,state,mode,multiparty,number,type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRow {
    pub index: u32,
    pub direction: u8,
    pub state: u8,
    pub mode: u8,
    pub multiparty: bool,
    pub number: String,
    pub number_type: Option<u16>,
}

impl CallRow {
    pub fn parse(line: &str) -> Option<CallRow> {
        let fields = split_fields(params(line, "+CLCC:")?);
        if fields.len() < 6 {
            return None;
        }
        Some(CallRow {
            index: fields[0].parse().ok()?,
            direction: fields[1].parse().ok()?,
            state: fields[2].parse().ok()?,
            mode: fields[3].parse().ok()?,
            multiparty: fields[4] == "1",
            number: fields[5].clone(),
            number_type: fields.get(6).and_then(|t| t.parse().ok()),
        })
    }

    /// Voice, mobile-terminated, still alerting.
    pub fn is_incoming_voice(&self) -> bool {
        self.mode == MODE_VOICE
            && self.direction == DIR_MOBILE_TERMINATED
            && self.state == STATE_INCOMING
    }
}

/// Pick the incoming voice call out of an `AT+CLCC` result. Other rows are
/// logged and skipped.
pub fn select_incoming(result: &CommandResult) -> Option<CallRow> {
    for line in result.body().iter().filter(|l| l.starts_with("+CLCC")) {
        match CallRow::parse(line) {
            Some(row) if row.is_incoming_voice() => return Some(row),
            Some(row) => tracing::warn!(
                index = row.index,
                direction = row.direction,
                state = row.state,
                mode = row.mode,
                number = %row.number,
                "ignoring call row that is not an incoming voice call"
            ),
            None => tracing::warn!(line = %line, "unparseable call row"),
        }
    }
    None
}

// ── PIN retry counters (+QPINC) ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCounters {
    pub left: u32,
    pub total: u32,
}

impl PinCounters {
    /// Unlocking is only attempted when at most one attempt has been used,
    /// so a wrong PIN can never run the SIM into PUK lock.
    pub fn unlock_is_safe(&self) -> bool {
        self.left.saturating_add(1) >= self.total
    }
}

/// Parse the `"SC"` counters out of `+QPINC: "SC",<left>,<total>`.
pub fn parse_pin_counters(result: &CommandResult) -> Option<PinCounters> {
    result.body().iter().find_map(|line| {
        let fields = split_fields(params(line, "+QPINC:")?);
        if fields.first().map(String::as_str) != Some("SC") || fields.len() < 3 {
            return None;
        }
        Some(PinCounters {
            left: fields[1].parse().ok()?,
            total: fields[2].parse().ok()?,
        })
    })
}

// ── Operator (+COPS?) ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo {
    pub mode: u8,
    pub name: Option<String>,
    pub access_technology: Option<u8>,
}

impl OperatorInfo {
    pub fn technology_name(&self) -> &'static str {
        match self.access_technology {
            Some(0) => "GSM",
            Some(2) => "UTRAN",
            Some(3) => "GSM/EGPRS",
            Some(4) | Some(5) | Some(6) => "HSPA",
            Some(7) => "LTE",
            Some(_) => "other",
            None => "unknown",
        }
    }
}

pub fn parse_operator(result: &CommandResult) -> Option<OperatorInfo> {
    result.body().iter().find_map(|line| {
        let fields = split_fields(params(line, "+COPS:")?);
        Some(OperatorInfo {
            mode: fields.first()?.parse().ok()?,
            name: fields.get(2).filter(|n| !n.is_empty()).cloned(),
            access_technology: fields.get(3).and_then(|t| t.parse().ok()),
        })
    })
}

// ── Stored messages (+CMGL, text mode) ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSms {
    pub index: u32,
    pub status: String,
    pub sender: String,
    pub timestamp: Option<String>,
    pub body: String,
}

impl StoredSms {
    /// Text relayed to the peer.
    pub fn relay_text(&self) -> String {
        match &self.timestamp {
            Some(ts) => format!("SMS from {} ({}):\n{}", self.sender, ts, self.body),
            None => format!("SMS from {}:\n{}", self.sender, self.body),
        }
    }
}

/// Parse a text-mode listing: a `+CMGL: <index>,<stat>,<oa>,[<alpha>],[<scts>]`
/// header followed by the message body lines.
pub fn parse_sms_list(result: &CommandResult) -> Vec<StoredSms> {
    let mut messages: Vec<StoredSms> = Vec::new();

    for line in result.body() {
        if let Some(p) = params(line, "+CMGL:") {
            let fields = split_fields(p);
            let Some(index) = fields.first().and_then(|i| i.parse().ok()) else {
                tracing::warn!(line = %line, "unparseable SMS header");
                continue;
            };
            let timestamp = fields.get(4).filter(|ts| !ts.is_empty()).cloned();
            messages.push(StoredSms {
                index,
                status: fields.get(1).cloned().unwrap_or_default(),
                sender: fields.get(2).cloned().unwrap_or_default(),
                timestamp,
                body: String::new(),
            });
        } else if let Some(current) = messages.last_mut() {
            if line.is_empty() && current.body.is_empty() {
                continue;
            }
            if !current.body.is_empty() {
                current.body.push('\n');
            }
            current.body.push_str(line);
        }
    }
    // Blank lines separate the last body from the terminator.
    for sms in &mut messages {
        let end = sms.body.trim_end_matches('\n').len();
        sms.body.truncate(end);
    }
    messages
}

// ── Network scan mode ───────────────────────────────────────────────

/// Preferred radio access technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Auto,
    Gsm,
    Umts,
    Lte,
}

impl NetworkMode {
    /// Value of `AT+QCFG="nwscanmode"`.
    pub fn scan_mode(self) -> u8 {
        match self {
            NetworkMode::Auto => 0,
            NetworkMode::Gsm => 1,
            NetworkMode::Umts => 2,
            NetworkMode::Lte => 3,
        }
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(NetworkMode::Auto),
            "gsm" => Ok(NetworkMode::Gsm),
            "umts" => Ok(NetworkMode::Umts),
            "lte" => Ok(NetworkMode::Lte),
            other => Err(format!("unknown network mode '{other}' (auto, gsm, umts, lte)")),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkMode::Auto => "auto",
            NetworkMode::Gsm => "gsm",
            NetworkMode::Umts => "umts",
            NetworkMode::Lte => "lte",
        };
        f.write_str(s)
    }
}
