//! Unsolicited result codes.

use std::fmt;

use super::at::split_fields;

/// One unsolicited line, classified once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Ring,
    NoCarrier,
    /// `+CMTI: <mem>,<index>`
    NewSms { storage: String, index: Option<u32> },
    SimPin,
    SimNotReady,
    SimReady,
    PhonebookReady,
    Unknown(String),
}

impl Notification {
    pub fn classify(line: &str) -> Notification {
        if line == "RING" {
            Notification::Ring
        } else if line.contains("NO CARRIER") {
            Notification::NoCarrier
        } else if let Some(pos) = line.find("+CMTI:") {
            let fields = split_fields(line[pos + "+CMTI:".len()..].trim());
            Notification::NewSms {
                storage: fields.first().cloned().unwrap_or_default(),
                index: fields.get(1).and_then(|i| i.parse().ok()),
            }
        } else if line.contains("+CPIN: SIM PIN") {
            Notification::SimPin
        } else if line.contains("+CPIN: NOT READY") {
            Notification::SimNotReady
        } else if line.contains("+CPIN: READY") {
            Notification::SimReady
        } else if line.contains("PB DONE") {
            Notification::PhonebookReady
        } else {
            Notification::Unknown(line.to_string())
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Ring => f.write_str("RING"),
            Notification::NoCarrier => f.write_str("NO CARRIER"),
            Notification::NewSms { storage, index } => match index {
                Some(i) => write!(f, "+CMTI: \"{storage}\",{i}"),
                None => write!(f, "+CMTI: \"{storage}\""),
            },
            Notification::SimPin => f.write_str("+CPIN: SIM PIN"),
            Notification::SimNotReady => f.write_str("+CPIN: NOT READY"),
            Notification::SimReady => f.write_str("+CPIN: READY"),
            Notification::PhonebookReady => f.write_str("PB DONE"),
            Notification::Unknown(line) => f.write_str(line),
        }
    }
}
