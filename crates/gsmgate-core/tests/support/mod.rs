//! Scripted in-memory modem and test forwarders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gsmgate_common::protocol::{CallSignal, CallSignalKind};
use gsmgate_core::{
    CallControl, CallCorrelator, CallForwarder, CallOutcome, IncomingCall, RelayError,
    SmsForwarder,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;

/// Reply to one command: response lines, then URCs printed afterwards.
#[derive(Clone, Default)]
struct Reply {
    lines: Vec<String>,
    then: Vec<String>,
}

/// One message in the fake's SMS storage.
#[derive(Clone)]
struct Stored {
    sender: String,
    body: String,
    read: bool,
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, Reply>,
    log: Vec<String>,
    storage: BTreeMap<u32, Stored>,
}

/// Scripted modem on the far end of an in-memory pipe. Echoes every
/// command, answers from its script, and prints injected URCs between
/// responses. Unscripted commands get `OK`, except SMS listing and delete,
/// which act on a text-mode message store.
#[derive(Clone)]
pub struct FakeModem {
    script: Arc<Mutex<Script>>,
    urc_tx: mpsc::UnboundedSender<String>,
    seen_tx: mpsc::UnboundedSender<String>,
}

pub struct ModemHandle {
    pub modem: FakeModem,
    seen_rx: mpsc::UnboundedReceiver<String>,
}

impl FakeModem {
    /// Returns the engine's end of the link and the handle driving the fake.
    pub fn spawn() -> (DuplexStream, ModemHandle) {
        let (engine_side, modem_side) = duplex(4096);
        let (urc_tx, urc_rx) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let modem = FakeModem {
            script: Arc::new(Mutex::new(Script::default())),
            urc_tx,
            seen_tx,
        };
        tokio::spawn(modem.clone().serve(modem_side, urc_rx));
        (engine_side, ModemHandle { modem, seen_rx })
    }

    /// A modem that boots straight to `PB DONE` after the radio restart.
    pub fn spawn_ready() -> (DuplexStream, ModemHandle) {
        let (link, handle) = Self::spawn();
        handle.modem.on("AT+CFUN=1", &["OK"], &["+CPIN: READY", "PB DONE"]);
        handle
            .modem
            .on("AT+COPS?", &["+COPS: 0,0,\"Test Network\",7", "OK"], &[]);
        (link, handle)
    }

    pub fn on(&self, command: &str, lines: &[&str], then: &[&str]) {
        let reply = Reply {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            then: then.iter().map(|s| s.to_string()).collect(),
        };
        self.lock().replies.insert(command.to_string(), reply);
    }

    /// Store an unread message in slot `index` and announce it with `+CMTI`.
    pub fn deliver_sms(&self, index: u32, sender: &str, body: &str) {
        self.lock().storage.insert(
            index,
            Stored {
                sender: sender.to_string(),
                body: body.to_string(),
                read: false,
            },
        );
        self.urc(&format!("+CMTI: \"SM\",{index}"));
    }

    /// Storage slots currently holding a message.
    pub fn stored(&self) -> Vec<u32> {
        self.lock().storage.keys().copied().collect()
    }

    pub fn urc(&self, line: &str) {
        let _ = self.urc_tx.send(line.to_string());
    }

    /// Every command received so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.lock().log.iter().filter(|c| *c == command).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    async fn serve(self, stream: DuplexStream, mut urc_rx: mpsc::UnboundedReceiver<String>) {
        let (mut rx, mut tx) = tokio::io::split(stream);
        let mut pending = Vec::new();
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                n = rx.read(&mut buf) => {
                    let n = match n {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
                        let command: Vec<u8> = pending.drain(..=pos).collect();
                        let command = String::from_utf8_lossy(&command[..pos]).trim().to_string();
                        if command.is_empty() {
                            continue;
                        }
                        if self.answer(&mut tx, &command).await.is_err() {
                            return;
                        }
                    }
                }
                Some(urc) = urc_rx.recv() => {
                    if tx.write_all(format!("\r\n{urc}\r\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn answer<W: AsyncWrite + Unpin>(
        &self,
        tx: &mut W,
        command: &str,
    ) -> std::io::Result<()> {
        let reply = {
            let mut script = self.lock();
            script.log.push(command.to_string());
            match script.replies.get(command) {
                Some(reply) => reply.clone(),
                None => Reply {
                    lines: script.storage_reply(command),
                    then: Vec::new(),
                },
            }
        };
        let _ = self.seen_tx.send(command.to_string());

        // Echo, then information lines in one block, then the final result.
        let mut out = format!("{command}\r");
        let (info, last) = match reply.lines.split_last() {
            Some((last, info)) if last == "OK" || last == "ERROR" => (info, Some(last)),
            _ => (&reply.lines[..], None),
        };
        if !info.is_empty() {
            out.push_str("\r\n");
            for line in info {
                out.push_str(&format!("{line}\r\n"));
            }
        }
        if let Some(last) = last {
            out.push_str(&format!("\r\n{last}\r\n"));
        }
        for urc in &reply.then {
            out.push_str(&format!("\r\n{urc}\r\n"));
        }
        tx.write_all(out.as_bytes()).await?;
        tx.flush().await
    }
}

impl Script {
    fn storage_reply(&mut self, command: &str) -> Vec<String> {
        let listing = match command {
            "AT+CMGL=\"ALL\"" => Some(true),
            "AT+CMGL" => Some(false),
            _ => None,
        };
        if let Some(all) = listing {
            let mut lines = Vec::new();
            for (index, sms) in self.storage.iter_mut() {
                if sms.read && !all {
                    continue;
                }
                let status = if sms.read { "REC READ" } else { "REC UNREAD" };
                lines.push(format!(
                    "+CMGL: {index},\"{status}\",\"{}\",,\"24/03/01,10:15:00+04\"",
                    sms.sender
                ));
                lines.extend(sms.body.split('\n').map(str::to_string));
                sms.read = true;
            }
            lines.push("OK".into());
            return lines;
        }

        if let Some(index) = command.strip_prefix("AT+CMGD=") {
            return match index.parse().ok().and_then(|i| self.storage.remove(&i)) {
                Some(_) => vec!["OK".into()],
                None => vec!["+CMS ERROR: 321".into(), "ERROR".into()],
            };
        }

        vec!["OK".into()]
    }
}

impl ModemHandle {
    /// Wait until the modem receives `command`, skipping anything else.
    pub async fn expect(&mut self, command: &str) {
        let wait = async {
            while let Some(seen) = self.seen_rx.recv().await {
                if seen == command {
                    return;
                }
            }
            panic!("modem link closed before `{command}`");
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("modem never received `{command}`; log: {:?}", self.modem.log()));
    }
}

// ── Forwarders ──────────────────────────────────────────────────────

/// Call forwarder that signals through a [`CallCorrelator`] under a fixed
/// call-id, the way a real peer link would.
pub struct CorrelatedForwarder {
    pub correlator: Arc<CallCorrelator>,
    calls_tx: mpsc::UnboundedSender<IncomingCall>,
    outcomes_tx: mpsc::UnboundedSender<CallOutcome>,
    counter: Mutex<u32>,
}

pub struct ForwarderHandle {
    pub correlator: Arc<CallCorrelator>,
    pub calls: mpsc::UnboundedReceiver<IncomingCall>,
    pub outcomes: mpsc::UnboundedReceiver<CallOutcome>,
}

impl CorrelatedForwarder {
    pub fn new() -> (Arc<Self>, ForwarderHandle) {
        let correlator = Arc::new(CallCorrelator::new());
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let forwarder = Arc::new(CorrelatedForwarder {
            correlator: correlator.clone(),
            calls_tx,
            outcomes_tx,
            counter: Mutex::new(0),
        });
        (
            forwarder,
            ForwarderHandle {
                correlator,
                calls,
                outcomes,
            },
        )
    }
}

/// Call-id of the `n`th forwarded call, starting at 1.
pub fn call_id(n: u32) -> String {
    format!("call_test_{n}")
}

impl CallForwarder for CorrelatedForwarder {
    async fn forward(&self, call: IncomingCall, control: CallControl) -> CallOutcome {
        let id = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            call_id(*counter)
        };
        self.correlator.prepare(&id);
        let _ = self.calls_tx.send(call);

        let outcome = tokio::select! {
            _ = control.cancelled() => CallOutcome::Cancelled,
            signal = self.correlator.await_answer_or_hangup(&id, Duration::from_secs(90)) => match signal {
                Ok(CallSignal::Answer(_)) => {
                    control.connected();
                    tokio::select! {
                        _ = control.cancelled() => CallOutcome::Cancelled,
                        _ = self.correlator.await_event(CallSignalKind::Hangup, &id) => CallOutcome::Completed,
                    }
                }
                Ok(_) => CallOutcome::Rejected,
                Err(_) => CallOutcome::TimedOut,
            },
        };

        self.correlator.discard(&id);
        let _ = self.outcomes_tx.send(outcome.clone());
        outcome
    }
}

/// SMS forwarder that records relayed text and can be told to fail.
#[derive(Default)]
pub struct RecordingSms {
    pub sent: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl RecordingSms {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl SmsForwarder for RecordingSms {
    async fn send(&self, text: String) -> Result<(), RelayError> {
        if *self.fail.lock().unwrap() {
            return Err("peer unavailable".into());
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

/// Call forwarder for tests that never expect a call.
pub struct NoCalls;

impl CallForwarder for NoCalls {
    async fn forward(&self, call: IncomingCall, _control: CallControl) -> CallOutcome {
        panic!("unexpected call from {}", call.number);
    }
}
