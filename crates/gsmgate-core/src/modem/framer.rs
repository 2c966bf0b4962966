//! Line framer: splits the modem's line stream into command results and
//! unsolicited notifications.
//!
//! The modem does not frame its output: a response is a run of lines ending
//! in `OK`/`ERROR`, and notifications can arrive at any time, including in
//! the middle of a response. The framer is a pure state machine; the link
//! task feeds it lines and quiet-period wakeups and performs whatever I/O it
//! asks for.
//!
//! ```text
//!   Idle ──echo──▶ Collecting ──quiet──▶ AwaitProbeEcho ──"AT"──▶ AwaitProbeStatus
//!    ▲                 │  ▲                  │                        │
//!    └──OK/ERROR───────┘  └──other line──────┴────────other line──────┘
//! ```
//!
//! When a response goes quiet without a terminator the framer writes a bare
//! `AT`. Its echo followed by `OK` proves the previous response is over.
//! The modem answers in order, so a terminator seen before the probe's echo
//! still belongs to the command; the probe's reply then arrives after it and
//! is discarded. Everything is bounded by the long timeout measured from
//! command issue.

use tokio::time::Instant;

use super::AtTimeouts;
use super::at;
use super::channel::{CommandResult, Status};
use crate::error::ModemError;

/// Probe written when a response goes quiet.
pub(crate) const PROBE: &str = "AT";

/// What the link task must do after feeding the framer.
#[derive(Debug)]
pub enum FramerOutput {
    /// An unsolicited line, to be classified and dispatched.
    Notification(String),
    /// The outstanding command resolved.
    Completed(CommandResult),
    /// The outstanding command could not be framed.
    Failed(ModemError),
    /// Write [`PROBE`] to the modem.
    SendProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the echo of the outstanding command, or nothing outstanding.
    Idle,
    Collecting,
    AwaitProbeEcho,
    AwaitProbeStatus,
}

#[derive(Debug)]
struct Outstanding {
    command: String,
    issued_at: Instant,
    /// The modem echoed the command. Decides the shape of a probe reply.
    echoed: bool,
    lines: Vec<String>,
}

#[derive(Debug)]
pub struct Framer {
    timeouts: AtTimeouts,
    outstanding: Option<Outstanding>,
    phase: Phase,
    last_activity: Instant,
    /// Probes written for the current command whose replies are not yet seen.
    probes_in_flight: u8,
    /// Probe reply lines still expected after the command they were sent
    /// for resolved. Swallowed instead of being reported as notifications.
    stray: u8,
}

impl Framer {
    pub fn new(timeouts: AtTimeouts, now: Instant) -> Self {
        Framer {
            timeouts,
            outstanding: None,
            phase: Phase::Idle,
            last_activity: now,
            probes_in_flight: 0,
            stray: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// A command is outstanding; the next one must wait.
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Record `command` as written to the modem.
    pub fn begin(&mut self, command: &str, now: Instant) {
        debug_assert!(self.outstanding.is_none(), "one command at a time");
        self.outstanding = Some(Outstanding {
            command: command.to_string(),
            issued_at: now,
            echoed: false,
            lines: Vec::new(),
        });
        self.phase = Phase::Idle;
        self.last_activity = now;
        self.probes_in_flight = 0;
    }

    /// Next instant at which [`Framer::on_quiet`] must be called.
    pub fn deadline(&self) -> Option<Instant> {
        let out = self.outstanding.as_ref()?;
        let hard = out.issued_at + self.timeouts.long;
        match self.phase {
            Phase::Idle => Some(hard),
            _ => Some(hard.min(self.last_activity + self.timeouts.short)),
        }
    }

    /// Feed one line, already stripped of its line terminator.
    pub fn on_line(&mut self, raw: &[u8], now: Instant) -> Vec<FramerOutput> {
        let line = String::from_utf8_lossy(raw.trim_ascii()).into_owned();

        if self.phase == Phase::Idle && self.stray > 0 {
            if line.is_empty() {
                return Vec::new();
            }
            if line == PROBE || line == "OK" {
                self.stray -= 1;
                tracing::trace!(line = %line, "discarding late probe reply");
                return Vec::new();
            }
        }

        let Some(out) = self.outstanding.as_mut() else {
            return match line.is_empty() {
                true => Vec::new(),
                false => vec![FramerOutput::Notification(line)],
            };
        };

        self.last_activity = now;

        match self.phase {
            Phase::Idle => {
                if line.is_empty() || line.starts_with(out.command.as_str()) {
                    out.echoed = !line.is_empty();
                    self.phase = Phase::Collecting;
                    // Any probe reply owed to an earlier command came before this.
                    self.stray = 0;
                    Vec::new()
                } else {
                    vec![FramerOutput::Notification(line)]
                }
            }
            Phase::Collecting => {
                if line.is_empty() && !keeps_blank_lines(&out.lines) {
                    return Vec::new();
                }
                let terminal = Status::parse(&line).is_some();
                out.lines.push(line);
                match terminal {
                    true => vec![self.complete()],
                    false => Vec::new(),
                }
            }
            Phase::AwaitProbeEcho => match line.as_str() {
                "" => Vec::new(),
                PROBE => {
                    self.phase = Phase::AwaitProbeStatus;
                    Vec::new()
                }
                // A late terminator of the command itself; the probe is still owed.
                _ => {
                    let terminal = Status::parse(&line).is_some();
                    out.lines.push(line);
                    match terminal {
                        true => vec![self.complete()],
                        false => {
                            self.phase = Phase::Collecting;
                            Vec::new()
                        }
                    }
                }
            },
            Phase::AwaitProbeStatus => match line.as_str() {
                "" => Vec::new(),
                "OK" => {
                    self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                    self.complete_by_probe()
                }
                _ => {
                    // The "AT" was genuine response text after all.
                    out.lines.push(PROBE.to_string());
                    let terminal = Status::parse(&line).is_some();
                    out.lines.push(line);
                    match terminal {
                        true => vec![self.complete()],
                        false => {
                            self.phase = Phase::Collecting;
                            Vec::new()
                        }
                    }
                }
            },
        }
    }

    /// Called when [`Framer::deadline`] passes without a line arriving.
    pub fn on_quiet(&mut self, now: Instant) -> Vec<FramerOutput> {
        let Some(out) = self.outstanding.as_ref() else {
            return Vec::new();
        };

        if now >= out.issued_at + self.timeouts.long {
            let command = at::redact(&out.command).into_owned();
            self.reset();
            return vec![FramerOutput::Failed(ModemError::FramingTimeout {
                command,
                after: self.timeouts.long,
            })];
        }

        if self.phase != Phase::Idle && now >= self.last_activity + self.timeouts.short {
            tracing::trace!(command = %at::redact(&out.command), "response quiet, probing");
            self.phase = Phase::AwaitProbeEcho;
            self.last_activity = now;
            self.probes_in_flight = self.probes_in_flight.saturating_add(1);
            return vec![FramerOutput::SendProbe];
        }

        Vec::new()
    }

    /// The probe's `OK` proved the response is over.
    fn complete_by_probe(&mut self) -> Vec<FramerOutput> {
        if let Some(out) = self.outstanding.as_mut() {
            let terminated = out
                .lines
                .last()
                .is_some_and(|l| Status::parse(l).is_some());
            if !terminated {
                out.lines.push("OK".to_string());
            }
        }
        vec![self.complete()]
    }

    fn complete(&mut self) -> FramerOutput {
        let out = self.outstanding.take();
        // Each unanswered probe still owes its OK, preceded by the echo when
        // echo is on.
        let per_probe = match out.as_ref().is_some_and(|o| o.echoed) {
            true => 2,
            false => 1,
        };
        self.stray = self
            .stray
            .saturating_add(self.probes_in_flight.saturating_mul(per_probe));
        self.reset();
        match out {
            Some(out) => FramerOutput::Completed(CommandResult::new(out.command, out.lines)),
            None => FramerOutput::Failed(ModemError::ProtocolState(
                "completion without an outstanding command".into(),
            )),
        }
    }

    fn reset(&mut self) {
        self.outstanding = None;
        self.phase = Phase::Idle;
        self.probes_in_flight = 0;
    }
}

/// Blank lines inside a stored message body are part of the text.
fn keeps_blank_lines(lines: &[String]) -> bool {
    lines.iter().any(|l| l.starts_with("+CMGL:"))
}
