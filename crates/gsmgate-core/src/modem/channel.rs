//! Command channel: the only way to issue AT commands.
//!
//! Requests queue up in front of the link task, which writes the next one
//! only once the framer has resolved the previous result. At most one
//! command is ever outstanding on the wire.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::at;
use crate::error::ModemError;

/// Terminal status line of a command result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    pub(crate) fn parse(line: &str) -> Option<Status> {
        match line {
            "OK" => Some(Status::Ok),
            "ERROR" => Some(Status::Error),
            _ => None,
        }
    }
}

/// Response lines of one command, terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    command: String,
    lines: Vec<String>,
}

impl CommandResult {
    pub fn new(command: impl Into<String>, lines: Vec<String>) -> Self {
        CommandResult {
            command: command.into(),
            lines,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Status of the last line, if it is a terminator.
    pub fn status(&self) -> Option<Status> {
        self.lines.last().and_then(|l| Status::parse(l))
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Some(Status::Ok)
    }

    /// Lines without the terminator.
    pub fn body(&self) -> &[String] {
        match self.status() {
            Some(_) => &self.lines[..self.lines.len() - 1],
            None => &self.lines,
        }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Fail with the full response text unless the result ended in `OK`.
    pub fn verify_ok(&self) -> Result<(), ModemError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(ModemError::Command {
                command: at::redact(&self.command).into_owned(),
                response: self.text(),
            })
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

pub(crate) struct CommandRequest {
    pub command: String,
    pub reply: oneshot::Sender<Result<CommandResult, ModemError>>,
}

/// Cloneable handle for issuing commands.
#[derive(Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<CommandRequest>,
    default_timeout: Duration,
}

impl CommandChannel {
    pub(crate) fn new(tx: mpsc::Sender<CommandRequest>, default_timeout: Duration) -> Self {
        CommandChannel {
            tx,
            default_timeout,
        }
    }

    /// Issue `command` and wait up to `timeout` for its result.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ModemError> {
        let exchange = async {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(CommandRequest {
                    command: command.to_string(),
                    reply,
                })
                .await
                .map_err(|_| ModemError::LinkClosed)?;
            rx.await.map_err(|_| ModemError::LinkClosed)?
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ModemError::CommandTimeout {
                command: at::redact(command).into_owned(),
                after: timeout,
            }),
        };

        match &result {
            Ok(r) => tracing::debug!(command = %at::redact(command), response = %r, "AT"),
            Err(e) => tracing::debug!(command = %at::redact(command), error = %e, "AT failed"),
        }
        result
    }

    /// Issue `command` with the default (long) timeout.
    pub async fn run(&self, command: &str) -> Result<CommandResult, ModemError> {
        self.execute(command, self.default_timeout).await
    }

    /// Issue `command` and require an `OK` result.
    pub async fn run_ok(&self, command: &str) -> Result<CommandResult, ModemError> {
        let result = self.run(command).await?;
        result.verify_ok()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(lines: &[&str]) -> CommandResult {
        CommandResult::new("AT+CMGL", lines.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn body_excludes_terminator() {
        let r = result(&["+CMGL: 1,\"REC UNREAD\",\"+1555\",,\"24/01/01,10:00:00+00\"", "hi", "OK"]);
        assert_eq!(r.status(), Some(Status::Ok));
        assert_eq!(r.body().len(), 2);
        assert_eq!(r.lines().len(), 3);
    }

    #[test]
    fn verify_ok_carries_full_text() {
        let r = result(&["+CME ERROR: 10", "ERROR"]);
        match r.verify_ok() {
            Err(ModemError::Command { command, response }) => {
                assert_eq!(command, "AT+CMGL");
                assert_eq!(response, "+CME ERROR: 10\nERROR");
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[test]
    fn pin_is_redacted_in_errors() {
        let r = CommandResult::new("AT+CPIN=1234", vec!["ERROR".into()]);
        let err = r.verify_ok().unwrap_err().to_string();
        assert!(!err.contains("1234"), "{err}");
    }

    #[tokio::test]
    async fn execute_times_out_when_link_never_answers() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = CommandChannel::new(tx, Duration::from_secs(5));

        // Hold the request without replying.
        let holder = tokio::spawn(async move {
            let req = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(req);
        });

        let err = channel
            .execute("AT+COPS?", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ModemError::CommandTimeout { .. }));
        holder.abort();
    }

    #[tokio::test]
    async fn execute_reports_closed_link() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let channel = CommandChannel::new(tx, Duration::from_secs(5));
        assert!(matches!(
            channel.run("AT").await,
            Err(ModemError::LinkClosed)
        ));
    }
}
