//! Serial link tasks: the line reader and the link task that owns the
//! writer, the [`Framer`] and command arbitration.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};

use super::AtTimeouts;
use super::at;
use super::channel::{CommandRequest, CommandResult};
use super::framer::{Framer, FramerOutput, PROBE};
use super::urc::Notification;
use crate::error::ModemError;

/// Bring the AT interpreter to a known state and discard whatever the modem
/// printed before we attached.
pub(crate) async fn reset_at<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeouts: AtTimeouts,
) -> Result<(), ModemError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(at::ECHO_RESET).await?;
    writer.flush().await?;
    sleep(timeouts.medium).await;

    let mut buf = [0u8; 256];
    let mut drained = 0usize;
    loop {
        match timeout(timeouts.medium, reader.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => return Err(ModemError::LinkClosed),
            Ok(Ok(n)) => drained += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    tracing::debug!(bytes = drained, "drained serial link");
    Ok(())
}

/// Read newline-terminated lines, trimmed, until the link or the consumer
/// goes away.
pub(crate) async fn read_lines<R>(reader: R, lines_tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::info!("serial link reached EOF");
                return;
            }
            Ok(_) => {
                let line = buf.trim_ascii().to_vec();
                tracing::trace!(line = %String::from_utf8_lossy(&line), "rx");
                if lines_tx.send(line).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "serial read failed");
                return;
            }
        }
    }
}

/// Link task. Writes queued commands one at a time, feeds incoming lines to
/// the framer and routes its output: results back to the issuer,
/// notifications to the dispatcher.
///
/// Returns `Ok(())` once every [`CommandChannel`](super::channel::CommandChannel)
/// is dropped and `Err(LinkClosed)` when the reader stops.
pub(crate) async fn run<W>(
    mut writer: W,
    mut lines_rx: mpsc::Receiver<Vec<u8>>,
    mut requests_rx: mpsc::Receiver<CommandRequest>,
    notifications: mpsc::UnboundedSender<Notification>,
    timeouts: AtTimeouts,
) -> Result<(), ModemError>
where
    W: AsyncWrite + Unpin,
{
    let mut framer = Framer::new(timeouts, Instant::now());
    let mut pending: Option<oneshot::Sender<Result<CommandResult, ModemError>>> = None;

    loop {
        let deadline = framer.deadline();

        let outputs = tokio::select! {
            line = lines_rx.recv() => match line {
                Some(line) => framer.on_line(&line, Instant::now()),
                None => return Err(ModemError::LinkClosed),
            },

            request = requests_rx.recv(), if !framer.is_busy() => match request {
                Some(request) => {
                    if request.reply.is_closed() {
                        tracing::debug!(command = %at::redact(&request.command), "issuer gone, skipping command");
                        continue;
                    }
                    write_line(&mut writer, &request.command).await?;
                    framer.begin(&request.command, Instant::now());
                    pending = Some(request.reply);
                    Vec::new()
                }
                None => return Ok(()),
            },

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                framer.on_quiet(Instant::now())
            }
        };

        for output in outputs {
            match output {
                FramerOutput::Notification(line) => {
                    let notification = Notification::classify(&line);
                    tracing::debug!(urc = %notification, "notification");
                    // The dispatcher may already be gone during shutdown.
                    let _ = notifications.send(notification);
                }
                FramerOutput::Completed(result) => reply(&mut pending, Ok(result)),
                FramerOutput::Failed(err) => {
                    tracing::warn!(error = %err, "command framing failed");
                    reply(&mut pending, Err(err));
                }
                FramerOutput::SendProbe => write_line(&mut writer, PROBE).await?,
            }
        }
    }
}

fn reply(
    pending: &mut Option<oneshot::Sender<Result<CommandResult, ModemError>>>,
    result: Result<CommandResult, ModemError>,
) {
    match pending.take() {
        Some(tx) => {
            if tx.send(result).is_err() {
                tracing::debug!("command issuer stopped waiting");
            }
        }
        None => tracing::warn!("command resolved with nobody waiting"),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, command: &str) -> Result<(), ModemError> {
    tracing::trace!(command = %at::redact(command), "tx");
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\r").await?;
    writer.flush().await?;
    Ok(())
}
