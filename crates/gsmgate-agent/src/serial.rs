use anyhow::Context;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Open the modem's AT tty as 8N1 at `baud`.
pub fn open(tty: &str, baud: u32) -> anyhow::Result<SerialStream> {
    let stream = tokio_serial::new(tty, baud)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .open_native_async()
        .with_context(|| format!("failed to open serial port {tty}"))?;
    tracing::info!(tty, baud, "serial port open");
    Ok(stream)
}
