use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

use super::{Result, SerialError};
use crate::gpio::{ControlLine, ControlPins, Level};
use crate::sync::Gate;

pub const RUNTIME_BAUD_RATE: u32 = 115_200;
pub const PROGRAMMING_BAUD_RATE: u32 = 57_600;
/// Comfortably above the controller's minimum reset pulse width.
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Byte stream to the oven controller.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

pub type BoxedSerial = Box<dyn SerialIo>;

/// Opens the link at a given baud rate. Runtime traffic and the ISP
/// bootloader use different rates, so the port is reopened between them.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, baud_rate: u32) -> Result<BoxedSerial>;

    fn describe(&self) -> String;
}

pub struct NativePortOpener {
    path: String,
}

impl NativePortOpener {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PortOpener for NativePortOpener {
    async fn open(&self, baud_rate: u32) -> Result<BoxedSerial> {
        let stream = tokio_serial::new(&self.path, baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", self.path, e)))?;
        log::debug!("Opened {} at {} baud", self.path, baud_rate);
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Owns the runtime serial connection and the reset/boot-select lines.
///
/// Incoming bytes are split on `\n` (trailing `\r` stripped) and pushed into a
/// single line stream that survives reconnects; claim it once with
/// [`SerialInterface::take_lines`].
pub struct SerialInterface {
    opener: Box<dyn PortOpener>,
    pins: Box<dyn ControlPins>,
    baud_rate: u32,
    reset_pulse: Duration,
    writer: Mutex<Option<WriteHalf<BoxedSerial>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    lines_tx: mpsc::UnboundedSender<String>,
    lines_rx: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
    resetting: Gate<bool>,
}

impl SerialInterface {
    pub fn new(opener: Box<dyn PortOpener>, pins: Box<dyn ControlPins>) -> Self {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        Self {
            opener,
            pins,
            baud_rate: RUNTIME_BAUD_RATE,
            reset_pulse: RESET_PULSE,
            writer: Mutex::new(None),
            reader: StdMutex::new(None),
            lines_tx,
            lines_rx: StdMutex::new(Some(lines_rx)),
            resetting: Gate::new(false),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_reset_pulse(mut self, reset_pulse: Duration) -> Self {
        self.reset_pulse = reset_pulse;
        self
    }

    pub fn describe(&self) -> String {
        format!("{} @ {} baud, {}", self.opener.describe(), self.baud_rate, self.pins.describe())
    }

    /// Hand out the line stream. Only the first caller gets it.
    pub fn take_lines(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Open the port at the runtime baud rate and start forwarding lines.
    pub async fn connect(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }

        let port = self.opener.open(self.baud_rate).await?;
        let (read_half, write_half) = tokio::io::split(port);
        let task = tokio::spawn(read_lines(read_half, self.lines_tx.clone()));
        if let Some(stale) = self.reader_slot().replace(task) {
            stale.abort();
        }
        *writer = Some(write_half);

        log::info!("Connected to oven on {}", self.opener.describe());
        Ok(())
    }

    /// Close the runtime connection, e.g. before the ISP bootloader takes the port.
    pub async fn disconnect(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(task) = self.reader_slot().take() {
            task.abort();
        }
        if let Some(mut port) = writer.take() {
            log::info!("Disconnecting from {}", self.opener.describe());
            port.shutdown().await?;
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    pub async fn send_data(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let port = writer.as_mut().ok_or(SerialError::NotConnected)?;
        port.write_all(data).await?;
        port.flush().await?;
        Ok(data.len())
    }

    /// Write one command line, terminated with `\n`.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        log::debug!("-> {}", line);
        self.send_data(format!("{}\n", line).as_bytes()).await?;
        Ok(())
    }

    /// Pulse reset, selecting runtime firmware or the ISP bootloader for the
    /// next boot.
    ///
    /// Overlapping calls share the pulse already in flight instead of starting
    /// another one; the boot mode of the first caller wins.
    pub async fn reset(&self, enter_bootloader: bool) -> Result<()> {
        if self.resetting.set(true) {
            log::debug!("Reset already in progress, joining it");
            self.resetting.next_value(false).await;
            return Ok(());
        }

        let _guard = ResetGuard { resetting: &self.resetting };
        self.pulse_reset(enter_bootloader).await
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.get()
    }

    async fn pulse_reset(&self, enter_bootloader: bool) -> Result<()> {
        log::info!(
            "Resetting oven into {}",
            if enter_bootloader { "ISP bootloader" } else { "runtime firmware" }
        );
        self.pins.write(ControlLine::Reset, Level::Low)?;
        tokio::time::sleep(self.reset_pulse).await;
        let boot_select = if enter_bootloader { Level::Low } else { Level::High };
        self.pins.write(ControlLine::BootSelect, boot_select)?;
        self.pins.write(ControlLine::Reset, Level::High)?;
        Ok(())
    }

    fn reader_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ends the in-flight reset however `reset` is left, so joiners never wait
/// on a pulse whose future was dropped.
struct ResetGuard<'a> {
    resetting: &'a Gate<bool>,
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.resetting.set(false);
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        if let Some(task) = self.reader_slot().take() {
            task.abort();
        }
    }
}

async fn read_lines(port: ReadHalf<BoxedSerial>, lines: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(port);
    let mut buf = Vec::with_capacity(128);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                log::debug!("Serial stream closed");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                if lines.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Serial read failed: {}", e);
                break;
            }
        }
    }
}
