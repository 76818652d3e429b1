//! In-memory oven controller used by the integration tests.
//!
//! `FakeOven` plays the device firmware on the far end of a `tokio::io::duplex`
//! pipe and reacts to the control lines written through `FakePins`.
#![allow(dead_code)]

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use toaster_lib::gpio::{self, ControlLine, ControlPins, Level};
use toaster_lib::serial::interface::{BoxedSerial, PortOpener};
use toaster_lib::serial::SerialInterface;
use toaster_lib::update::{FirmwareRelease, FirmwareSource, Programmer, UpdateError, UpdateResult};

pub const TARGET: &str = "v0.5.2";
pub const TELEMETRY_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Held in reset or not yet powered.
    Halted,
    Runtime,
    Bootloader,
}

struct OvenInner {
    version: String,
    mode: Mode,
    logging: bool,
    boot_select: Level,
    reset: Level,
    outbox: Option<mpsc::UnboundedSender<String>>,
    received: Vec<String>,
    pin_events: Vec<(ControlLine, Level)>,
    opens: Vec<u32>,
    ticks: f64,
    announces_version: bool,
    honours_quiet: bool,
    boot_record_pending: bool,
}

pub struct FakeOven {
    inner: StdMutex<OvenInner>,
}

impl FakeOven {
    /// Running `version`, already booted, standby logging off.
    pub fn new(version: &str) -> Arc<Self> {
        let oven = Arc::new(Self {
            inner: StdMutex::new(OvenInner {
                version: version.to_string(),
                mode: Mode::Runtime,
                logging: false,
                boot_select: Level::High,
                reset: Level::High,
                outbox: None,
                received: Vec::new(),
                pin_events: Vec::new(),
                opens: Vec::new(),
                ticks: 0.0,
                announces_version: true,
                honours_quiet: true,
                boot_record_pending: false,
            }),
        });
        tokio::spawn(ticker(Arc::downgrade(&oven)));
        oven
    }

    pub fn set_logging(&self, on: bool) {
        self.inner.lock().unwrap().logging = on;
    }

    pub fn logging(&self) -> bool {
        self.inner.lock().unwrap().logging
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().unwrap().mode
    }

    pub fn version(&self) -> String {
        self.inner.lock().unwrap().version.clone()
    }

    /// Firmware that never prints its version banner.
    pub fn without_banner(&self) {
        self.inner.lock().unwrap().announces_version = false;
    }

    /// Firmware that swallows `quiet` without toggling or answering.
    pub fn ignoring_quiet(&self) {
        self.inner.lock().unwrap().honours_quiet = false;
    }

    /// Print one telemetry record right after the next runtime boot only.
    pub fn telemetry_on_next_boot(&self) {
        self.inner.lock().unwrap().boot_record_pending = true;
    }

    pub fn install_firmware(&self, version: &str) {
        self.inner.lock().unwrap().version = version.to_string();
    }

    pub fn received(&self) -> Vec<String> {
        self.inner.lock().unwrap().received.clone()
    }

    pub fn pin_events(&self) -> Vec<(ControlLine, Level)> {
        self.inner.lock().unwrap().pin_events.clone()
    }

    pub fn reset_pulses(&self) -> usize {
        self.pin_events()
            .iter()
            .filter(|e| **e == (ControlLine::Reset, Level::Low))
            .count()
    }

    /// Baud rates of every connection opened so far.
    pub fn opens(&self) -> Vec<u32> {
        self.inner.lock().unwrap().opens.clone()
    }

    /// Write raw text to the host, as the firmware would.
    pub fn emit(&self, line: &str) {
        if let Some(outbox) = &self.inner.lock().unwrap().outbox {
            let _ = outbox.send(format!("{}\r\n", line));
        }
    }

    fn emit_all(&self, lines: &[&str]) {
        for line in lines {
            self.emit(line);
        }
    }

    fn connect(self: &Arc<Self>, baud_rate: u32) -> BoxedSerial {
        let (host, device) = tokio::io::duplex(64 * 1024);
        let (read_half, mut write_half) = tokio::io::split(device);
        let (outbox, mut pending) = mpsc::unbounded_channel::<String>();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.outbox = Some(outbox);
            inner.opens.push(baud_rate);
        }

        tokio::spawn(async move {
            while let Some(text) = pending.recv().await {
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let oven = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match oven.upgrade() {
                    Some(oven) => oven.handle_command(line.trim()),
                    None => break,
                }
            }
        });

        Box::new(host)
    }

    fn handle_command(&self, command: &str) {
        let mode = {
            let mut inner = self.inner.lock().unwrap();
            inner.received.push(command.to_string());
            inner.mode
        };
        if mode != Mode::Runtime {
            return;
        }

        match command {
            "about" => {
                if let Some(banner) = self.banner() {
                    self.emit(&banner);
                }
                self.emit("See https://github.com/UnifiedEngineering/T-962-improvement for more details.");
            }
            "quiet" => {
                if !self.inner.lock().unwrap().honours_quiet {
                    return;
                }
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.logging = !inner.logging;
                }
                self.emit("Toggled standby logging");
            }
            "list profiles" => self.emit_all(&[
                "",
                "Reflow profiles available:",
                "",
                "0: SYNTECH_LF",
                "1: NC31",
                "2: CUSTOM #1",
            ]),
            "list settings" => self.emit_all(&[
                "",
                "Current settings:",
                "",
                "0: Heater cycles    20",
                "1: Min fan speed    8",
            ]),
            "values" => self.emit_all(&[
                "Sensor values:",
                "         Left: 31.0degC",
                "        Right: 43.4degC",
                "Cold junction: 31.0degC",
            ]),
            "help" => self.emit_all(&["T-962 controller help:", "about - Show firmware info"]),
            // Reflow and the rest are silent on the wire.
            _ => {}
        }
    }

    fn banner(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .announces_version
            .then(|| format!("T-962-controller open source firmware ({})", inner.version))
    }

    fn on_pin(&self, line: ControlLine, level: Level) {
        let booted = {
            let mut inner = self.inner.lock().unwrap();
            inner.pin_events.push((line, level));
            match line {
                ControlLine::BootSelect => {
                    inner.boot_select = level;
                    None
                }
                ControlLine::Reset => {
                    let released = inner.reset == Level::Low && level == Level::High;
                    inner.reset = level;
                    if level == Level::Low {
                        inner.mode = Mode::Halted;
                        None
                    } else if released {
                        inner.logging = false;
                        inner.mode = if inner.boot_select == Level::High {
                            Mode::Runtime
                        } else {
                            Mode::Bootloader
                        };
                        Some(inner.mode)
                    } else {
                        None
                    }
                }
            }
        };
        if booted == Some(Mode::Runtime) {
            self.emit_all(&["Initializing improved reflow oven...", "Buzzer_Init"]);
            if let Some(banner) = self.banner() {
                self.emit(&banner);
            }
            let boot_record = std::mem::take(&mut self.inner.lock().unwrap().boot_record_pending);
            if boot_record {
                let line = self.telemetry_line();
                self.emit(&line);
            }
        }
    }

    fn tick(&self) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.mode != Mode::Runtime || !inner.logging {
                return;
            }
        }
        let line = self.telemetry_line();
        self.emit(&line);
    }

    fn telemetry_line(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.ticks += 1.0;
        format!(
            "{:7.1}, {:6.1}, {:5.1}, {:5.1}, {:5.1}, {:4}, {:5.1}, {:4}, {:3}, {:6.1}, STANDBY",
            inner.ticks / 4.0,
            31.5,
            44.1,
            0.0,
            0.0,
            50,
            37.8,
            0,
            0,
            31.5
        )
    }
}

async fn ticker(oven: std::sync::Weak<FakeOven>) {
    let mut interval = tokio::time::interval(TELEMETRY_PERIOD);
    loop {
        interval.tick().await;
        match oven.upgrade() {
            Some(oven) => oven.tick(),
            None => break,
        }
    }
}

pub struct DuplexOpener {
    oven: Arc<FakeOven>,
}

impl DuplexOpener {
    pub fn new(oven: Arc<FakeOven>) -> Self {
        Self { oven }
    }
}

#[async_trait]
impl PortOpener for DuplexOpener {
    async fn open(&self, baud_rate: u32) -> toaster_lib::serial::Result<BoxedSerial> {
        Ok(self.oven.connect(baud_rate))
    }

    fn describe(&self) -> String {
        "fake-oven".into()
    }
}

pub struct FakePins {
    oven: Arc<FakeOven>,
}

impl FakePins {
    pub fn new(oven: Arc<FakeOven>) -> Self {
        Self { oven }
    }
}

impl ControlPins for FakePins {
    fn write(&self, line: ControlLine, level: Level) -> gpio::Result<()> {
        self.oven.on_pin(line, level);
        Ok(())
    }

    fn describe(&self) -> String {
        "fake pins".into()
    }
}

pub fn interface_for(oven: &Arc<FakeOven>) -> SerialInterface {
    SerialInterface::new(
        Box::new(DuplexOpener::new(oven.clone())),
        Box::new(FakePins::new(oven.clone())),
    )
}

/// Records programmed segments and installs `installs` on a clean close.
pub struct ScriptedProgrammer {
    oven: Arc<FakeOven>,
    installs: String,
    fail_at: Option<usize>,
    attempts: Arc<StdMutex<Vec<u32>>>,
    failed: bool,
}

impl ScriptedProgrammer {
    pub fn new(oven: Arc<FakeOven>, installs: &str) -> Self {
        Self {
            oven,
            installs: installs.to_string(),
            fail_at: None,
            attempts: Arc::new(StdMutex::new(Vec::new())),
            failed: false,
        }
    }

    /// Fail the `index`th segment (zero based).
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Start addresses of every segment the flasher tried to write.
    pub fn attempts(&self) -> Arc<StdMutex<Vec<u32>>> {
        self.attempts.clone()
    }
}

#[async_trait]
impl Programmer for ScriptedProgrammer {
    async fn open(&mut self) -> UpdateResult<()> {
        Ok(())
    }

    async fn handshake(&mut self) -> UpdateResult<()> {
        if self.oven.mode() == Mode::Bootloader {
            Ok(())
        } else {
            Err(UpdateError::Isp(format!("device is in {:?}, not the bootloader", self.oven.mode())))
        }
    }

    async fn program(&mut self, address: u32, _data: &[u8]) -> UpdateResult<()> {
        let index = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(address);
            attempts.len() - 1
        };
        if self.fail_at == Some(index) {
            self.failed = true;
            return Err(UpdateError::Isp("COMPARE_ERROR (10)".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> UpdateResult<()> {
        if !self.failed {
            self.oven.install_firmware(&self.installs);
        }
        Ok(())
    }
}

pub struct StaticFirmware {
    hex: String,
    fetches: Arc<StdMutex<usize>>,
}

impl StaticFirmware {
    pub fn new(hex: String) -> Self {
        Self { hex, fetches: Arc::new(StdMutex::new(0)) }
    }

    pub fn fetches(&self) -> Arc<StdMutex<usize>> {
        self.fetches.clone()
    }
}

#[async_trait]
impl FirmwareSource for StaticFirmware {
    async fn fetch(&self, _release: &FirmwareRelease) -> UpdateResult<String> {
        *self.fetches.lock().unwrap() += 1;
        Ok(self.hex.clone())
    }
}

/// Intel HEX text for `segments`, 16 data bytes per record.
pub fn hex_image(segments: &[(u32, Vec<u8>)]) -> String {
    fn record(kind: u8, offset: u16, payload: &[u8]) -> String {
        let mut bytes = vec![payload.len() as u8, (offset >> 8) as u8, offset as u8, kind];
        bytes.extend_from_slice(payload);
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(0u8.wrapping_sub(sum));
        let digits: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}\n", digits)
    }

    let mut text = String::new();
    let mut upper = None;
    for (address, data) in segments {
        for (i, chunk) in data.chunks(16).enumerate() {
            let at = address + (i as u32) * 16;
            let high = (at >> 16) as u16;
            if upper != Some(high) {
                text.push_str(&record(0x04, 0, &high.to_be_bytes()));
                upper = Some(high);
            }
            text.push_str(&record(0x00, at as u16, chunk));
        }
    }
    text.push_str(&record(0x01, 0, &[]));
    text
}
