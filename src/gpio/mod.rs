//! Control lines used to reset the oven controller and select its boot mode.
//!
//! | Backend | Crate          | Use case                                   |
//! |---------|----------------|--------------------------------------------|
//! | `sysfs` | std (`/sys`)   | Any Linux SBC with the legacy GPIO sysfs   |
//! | `rppal` | rppal (`rpi`)  | Raspberry Pi, also claims the UART pins    |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("GPIO {pin} unavailable: {reason}")]
    Unavailable { pin: u8, reason: String },

    #[error("IO error on GPIO {pin}: {source}")]
    Io {
        pin: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("GPIO backend '{0}' is not compiled in")]
    BackendMissing(String),
}

pub type Result<T> = std::result::Result<T, GpioError>;

/// The two outputs wired to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlLine {
    /// Low while the controller leaves reset starts the ISP bootloader.
    BootSelect,
    /// Active low.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_sysfs(self) -> &'static str {
        match self {
            Level::Low => "0",
            Level::High => "1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackend {
    #[default]
    Sysfs,
    Rppal,
}

/// BCM pin numbers for the control lines and the UART they share a header with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinAssignment {
    pub boot_select: u8,
    pub reset: u8,
    pub uart_tx: u8,
    pub uart_rx: u8,
}

impl Default for PinAssignment {
    fn default() -> Self {
        Self {
            boot_select: 17,
            reset: 18,
            uart_tx: 14,
            uart_rx: 15,
        }
    }
}

impl PinAssignment {
    pub fn pin(&self, line: ControlLine) -> u8 {
        match line {
            ControlLine::BootSelect => self.boot_select,
            ControlLine::Reset => self.reset,
        }
    }
}

/// Fire-and-forget digital outputs; there is no readback.
pub trait ControlPins: Send + Sync {
    fn write(&self, line: ControlLine, level: Level) -> Result<()>;

    fn describe(&self) -> String;
}

/// Legacy `/sys/class/gpio` interface.
pub struct SysfsPins {
    root: PathBuf,
    assignment: PinAssignment,
}

impl SysfsPins {
    pub const DEFAULT_ROOT: &'static str = "/sys/class/gpio";

    /// Export both control lines and configure them as outputs.
    pub fn export(assignment: PinAssignment) -> Result<Self> {
        Self::export_at(PathBuf::from(Self::DEFAULT_ROOT), assignment)
    }

    pub fn export_at(root: PathBuf, assignment: PinAssignment) -> Result<Self> {
        let pins = Self { root, assignment };
        for line in [ControlLine::BootSelect, ControlLine::Reset] {
            let pin = assignment.pin(line);
            let dir = pins.root.join(format!("gpio{pin}"));
            if !dir.exists() {
                std::fs::write(pins.root.join("export"), pin.to_string())
                    .map_err(|source| GpioError::Io { pin, source })?;
            }
            // "high" sets the direction and drives the line high in one step,
            // keeping the controller out of reset and in normal boot mode.
            std::fs::write(dir.join("direction"), "high")
                .map_err(|source| GpioError::Io { pin, source })?;
        }
        log::debug!("Exported control lines {:?} under {}", assignment, pins.root.display());
        Ok(pins)
    }
}

impl ControlPins for SysfsPins {
    fn write(&self, line: ControlLine, level: Level) -> Result<()> {
        let pin = self.assignment.pin(line);
        let path = self.root.join(format!("gpio{pin}")).join("value");
        std::fs::write(path, level.as_sysfs()).map_err(|source| GpioError::Io { pin, source })
    }

    fn describe(&self) -> String {
        format!(
            "sysfs GPIO (boot select {}, reset {})",
            self.assignment.boot_select, self.assignment.reset
        )
    }
}

#[cfg(all(feature = "rpi", target_os = "linux"))]
pub use rpi::RppalPins;

#[cfg(all(feature = "rpi", target_os = "linux"))]
mod rpi {
    use std::sync::{Mutex, PoisonError};

    use rppal::gpio::{Gpio, IoPin, Mode, OutputPin};

    use super::{ControlLine, ControlPins, GpioError, Level, PinAssignment, Result};

    pub struct RppalPins {
        assignment: PinAssignment,
        boot_select: Mutex<OutputPin>,
        reset: Mutex<OutputPin>,
        // Held so the UART pins stay in their alternate function.
        _uart: [IoPin; 2],
    }

    impl RppalPins {
        pub fn claim(assignment: PinAssignment) -> Result<Self> {
            let gpio = Gpio::new().map_err(|e| unavailable(assignment.boot_select, e))?;
            let output = |pin: u8| -> Result<OutputPin> {
                let mut out = gpio.get(pin).map_err(|e| unavailable(pin, e))?.into_output_high();
                out.set_reset_on_drop(false);
                Ok(out)
            };
            let alt5 = |pin: u8| -> Result<IoPin> {
                let mut io = gpio.get(pin).map_err(|e| unavailable(pin, e))?.into_io(Mode::Alt5);
                io.set_reset_on_drop(false);
                Ok(io)
            };
            Ok(Self {
                assignment,
                boot_select: Mutex::new(output(assignment.boot_select)?),
                reset: Mutex::new(output(assignment.reset)?),
                _uart: [alt5(assignment.uart_tx)?, alt5(assignment.uart_rx)?],
            })
        }
    }

    fn unavailable(pin: u8, err: rppal::gpio::Error) -> GpioError {
        GpioError::Unavailable { pin, reason: err.to_string() }
    }

    impl ControlPins for RppalPins {
        fn write(&self, line: ControlLine, level: Level) -> Result<()> {
            let pin = match line {
                ControlLine::BootSelect => &self.boot_select,
                ControlLine::Reset => &self.reset,
            };
            let mut pin = pin.lock().unwrap_or_else(PoisonError::into_inner);
            match level {
                Level::Low => pin.set_low(),
                Level::High => pin.set_high(),
            }
            Ok(())
        }

        fn describe(&self) -> String {
            format!(
                "rppal GPIO (boot select {}, reset {})",
                self.assignment.boot_select, self.assignment.reset
            )
        }
    }
}

/// Build the configured backend.
pub fn create_pins(backend: GpioBackend, assignment: PinAssignment) -> Result<Box<dyn ControlPins>> {
    match backend {
        GpioBackend::Sysfs => Ok(Box::new(SysfsPins::export(assignment)?)),
        #[cfg(all(feature = "rpi", target_os = "linux"))]
        GpioBackend::Rppal => Ok(Box::new(RppalPins::claim(assignment)?)),
        #[cfg(not(all(feature = "rpi", target_os = "linux")))]
        GpioBackend::Rppal => Err(GpioError::BackendMissing(
            "rppal (build with `--features rpi` on Linux)".to_string(),
        )),
    }
}
