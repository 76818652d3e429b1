pub mod interface;
pub mod protocol;
pub mod unified;

pub use interface::{NativePortOpener, PortOpener, SerialInterface};
pub use protocol::{decode_line, Command, LineEvent};

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Command '{0}' rejected: another command is awaiting its response")]
    CommandInFlight(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("GPIO error: {0}")]
    Gpio(#[from] crate::gpio::GpioError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Enumerate every serial port the OS reports.
pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let devices = ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => SerialDeviceInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect();

    Ok(devices)
}
