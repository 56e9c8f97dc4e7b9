//! # Serial Port Discovery
//!
//! The thin seam between the device loop and the serial library. Everything
//! above this file talks to [`SerialBackend`], so the reconnect logic can be
//! exercised against in-memory streams.
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

/// An open serial link, read as a byte stream.
pub type SerialStream = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised while finding or opening a port.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerialError {
    /// Listing the system's ports failed.
    #[error("port enumeration failed: {0}")]
    Discovery(String),

    /// No USB port is free.
    #[error("no free USB serial port found")]
    NoPortAvailable,

    /// The port is held by another device.
    #[error("port {0} is in use by another device")]
    PortBusy(String),

    /// The port exists but could not be opened.
    #[error("failed to open {port}: {reason}")]
    Open {
        /// Port path.
        port: String,
        /// Library error text.
        reason: String,
    },
}

/// A port as reported by the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    /// Whether the port is a USB serial adapter.
    pub is_usb: bool,
}

impl PortInfo {
    /// A port is USB when the library says so or its path mentions `usb`.
    pub fn new(path: impl Into<String>, usb_port_type: bool) -> Self {
        let path = path.into();
        let is_usb = usb_port_type || path.to_lowercase().contains("usb");
        Self { path, is_usb }
    }
}

/// Access to the machine's serial ports.
pub trait SerialBackend: Send + Sync {
    /// Every port the system currently knows about.
    fn available_ports(&self) -> Result<Vec<PortInfo>, SerialError>;

    /// Opens `path` at `baud_rate`, 8N1, no flow control.
    fn open(&self, path: &str, baud_rate: u32) -> Result<SerialStream, SerialError>;
}

/// [`SerialBackend`] over `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialBackend;

impl SerialBackend for TokioSerialBackend {
    fn available_ports(&self) -> Result<Vec<PortInfo>, SerialError> {
        let ports = tokio_serial::available_ports().map_err(|e| SerialError::Discovery(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let usb = matches!(p.port_type, SerialPortType::UsbPort(_));
                PortInfo::new(p.port_name, usb)
            })
            .collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<SerialStream, SerialError> {
        let stream = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::Open {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

/// Splits `ports` into USB ports and the rest, logging each skipped port.
pub fn partition_ports(ports: Vec<PortInfo>) -> (Vec<PortInfo>, Vec<PortInfo>) {
    let (usb, skipped): (Vec<PortInfo>, Vec<PortInfo>) = ports.into_iter().partition(|p| p.is_usb);
    for port in &skipped {
        log::info!("Port: {} is not a USB port so will be skipped", port.path);
    }
    (usb, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hint_marks_usb_ports() {
        assert!(PortInfo::new("/dev/ttyUSB0", false).is_usb);
        assert!(PortInfo::new("/dev/cu.usbmodem14101", false).is_usb);
        assert!(PortInfo::new("COM3", true).is_usb);
        assert!(!PortInfo::new("/dev/ttyS0", false).is_usb);
    }

    #[test]
    fn non_usb_ports_are_skipped() {
        let ports = vec![
            PortInfo::new("/dev/ttyS0", false),
            PortInfo::new("/dev/ttyUSB0", false),
            PortInfo::new("/dev/ttyACM0", true),
        ];
        let (usb, skipped) = partition_ports(ports);
        let usb: Vec<&str> = usb.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(usb, vec!["/dev/ttyUSB0", "/dev/ttyACM0"]);
        assert_eq!(skipped, vec![PortInfo::new("/dev/ttyS0", false)]);
    }
}
