use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::serial::error::SerialPortError;

/// Serial port related errors.
pub mod error;

/// The serial port structure.
pub mod serial_port;

/// Codecs for encoding/decoding messages to/from wire.
pub mod codecs;

/// A serial port which probed successfully and may host the sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// Likely "/dev/ttyACMx" or "/dev/ttyUSBx".
    pub path: String,

    /// The baud rate the port probed at.
    pub baud: u32,
}

impl PortDescriptor {
    /// Describe a port.
    pub fn new(path: &str, baud: u32) -> Self {
        Self {
            path: path.to_owned(),
            baud,
        }
    }
}

impl Display for PortDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.baud)
    }
}

/// An opened connection to the device, read line by line.
///
/// Exactly one task owns a link at a time.
#[async_trait]
pub trait Link: Send {
    /// Set the data terminal ready control line.
    fn set_dtr(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Throw away anything received but not yet read.
    fn discard_input(&mut self) -> Result<(), SerialPortError>;

    /// Put these bytes on the wire.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), SerialPortError>;

    /// Wait at most `wait` for the next line.
    /// `Ok(None)` means nothing arrived in time.
    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SerialPortError>;
}

/// Where serial ports come from.
///
/// The system implementation talks to the OS, the mock one to scripted devices.
pub trait SerialBackend: Send + Sync {
    /// The link type opened ports yield.
    type Link: Link + 'static;

    /// Every serial device path currently present, in no particular order.
    fn candidates(&self) -> Vec<String>;

    /// Open the port briefly and close it again.
    fn probe(&self, path: &str, baud: u32) -> Result<(), SerialPortError>;

    /// Open the port for a session.
    fn open(&self, port: &PortDescriptor) -> Result<Self::Link, SerialPortError>;
}
