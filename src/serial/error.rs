use std::{io, string};

use thiserror::Error;

/// Serial port related errors.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem")]
    IO(#[from] io::Error),

    /// Utf8 related errors.
    #[error("Problem with UTF8 conversion")]
    Utf8(#[from] string::FromUtf8Error),

    /// The serial port driver refused to open or configure the port.
    #[error("Serial port problem: {0}")]
    Driver(#[from] tokio_serial::Error),

    /// Serial port disconnected.
    #[error("Serial port disconnected")]
    Disconnected,
}

impl SerialPortError {
    /// Whether the error only affects the current read,
    /// leaving the link itself usable.
    pub fn is_transient(&self) -> bool {
        match self {
            SerialPortError::IO(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            SerialPortError::Utf8(_) => true,
            SerialPortError::Driver(_) | SerialPortError::Disconnected => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let e = SerialPortError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(e.is_transient());

        let e = SerialPortError::from(io::Error::from(io::ErrorKind::Interrupted));
        assert!(e.is_transient());
    }

    #[test]
    fn broken_pipe_and_disconnect_are_fatal() {
        let e = SerialPortError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!e.is_transient());

        assert!(!SerialPortError::Disconnected.is_transient());
    }
}
