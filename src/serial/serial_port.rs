use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Framed};
use tracing::{debug, info, trace, warn};

use crate::serial::{
    codecs::lines::{LinesCodec, StringCodec},
    error::SerialPortError,
    Link, PortDescriptor, SerialBackend,
};

/// Builder for a [`SerialLink`].
#[derive(Debug, Default)]
pub struct SerialLinkBuilder {
    baud: Option<u32>,
    read_timeout: Option<Duration>,
    path: String,
    line_codec: Option<LinesCodec>,
}

fn try_create_serial_port(
    path: &str,
    baud: u32,
    read_timeout: Duration,
) -> Result<SerialStream, SerialPortError> {
    let serial_stream = tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(read_timeout)
        .open_native_async()?;

    Ok(serial_stream)
}

impl SerialLinkBuilder {
    /// Start a new builder.
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix.
    pub fn new(tty: &str) -> Self {
        Self {
            path: tty.to_string(),
            ..Default::default()
        }
    }

    /// Set the serial port builder's baud.
    /// Will use 115_200 if not set.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// How long the driver may block on a single read.
    /// Will use one second if not set.
    pub fn set_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Set the [LinesCodec] to use.
    pub fn set_line_codec(mut self, codec: LinesCodec) -> Self {
        self.line_codec = Some(codec);
        self
    }

    /// Open the port.
    pub fn build(self) -> Result<SerialLink, SerialPortError> {
        let baud = self.baud.unwrap_or(115_200);
        let read_timeout = self.read_timeout.unwrap_or(Duration::from_secs(1));

        debug!(%self.path, %baud, "Opening port");

        let serial_stream = try_create_serial_port(&self.path, baud, read_timeout)?;

        let codec = self
            .line_codec
            .unwrap_or_default()
            .into_string_codec(true);

        info!(%self.path, %baud, "Serial port open");

        Ok(SerialLink {
            tty: self.path,
            framed: codec.framed(serial_stream),
        })
    }
}

/// An open serial port, framed into lossy UTF-8 lines.
pub struct SerialLink {
    tty: String,
    framed: Framed<SerialStream, StringCodec>,
}

#[async_trait]
impl Link for SerialLink {
    fn set_dtr(&mut self, level: bool) -> Result<(), SerialPortError> {
        trace!(%self.tty, %level, "DTR");
        self.framed.get_mut().write_data_terminal_ready(level)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), SerialPortError> {
        self.framed.get_mut().clear(ClearBuffer::Input)?;

        // Bytes already pulled off the port but not yet framed are stale too.
        self.framed.read_buffer_mut().clear();
        self.framed.codec_mut().reset();

        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SerialPortError> {
        self.framed.send(bytes.to_vec()).await
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SerialPortError> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(SerialPortError::Disconnected),
            Ok(Some(line)) => line.map(Some),
        }
    }
}

/// The serial ports of this machine.
#[derive(Debug, Clone)]
pub struct SystemSerial {
    probe_timeout: Duration,
    read_timeout: Duration,
    dev_dir: PathBuf,
}

impl SystemSerial {
    /// Ports are looked up via the OS and by listing `/dev`.
    pub fn new(probe_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            read_timeout,
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

impl SerialBackend for SystemSerial {
    type Link = SerialLink;

    fn candidates(&self) -> Vec<String> {
        let mut candidates = match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|serial_port_info| serial_port_info.port_name)
                .collect(),
            Err(e) => {
                warn!(?e, "Could not list serial ports");
                vec![]
            }
        };

        // Enumeration via the OS may miss ports without udev metadata.
        match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => candidates.extend(
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path().to_string_lossy().into_owned()),
            ),
            Err(e) => debug!(?e, dir = ?self.dev_dir, "Could not list device directory"),
        }

        candidates
    }

    fn probe(&self, path: &str, baud: u32) -> Result<(), SerialPortError> {
        let port = serialport::new(path, baud)
            .timeout(self.probe_timeout)
            .open()?;

        // Only checking, the session opens it for real.
        drop(port);

        Ok(())
    }

    fn open(&self, port: &PortDescriptor) -> Result<SerialLink, SerialPortError> {
        SerialLinkBuilder::new(&port.path)
            .set_baud(port.baud)
            .set_read_timeout(self.read_timeout)
            .build()
    }
}
