//! Byte transports and the openers that produce them

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits};

use super::serial::resolve_port;
use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Abstraction for byte links to a controller (serial port or in-memory pipe)
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned transport as handed to a session
pub type BoxedTransport = Box<dyn Transport>;

/// Opens a fresh transport for every (re)connect attempt
#[async_trait]
pub trait TransportOpener: Send + Sync {
    /// Open the link
    async fn open(&self) -> Result<BoxedTransport, ProtocolError>;

    /// Human-readable target, used in logs
    fn describe(&self) -> String;
}

/// Opens the serial port a USB location currently maps to
#[derive(Debug, Clone)]
pub struct SerialOpener {
    location: String,
    baud_rate: u32,
    /// Fixed port path, skipping location resolution
    port: Option<String>,
}

impl SerialOpener {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            port: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }
}

#[async_trait]
impl TransportOpener for SerialOpener {
    async fn open(&self) -> Result<BoxedTransport, ProtocolError> {
        // Resolved on every attempt: the device may re-enumerate after a reset
        let path = match &self.port {
            Some(p) => p.clone(),
            None => resolve_port(&self.location)?,
        };

        let mut port = tokio_serial::new(&path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()?;

        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::debug!(port = %path, "failed to set DTR high: {} (continuing)", e);
        }
        if let Err(e) = port.clear(tokio_serial::ClearBuffer::All) {
            tracing::debug!(port = %path, "failed to clear buffers: {} (continuing)", e);
        }

        tracing::info!(port = %path, baud = self.baud_rate, "serial port opened");
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        match &self.port {
            Some(p) => p.clone(),
            None => format!("USB location {}", self.location),
        }
    }
}
