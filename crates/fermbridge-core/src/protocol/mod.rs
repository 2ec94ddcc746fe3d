//! Serial Protocol Communication
//!
//! Implements the line-oriented BrewPi serial protocol: framing, response
//! decoding, request encoding and untagged request/response correlation.

pub mod commands;
mod correlator;
mod error;
mod framer;
pub mod payload;
mod response;
pub mod serial;
mod stream;

pub use commands::{Expect, Request, RequestEncoder};
pub use correlator::{Correlator, Reply, Resolution};
pub use error::ProtocolError;
pub use framer::{FramedLine, LineFramer, RawFrame};
pub use payload::{
    ControlConstants, ControlSettings, ControllerMode, DeviceHardware, DeviceListItem,
    FirmwareInfo, PinOrAddress, TempFormat,
};
pub use response::{decode_line, ResponseKind, ResponseRecord, Temperatures};
pub use serial::{list_ports, resolve_port, PortInfo};
pub use stream::{BoxedTransport, SerialOpener, Transport, TransportOpener};

/// Default baud rate for controller communication
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum buffered line length before the framer discards input
pub const MAX_LINE_LENGTH: usize = 4096;
