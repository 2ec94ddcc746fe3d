//! Controller requests
//!
//! Defines the requests understood by BrewPi-compatible firmware and their
//! wire encoding. Every request is a single ASCII letter, optionally followed
//! by a JSON argument, terminated by `\n`.

use bytes::{BufMut, BytesMut};
use serde_json::{Map, Value};
use std::io;
use tokio_util::codec::Encoder;

use super::ResponseKind;

/// Requests that can be sent to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Firmware version ('n')
    Version,

    /// Temperature readings ('t')
    Temperatures,

    /// LCD content ('l')
    Lcd,

    /// Control settings ('s')
    Settings,

    /// Control constants ('c')
    ControlConstants,

    /// Installed/available device list ('h{}')
    DeviceList,

    /// Assign a single parameter ('j{"name":value}')
    SetParameter { name: String, value: Value },

    /// Update control settings ('j{...}')
    SetControlSettings(Map<String, Value>),

    /// Update control constants ('j{...}')
    SetControlConstants(Map<String, Value>),

    /// Update one device definition ('U{...}')
    SetDevice(Map<String, Value>),

    /// Reboot the controller ('R')
    RestartDevice,

    /// Wipe EEPROM back to defaults ('E')
    ResetEeprom,

    /// Load default control settings ('S')
    DefaultControlSettings,

    /// Load default control constants ('C')
    DefaultControlConstants,
}

/// What the controller sends back for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// A typed response
    Response(ResponseKind),
    /// A success/failure acknowledgement
    Ack,
    /// Nothing; the request is fire-and-forget
    Nothing,
}

impl Request {
    /// Get the command letter
    pub fn letter(&self) -> u8 {
        match self {
            Request::Version => b'n',
            Request::Temperatures => b't',
            Request::Lcd => b'l',
            Request::Settings => b's',
            Request::ControlConstants => b'c',
            Request::DeviceList => b'h',
            Request::SetParameter { .. }
            | Request::SetControlSettings(_)
            | Request::SetControlConstants(_) => b'j',
            Request::SetDevice(_) => b'U',
            Request::RestartDevice => b'R',
            Request::ResetEeprom => b'E',
            Request::DefaultControlSettings => b'S',
            Request::DefaultControlConstants => b'C',
        }
    }

    /// Response this request waits for
    pub fn expects(&self) -> Expect {
        match self {
            Request::Version => Expect::Response(ResponseKind::Version),
            Request::Temperatures => Expect::Response(ResponseKind::Temperatures),
            Request::Lcd => Expect::Response(ResponseKind::LcdContent),
            Request::Settings => Expect::Response(ResponseKind::Settings),
            Request::ControlConstants => Expect::Response(ResponseKind::ControlConstants),
            Request::DeviceList => Expect::Response(ResponseKind::DeviceList),
            Request::SetParameter { .. }
            | Request::SetControlSettings(_)
            | Request::SetControlConstants(_)
            | Request::SetDevice(_) => Expect::Ack,
            Request::RestartDevice
            | Request::ResetEeprom
            | Request::DefaultControlSettings
            | Request::DefaultControlConstants => Expect::Nothing,
        }
    }

    /// Correlation slot this request occupies, if any
    pub fn slot(&self) -> Option<ResponseKind> {
        match self.expects() {
            Expect::Response(kind) => Some(kind),
            Expect::Ack => Some(ResponseKind::Ack),
            Expect::Nothing => None,
        }
    }

    /// Check whether this request changes controller state
    pub fn is_setter(&self) -> bool {
        self.expects() == Expect::Ack
    }

    /// Wire form without the trailing newline
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.letter()];
        match self {
            Request::DeviceList => out.extend_from_slice(b"{}"),
            Request::SetParameter { name, value } => {
                let mut arg = Map::new();
                arg.insert(name.clone(), value.clone());
                out.extend_from_slice(Value::Object(arg).to_string().as_bytes());
            }
            Request::SetControlSettings(arg)
            | Request::SetControlConstants(arg)
            | Request::SetDevice(arg) => {
                out.extend_from_slice(Value::Object(arg.clone()).to_string().as_bytes());
            }
            _ => {}
        }
        out
    }
}

/// Encoder for [`Request`]s on a `FramedWrite`
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEncoder;

impl Encoder<Request> for RequestEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), io::Error> {
        let wire = item.encode();
        dst.reserve(wire.len() + 1);
        dst.put_slice(&wire);
        dst.put_u8(b'\n');
        Ok(())
    }
}
