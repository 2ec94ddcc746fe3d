//! Response decoding
//!
//! Every line from the controller is classified by its prefix:
//!
//! | Prefix | Record | Payload |
//! |--------|--------|---------|
//! | `N:` | [`ResponseRecord::Version`] | object |
//! | `T:` | [`ResponseRecord::Temperatures`] | object |
//! | `L:` | [`ResponseRecord::LcdContent`] | array of strings |
//! | `S:` | [`ResponseRecord::Settings`] | object |
//! | `C:` | [`ResponseRecord::ControlConstants`] | object |
//! | `h:` | [`ResponseRecord::DeviceList`] | array of objects |
//! | `{"success":..}` | [`ResponseRecord::Success`] / [`ResponseRecord::Failure`] | none |
//!
//! Anything else decodes to [`ResponseRecord::Unknown`]. A known prefix with
//! a malformed payload is a [`ProtocolError::Decode`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::payload::{ControlConstants, ControlSettings, DeviceListItem, FirmwareInfo};
use super::ProtocolError;

/// Sensor name to reading; `None` means the sensor reported no value
pub type Temperatures = BTreeMap<String, Option<f64>>;

/// The kind of response a request waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResponseKind {
    Version,
    Temperatures,
    LcdContent,
    Settings,
    ControlConstants,
    DeviceList,
    /// Success/failure acknowledgement of a setter
    Ack,
}

impl ResponseKind {
    /// Wire prefix for typed responses
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            ResponseKind::Version => Some("N:"),
            ResponseKind::Temperatures => Some("T:"),
            ResponseKind::LcdContent => Some("L:"),
            ResponseKind::Settings => Some("S:"),
            ResponseKind::ControlConstants => Some("C:"),
            ResponseKind::DeviceList => Some("h:"),
            ResponseKind::Ack => None,
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseKind::Version => "version",
            ResponseKind::Temperatures => "temperatures",
            ResponseKind::LcdContent => "LCD",
            ResponseKind::Settings => "settings",
            ResponseKind::ControlConstants => "control constants",
            ResponseKind::DeviceList => "device list",
            ResponseKind::Ack => "acknowledgement",
        };
        f.write_str(name)
    }
}

/// A decoded response line
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseRecord {
    Version(FirmwareInfo),
    Temperatures(Temperatures),
    LcdContent(Vec<String>),
    Settings(ControlSettings),
    ControlConstants(ControlConstants),
    DeviceList(Vec<DeviceListItem>),
    Success,
    Failure(Option<String>),
    /// Unrecognized line, kept verbatim for diagnostics
    Unknown(String),
}

impl ResponseRecord {
    /// Kind used for correlation; `None` for unknown lines
    pub fn kind(&self) -> Option<ResponseKind> {
        match self {
            ResponseRecord::Version(_) => Some(ResponseKind::Version),
            ResponseRecord::Temperatures(_) => Some(ResponseKind::Temperatures),
            ResponseRecord::LcdContent(_) => Some(ResponseKind::LcdContent),
            ResponseRecord::Settings(_) => Some(ResponseKind::Settings),
            ResponseRecord::ControlConstants(_) => Some(ResponseKind::ControlConstants),
            ResponseRecord::DeviceList(_) => Some(ResponseKind::DeviceList),
            ResponseRecord::Success | ResponseRecord::Failure(_) => Some(ResponseKind::Ack),
            ResponseRecord::Unknown(_) => None,
        }
    }
}

/// Decode one framed line
pub fn decode_line(line: &str) -> Result<ResponseRecord, ProtocolError> {
    let line = line.trim();

    if let Some((prefix, payload)) = split_prefix(line) {
        return match prefix {
            "N:" => parse(prefix, payload).map(ResponseRecord::Version),
            "T:" => parse_temperatures(payload).map(ResponseRecord::Temperatures),
            "L:" => parse(prefix, payload).map(ResponseRecord::LcdContent),
            "S:" => parse(prefix, payload).map(ResponseRecord::Settings),
            "C:" => parse(prefix, payload).map(ResponseRecord::ControlConstants),
            "h:" => parse(prefix, payload).map(ResponseRecord::DeviceList),
            _ => Ok(ResponseRecord::Unknown(line.to_string())),
        };
    }

    if line.starts_with('{') {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) {
            if let Some(success) = obj.get("success") {
                return Ok(if is_truthy(success) {
                    ResponseRecord::Success
                } else {
                    let message = obj
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    ResponseRecord::Failure(message)
                });
            }
        }
    }

    Ok(ResponseRecord::Unknown(line.to_string()))
}

fn split_prefix(line: &str) -> Option<(&'static str, &str)> {
    const PREFIXES: [&str; 6] = ["N:", "T:", "L:", "S:", "C:", "h:"];
    PREFIXES
        .iter()
        .find(|p| line.starts_with(**p))
        .map(|p| (*p, &line[p.len()..]))
}

fn parse<T: DeserializeOwned>(prefix: &str, payload: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::Decode {
        prefix: prefix.to_string(),
        reason: e.to_string(),
    })
}

fn parse_temperatures(payload: &str) -> Result<Temperatures, ProtocolError> {
    let raw: serde_json::Map<String, Value> = parse("T:", payload)?;
    let mut temps = Temperatures::new();
    for (name, value) in raw {
        let reading = match &value {
            Value::Number(n) => n.as_f64(),
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().parse::<f64>().map_err(|_| ProtocolError::Decode {
                prefix: "T:".to_string(),
                reason: format!("sensor '{}' has non-numeric reading {:?}", name, s),
            })?),
            other => {
                return Err(ProtocolError::Decode {
                    prefix: "T:".to_string(),
                    reason: format!("sensor '{}' has unexpected value {}", name, other),
                })
            }
        };
        temps.insert(name, reading);
    }
    Ok(temps)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}
