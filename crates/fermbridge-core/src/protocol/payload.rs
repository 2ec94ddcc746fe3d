//! Typed payloads carried by controller responses
//!
//! Field names follow the firmware's JSON keys so that payloads can be
//! forwarded to the remote service unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Temperature display unit reported in the control constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempFormat {
    #[default]
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
}

impl TempFormat {
    /// Single-letter wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            TempFormat::Celsius => "C",
            TempFormat::Fahrenheit => "F",
        }
    }
}

impl fmt::Display for TempFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerMode {
    #[serde(rename = "b")]
    BeerConstant,
    #[serde(rename = "f")]
    FridgeConstant,
    #[serde(rename = "p")]
    Profile,
    #[default]
    #[serde(rename = "o")]
    Off,
}

impl ControllerMode {
    /// Single-letter wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerMode::BeerConstant => "b",
            ControllerMode::FridgeConstant => "f",
            ControllerMode::Profile => "p",
            ControllerMode::Off => "o",
        }
    }

    /// Parse the single-letter wire form
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "b" => Some(ControllerMode::BeerConstant),
            "f" => Some(ControllerMode::FridgeConstant),
            "p" => Some(ControllerMode::Profile),
            "o" => Some(ControllerMode::Off),
            _ => None,
        }
    }
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware identification from the `N:` response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Firmware version (`v`)
    #[serde(rename = "v")]
    pub version: String,

    /// Extended version string (`e`), preferred over `v` when present
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extended_version: Option<String>,

    /// Board type code (`b`)
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,

    /// Source commit (`c`)
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Remaining keys (`n`, `s`, `y`, `l`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FirmwareInfo {
    /// Version to report: the extended version if the firmware sent one
    pub fn reported_version(&self) -> &str {
        self.extended_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.version)
    }

    /// Human-readable board name
    pub fn board_name(&self) -> String {
        board_name(self.board.as_deref().unwrap_or("?"))
    }
}

/// Translate a board type code to a human-readable name
pub fn board_name(code: &str) -> String {
    let name = match code {
        "l" => "Arduino Leonardo",
        "s" => "Arduino",
        "m" => "Arduino Mega",
        "e" => "ESP8266",
        "3" => "ESP32",
        "c" => "ESP32-C3",
        "2" => "ESP32-S2",
        "?" => "Unknown",
        other => return format!("Unknown ({})", other),
    };
    name.to_string()
}

/// Control settings from the `S:` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSettings {
    pub mode: ControllerMode,
    #[serde(default)]
    pub beer_set: f64,
    #[serde(default)]
    pub fridge_set: f64,
    #[serde(default)]
    pub heat_est: f64,
    #[serde(default)]
    pub cool_est: f64,
    /// Keys this bridge does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Control constants from the `C:` response
///
/// Only `tempFormat` is interpreted; the PID and filter constants are kept
/// verbatim for forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConstants {
    #[serde(rename = "tempFormat", default)]
    pub temp_format: TempFormat,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

/// Hardware type of a device-list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHardware {
    None,
    Pin,
    OneWireTemp,
    OneWire2413,
    BluetoothInkbird,
    BluetoothTilt,
    TplinkSwitch,
    Other(i64),
}

impl From<i64> for DeviceHardware {
    fn from(code: i64) -> Self {
        match code {
            0 => DeviceHardware::None,
            1 => DeviceHardware::Pin,
            2 => DeviceHardware::OneWireTemp,
            3 => DeviceHardware::OneWire2413,
            5 => DeviceHardware::BluetoothInkbird,
            6 => DeviceHardware::BluetoothTilt,
            7 => DeviceHardware::TplinkSwitch,
            other => DeviceHardware::Other(other),
        }
    }
}

/// A device's physical attachment: a pin number or a bus address
#[derive(Debug, Clone, PartialEq)]
pub enum PinOrAddress {
    Pin(i64),
    Address(Value),
}

/// One compact entry of the `h:` device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListItem {
    /// Slot index
    pub i: i64,
    /// Chamber
    pub c: i64,
    /// Beer
    pub b: i64,
    /// Function
    pub f: i64,
    /// Hardware type
    pub h: i64,
    /// Pin
    pub p: i64,
    /// Inverted output
    #[serde(default)]
    pub x: i64,
    /// Deactivated
    #[serde(default)]
    pub d: i64,
    /// OneWire address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Value>,
    /// Child id / PIO
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    /// Calibration adjustment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub j: Option<f64>,
    /// Current sensor value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<f64>,
    /// Current actuator write value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
}

impl DeviceListItem {
    pub fn index(&self) -> i64 {
        self.i
    }

    pub fn kind(&self) -> DeviceHardware {
        DeviceHardware::from(self.h)
    }

    /// OneWire devices are addressed on the bus, everything else by pin
    pub fn pin_or_address(&self) -> PinOrAddress {
        match (&self.a, self.kind()) {
            (Some(addr), DeviceHardware::OneWireTemp | DeviceHardware::OneWire2413) => {
                PinOrAddress::Address(addr.clone())
            }
            _ => PinOrAddress::Pin(self.p),
        }
    }
}
