//! Controller state snapshot

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::{
    ControlConstants, ControlSettings, ControllerMode, DeviceListItem, FirmwareInfo,
    ResponseRecord, TempFormat, Temperatures,
};

/// Number of LCD lines on the controller display
pub const LCD_LINES: usize = 4;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Transport opened, waiting for the controller to speak
    Connecting,
    /// Connected and idle
    Connected,
    /// Connected with at least one request outstanding
    AwaitingResponse,
    /// Transport lost, reconnect in progress
    Degraded,
    /// Reconnect attempts exhausted; waiting for an explicit reconnect
    Failed,
}

impl SessionState {
    /// Check whether requests can currently be written to the controller
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::AwaitingResponse
        )
    }
}

/// Authoritative snapshot of one controller
///
/// Only the session mutates this, by applying decoded responses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    /// LCD line index to text
    pub lcd: BTreeMap<usize, String>,
    pub temps: Temperatures,
    pub temp_format: TempFormat,
    pub mode: ControllerMode,
    pub firmware: Option<FirmwareInfo>,
    pub settings: Option<ControlSettings>,
    pub constants: Option<ControlConstants>,
    pub devices: Option<Vec<DeviceListItem>>,
}

impl ControllerState {
    /// Fold a response into the snapshot; returns whether anything changed
    pub fn apply(&mut self, record: &ResponseRecord) -> bool {
        match record {
            ResponseRecord::Version(info) => replace(&mut self.firmware, Some(info.clone())),
            ResponseRecord::Temperatures(temps) => replace(&mut self.temps, temps.clone()),
            ResponseRecord::LcdContent(lines) => {
                let lcd = lines
                    .iter()
                    .take(LCD_LINES)
                    .cloned()
                    .enumerate()
                    .collect::<BTreeMap<_, _>>();
                replace(&mut self.lcd, lcd)
            }
            ResponseRecord::Settings(cs) => {
                let mode_changed = replace(&mut self.mode, cs.mode);
                replace(&mut self.settings, Some(cs.clone())) || mode_changed
            }
            ResponseRecord::ControlConstants(cc) => {
                let format_changed = replace(&mut self.temp_format, cc.temp_format);
                replace(&mut self.constants, Some(cc.clone())) || format_changed
            }
            ResponseRecord::DeviceList(items) => replace(&mut self.devices, Some(items.clone())),
            ResponseRecord::Success | ResponseRecord::Failure(_) | ResponseRecord::Unknown(_) => {
                false
            }
        }
    }

    /// LCD as exactly [`LCD_LINES`] lines, blank where unknown
    pub fn lcd_lines(&self) -> Vec<String> {
        (0..LCD_LINES)
            .map(|i| self.lcd.get(&i).cloned().unwrap_or_default())
            .collect()
    }

    /// Status report for the remote service
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            lcd: self.lcd_lines(),
            temps: self.temps.clone(),
            temp_format: self.temp_format,
            mode: self.mode,
        }
    }

    /// Full configuration (`cs`, `cc`, `devices`) for the remote service
    pub fn full_config(&self) -> FullConfig {
        FullConfig {
            cs: self.settings.clone(),
            cc: self.constants.clone(),
            devices: self.devices.clone().unwrap_or_default(),
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Periodic status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub lcd: Vec<String>,
    pub temps: Temperatures,
    pub temp_format: TempFormat,
    pub mode: ControllerMode,
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cs: Option<ControlSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<ControlConstants>,
    #[serde(default)]
    pub devices: Vec<DeviceListItem>,
}
