//! Serial port discovery
//!
//! Enumerates serial ports and maps USB locations (e.g. `1-1` or
//! `1-1:1.0`) to port paths.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;

use super::ProtocolError;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,

    /// USB location, e.g. `1-1:1.0` (Linux only)
    pub location: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None),
        };

        let location = sysfs_device_path(&info.port_name)
            .as_deref()
            .and_then(usb_location);

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            serial_number,
            location,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports in a deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Find the port currently attached at a USB location
pub fn resolve_port(location: &str) -> Result<String, ProtocolError> {
    list_ports()
        .into_iter()
        .find(|p| {
            sysfs_device_path(&p.name)
                .map(|path| location_matches(&path, location))
                .unwrap_or(false)
        })
        .map(|p| p.name)
        .ok_or_else(|| ProtocolError::PortNotFound(location.to_string()))
}

/// Canonical sysfs path of the device behind a tty
#[cfg(target_os = "linux")]
fn sysfs_device_path(port_name: &str) -> Option<String> {
    let basename = port_name.rsplit('/').next()?;
    let link = Path::new("/sys/class/tty").join(basename).join("device");
    fs::canonicalize(link)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "linux"))]
fn sysfs_device_path(_port_name: &str) -> Option<String> {
    None
}

/// Check whether a sysfs device path sits under a USB location
///
/// A path component must either equal the location or be an interface of it
/// (`<location>:<config>.<interface>`).
pub fn location_matches(device_path: &str, location: &str) -> bool {
    if location.is_empty() {
        return false;
    }
    Path::new(device_path).components().any(|c| {
        let part = c.as_os_str().to_string_lossy();
        part == location
            || part
                .strip_prefix(location)
                .map(|rest| rest.starts_with(':'))
                .unwrap_or(false)
    })
}

/// USB interface location (`1-1:1.0`) from a sysfs device path
fn usb_location(device_path: &str) -> Option<String> {
    Path::new(device_path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|part| {
            part.contains(':')
                && part
                    .chars()
                    .next()
                    .map(|ch| ch.is_ascii_digit())
                    .unwrap_or(false)
                && part.contains('-')
        })
        .last()
}
