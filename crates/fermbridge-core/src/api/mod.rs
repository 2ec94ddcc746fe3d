//! Fermentrack REST API
//!
//! The [`FermentrackApi`] trait is the capability the device workers use to
//! reach the remote service; [`FermentrackClient`] implements it over HTTP.

mod client;
mod error;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::controller::{ControllerStatus, FullConfig};
use crate::protocol::DeviceListItem;

pub use client::FermentrackClient;
pub use error::{registration_error_message, ApiError};

/// Connection type reported when registering
pub const CONNECTION_TYPE: &str = "Serial (BSR)";

/// Device identity for authenticated endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub device_id: String,
    pub api_key: String,
}

/// Reply to a status push
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub has_messages: bool,
    pub updated_mode: Option<String>,
    #[serde(deserialize_with = "optional_f64")]
    pub updated_beer_set: Option<f64>,
    #[serde(deserialize_with = "optional_f64")]
    pub updated_fridge_set: Option<f64>,
}

/// A pending command from the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCommand {
    RestartDevice,
    ResetEeprom,
    ResetConnection,
    DefaultControlConstants,
    DefaultControlSettings,
    RefreshConfig,
    UpdatedControlSettings,
    UpdatedControlConstants,
    UpdatedDevices,
    UpdatedMinimumTimes,
}

impl RemoteCommand {
    /// Flag name on the messages endpoint
    pub fn flag(&self) -> &'static str {
        match self {
            RemoteCommand::RestartDevice => "restart_device",
            RemoteCommand::ResetEeprom => "reset_eeprom",
            RemoteCommand::ResetConnection => "reset_connection",
            RemoteCommand::DefaultControlConstants => "default_cc",
            RemoteCommand::DefaultControlSettings => "default_cs",
            RemoteCommand::RefreshConfig => "refresh_config",
            RemoteCommand::UpdatedControlSettings => "updated_cs",
            RemoteCommand::UpdatedControlConstants => "updated_cc",
            RemoteCommand::UpdatedDevices => "updated_devices",
            RemoteCommand::UpdatedMinimumTimes => "updated_mt",
        }
    }
}

/// Flag set returned by the messages endpoint
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessageFlags {
    #[serde(deserialize_with = "truthy")]
    pub restart_device: bool,
    #[serde(deserialize_with = "truthy")]
    pub reset_eeprom: bool,
    #[serde(deserialize_with = "truthy")]
    pub reset_connection: bool,
    #[serde(deserialize_with = "truthy")]
    pub updated_cc: bool,
    #[serde(deserialize_with = "truthy")]
    pub updated_cs: bool,
    #[serde(deserialize_with = "truthy")]
    pub updated_mt: bool,
    #[serde(deserialize_with = "truthy")]
    pub updated_devices: bool,
    #[serde(deserialize_with = "truthy")]
    pub refresh_config: bool,
    #[serde(deserialize_with = "truthy")]
    pub default_cc: bool,
    #[serde(deserialize_with = "truthy")]
    pub default_cs: bool,
}

impl MessageFlags {
    /// Commands to run, in processing order
    ///
    /// A restart or an EEPROM reset supersedes everything else in the batch;
    /// the remaining flags are picked up by a later poll.
    pub fn into_commands(self) -> Vec<RemoteCommand> {
        if self.restart_device {
            return vec![RemoteCommand::RestartDevice];
        }
        if self.reset_eeprom {
            return vec![RemoteCommand::ResetEeprom];
        }
        [
            (self.reset_connection, RemoteCommand::ResetConnection),
            (self.default_cc, RemoteCommand::DefaultControlConstants),
            (self.default_cs, RemoteCommand::DefaultControlSettings),
            (self.refresh_config, RemoteCommand::RefreshConfig),
            (self.updated_cs, RemoteCommand::UpdatedControlSettings),
            (self.updated_cc, RemoteCommand::UpdatedControlConstants),
            (self.updated_devices, RemoteCommand::UpdatedDevices),
            (self.updated_mt, RemoteCommand::UpdatedMinimumTimes),
        ]
        .into_iter()
        .filter_map(|(set, cmd)| set.then_some(cmd))
        .collect()
    }
}

/// Configuration the remote service wants installed on the controller
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(alias = "cs")]
    pub control_settings: Option<Map<String, Value>>,
    #[serde(alias = "cc")]
    pub control_constants: Option<Map<String, Value>>,
    pub devices: Option<Vec<DeviceListItem>>,
}

/// Registration request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationRequest {
    pub guid: String,
    pub hardware: String,
    pub version: String,
    pub username: String,
    pub name: String,
    pub connection_type: String,
}

/// Identity issued by a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub device_id: String,
    pub api_key: Option<String>,
}

/// Capability to talk to the remote service
#[async_trait]
pub trait FermentrackApi: Send + Sync {
    /// Push a status report
    async fn send_status(
        &self,
        creds: &Credentials,
        status: &ControllerStatus,
    ) -> Result<StatusResponse, ApiError>;

    /// Fetch pending remote commands
    async fn fetch_messages(&self, creds: &Credentials) -> Result<Vec<RemoteCommand>, ApiError>;

    /// Clear a handled command's flag
    async fn mark_message_processed(
        &self,
        creds: &Credentials,
        command: RemoteCommand,
    ) -> Result<(), ApiError>;

    /// Push the complete controller configuration
    async fn send_full_config(
        &self,
        creds: &Credentials,
        config: &FullConfig,
    ) -> Result<(), ApiError>;

    /// Fetch the configuration to install
    async fn fetch_full_config(&self, creds: &Credentials) -> Result<RemoteConfig, ApiError>;

    /// Register (or re-register) a device
    async fn register_device(&self, request: &RegistrationRequest)
        -> Result<Registration, ApiError>;
}

fn truthy<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    })
}

fn optional_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, got {}",
            other
        ))),
    }
}
