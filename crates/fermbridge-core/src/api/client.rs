//! HTTP client for the Fermentrack device endpoints

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::{
    registration_error_message, ApiError, Credentials, FermentrackApi, MessageFlags,
    RegistrationRequest, Registration, RemoteCommand, RemoteConfig, StatusResponse,
};
use crate::controller::{ControllerStatus, FullConfig};

const STATUS_ENDPOINT: &str = "/api/brewpi/device/status/";
const MESSAGES_ENDPOINT: &str = "/api/brewpi/device/messages/";
const FULL_CONFIG_ENDPOINT: &str = "/api/brewpi/device/full-config/";
const REGISTER_ENDPOINT: &str = "/api/brewpi/device/register/";

/// Fermentrack REST client
#[derive(Debug, Clone)]
pub struct FermentrackClient {
    client: reqwest::Client,
    base_url: String,
}

impl FermentrackClient {
    /// Create a client for `base_url` (e.g. `http://localhost:80`)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fermbridge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, endpoint))
    }

    /// Send and decode a JSON reply
    ///
    /// 404 on a device endpoint means the service no longer knows the device.
    async fn execute(&self, builder: RequestBuilder) -> Result<Value, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::RegistrationRequired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

fn with_auth<T: Serialize>(creds: &Credentials, body: &T) -> Result<Value, ApiError> {
    let mut value =
        serde_json::to_value(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert("deviceID".into(), Value::String(creds.device_id.clone()));
            obj.insert("apiKey".into(), Value::String(creds.api_key.clone()));
            Ok(value)
        }
        None => Err(ApiError::InvalidResponse(
            "request body is not a JSON object".to_string(),
        )),
    }
}

fn auth_query(creds: &Credentials) -> Result<[(&'static str, String); 2], ApiError> {
    if creds.device_id.is_empty() || creds.api_key.is_empty() {
        return Err(ApiError::MissingCredentials);
    }
    Ok([
        ("deviceID", creds.device_id.clone()),
        ("apiKey", creds.api_key.clone()),
    ])
}

fn decode<T: serde::de::DeserializeOwned + Default>(value: Value) -> Result<T, ApiError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl FermentrackApi for FermentrackClient {
    async fn send_status(
        &self,
        creds: &Credentials,
        status: &ControllerStatus,
    ) -> Result<StatusResponse, ApiError> {
        auth_query(creds)?;
        let body = with_auth(creds, status)?;
        tracing::debug!(device_id = %creds.device_id, "sending status update");
        let reply = self
            .execute(self.request(Method::PUT, STATUS_ENDPOINT).json(&body))
            .await?;
        decode(reply)
    }

    async fn fetch_messages(&self, creds: &Credentials) -> Result<Vec<RemoteCommand>, ApiError> {
        let query = auth_query(creds)?;
        let reply = self
            .execute(self.request(Method::GET, MESSAGES_ENDPOINT).query(&query))
            .await?;
        let flags: MessageFlags = decode(reply)?;
        Ok(flags.into_commands())
    }

    async fn mark_message_processed(
        &self,
        creds: &Credentials,
        command: RemoteCommand,
    ) -> Result<(), ApiError> {
        auth_query(creds)?;
        let mut flag = Map::new();
        flag.insert(command.flag().to_string(), Value::Bool(false));
        let body = with_auth(creds, &flag)?;
        tracing::debug!(flag = command.flag(), "marking message processed");
        self.execute(self.request(Method::PATCH, MESSAGES_ENDPOINT).json(&body))
            .await
            .map(|_| ())
    }

    async fn send_full_config(
        &self,
        creds: &Credentials,
        config: &FullConfig,
    ) -> Result<(), ApiError> {
        auth_query(creds)?;
        let body = with_auth(creds, config)?;
        tracing::debug!(device_id = %creds.device_id, "sending full configuration");
        self.execute(self.request(Method::PUT, FULL_CONFIG_ENDPOINT).json(&body))
            .await
            .map(|_| ())
    }

    async fn fetch_full_config(&self, creds: &Credentials) -> Result<RemoteConfig, ApiError> {
        let query = auth_query(creds)?;
        let reply = self
            .execute(self.request(Method::GET, FULL_CONFIG_ENDPOINT).query(&query))
            .await?;
        decode(reply)
    }

    async fn register_device(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Registration, ApiError> {
        tracing::info!(guid = %request.guid, "registering device");
        let builder = self.request(Method::PUT, REGISTER_ENDPOINT).json(request);
        let reply = match self.execute(builder).await {
            // The register endpoint itself never means "unknown device"
            Err(ApiError::RegistrationRequired) => {
                return Err(ApiError::Http {
                    status: 404,
                    body: "registration endpoint not found".to_string(),
                })
            }
            other => other?,
        };
        parse_registration(&reply)
    }
}

fn parse_registration(reply: &Value) -> Result<Registration, ApiError> {
    let success = reply
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !success {
        let code = reply.get("msg_code").and_then(Value::as_i64).unwrap_or(999);
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| registration_error_message(code).to_string());
        return Err(ApiError::RegistrationRejected { code, message });
    }
    let device_id = match reply.get("deviceID") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(ApiError::InvalidResponse(
                "registration reply has no deviceID".to_string(),
            ))
        }
    };
    let api_key = reply
        .get("apiKey")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    Ok(Registration { device_id, api_key })
}
