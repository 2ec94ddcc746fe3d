//! REST API errors

use thiserror::Error;

/// Errors from the remote service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Device is not registered with the remote service")]
    RegistrationRequired,

    #[error("Registration rejected: {message} (code {code})")]
    RegistrationRejected { code: i64, message: String },

    #[error("Missing device ID or API key")]
    MissingCredentials,
}

impl ApiError {
    /// Check whether the remote service has forgotten the device
    pub fn requires_registration(&self) -> bool {
        matches!(self, ApiError::RegistrationRequired)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Request(e.to_string())
        }
    }
}

/// Human-readable text for a registration `msg_code`
pub fn registration_error_message(code: i64) -> &'static str {
    match code {
        1 => "Missing device identifier (GUID)",
        2 => "Missing username or API key",
        3 => "User not found in Fermentrack",
        4 => "User does not have a brewhouse in Fermentrack",
        5 => "Missing hardware type information",
        6 => "Missing firmware version information",
        7 => "API key is not associated with a brewhouse",
        _ => "Unknown error from Fermentrack",
    }
}
