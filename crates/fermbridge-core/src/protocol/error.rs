//! Protocol errors

use thiserror::Error;

use super::ResponseKind;

/// Errors that can occur while talking to a controller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Line exceeded {max} bytes without a delimiter ({discarded} bytes discarded)")]
    FrameTooLong { max: usize, discarded: usize },

    #[error("Malformed '{prefix}' payload: {reason}")]
    Decode { prefix: String, reason: String },

    #[error("Cannot encode request argument: {0}")]
    Encode(String),

    #[error("A {0} request is already in flight")]
    RequestAlreadyInFlight(ResponseKind),

    #[error("No {0} response within the deadline")]
    Timeout(ResponseKind),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Controller rejected the command: {}", .0.as_deref().unwrap_or("no diagnostic"))]
    Rejected(Option<String>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected to controller")]
    NotConnected,

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Port not found for location: {0}")]
    PortNotFound(String),

    #[error("Session closed")]
    SessionClosed,
}

impl ProtocolError {
    /// Transport-level failures are the ones that push a session into reconnect
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Transport(_))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(e: tokio_serial::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}
