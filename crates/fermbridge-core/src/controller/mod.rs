//! Controller sessions
//!
//! A session owns one transport to one controller and keeps the
//! authoritative [`ControllerState`] for it.

mod backoff;
mod session;
mod state;

pub use backoff::{Backoff, BackoffPolicy};
pub use session::{ControllerSession, SessionConfig, SessionHandle};
pub use state::{ControllerState, ControllerStatus, FullConfig, SessionState, LCD_LINES};
