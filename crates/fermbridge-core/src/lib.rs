//! # fermbridge core library
//!
//! Bridges serial BrewPi-style temperature controllers to a Fermentrack
//! server.
//!
//! This library provides:
//! - The line-oriented controller protocol (framing, decoding, request
//!   encoding and untagged request/response correlation)
//! - Controller sessions with automatic reconnect
//! - Device workers that push controller state to Fermentrack and run the
//!   commands it queues
//! - A supervisor that keeps one worker per configured device alive
//! - Configuration directory loading and the Fermentrack REST client
//!
//! ## Example
//!
//! ```rust,ignore
//! use fermbridge_core::prelude::*;
//! use std::sync::Arc;
//!
//! let opener = Arc::new(SerialOpener::new("1-1"));
//! let (session, _task) = ControllerSession::spawn(
//!     SessionConfig::new("1-1"),
//!     opener,
//!     CancellationToken::new(),
//! );
//! let temps = session.request_temperatures().await?;
//! println!("beer: {:?}", temps.get("BeerTemp"));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod api;
pub mod config;
pub mod controller;
pub mod protocol;
pub mod supervisor;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{ApiError, FermentrackApi, FermentrackClient};
    pub use crate::config::{AppConfig, ConfigDir, ConfigError, DeviceConfig};
    pub use crate::controller::{
        ControllerSession, ControllerState, SessionConfig, SessionHandle, SessionState,
    };
    pub use crate::protocol::{ProtocolError, Request, ResponseRecord, SerialOpener};
    pub use crate::supervisor::{Supervisor, SupervisorSettings};
    pub use crate::worker::{DeviceWorkerSpawner, WorkerContext, WorkerHealth, WorkerSettings};
    pub use tokio_util::sync::CancellationToken;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
