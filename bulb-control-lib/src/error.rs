//! Error types for the bulb control library.
//!
//! Only a subset of these ever reaches the caller synchronously
//! (`QueueFull`, `NotReady`, `Configuration`, `Unsupported`, `Draining`).
//! The rest are contained inside a connection or the discovery listener and
//! show up as state transitions and log lines.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::control_interface::command::Method;

/// Main error type for the library.
#[derive(Debug, Error)]
pub enum BulbError {
    /// A discovery reply that could not be turned into a device identity.
    #[error("Malformed discovery reply: {0}")]
    DiscoveryParse(String),

    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: SocketAddr, message: String },

    #[error("Connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    /// Read/write failure or peer close in the middle of a session.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Command queue is full (max {max})")]
    QueueFull { max: usize },

    /// A response carried an id with no outstanding command.
    #[error("No outstanding command for correlation id {0}")]
    CorrelationMismatch(u32),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No connection of the device is currently usable.
    #[error("Device {device_id} has no connected link")]
    NotReady { device_id: String },

    /// A bulb for this device id is already live.
    #[error("Device {device_id} is already active")]
    AlreadyActive { device_id: String },

    #[error("Device {device_id} does not support {method}")]
    Unsupported { device_id: String, method: Method },

    #[error("Connection is draining and no longer accepts commands")]
    Draining,

    #[error("Codec error: {0}")]
    Codec(String),

    /// The inbound byte stream cannot be resynchronised.
    #[error("Framing lost after {0} bytes without a frame delimiter")]
    FramingLost(usize),
}

impl BulbError {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        BulbError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// True for errors produced while establishing a link, as opposed to a
    /// failure of an established session.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            BulbError::Connect { .. } | BulbError::ConnectTimeout { .. }
        )
    }
}

impl From<std::io::Error> for BulbError {
    fn from(err: std::io::Error) -> Self {
        BulbError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BulbError {
    fn from(err: serde_json::Error) -> Self {
        BulbError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BulbError>;
