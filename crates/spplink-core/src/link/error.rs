//! Link errors

use std::time::Duration;
use thiserror::Error;

use super::state::DeviceId;

/// Errors a [`Transport`](crate::transport::Transport) reports when a link cannot be opened
#[derive(Error, Debug)]
pub enum TransportError {
    /// The OS refused access to the device
    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    /// The device has no service for the requested profile
    #[error("Device {device} does not offer profile {profile}")]
    ProfileNotOffered {
        /// Device that was asked
        device: String,
        /// Requested profile id
        profile: String,
    },

    /// The remote end rejected the connection
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The transport gave up waiting for the remote end
    #[error("Connection timeout")]
    Timeout,

    /// No such device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error reported by the serial port driver
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Any other I/O failure while opening
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors surfaced by the connection manager
#[derive(Error, Debug)]
pub enum LinkError {
    /// Opening the link failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connect timeout elapsed before the transport returned
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// `Send` while no link is up
    #[error("Not connected to a device")]
    NotConnected,

    /// A timed-out open is still running against the transport
    #[error("Previous connection attempt to {0} is still in progress")]
    OpenInProgress(DeviceId),

    /// The command executor is gone
    #[error("Connection manager has stopped")]
    ManagerStopped,

    /// Configuration could not be parsed or failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Read or write failure on an open link
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::InvalidConfig(e.to_string())
    }
}
