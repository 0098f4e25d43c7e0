//! Connection state model

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::StreamPair;

/// Opaque identifier of an already-bonded device.
///
/// For Bluetooth devices this is typically the MAC address (`"AA:BB:CC:DD:EE:FF"`),
/// for the serial transport a tty path and for the TCP transport `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection state as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicState {
    /// Not connected
    NotConnected,
    /// Transport open in flight
    Connecting,
    /// Connected, lines are being read
    Connected,
    /// Connection attempt failed or the link dropped
    Error,
}

/// Internal connection state, owned by the command executor.
///
/// `Connected` holds the open stream pair; it never leaves the executor.
pub(crate) enum ConnectionState {
    NotConnected,
    Connecting {
        device_id: DeviceId,
    },
    Connected {
        device_id: DeviceId,
        stream: Box<dyn StreamPair>,
    },
}

impl ConnectionState {
    pub(crate) fn summary(&self) -> PublicState {
        match self {
            ConnectionState::NotConnected => PublicState::NotConnected,
            ConnectionState::Connecting { .. } => PublicState::Connecting,
            ConnectionState::Connected { .. } => PublicState::Connected,
        }
    }

    pub(crate) fn device_id(&self) -> Option<&DeviceId> {
        match self {
            ConnectionState::NotConnected => None,
            ConnectionState::Connecting { device_id }
            | ConnectionState::Connected { device_id, .. } => Some(device_id),
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotConnected => f.write_str("NotConnected"),
            ConnectionState::Connecting { device_id } => {
                write!(f, "Connecting({})", device_id)
            }
            ConnectionState::Connected { device_id, .. } => {
                write!(f, "Connected({})", device_id)
            }
        }
    }
}
