//! Link configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::{LinkError, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_READ_POLL_MS, MAX_LINE_LENGTH};
use crate::transport::SPP_PROFILE_ID;

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service profile dialed on the remote device
    pub profile_id: Uuid,
    /// Upper bound on a single transport open, in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout used by the line reader to notice cancellation, in milliseconds
    pub read_poll_ms: u64,
    /// Lines longer than this many bytes are discarded
    pub max_line_length: usize,
    /// Capacity of the reader to delivery queue
    pub line_queue_capacity: usize,
    /// Events buffered per lagging broadcast subscriber
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            profile_id: SPP_PROFILE_ID,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_poll_ms: DEFAULT_READ_POLL_MS,
            max_line_length: MAX_LINE_LENGTH,
            line_queue_capacity: 256,
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, LinkError> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.connect_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.read_poll_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "read_poll_ms must be greater than zero".into(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(LinkError::InvalidConfig(
                "max_line_length must be greater than zero".into(),
            ));
        }
        if self.line_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(LinkError::InvalidConfig(
                "queue capacities must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Transport open timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reader poll interval
    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}
