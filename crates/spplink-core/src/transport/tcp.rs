//! TCP transport for serial-over-TCP bridges

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use uuid::Uuid;

use super::{require_serial_profile, StreamPair, TcpChannel, Transport};
use crate::link::{DeviceId, TransportError};

/// Transport that treats `device_id` as `host:port`
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Transport bounding each TCP connect by `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn map_io_error(device_id: &DeviceId, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => TransportError::Refused(device_id.to_string()),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
        io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(device_id.to_string()),
        _ => TransportError::IoError(e),
    }
}

impl Transport for TcpTransport {
    fn open(
        &self,
        device_id: &DeviceId,
        profile_id: Uuid,
    ) -> Result<Box<dyn StreamPair>, TransportError> {
        require_serial_profile(device_id, profile_id)?;
        let addrs: Vec<SocketAddr> = device_id
            .as_str()
            .to_socket_addrs()
            .map_err(|_| TransportError::DeviceNotFound(device_id.to_string()))?
            .collect();

        tracing::info!(device = %device_id, profile = %profile_id, "opening tcp link");

        let mut last_err = TransportError::DeviceNotFound(device_id.to_string());
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("failed to set TCP_NODELAY: {}", e);
                    }
                    return Ok(Box::new(TcpChannel::new(stream)));
                }
                Err(e) => {
                    tracing::debug!(%addr, "tcp connect failed: {}", e);
                    last_err = map_io_error(device_id, e);
                }
            }
        }
        Err(last_err)
    }
}
