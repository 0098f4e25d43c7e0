//! Serial port transport
//!
//! Opens a tty that the platform has already bound to a bonded device's
//! serial-port profile (e.g. `/dev/rfcomm0` after `rfcomm bind`), or any
//! wired serial adapter speaking the same line protocol.

use serialport::SerialPort;
use std::time::Duration;
use uuid::Uuid;

use super::{require_serial_profile, SerialChannel, StreamPair, Transport};
use crate::link::{DeviceId, TransportError};

/// Default baud rate; RFCOMM ignores it, wired adapters do not
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Transport that opens `device_id` as a serial port path
#[derive(Debug, Clone)]
pub struct SerialPortTransport {
    baud_rate: u32,
}

impl Default for SerialPortTransport {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl SerialPortTransport {
    /// Transport opening ports at `baud_rate`
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

fn map_serial_error(name: &str, e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(name.to_string()),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::DeviceNotFound(name.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied(name.to_string())
        }
        _ => TransportError::SerialError(e.to_string()),
    }
}

/// Open a serial port with 8N1 framing and no flow control
fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    serialport::new(name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| map_serial_error(name, e))
}

/// Assert DTR so the remote end sees the terminal as present
fn configure_port(port: &mut dyn SerialPort) {
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("failed to set DTR high: {} (continuing)", e);
    }
}

impl Transport for SerialPortTransport {
    fn open(
        &self,
        device_id: &DeviceId,
        profile_id: Uuid,
    ) -> Result<Box<dyn StreamPair>, TransportError> {
        require_serial_profile(device_id, profile_id)?;
        tracing::info!(
            device = %device_id,
            profile = %profile_id,
            baud = self.baud_rate,
            "opening serial port"
        );
        let mut port = open_port(device_id.as_str(), self.baud_rate)?;
        configure_port(port.as_mut());
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| map_serial_error(device_id.as_str(), e))?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}
