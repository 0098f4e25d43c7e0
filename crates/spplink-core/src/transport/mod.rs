//! Link transports
//!
//! A [`Transport`] opens a byte-stream connection to a bonded device and hands
//! back a [`StreamPair`]. The connection manager owns the pair exclusively; the
//! line reader only ever sees a cloned read handle.

mod serial;
mod stream;
mod tcp;

use std::io::{self, Read, Write};
use std::time::Duration;
use uuid::Uuid;

use crate::link::{DeviceId, TransportError};

pub use serial::{SerialPortTransport, DEFAULT_BAUD_RATE};
pub use stream::{SerialChannel, TcpChannel};
pub use tcp::TcpTransport;

/// Serial Port Profile service class UUID
pub const SPP_PROFILE_ID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// Bound ttys and serial bridges only ever carry the serial port profile
fn require_serial_profile(device_id: &DeviceId, profile_id: Uuid) -> Result<(), TransportError> {
    if profile_id == SPP_PROFILE_ID {
        Ok(())
    } else {
        Err(TransportError::ProfileNotOffered {
            device: device_id.to_string(),
            profile: profile_id.to_string(),
        })
    }
}

/// Opens byte-stream connections to devices
pub trait Transport: Send + Sync {
    /// Open a connection to `device_id` using service `profile_id`.
    ///
    /// May block for the whole remote handshake.
    fn open(
        &self,
        device_id: &DeviceId,
        profile_id: Uuid,
    ) -> Result<Box<dyn StreamPair>, TransportError>;
}

/// Readable and writable halves of an open link
pub trait StreamPair: Read + Write + Send {
    /// Set the timeout for blocking reads on this stream and on readers cloned afterwards
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Independent read handle onto the same stream
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Close the stream and release the underlying handle
    fn close(&mut self) -> io::Result<()>;
}
