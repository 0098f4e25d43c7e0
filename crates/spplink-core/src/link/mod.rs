//! Serial Link Management
//!
//! Connection lifecycle, line reading and event publishing for a single
//! serial-port-profile link.

mod config;
mod error;
pub mod event;
mod manager;
pub mod reader;
mod state;

pub use config::LinkConfig;
pub use error::{LinkError, TransportError};
pub use event::{EventBroadcaster, EventSink, LinkEvent};
pub use manager::{Command, Completion, ConnectionManager, LinkStats, StateSnapshot};
pub use reader::{DecodeError, LineDecoder, LineReader, ReaderExit, ReaderOptions};
pub use state::{DeviceId, PublicState};

/// Default upper bound on a transport open in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default read timeout the line reader polls cancellation with, in milliseconds
pub const DEFAULT_READ_POLL_MS: u64 = 100;

/// Maximum line length in bytes
pub const MAX_LINE_LENGTH: usize = 8192;
