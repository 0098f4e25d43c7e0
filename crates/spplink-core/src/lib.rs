//! # spplink Core Library
//!
//! Connection manager for serial-port-profile (SPP) links.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A single-writer connection manager that serializes connect, disconnect
//!   and send commands against one link
//! - A cancellable line reader that turns the incoming byte stream into text lines
//! - State and line events fanned out to listeners
//! - Serial port and TCP transports
//!
//! The device directory (discovery, pairing, permissions) stays outside this
//! crate; the manager only needs the identifier of an already-bonded device.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spplink_core::{link::{ConnectionManager, LinkConfig}, transport::SerialPortTransport};
//!
//! let (manager, events) = ConnectionManager::with_broadcaster(
//!     Arc::new(SerialPortTransport::default()),
//!     LinkConfig::default(),
//! )?;
//! let mut rx = events.subscribe();
//!
//! manager.connect("/dev/rfcomm0").wait()?;
//! while let Ok(event) = rx.blocking_recv() {
//!     println!("{:?}", event);
//! }
//! ```

pub mod link;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::link::{
        Command, ConnectionManager, DeviceId, EventBroadcaster, EventSink, LinkConfig, LinkError,
        LinkEvent, PublicState,
    };
    pub use crate::transport::{SerialPortTransport, StreamPair, TcpTransport, Transport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
