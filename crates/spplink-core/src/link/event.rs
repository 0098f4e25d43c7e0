//! Events published by the connection manager

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::state::{DeviceId, PublicState};

/// Notification emitted to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
    /// A complete text line was read from the link
    LineReceived {
        /// Line content without its terminator
        text: String,
    },
    /// The connection moved to a new state
    StateChanged {
        /// New public state
        state: PublicState,
        /// Device the transition concerns, if any
        device_id: Option<DeviceId>,
    },
}

impl LinkEvent {
    pub(crate) fn line(text: String) -> Self {
        LinkEvent::LineReceived { text }
    }

    pub(crate) fn state(state: PublicState, device_id: Option<DeviceId>) -> Self {
        LinkEvent::StateChanged { state, device_id }
    }
}

/// Receiver of link events.
///
/// `publish` is called from the command executor and from the line delivery
/// thread, so implementations must be cheap and must not call back into the
/// connection manager synchronously.
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn publish(&self, event: LinkEvent);
}

impl<F> EventSink for F
where
    F: Fn(LinkEvent) + Send + Sync,
{
    fn publish(&self, event: LinkEvent) {
        self(event)
    }
}

/// Fan-out of link events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new listener; it sees events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventBroadcaster {
    fn publish(&self, event: LinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("link event dropped, no subscribers");
        }
    }
}
