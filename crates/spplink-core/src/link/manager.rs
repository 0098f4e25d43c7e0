//! Connection management
//!
//! Owns the connection lifecycle. Every command is queued to one executor
//! thread which is the only writer of the connection state, so connect,
//! disconnect, send and teardown never race each other.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::event::{EventBroadcaster, EventSink, LinkEvent};
use super::reader::{LineReader, ReaderCounters, ReaderExit, ReaderOptions};
use super::state::{ConnectionState, DeviceId, PublicState};
use super::{LinkConfig, LinkError, TransportError};
use crate::transport::{StreamPair, Transport};

/// Commands accepted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect to a bonded device, replacing any current connection
    Connect(DeviceId),
    /// Close the current connection; no-op when not connected
    Disconnect,
    /// Write text verbatim to the link
    Send(String),
}

enum Message {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    StreamEnded {
        generation: u64,
        exit: ReaderExit,
    },
    Shutdown,
}

/// Outcome of a submitted command.
///
/// Dropping it leaves the command running; the result is discarded.
#[must_use = "dropping a Completion discards the command result"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), LinkError>>,
}

impl Completion {
    fn failed(err: LinkError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }

    /// Block the calling thread until the command has been processed.
    ///
    /// Panics when called from inside an async runtime; use [`Completion::finished`] there.
    pub fn wait(self) -> Result<(), LinkError> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(LinkError::ManagerStopped))
    }

    /// Wait for the command asynchronously
    pub async fn finished(self) -> Result<(), LinkError> {
        self.rx.await.unwrap_or_else(|_| Err(LinkError::ManagerStopped))
    }
}

/// Snapshot of the connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    /// Resting state; a failure reads as `NotConnected`
    pub state: PublicState,
    /// Device of the current or most recent connection
    pub device_id: Option<DeviceId>,
}

/// Cumulative link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Connect commands processed
    pub connect_attempts: u64,
    /// Connect commands that ended in `Error`
    pub connect_failures: u64,
    /// Raw bytes read across all connections
    pub bytes_read: u64,
    /// Bytes written by `Send`
    pub bytes_sent: u64,
    /// Lines published as `LineReceived`
    pub lines_delivered: u64,
    /// Lines dropped as invalid UTF-8 or overlong
    pub decode_failures: u64,
}

type OpenResult = Result<Box<dyn StreamPair>, TransportError>;

/// A transport open that outlived its connect timeout.
///
/// The helper thread closes the stream itself once it sees the attempt was
/// abandoned; a stream that slipped through before that is closed on settle.
struct PendingOpen {
    device_id: DeviceId,
    rx: std_mpsc::Receiver<Option<OpenResult>>,
}

impl PendingOpen {
    /// Wait up to `timeout` for the open to return. Hands the attempt back if it is still running.
    fn settle(self, timeout: Duration) -> Result<(), Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(Some(Ok(mut stream))) => {
                close_late(&self.device_id, stream.as_mut());
                Ok(())
            }
            Ok(_) | Err(std_mpsc::RecvTimeoutError::Disconnected) => Ok(()),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(self),
        }
    }
}

fn close_late(device_id: &DeviceId, stream: &mut dyn StreamPair) {
    tracing::warn!(device = %device_id, "connection completed after timeout, closing");
    if let Err(e) = stream.close() {
        tracing::warn!(device = %device_id, "unable to close late connection: {}", e);
    }
}

struct Shared {
    snapshot: RwLock<StateSnapshot>,
    reader: Arc<ReaderCounters>,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Single-connection manager for serial-port-profile links
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start the command executor
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(StateSnapshot {
                state: PublicState::NotConnected,
                device_id: None,
            }),
            reader: Arc::new(ReaderCounters::default()),
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        });

        let executor = Executor {
            state: ConnectionState::NotConnected,
            reader: None,
            pending_open: None,
            generation: 0,
            transport,
            sink,
            config,
            shared: shared.clone(),
            tx: tx.clone(),
        };
        let worker = thread::Builder::new()
            .name("spplink-commands".into())
            .spawn(move || executor.run(rx))?;

        Ok(Self {
            tx,
            shared,
            worker: Some(worker),
        })
    }

    /// Start a manager that publishes to a new [`EventBroadcaster`]
    pub fn with_broadcaster(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
    ) -> Result<(Self, EventBroadcaster), LinkError> {
        let broadcaster = EventBroadcaster::new(config.event_capacity);
        let manager = Self::new(transport, Arc::new(broadcaster.clone()), config)?;
        Ok((manager, broadcaster))
    }

    /// Queue a command; commands run one at a time in submission order
    pub fn submit(&self, command: Command) -> Completion {
        let (reply, rx) = oneshot::channel();
        match self.tx.send(Message::Command { command, reply }) {
            Ok(()) => Completion { rx },
            Err(_) => Completion::failed(LinkError::ManagerStopped),
        }
    }

    /// Connect to `device_id`, dropping the current connection first
    pub fn connect(&self, device_id: impl Into<DeviceId>) -> Completion {
        self.submit(Command::Connect(device_id.into()))
    }

    /// Close the current connection, if any
    pub fn disconnect(&self) -> Completion {
        self.submit(Command::Disconnect)
    }

    /// Write `content` to the link as-is
    pub fn send(&self, content: impl Into<String>) -> Completion {
        self.submit(Command::Send(content.into()))
    }

    /// Write `content` followed by `\n`
    pub fn send_line(&self, content: &str) -> Completion {
        self.submit(Command::Send(format!("{}\n", content)))
    }

    /// State as of the last completed transition
    pub fn state(&self) -> StateSnapshot {
        self.shared
            .snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Counters accumulated since the manager started
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            connect_attempts: self.shared.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.shared.connect_failures.load(Ordering::Relaxed),
            bytes_read: self.shared.reader.bytes_read(),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            lines_delivered: self.shared.reader.lines_delivered(),
            decode_failures: self.shared.reader.decode_failures(),
        }
    }

    /// Disconnect and stop the executor after every queued command has run
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(Message::Shutdown);
            if worker.join().is_err() {
                tracing::error!("command executor panicked");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the command executor thread
struct Executor {
    state: ConnectionState,
    reader: Option<LineReader>,
    // At most one open in flight against the transport
    pending_open: Option<PendingOpen>,
    // Bumped per connection so a late end-of-stream from an old reader is ignored
    generation: u64,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    config: LinkConfig,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Executor {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        tracing::debug!("command executor started");
        while let Some(message) = rx.blocking_recv() {
            match message {
                Message::Command { command, reply } => {
                    let result = self.handle(command);
                    let _ = reply.send(result);
                }
                Message::StreamEnded { generation, exit } => {
                    self.handle_stream_ended(generation, exit);
                }
                Message::Shutdown => break,
            }
        }
        self.disconnect();
        if let Some(pending) = self.pending_open.take() {
            // Dropping the receiver makes the helper close whatever it opens
            tracing::debug!(device = %pending.device_id, "abandoning unfinished open");
        }
        tracing::debug!("command executor stopped");
    }

    fn handle(&mut self, command: Command) -> Result<(), LinkError> {
        match command {
            Command::Connect(device_id) => self.connect(device_id),
            Command::Disconnect => {
                self.disconnect();
                Ok(())
            }
            Command::Send(content) => self.send(&content),
        }
    }

    fn connect(&mut self, device_id: DeviceId) -> Result<(), LinkError> {
        if matches!(self.state, ConnectionState::Connected { .. }) {
            self.disconnect();
        }

        self.shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(device = %device_id, "connecting");
        self.transition(ConnectionState::Connecting {
            device_id: device_id.clone(),
        });

        let (stream, input) = match self.establish(&device_id) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(device = %device_id, "unable to connect: {}", e);
                self.fail(device_id);
                return Err(e);
            }
        };

        self.generation += 1;
        self.transition(ConnectionState::Connected {
            device_id: device_id.clone(),
            stream,
        });

        let mut reader = self.build_reader(input);
        if let Err(e) = reader.start() {
            tracing::error!(device = %device_id, "unable to start line reader: {}", e);
            self.disconnect();
            self.fail(device_id);
            return Err(e.into());
        }
        self.reader = Some(reader);
        tracing::info!(device = %device_id, "connected");
        Ok(())
    }

    fn establish(
        &mut self,
        device_id: &DeviceId,
    ) -> Result<(Box<dyn StreamPair>, Box<dyn io::Read + Send>), LinkError> {
        self.settle_pending_open()?;
        let stream = self.open_with_timeout(device_id)?;
        self.prepare(stream)
    }

    /// Wait for an earlier timed-out open so the transport never has two in flight
    fn settle_pending_open(&mut self) -> Result<(), LinkError> {
        let pending = match self.pending_open.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        tracing::debug!(device = %pending.device_id, "waiting for timed-out open to finish");
        match pending.settle(self.config.connect_timeout()) {
            Ok(()) => Ok(()),
            Err(pending) => {
                let device_id = pending.device_id.clone();
                self.pending_open = Some(pending);
                Err(LinkError::OpenInProgress(device_id))
            }
        }
    }

    /// Open the transport on a helper thread so a hung handshake is bounded.
    ///
    /// On timeout the attempt is parked in `pending_open` and the helper
    /// closes the stream if the handshake completes later.
    fn open_with_timeout(&mut self, device_id: &DeviceId) -> Result<Box<dyn StreamPair>, LinkError> {
        let timeout = self.config.connect_timeout();
        let (tx, rx) = std_mpsc::sync_channel(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let transport = self.transport.clone();
        let device = device_id.clone();
        let profile: Uuid = self.config.profile_id;
        let late = abandoned.clone();

        thread::Builder::new()
            .name("spplink-open".into())
            .spawn(move || {
                let result = transport.open(&device, profile);
                if late.load(Ordering::Acquire) {
                    if let Ok(mut stream) = result {
                        close_late(&device, stream.as_mut());
                    }
                    let _ = tx.send(None);
                } else if let Err(std_mpsc::SendError(Some(Ok(mut stream)))) = tx.send(Some(result))
                {
                    close_late(&device, stream.as_mut());
                }
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Some(result)) => result.map_err(LinkError::from),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::Release);
                self.pending_open = Some(PendingOpen {
                    device_id: device_id.clone(),
                    rx,
                });
                Err(LinkError::ConnectTimeout(timeout))
            }
            Ok(None) | Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(
                TransportError::IoError(io::Error::new(
                    io::ErrorKind::Other,
                    "transport open aborted",
                ))
                .into(),
            ),
        }
    }

    /// Configure the fresh stream and clone the handle the reader will own
    fn prepare(
        &self,
        mut stream: Box<dyn StreamPair>,
    ) -> Result<(Box<dyn StreamPair>, Box<dyn io::Read + Send>), LinkError> {
        let configured = stream
            .set_read_timeout(self.config.read_poll())
            .and_then(|_| stream.try_clone_reader());
        match configured {
            Ok(input) => Ok((stream, input)),
            Err(e) => {
                if let Err(close_err) = stream.close() {
                    tracing::warn!("unable to close stream: {}", close_err);
                }
                Err(e.into())
            }
        }
    }

    fn build_reader(&self, input: Box<dyn io::Read + Send>) -> LineReader {
        let sink = self.sink.clone();
        let tx = self.tx.clone();
        let generation = self.generation;
        let options = ReaderOptions {
            max_line_length: self.config.max_line_length,
            queue_capacity: self.config.line_queue_capacity,
        };

        LineReader::new(input, options, move |line| {
            sink.publish(LinkEvent::line(line));
        })
        .on_exit(move |exit| {
            if exit.is_unexpected() {
                let _ = tx.send(Message::StreamEnded { generation, exit });
            }
        })
        .with_counters(self.shared.reader.clone())
    }

    fn disconnect(&mut self) {
        if !matches!(self.state, ConnectionState::Connected { .. }) {
            return;
        }

        tracing::info!(device = ?self.state.device_id(), "disconnecting");
        if let Some(mut reader) = self.reader.take() {
            reader.destroy();
        }

        if let ConnectionState::Connected {
            device_id,
            mut stream,
        } = std::mem::replace(&mut self.state, ConnectionState::NotConnected)
        {
            if let Err(e) = stream.close() {
                tracing::warn!(device = %device_id, "unable to close socket: {}", e);
            }
            self.publish_state(PublicState::NotConnected, Some(device_id));
        }
    }

    fn send(&mut self, content: &str) -> Result<(), LinkError> {
        let (device_id, result) = match &mut self.state {
            ConnectionState::Connected { device_id, stream } => {
                let result = stream
                    .write_all(content.as_bytes())
                    .and_then(|_| stream.flush());
                (device_id.clone(), result)
            }
            _ => return Err(LinkError::NotConnected),
        };

        match result {
            Ok(()) => {
                self.shared
                    .bytes_sent
                    .fetch_add(content.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(device = %device_id, "write failed: {}", e);
                self.disconnect();
                self.publish_state(PublicState::Error, Some(device_id));
                Err(e.into())
            }
        }
    }

    fn handle_stream_ended(&mut self, generation: u64, exit: ReaderExit) {
        let current = matches!(self.state, ConnectionState::Connected { .. })
            && generation == self.generation;
        if !current {
            tracing::debug!(generation, "ignoring end of stale link");
            return;
        }

        let device_id = self.state.device_id().cloned();
        match &exit {
            ReaderExit::Failed(e) => tracing::warn!(device = ?device_id, "link lost: {}", e),
            _ => tracing::info!(device = ?device_id, "link closed by remote"),
        }
        self.disconnect();
        self.publish_state(PublicState::Error, device_id);
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        let summary = next.summary();
        let device_id = next.device_id().cloned();
        self.state = next;
        self.publish_state(summary, device_id);
    }

    /// Failed connect: back to NotConnected, announced only as Error
    fn fail(&mut self, device_id: DeviceId) {
        self.shared.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.state = ConnectionState::NotConnected;
        self.publish_state(PublicState::Error, Some(device_id));
    }

    /// Update the snapshot then notify; Error is a signal, not a resting state
    fn publish_state(&self, state: PublicState, device_id: Option<DeviceId>) {
        let resting = match state {
            PublicState::Error => PublicState::NotConnected,
            other => other,
        };
        self.write_snapshot(resting, device_id.clone());
        self.sink.publish(LinkEvent::state(state, device_id));
    }

    fn write_snapshot(&self, state: PublicState, device_id: Option<DeviceId>) {
        let snapshot = StateSnapshot { state, device_id };
        match self.shared.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(e) => *e.into_inner() = snapshot,
        }
    }
}
