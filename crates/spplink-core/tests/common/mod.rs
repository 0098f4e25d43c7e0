//! In-memory link doubles shared by the integration tests

#![allow(dead_code)]

use spplink_core::link::{DeviceId, EventSink, LinkEvent, TransportError};
use spplink_core::transport::{StreamPair, Transport};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum Chunk {
    Data(Vec<u8>),
    Eof,
    Fail,
}

struct Inner {
    rx: Mutex<Receiver<Chunk>>,
    leftover: Mutex<Vec<u8>>,
    read_timeout: Mutex<Duration>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: AtomicBool,
}

/// Remote end of a mock link, used by tests to feed the reader
#[derive(Clone)]
pub struct Remote {
    tx: Sender<Chunk>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl Remote {
    pub fn send(&self, bytes: &[u8]) {
        let _ = self.tx.send(Chunk::Data(bytes.to_vec()));
    }

    pub fn eof(&self) {
        let _ = self.tx.send(Chunk::Eof);
    }

    pub fn fail(&self) {
        let _ = self.tx.send(Chunk::Fail);
    }

    /// Everything the local side wrote so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

/// Readable half cloned for the line reader
pub struct MockReader {
    inner: Arc<Inner>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut leftover = self.inner.leftover.lock().unwrap();
            if !leftover.is_empty() {
                let n = leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&leftover[..n]);
                leftover.drain(..n);
                return Ok(n);
            }
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(0);
        }

        let timeout = *self.inner.read_timeout.lock().unwrap();
        let chunk = self.inner.rx.lock().unwrap().recv_timeout(timeout);
        match chunk {
            Ok(Chunk::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                self.inner
                    .leftover
                    .lock()
                    .unwrap()
                    .extend_from_slice(&bytes[n..]);
                Ok(n)
            }
            Ok(Chunk::Eof) | Err(RecvTimeoutError::Disconnected) => Ok(0),
            Ok(Chunk::Fail) => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
        }
    }
}

/// Both halves of a mock link as seen by the connection manager
pub struct MockStream {
    inner: Arc<Inner>,
    device: String,
    transport: Arc<TransportLog>,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        MockReader {
            inner: self.inner.clone(),
        }
        .read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.transport.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.inner.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamPair for MockStream {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        *self.inner.read_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(MockReader {
            inner: self.inner.clone(),
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.transport.live.fetch_sub(1, Ordering::AcqRel);
            self.transport.record(format!("close {}", self.device));
        }
        if self.transport.fail_close.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "socket already faulted"));
        }
        Ok(())
    }
}

/// Create a detached reader/remote pair for driving a `LineReader` directly
pub fn pipe() -> (MockReader, Remote) {
    let (tx, rx) = mpsc::channel();
    let written = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::new(Inner {
        rx: Mutex::new(rx),
        leftover: Mutex::new(Vec::new()),
        read_timeout: Mutex::new(Duration::from_millis(20)),
        written: written.clone(),
        closed: AtomicBool::new(false),
    });
    (MockReader { inner }, Remote { tx, written })
}

#[derive(Default)]
pub struct TransportLog {
    calls: Mutex<Vec<String>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    opening: AtomicUsize,
    max_opening: AtomicUsize,
    fail_close: AtomicBool,
    fail_writes: AtomicBool,
    remotes: Mutex<HashMap<String, Remote>>,
}

impl TransportLog {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Transport double recording every open and close
pub struct MockTransport {
    log: Arc<TransportLog>,
    refuse: bool,
    open_delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            log: Arc::new(TransportLog::default()),
            refuse: false,
            open_delay: None,
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            open_delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.calls.lock().unwrap().clone()
    }

    pub fn max_live(&self) -> usize {
        self.log.max_live.load(Ordering::Acquire)
    }

    /// Most `open` calls ever running at the same time
    pub fn max_concurrent_opens(&self) -> usize {
        self.log.max_opening.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.log.live.load(Ordering::Acquire)
    }

    pub fn fail_close(&self) {
        self.log.fail_close.store(true, Ordering::Release);
    }

    pub fn fail_writes(&self) {
        self.log.fail_writes.store(true, Ordering::Release);
    }

    /// Remote end of the most recent link opened to `device`
    pub fn remote(&self, device: &str) -> Remote {
        self.log
            .remotes
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .expect("device was never opened")
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        device_id: &DeviceId,
        _profile_id: Uuid,
    ) -> Result<Box<dyn StreamPair>, TransportError> {
        let opening = self.log.opening.fetch_add(1, Ordering::AcqRel) + 1;
        self.log.max_opening.fetch_max(opening, Ordering::AcqRel);
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        self.log.opening.fetch_sub(1, Ordering::AcqRel);
        if self.refuse {
            self.log.record(format!("refuse {}", device_id));
            return Err(TransportError::Refused(device_id.to_string()));
        }

        let live = self.log.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.log.max_live.fetch_max(live, Ordering::AcqRel);
        self.log.record(format!("open {}", device_id));

        let (reader, remote) = pipe();
        self.log
            .remotes
            .lock()
            .unwrap()
            .insert(device_id.to_string(), remote);
        Ok(Box::new(MockStream {
            inner: reader.inner,
            device: device_id.to_string(),
            transport: self.log.clone(),
        }))
    }
}

/// Event sink that keeps everything it receives
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<LinkEvent>>,
}

impl EventSink for Recorder {
    fn publish(&self, event: LinkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::LineReceived { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds for the recorded events or two seconds pass
    pub fn wait_until<F>(&self, pred: F) -> bool
    where
        F: Fn(&[LinkEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if pred(&self.events.lock().unwrap()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// Poll `cond` for up to two seconds
pub fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
