//! Line reader
//!
//! Pumps bytes from a link's read handle on a background thread, splits them
//! into text lines and hands each line to a consumer callback on a second
//! thread. The two threads are joined by a bounded channel, so a slow consumer
//! applies back-pressure to the reader instead of growing a queue.
//!
//! Cancellation is cooperative: the read thread checks the cancel flag every
//! time a read returns, which includes read timeouts. Streams handed to a
//! reader must therefore have a read timeout set.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

use super::MAX_LINE_LENGTH;

/// Bytes requested per read call
const READ_CHUNK: usize = 1024;

/// Why a line could not be produced
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The line bytes are not UTF-8
    #[error("invalid UTF-8 in {len}-byte line (valid up to byte {valid_up_to})")]
    InvalidUtf8 {
        /// Line length in bytes
        len: usize,
        /// Offset of the first bad byte
        valid_up_to: usize,
    },

    /// The line grew past the configured limit
    #[error("line exceeds {limit} bytes")]
    TooLong {
        /// Configured maximum line length
        limit: usize,
    },
}

/// Splits a byte stream into lines terminated by `\n` or `\r\n`
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_length: usize,
    // Set after an overlong line was reported; bytes are skipped up to the next `\n`.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl LineDecoder {
    /// Decoder that drops lines longer than `max_line_length` bytes
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            max_line_length,
            discarding: false,
        }
    }

    /// Feed bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, DecodeError>> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    out.push(self.take_line());
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buffer.push(b);
            // The pending `\r` of a CRLF pair does not count against the limit
            let len = match self.buffer.last() {
                Some(b'\r') => self.buffer.len() - 1,
                _ => self.buffer.len(),
            };
            if len > self.max_line_length {
                self.buffer.clear();
                self.discarding = true;
                out.push(Err(DecodeError::TooLong {
                    limit: self.max_line_length,
                }));
            }
        }
        out
    }

    /// Flush an unterminated tail at end of stream
    pub fn finish(&mut self) -> Option<Result<String, DecodeError>> {
        let discarding = std::mem::replace(&mut self.discarding, false);
        if discarding || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        Some(self.take_line())
    }

    /// Bytes of the current, unterminated line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    fn take_line(&mut self) -> Result<String, DecodeError> {
        let mut bytes = std::mem::take(&mut self.buffer);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let len = bytes.len();
        String::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8 {
            len,
            valid_up_to: e.utf8_error().valid_up_to(),
        })
    }
}

/// How the read loop ended
#[derive(Debug)]
pub enum ReaderExit {
    /// `destroy()` was called
    Cancelled,
    /// The remote end closed the stream
    EndOfStream,
    /// A read failed
    Failed(io::Error),
}

impl ReaderExit {
    /// True when the loop ended for a reason other than cancellation
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, ReaderExit::Cancelled)
    }
}

/// Counters updated by the read loop
#[derive(Debug, Default)]
pub struct ReaderCounters {
    bytes_read: AtomicU64,
    lines_delivered: AtomicU64,
    decode_failures: AtomicU64,
}

impl ReaderCounters {
    /// Raw bytes taken from the input
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Lines handed to the line callback
    pub fn lines_delivered(&self) -> u64 {
        self.lines_delivered.load(Ordering::Relaxed)
    }

    /// Lines dropped by the decoder
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Reader tuning
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Lines longer than this are dropped
    pub max_line_length: usize,
    /// Capacity of the read thread to delivery thread queue
    pub queue_capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
            queue_capacity: 256,
        }
    }
}

enum ReaderMessage {
    Line(String),
    Exit(ReaderExit),
}

type LineCallback = Box<dyn FnMut(String) + Send>;
type ExitCallback = Box<dyn FnOnce(ReaderExit) + Send>;

/// Background line pump bound to one read handle
pub struct LineReader {
    input: Option<Box<dyn Read + Send>>,
    on_line: Option<LineCallback>,
    on_exit: Option<ExitCallback>,
    options: ReaderOptions,
    counters: Arc<ReaderCounters>,
    cancel: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

impl LineReader {
    /// Create a reader that passes every decoded line to `on_line`
    pub fn new<F>(input: Box<dyn Read + Send>, options: ReaderOptions, on_line: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        Self {
            input: Some(input),
            on_line: Some(Box::new(on_line)),
            on_exit: None,
            options,
            counters: Arc::new(ReaderCounters::default()),
            cancel: Arc::new(AtomicBool::new(false)),
            producer: None,
            delivery: None,
        }
    }

    /// Callback run on the delivery thread once, after the last line, with the exit reason
    pub fn on_exit<F>(mut self, on_exit: F) -> Self
    where
        F: FnOnce(ReaderExit) + Send + 'static,
    {
        self.on_exit = Some(Box::new(on_exit));
        self
    }

    /// Share counters with the owner
    pub fn with_counters(mut self, counters: Arc<ReaderCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Counters this reader updates
    pub fn counters(&self) -> &Arc<ReaderCounters> {
        &self.counters
    }

    /// True between a successful `start()` and `destroy()`
    pub fn is_running(&self) -> bool {
        self.producer.is_some()
    }

    /// Spawn the read and delivery threads
    pub fn start(&mut self) -> io::Result<()> {
        let (input, mut on_line) = match (self.input.take(), self.on_line.take()) {
            (Some(input), Some(on_line)) => (input, on_line),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "line reader already started",
                ))
            }
        };
        tracing::debug!("starting line reader");

        let (tx, rx) = mpsc::sync_channel::<ReaderMessage>(self.options.queue_capacity.max(1));
        let mut on_exit = self.on_exit.take();
        let delivered = self.counters.clone();
        let delivery = thread::Builder::new()
            .name("spplink-deliver".into())
            .spawn(move || {
                // Ends once the read thread drops its sender
                for message in rx {
                    match message {
                        ReaderMessage::Line(line) => {
                            delivered.lines_delivered.fetch_add(1, Ordering::Relaxed);
                            on_line(line);
                        }
                        ReaderMessage::Exit(exit) => {
                            if let Some(on_exit) = on_exit.take() {
                                on_exit(exit);
                            }
                        }
                    }
                }
            })?;

        let cancel = self.cancel.clone();
        let counters = self.counters.clone();
        let options = self.options.clone();
        let producer = thread::Builder::new()
            .name("spplink-reader".into())
            .spawn(move || {
                let exit = read_loop(input, &options, &cancel, &counters, &tx);
                match &exit {
                    ReaderExit::Cancelled => tracing::debug!("line reader cancelled"),
                    ReaderExit::EndOfStream => tracing::info!("link closed by remote"),
                    ReaderExit::Failed(e) => tracing::warn!("link read failed: {}", e),
                }
                let _ = tx.send(ReaderMessage::Exit(exit));
            });

        match producer {
            Ok(handle) => {
                self.producer = Some(handle);
                self.delivery = Some(delivery);
                Ok(())
            }
            Err(e) => {
                // The failed spawn dropped the sender, so delivery exits on its own
                let _ = delivery.join();
                Err(e)
            }
        }
    }

    /// Cancel the read loop and wait for both threads to finish.
    ///
    /// Lines already read are delivered before this returns; the line callback
    /// is never invoked afterwards. Must not be called from inside a callback.
    pub fn destroy(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(producer) = self.producer.take() {
            tracing::debug!("destroying line reader");
            if producer.join().is_err() {
                tracing::error!("line reader thread panicked");
            }
        }
        if let Some(delivery) = self.delivery.take() {
            if delivery.join().is_err() {
                tracing::error!("line delivery thread panicked");
            }
        }
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn read_loop(
    mut input: Box<dyn Read + Send>,
    options: &ReaderOptions,
    cancel: &AtomicBool,
    counters: &ReaderCounters,
    tx: &mpsc::SyncSender<ReaderMessage>,
) -> ReaderExit {
    let mut decoder = LineDecoder::new(options.max_line_length);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if cancel.load(Ordering::Acquire) {
            if decoder.pending() > 0 {
                tracing::debug!(bytes = decoder.pending(), "discarding partial line");
            }
            return ReaderExit::Cancelled;
        }

        match input.read(&mut buf) {
            Ok(0) => {
                if cancel.load(Ordering::Acquire) {
                    return ReaderExit::Cancelled;
                }
                if let Some(tail) = decoder.finish() {
                    forward(tail, counters, tx);
                }
                return ReaderExit::EndOfStream;
            }
            Ok(n) => {
                counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                for item in decoder.push(&buf[..n]) {
                    if !forward(item, counters, tx) {
                        return ReaderExit::Cancelled;
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                if cancel.load(Ordering::Acquire) {
                    return ReaderExit::Cancelled;
                }
                return ReaderExit::Failed(e);
            }
        }
    }
}

/// Queue a decoded line; returns false once the delivery side is gone
fn forward(
    item: Result<String, DecodeError>,
    counters: &ReaderCounters,
    tx: &mpsc::SyncSender<ReaderMessage>,
) -> bool {
    match item {
        Ok(line) => {
            tracing::trace!(%line, "line received");
            tx.send(ReaderMessage::Line(line)).is_ok()
        }
        Err(e) => {
            counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("dropping undecodable line: {}", e);
            true
        }
    }
}
