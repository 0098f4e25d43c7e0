mod common;

use common::{eventually, init_tracing, pipe};
use pretty_assertions::assert_eq;
use spplink_core::link::{LineReader, ReaderExit, ReaderOptions};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn collecting_reader(
    options: ReaderOptions,
) -> (LineReader, common::Remote, Arc<Mutex<Vec<String>>>) {
    init_tracing();
    let (input, remote) = pipe();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let reader = LineReader::new(Box::new(input), options, move |line| {
        sink.lock().unwrap().push(line);
    });
    (reader, remote, lines)
}

#[test]
fn test_lines_delivered_in_order() {
    let (mut reader, remote, lines) = collecting_reader(ReaderOptions::default());
    reader.start().unwrap();

    remote.send(b"hello\nwor");
    remote.send(b"ld\r\n\n");
    assert!(eventually(|| lines.lock().unwrap().len() == 3));

    reader.destroy();
    assert_eq!(
        *lines.lock().unwrap(),
        vec!["hello".to_string(), "world".to_string(), String::new()]
    );
}

#[test]
fn test_no_callback_after_destroy() {
    let (mut reader, remote, lines) = collecting_reader(ReaderOptions::default());
    reader.start().unwrap();

    remote.send(b"one\n");
    assert!(eventually(|| lines.lock().unwrap().len() == 1));

    reader.destroy();
    assert!(!reader.is_running());

    remote.send(b"two\n");
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(*lines.lock().unwrap(), vec!["one".to_string()]);
}

#[test]
fn test_slow_consumer_still_gets_lines_read_before_cancel() {
    init_tracing();
    let (input, remote) = pipe();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let options = ReaderOptions {
        queue_capacity: 1,
        ..ReaderOptions::default()
    };
    let mut reader = LineReader::new(Box::new(input), options, move |line| {
        std::thread::sleep(Duration::from_millis(20));
        sink.lock().unwrap().push(line);
    });
    reader.start().unwrap();

    remote.send(b"a\nb\nc\nd\n");
    let counters = reader.counters().clone();
    assert!(eventually(|| counters.bytes_read() == 8));

    // Cancel while most lines are still queued behind the slow consumer
    reader.destroy();
    assert_eq!(
        *lines.lock().unwrap(),
        vec!["a", "b", "c", "d"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_partial_line_discarded_on_cancel() {
    let (mut reader, remote, lines) = collecting_reader(ReaderOptions::default());
    let (exit_tx, exit_rx) = mpsc::channel();
    reader = reader.on_exit(move |exit| {
        let _ = exit_tx.send(exit);
    });
    reader.start().unwrap();

    remote.send(b"partial");
    let counters = reader.counters().clone();
    assert!(eventually(|| counters.bytes_read() == 7));

    reader.destroy();
    assert!(lines.lock().unwrap().is_empty());
    assert!(matches!(
        exit_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        ReaderExit::Cancelled
    ));
}

#[test]
fn test_end_of_stream_reported() {
    let (reader, remote, lines) = collecting_reader(ReaderOptions::default());
    let (exit_tx, exit_rx) = mpsc::channel();
    let mut reader = reader.on_exit(move |exit| {
        let _ = exit_tx.send(exit);
    });
    reader.start().unwrap();

    remote.send(b"last\ntail");
    remote.eof();

    let exit = exit_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(exit, ReaderExit::EndOfStream));
    assert!(exit.is_unexpected());
    // Exit is reported after the final line was delivered
    assert_eq!(
        *lines.lock().unwrap(),
        vec!["last".to_string(), "tail".to_string()]
    );
    reader.destroy();
}

#[test]
fn test_read_error_reported() {
    let (reader, remote, _lines) = collecting_reader(ReaderOptions::default());
    let (exit_tx, exit_rx) = mpsc::channel();
    let mut reader = reader.on_exit(move |exit| {
        let _ = exit_tx.send(exit);
    });
    reader.start().unwrap();

    remote.fail();
    match exit_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        ReaderExit::Failed(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        other => panic!("unexpected exit: {:?}", other),
    }
    reader.destroy();
}

#[test]
fn test_overlong_lines_dropped_and_counted() {
    let options = ReaderOptions {
        max_line_length: 8,
        ..ReaderOptions::default()
    };
    let (mut reader, remote, lines) = collecting_reader(options);
    reader.start().unwrap();

    remote.send(b"0123456789abcdef\nshort\n");
    assert!(eventually(|| lines.lock().unwrap().len() == 1));
    reader.destroy();

    assert_eq!(*lines.lock().unwrap(), vec!["short".to_string()]);
    assert_eq!(reader.counters().decode_failures(), 1);
    assert_eq!(reader.counters().lines_delivered(), 1);
}

#[test]
fn test_destroy_without_start() {
    let (mut reader, _remote, lines) = collecting_reader(ReaderOptions::default());
    reader.destroy();
    reader.destroy();
    assert!(lines.lock().unwrap().is_empty());
}
