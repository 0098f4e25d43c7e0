//! Serial Link Line Console
//!
//! Connects to a bonded device, prints every received line and state change,
//! and sends each line typed on stdin. Ctrl-D disconnects and exits.
//!
//! Usage:
//!   cargo run --example line_console -- [OPTIONS] [DEVICE]
//!
//! Options:
//!   --device DEV      Serial port path or host:port (default: /dev/rfcomm0)
//!   --tcp             Treat DEVICE as host:port of a serial-over-TCP bridge
//!   --baud RATE       Baud rate for serial devices (default: 115200)
//!   --timeout MS      Connection attempt timeout in ms (default: 10000)
//!   --config FILE     JSON link configuration (overrides defaults, not flags)
//!
//! Set RUST_LOG=spplink_core=debug to see the connection lifecycle.

use anyhow::Context;
use spplink_core::link::{ConnectionManager, LinkConfig, LinkEvent};
use spplink_core::transport::{SerialPortTransport, TcpTransport, Transport, DEFAULT_BAUD_RATE};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut device = "/dev/rfcomm0".to_string();
    let mut use_tcp = false;
    let mut baud_rate = DEFAULT_BAUD_RATE;
    let mut timeout_ms: Option<u64> = None;
    let mut config_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--device" | "-d" => {
                i += 1;
                if i < args.len() {
                    device = args[i].clone();
                }
            }
            "--tcp" => {
                use_tcp = true;
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    baud_rate = args[i].parse().unwrap_or(DEFAULT_BAUD_RATE);
                }
            }
            "--timeout" | "-t" => {
                i += 1;
                if i < args.len() {
                    timeout_ms = args[i].parse().ok();
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(args[i].clone());
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if !arg.starts_with('-') => {
                device = arg.to_string();
            }
            _ => {
                eprintln!("Unknown option: {}", args[i]);
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => LinkConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => LinkConfig::default(),
    };
    if let Some(ms) = timeout_ms {
        config.connect_timeout_ms = ms;
    }

    let transport: Arc<dyn Transport> = if use_tcp {
        Arc::new(TcpTransport::new(config.connect_timeout()))
    } else {
        Arc::new(SerialPortTransport::new(baud_rate))
    };

    let (manager, events) = ConnectionManager::with_broadcaster(transport, config)?;
    let mut rx = events.subscribe();
    drop(events);

    let printer = std::thread::spawn(move || loop {
        match rx.blocking_recv() {
            Ok(LinkEvent::LineReceived { text }) => println!("< {}", text),
            Ok(LinkEvent::StateChanged { state, device_id }) => match device_id {
                Some(id) => eprintln!("-- {:?} ({})", state, id),
                None => eprintln!("-- {:?}", state),
            },
            Err(RecvError::Lagged(n)) => eprintln!("-- {} events dropped", n),
            Err(RecvError::Closed) => break,
        }
    });

    manager
        .connect(device.as_str())
        .wait()
        .with_context(|| format!("connecting to {}", device))?;

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if let Err(e) = manager.send_line(&line).wait() {
            eprintln!("!! send failed: {}", e);
        }
    }

    manager.disconnect().wait()?;
    let stats = manager.stats();
    manager.shutdown();
    let _ = printer.join();

    eprintln!(
        "-- {} lines received, {} bytes read, {} bytes sent, {} undecodable",
        stats.lines_delivered, stats.bytes_read, stats.bytes_sent, stats.decode_failures
    );
    Ok(())
}

fn print_help() {
    println!("Serial Link Line Console");
    println!();
    println!("Usage: line_console [OPTIONS] [DEVICE]");
    println!();
    println!("Options:");
    println!("  -d, --device DEV     Serial port path or host:port (default: /dev/rfcomm0)");
    println!("      --tcp            DEVICE is host:port of a serial-over-TCP bridge");
    println!("  -b, --baud RATE      Baud rate for serial devices (default: 115200)");
    println!("  -t, --timeout MS     Connection attempt timeout (default: 10000)");
    println!("  -c, --config FILE    JSON link configuration");
    println!("  -h, --help           Show this help");
}
