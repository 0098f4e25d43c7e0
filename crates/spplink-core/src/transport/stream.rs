use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use super::StreamPair;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

/// Serial port wrapper implementing StreamPair
pub struct SerialChannel {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    /// Wrap an open serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port: Some(port) }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(closed)
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl StreamPair for SerialChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port()?
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let port = self.port.as_ref().ok_or_else(closed)?;
        let port_clone = port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle closes the tty; discard anything still queued
        // so a dying link does not block in tcdrain.
        match self.port.take() {
            Some(port) => port
                .clear(serialport::ClearBuffer::All)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            None => Ok(()),
        }
    }
}

/// TCP stream wrapper implementing StreamPair
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Wrap a connected TCP stream
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl StreamPair for TcpChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let stream_clone = self.stream.try_clone()?;
        Ok(Box::new(TcpChannel::new(stream_clone)))
    }

    fn close(&mut self) -> io::Result<()> {
        // Shutdown affects every clone of the socket, the fd itself goes on drop.
        self.stream.shutdown(Shutdown::Both)
    }
}
