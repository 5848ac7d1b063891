//! Byte stream module.
//!
//! The engine talks to its transport only through [`ByteStream`]. Inbound
//! bytes arrive through a reader taken from the stream and pumped into the
//! engine by a background thread.

use crate::device::{CodaDevice, SharedDevice};
use crate::protocol::CodaEvent;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How long a reader blocks before the pump re-checks the stream.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream is not open")]
    NotOpen,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A bidirectional byte transport.
pub trait ByteStream: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Last error, empty when none occurred.
    fn error_string(&self) -> String;

    /// Hand out the inbound side. Streams without one return `None` and are
    /// fed by calling `process_incoming` directly.
    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>>;
}

/// In-memory stream recording every write.
pub struct MemoryStream {
    written: Arc<Mutex<Vec<u8>>>,
    open: Arc<Mutex<bool>>,
    inbound: Option<Receiver<Vec<u8>>>,
    error: String,
}

/// Test-side view of a [`MemoryStream`].
#[derive(Clone)]
pub struct MemoryStreamHandle {
    written: Arc<Mutex<Vec<u8>>>,
    open: Arc<Mutex<bool>>,
    inbound: Sender<Vec<u8>>,
}

impl MemoryStream {
    /// Open stream plus the handle that observes and feeds it.
    pub fn new() -> (Self, MemoryStreamHandle) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let open = Arc::new(Mutex::new(true));
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                written: Arc::clone(&written),
                open: Arc::clone(&open),
                inbound: Some(rx),
                error: String::new(),
            },
            MemoryStreamHandle { written, open, inbound: tx },
        )
    }

    /// A stream that refuses writes, as a failed open leaves it.
    pub fn closed(error: impl Into<String>) -> Self {
        let (mut stream, _) = Self::new();
        stream.error = error.into();
        if let Ok(mut open) = stream.open.lock() {
            *open = false;
        }
        stream
    }
}

impl ByteStream for MemoryStream {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if let Ok(mut written) = self.written.lock() {
            written.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.lock().map(|o| *o).unwrap_or(false)
    }

    fn close(&mut self) {
        if let Ok(mut open) = self.open.lock() {
            *open = false;
        }
    }

    fn error_string(&self) -> String {
        self.error.clone()
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        let rx = self.inbound.take()?;
        Some(Box::new(ChannelReader { rx, pending: Vec::new() }))
    }
}

impl MemoryStreamHandle {
    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Drain the write record.
    pub fn take_written(&self) -> Vec<u8> {
        self.written.lock().map(|mut w| std::mem::take(&mut *w)).unwrap_or_default()
    }

    /// Queue bytes for the stream's reader.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.inbound.send(bytes.to_vec());
    }

    /// Whether the engine side is still open.
    pub fn is_open(&self) -> bool {
        self.open.lock().map(|o| *o).unwrap_or(false)
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(READ_POLL_INTERVAL) {
                Ok(bytes) => self.pending = bytes,
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// TCP transport.
pub struct TcpByteStream {
    stream: Option<TcpStream>,
    error: String,
}

impl TcpByteStream {
    /// Connect with `timeout` applied to the connect and to each read.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        log::info!("Connected to {}", addr);
        Ok(Self { stream: Some(stream), error: String::new() })
    }
}

impl ByteStream for TcpByteStream {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        if let Err(e) = stream.write_all(bytes) {
            self.error = e.to_string();
            return Err(e.into());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn error_string(&self) -> String {
        self.error.clone()
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        let stream = self.stream.as_ref()?;
        match stream.try_clone() {
            Ok(reader) => {
                let _ = reader.set_read_timeout(Some(READ_POLL_INTERVAL));
                Some(Box::new(reader))
            }
            Err(e) => {
                self.error = e.to_string();
                None
            }
        }
    }
}

/// Serial transport backed by the `serialport` crate.
#[cfg(feature = "serial")]
pub struct SerialByteStream {
    port: Option<Box<dyn serialport::SerialPort>>,
    error: String,
}

#[cfg(feature = "serial")]
impl SerialByteStream {
    /// Open `path` at `baud_rate`, 8N1.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(READ_POLL_INTERVAL)
            .open()?;
        log::info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self { port: Some(port), error: String::new() })
    }
}

#[cfg(feature = "serial")]
impl ByteStream for SerialByteStream {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        if let Err(e) = port.write_all(bytes).and_then(|()| port.flush()) {
            self.error = e.to_string();
            return Err(e.into());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn error_string(&self) -> String {
        self.error.clone()
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        match self.port.as_ref()?.try_clone() {
            Ok(reader) => Some(Box::new(SerialReader(reader))),
            Err(e) => {
                self.error = e.to_string();
                None
            }
        }
    }
}

#[cfg(feature = "serial")]
struct SerialReader(Box<dyn serialport::SerialPort>);

#[cfg(feature = "serial")]
impl Read for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Start a thread feeding the device's inbound bytes into `process_incoming`.
///
/// Returns `None` when the bound stream has no reader. The thread exits when
/// the device is dropped, its stream closes or the reader reports EOF.
pub fn spawn_read_pump(device: &SharedDevice) -> Option<thread::JoinHandle<()>> {
    let reader = device.lock().ok()?.take_reader()?;
    let weak = Arc::downgrade(device);
    let spawned = thread::Builder::new()
        .name("coda-read-pump".into())
        .spawn(move || read_pump(reader, &weak));
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("Failed to spawn read pump: {}", e);
            None
        }
    }
}

fn read_pump(mut reader: Box<dyn Read + Send>, weak: &Weak<Mutex<CodaDevice>>) {
    let mut buf = [0u8; 4096];
    loop {
        let result = reader.read(&mut buf);
        let Some(device) = weak.upgrade() else { break };
        let Ok(mut device) = device.lock() else { break };
        match result {
            Ok(0) => {
                log::info!("Stream reached end of input");
                break;
            }
            Ok(n) => device.process_incoming(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                if !device.is_open() {
                    break;
                }
            }
            Err(e) => {
                if device.is_open() {
                    log::error!("Read failed: {}", e);
                    device.publish(CodaEvent::Error(format!("Read failed: {e}")));
                }
                break;
            }
        }
    }
    log::debug!("Read pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_stream_records_writes() {
        let (mut stream, handle) = MemoryStream::new();
        stream.write(b"abc").unwrap();
        stream.write(b"def").unwrap();
        assert_eq!(handle.written(), b"abcdef");
        assert_eq!(handle.take_written(), b"abcdef");
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_memory_stream_close_refuses_writes() {
        let (mut stream, handle) = MemoryStream::new();
        stream.close();
        assert!(!handle.is_open());
        assert!(matches!(stream.write(b"x"), Err(TransportError::NotOpen)));

        let failed = MemoryStream::closed("no such port");
        assert!(!failed.is_open());
        assert_eq!(failed.error_string(), "no such port");
    }

    #[test]
    fn test_channel_reader_splits_reads() {
        let (mut stream, handle) = MemoryStream::new();
        let mut reader = stream.take_reader().unwrap();
        assert!(stream.take_reader().is_none());
        handle.inject(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        drop(handle);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
