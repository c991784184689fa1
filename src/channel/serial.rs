//! Serial transport for RS-232/USB-serial instruments.
//!
//! Wraps the `serialport` crate and provides async I/O by executing the
//! blocking serial operations on Tokio's blocking-thread pool. The port
//! handle lives behind an async mutex holding an `Option`, which makes
//! `close()` idempotent: the first close takes the handle, later closes
//! find `None`.

use crate::channel::DeviceChannel;
use crate::error::IoError;
use async_trait::async_trait;
use serialport::SerialPort;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

/// Line discipline and addressing for one serial endpoint.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate (e.g. 9600, 19200).
    pub baud_rate: u32,
    /// Bounded receive timeout.
    pub io_timeout: Duration,
    /// Terminator appended to outgoing command lines (e.g. "\r\n").
    pub line_terminator: String,
    /// Byte ending an incoming reply line (e.g. b'\n').
    pub response_delimiter: u8,
}

impl SerialSettings {
    /// Settings with the common 8N1 ASCII-line defaults.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
        }
    }

    /// Set the receive timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the outgoing line terminator.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set the incoming reply delimiter byte.
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

/// Serial channel to one RS-232/USB endpoint.
#[derive(Clone)]
pub struct SerialChannel {
    settings: Arc<SerialSettings>,
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
}

impl SerialChannel {
    /// Open the endpoint and configure its line discipline.
    ///
    /// Fails with [`IoError::NotFound`] or [`IoError::PermissionDenied`] when
    /// the endpoint cannot be opened.
    pub async fn open(settings: SerialSettings) -> Result<Self, IoError> {
        let port_name = settings.port.clone();
        let baud_rate = settings.baud_rate;
        let timeout = settings.io_timeout;

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(timeout)
                .open()
                .map_err(|e| map_open_error(&port_name, &e))
        })
        .await
        .map_err(|_| IoError::Disconnected)??;

        debug!(port = %settings.port, baud = settings.baud_rate, "serial endpoint opened");

        Ok(Self {
            settings: Arc::new(settings),
            port: Arc::new(Mutex::new(Some(port))),
        })
    }

    /// Whether the endpoint is still held open.
    pub async fn is_open(&self) -> bool {
        self.port.lock().await.is_some()
    }
}

#[async_trait]
impl DeviceChannel for SerialChannel {
    async fn send(&self, bytes: &[u8]) -> Result<(), IoError> {
        let port = Arc::clone(&self.port);
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let port = guard.as_mut().ok_or(IoError::Disconnected)?;
            port.write_all(&bytes).map_err(map_io_error)?;
            port.flush().map_err(map_io_error)
        })
        .await
        .map_err(|_| IoError::Disconnected)?
    }

    async fn receive(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, IoError> {
        let port = Arc::clone(&self.port);

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let port = guard.as_mut().ok_or(IoError::Disconnected)?;
            port.set_timeout(timeout).map_err(|_| IoError::Disconnected)?;

            let mut buf = vec![0u8; max_len];
            match port.read(&mut buf) {
                Ok(0) => Err(IoError::Disconnected),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(e) => Err(map_io_error(e)),
            }
        })
        .await
        .map_err(|_| IoError::Disconnected)?
    }

    async fn send_line(&self, line: &str) -> Result<(), IoError> {
        let framed = format!("{}{}", line, self.settings.line_terminator);
        self.send(framed.as_bytes()).await
    }

    async fn query(&self, line: &str) -> Result<String, IoError> {
        let port = Arc::clone(&self.port);
        let framed = format!("{}{}", line, self.settings.line_terminator);
        let delimiter = self.settings.response_delimiter;

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let port = guard.as_mut().ok_or(IoError::Disconnected)?;
            port.write_all(framed.as_bytes()).map_err(map_io_error)?;
            port.flush().map_err(map_io_error)?;

            let mut response: Vec<u8> = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match port.read(&mut buf) {
                    Ok(0) => return Err(IoError::Disconnected),
                    Ok(n) => {
                        response.extend_from_slice(&buf[..n]);
                        if response.ends_with(&[delimiter]) {
                            break;
                        }
                    }
                    Err(e) => return Err(map_io_error(e)),
                }
            }

            Ok(String::from_utf8_lossy(&response).trim().to_string())
        })
        .await
        .map_err(|_| IoError::Disconnected)?
    }

    async fn close(&self) {
        let released = self.port.lock().await.take().is_some();
        if released {
            debug!(port = %self.settings.port, "serial endpoint released");
        }
    }
}

fn map_open_error(port: &str, e: &serialport::Error) -> IoError {
    use serialport::ErrorKind;
    match e.kind() {
        ErrorKind::NoDevice => IoError::NotFound(port.to_string()),
        ErrorKind::Io(std::io::ErrorKind::NotFound) => IoError::NotFound(port.to_string()),
        ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            IoError::PermissionDenied(port.to_string())
        }
        _ => IoError::NotFound(port.to_string()),
    }
}

fn map_io_error(e: std::io::Error) -> IoError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => IoError::Timeout,
        _ => IoError::Disconnected,
    }
}
