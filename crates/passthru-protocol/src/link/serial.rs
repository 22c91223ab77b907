//! Serial Port Link

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_serial::SerialPort;
use tracing::{debug, error, info, warn};

use super::DeviceLink;
use crate::error::DeviceError;
use crate::frame::{Frame, FrameDecoder, FrameKind};

/// Default serial read timeout, bounds the inbound poll latency
const DEFAULT_READ_TIMEOUT_MS: u64 = 20;

/// Translator link over a serial port
pub struct SerialLink {
    /// Port used when `wait_until_initialized` gets no identifier
    default_port: String,
    baud_rate: u32,
    read_timeout: Duration,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    connected: AtomicBool,
    firmware_version: Mutex<Option<String>>,
}

impl SerialLink {
    /// Create a link; the port is opened by `wait_until_initialized`
    ///
    /// # Arguments
    /// * `port` - Serial port device path (e.g. "/dev/ttyUSB0" or "COM3")
    /// * `baud_rate` - Baud rate for the translator
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            default_port: port.to_string(),
            baud_rate,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            firmware_version: Mutex::new(None),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Version string reported by the translator during the handshake
    pub fn firmware_version(&self) -> Option<String> {
        self.firmware_version.lock().clone()
    }

    fn open(&self, path: &str) -> Result<(), DeviceError> {
        info!("Opening translator port {} at {} baud", path, self.baud_rate);
        let port = tokio_serial::new(path, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| DeviceError::Serial(e.to_string()))?;
        let reader = port
            .try_clone()
            .map_err(|e| DeviceError::Serial(e.to_string()))?;

        *self.writer.lock() = Some(port);
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock() = None;
        *self.reader.lock() = None;
    }

    fn mark_lost(&self, err: &std::io::Error) {
        if self.connected.swap(false, Ordering::SeqCst) {
            error!("Translator link lost: {}", err);
        }
    }

    fn read_chunk(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        let mut guard = self.reader.lock();
        let port = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        let mut buf = [0u8; 1024];
        match port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => {
                self.mark_lost(&e);
                Err(e.into())
            }
        }
    }

    fn handshake(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.write_bytes(&Frame::version_request().encode(), timeout)?;

        let deadline = Instant::now() + timeout;
        let mut decoder = FrameDecoder::new();
        while Instant::now() < deadline {
            let Some(chunk) = self.read_chunk()? else {
                continue;
            };
            for frame in decoder.push(&chunk) {
                if frame.kind() == FrameKind::Version {
                    let version = String::from_utf8_lossy(frame.body()).into_owned();
                    info!("Translator firmware version: {}", version);
                    *self.firmware_version.lock() = Some(version);
                    return Ok(());
                }
                debug!(kind = ?frame.kind(), "Ignoring frame during handshake");
            }
        }
        Err(DeviceError::Timeout(timeout.as_millis() as u64))
    }

    /// Timeout for one write; zero means the link default
    fn write_timeout(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.read_timeout
        } else {
            requested
        }
    }

    fn write_bytes(&self, bytes: &[u8], timeout: Duration) -> Result<(), DeviceError> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        let timeout = self.write_timeout(timeout);
        port.set_timeout(timeout)
            .map_err(|e| DeviceError::Serial(e.to_string()))?;
        let result = port.write_all(bytes).and_then(|_| port.flush());
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                warn!("Serial write timed out after {:?}", timeout);
                Err(DeviceError::Timeout(timeout.as_millis() as u64))
            }
            Err(e) => {
                self.mark_lost(&e);
                Err(e.into())
            }
        }
    }
}

impl DeviceLink for SerialLink {
    fn send(&self, bytes: &[u8], timeout: Duration) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.write_bytes(bytes, timeout)
    }

    fn receive(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.read_chunk()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn wait_until_initialized(
        &self,
        identifier: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        if self.is_connected() {
            debug!("Translator already initialized");
            return Ok(());
        }

        let path = identifier
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.default_port)
            .to_string();
        self.open(&path)?;

        match self.handshake(timeout) {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                warn!("Translator on {} did not answer: {}", path, e);
                self.close();
                Err(e)
            }
        }
    }
}
