//! Line-oriented transport to a GRBL controller.
//!
//! [`SerialLink`] is the seam between the controller state machine and the
//! physical port, so the controller can be driven by [`SimulatedGrbl`] in
//! tests.
//!
//! [`SimulatedGrbl`]: super::sim::SimulatedGrbl

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace};

use super::GrblError;

/// Poll interval for the underlying port read.
const READ_POLL: Duration = Duration::from_millis(20);

/// Byte-level link to a controller.
pub trait SerialLink: Send {
    /// Write all bytes and flush.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read one line without its terminator.
    ///
    /// Returns `Ok(None)` if no complete line arrived within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Discard anything received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens links by port name, so `connect` can be pointed at hardware or a simulator.
pub trait LinkFactory: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, GrblError>;
}

/// [`SerialLink`] over a `serialport` handle.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialPortLink {
    /// Open `port` at `baud`, 8N1.
    ///
    /// # Errors
    ///
    /// Returns [`GrblError::ConnectionFailed`] if the port cannot be opened.
    pub fn open(port: &str, baud: u32) -> Result<Self, GrblError> {
        let handle = serialport::new(port, baud)
            .timeout(READ_POLL)
            .open()
            .map_err(|e| GrblError::ConnectionFailed(format!("Failed to open {port}: {e}")))?;
        debug!("Opened serial port {port} at {baud} baud");
        Ok(Self {
            port: handle,
            pending: Vec::new(),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        Some(line)
    }
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];

        loop {
            if let Some(line) = self.take_line() {
                trace!("serial recv: {line:?}");
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Opens real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortFactory;

impl LinkFactory for SerialPortFactory {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, GrblError> {
        Ok(Box::new(SerialPortLink::open(port, baud)?))
    }
}

/// Names of the serial ports present on this machine.
pub fn list_available_ports() -> Result<Vec<String>, GrblError> {
    let ports = serialport::available_ports()
        .map_err(|e| GrblError::ConnectionFailed(format!("Failed to enumerate ports: {e}")))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
