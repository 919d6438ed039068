//! Device link abstraction
//!
//! The session controller talks to the device through [`DeviceLink`] so the serial
//! port can be replaced by the demo device or a scripted link in tests.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use super::{clear_buffers, configure_port, open_port, ProtocolError};

/// Longest reply line accepted by [`DeviceLink::read_line`]
pub const MAX_LINE_LEN: usize = 256;

/// Byte-oriented, half-duplex link to the device
pub trait DeviceLink: Read + Write + Send {
    /// Get number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Read everything currently available
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let available = self.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; available];
        match self.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(e) if is_timeout(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Read a `\n`-terminated line, giving up once nothing arrives after `timeout`.
    ///
    /// Returns whatever was received, terminator excluded.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        let start = Instant::now();
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < MAX_LINE_LEN {
            match self.read(&mut byte) {
                Ok(1) if byte[0] == b'\n' => break,
                Ok(1) => line.push(byte[0]),
                Ok(_) => {
                    if start.elapsed() >= timeout {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if is_timeout(&e) => {
                    if start.elapsed() >= timeout {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(line)
    }
}

/// Whether an I/O error only means "no data yet"
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Serial port wrapper implementing DeviceLink
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Wrap an already configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Open and configure `name` for the device
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        let mut port = open_port(name, Some(baud_rate))?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;
        Ok(Self::new(port))
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl DeviceLink for SerialLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
