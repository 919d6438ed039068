//! Serial port handling
//!
//! Provides low-level serial port access for the device link.

use serialport::SerialPort;
use std::time::Duration;
use tracing::debug;

use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};

/// Open a serial port with a short read timeout
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    // Reads must return quickly so a controller tick stays bounded
    serialport::new(name, baud)
        .timeout(Duration::from_millis(DEFAULT_READ_TIMEOUT_MS))
        .open()
        .map_err(|e| ProtocolError::SerialError(format!("{}: {}", name, e)))
}

/// Configure a serial port for device communication
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    // Standard 8N1 configuration
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // The device's USB CDC stack only transmits while DTR is asserted
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}
