//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No link is open
    #[error("Not connected to device")]
    NotConnected,

    /// A frame failed the structural decode
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A message cannot be encoded
    #[error("Invalid arguments for '{message}' frame: {reason}")]
    InvalidArguments {
        /// Message name
        message: &'static str,
        /// What is wrong
        reason: String,
    },

    /// Read or write failure on the link
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn invalid(message: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidArguments {
            message,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFrame(reason.into())
    }
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        ProtocolError::SerialError(e.to_string())
    }
}
