//! Error types for beatha.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::session::Mode;

/// Result type for beatha operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for beatha operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial device could not be opened.
    #[error("Failed to open {port}: {reason}")]
    PortOpen {
        /// Device path.
        port: String,
        /// Underlying cause.
        reason: String,
    },

    /// Device is present but produced no bytes within the probe window.
    #[error("No response from device within {0} ms")]
    NoResponse(u64),

    /// A session transition was requested while another workflow is active.
    #[error("Session busy ({0})")]
    Busy(Mode),

    /// A workflow needs a serial device but none is connected.
    #[error("No flight controller connected")]
    NotConnected,

    /// Child-process spawn or control failure.
    #[error("Process error: {0}")]
    Process(String),

    /// A dump path resolved outside the dump root.
    #[error("Path is outside the dump directory: {}", .0.display())]
    PathOutsideDumpRoot(PathBuf),

    /// Unsupported operation on this platform or firmware.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a synchronous guard rejection (no state changed).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(Error::Busy(Mode::Dumping).is_rejection());
        assert!(Error::NotConnected.is_rejection());
        assert!(!Error::NoResponse(3000).is_rejection());
    }

    #[test]
    fn test_display_mentions_mode() {
        let msg = Error::Busy(Mode::Pairing).to_string();
        assert!(msg.contains("PAIRING"));
    }
}
