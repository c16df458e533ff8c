//! Error types for cvls.
//!
//! These cover transport and construction failures only. The outcome of a
//! paginated transfer is never an `Err`; it is reported through
//! [`TransferStatus`](crate::transfer::TransferStatus).

use std::io;
use thiserror::Error;

/// Result type for cvls operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for cvls operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The link to the unit is closed or was never opened.
    #[error("Not connected to unit")]
    NotConnected,

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The unit replied with something that does not fit the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A firmware image failed its embedded length check.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// A worker thread could not be spawned.
    #[error("Thread error: {0}")]
    Thread(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
