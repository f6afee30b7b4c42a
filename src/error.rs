//! Error types for flowtxn.

use thiserror::Error;

/// Main error type for flowtxn operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error opening or reading a capture file
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Engine construction failed
    #[error(transparent)]
    Engine(#[from] flowtxn_core::Error),

    /// Error writing transactions
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid pcap or pcapng data
    #[error("Invalid capture format: {reason}")]
    InvalidFormat { reason: String },
}

/// Result type alias for flowtxn operations.
pub type Result<T> = std::result::Result<T, Error>;
