//! Error types for flowtxn-core.
//!
//! Only configuration and API misuse surface as [`enum@Error`]. Malformed
//! traffic never does: decoders report it as [`ParseOutcome::Corrupt`] and
//! the engine turns that into counters and log lines.
//!
//! [`ParseOutcome::Corrupt`]: crate::decoder::ParseOutcome::Corrupt

use thiserror::Error;

use crate::decoder::Protocol;

/// Main error type for flowtxn-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unknown protocol name (from a CLI flag or config file)
    #[error("Unknown protocol: {name}")]
    UnknownProtocol { name: String },
}

/// Errors raised by [`EngineConfig::validate`](crate::config::EngineConfig::validate).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The same port is mapped to two protocols
    #[error("port {port} is claimed by both {first} and {second}")]
    PortConflict {
        port: u16,
        first: Protocol,
        second: Protocol,
    },

    /// A timeout was configured as zero or negative
    #[error("{name} must be positive (got {value_us} us)")]
    NonPositiveTimeout { name: &'static str, value_us: i64 },

    /// No protocol has any port configured
    #[error("no protocol ports configured")]
    NoPorts,
}

/// Result type alias for flowtxn-core operations.
pub type Result<T> = std::result::Result<T, Error>;
