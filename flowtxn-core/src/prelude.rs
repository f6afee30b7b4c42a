//! Convenient re-exports for common usage.
//!
//! ```rust,no_run
//! use flowtxn_core::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! ```

// Engine and configuration
pub use crate::config::{EngineConfig, ProtocolConfig};
pub use crate::engine::{Engine, SharedEngine};

// Input
pub use crate::stream::{Segment, TcpFlags};

// Output
pub use crate::decoder::Protocol;
pub use crate::field::FieldValue;
pub use crate::publish::{ProcessResolver, TransactionSink, VecSink};
pub use crate::transaction::{Status, Transaction};

// Error types
pub use crate::error::{Error, Result};
