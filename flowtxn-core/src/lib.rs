//! # flowtxn-core
//!
//! Passive reconstruction of application-level transactions from captured
//! TCP segments.
//!
//! The engine tracks TCP flows, reassembles each direction into a byte
//! stream, decodes that stream with a resumable per-protocol decoder and
//! pairs requests with responses into [`Transaction`] records. It never
//! touches the network itself: the caller feeds it [`Segment`]s (from a
//! capture file, a live socket, a test) and drains transactions through a
//! [`TransactionSink`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowtxn_core::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! let mut sink = VecSink::new();
//!
//! let client = "10.0.0.1:40000".parse().unwrap();
//! let server = "10.0.0.2:6379".parse().unwrap();
//! engine.process_segment(&Segment::data(0, client, server, 1, b"*1\r\n$4\r\nPING\r\n"), &mut sink);
//! engine.process_segment(&Segment::data(250, server, client, 1, b"+PONG\r\n"), &mut sink);
//! engine.flush(&mut sink);
//!
//! for txn in sink.take() {
//!     println!("{} {} {:?}us", txn.protocol, txn.method, txn.response_time_us);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          flowtxn-core                               |
//! +---------------------------------------------------------------------+
//! |  Segment -> flow/      FlowTable, per-direction HalfFlow            |
//! |          -> stream/    DirectionalBuffer (dedupe, gaps, cap)        |
//! |          -> decoder/   HTTP, MySQL, PostgreSQL, Redis, Thrift       |
//! |          -> correlate/ request/response pairing, statement cache    |
//! |          -> publish/   TransactionSink, ProcessResolver             |
//! |                                                                     |
//! |  engine/  - drives the pipeline, sweeps idle flows and requests     |
//! |  config/  - ports, timeouts, buffer and field caps                  |
//! |  stats/   - relaxed atomic counters                                 |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Supported Protocols
//!
//! | Protocol | Default ports | Pairing |
//! |----------|---------------|---------|
//! | HTTP/1.x | 80, 8080, 8000, 5000, 8002 | pipelined |
//! | MySQL | 3306 | one request in flight |
//! | PostgreSQL | 5432 | pipelined |
//! | Redis | 6379 | pipelined |
//! | Thrift (binary) | 9090 | one request in flight |

pub mod config;
pub mod correlate;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod field;
pub mod flow;
pub mod prelude;
pub mod publish;
pub mod queue;
pub mod stats;
pub mod stream;
pub mod transaction;

// Re-export commonly used types at crate root for convenience
pub use config::{
    DecoderOptions, EngineConfig, FieldLimits, ProtocolConfig, ThriftTransport,
    DEFAULT_TRANSACTION_TIMEOUT_US,
};
pub use decoder::{Protocol, ProtocolDecoder};
pub use engine::{Engine, SharedEngine};
pub use error::{ConfigError, Error, Result};
pub use field::FieldValue;
pub use flow::{Direction, FlowKey};
pub use publish::{
    NoProcessResolver, ProcessResolver, StaticProcessResolver, TransactionSink, VecSink,
};
pub use queue::QueueLimits;
pub use stats::{EngineStats, StatsSnapshot};
pub use stream::{Segment, TcpFlags};
pub use transaction::{Endpoint, Status, Transaction};
