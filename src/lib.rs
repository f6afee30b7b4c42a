//! flowtxn - reconstruct request/response transactions from captured TCP
//! traffic.
//!
//! This crate is the capture-file front end for [`flowtxn_core`]: it reads
//! pcap and pcapng files (optionally gzip-compressed), slices each frame down
//! to its TCP segment and replays the segments through an
//! [`Engine`](flowtxn_core::Engine).
//!
//! # Example
//!
//! ```no_run
//! use flowtxn::capture::{replay, CaptureReader, ReplayOptions};
//! use flowtxn_core::{Engine, EngineConfig, VecSink};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut engine = Engine::new(EngineConfig::default())?;
//!     let mut reader = CaptureReader::open("capture.pcap")?;
//!     let mut sink = VecSink::new();
//!     let summary = replay(&mut reader, &mut engine, &mut sink, &ReplayOptions::default())?;
//!     println!("{} segments, {} transactions", summary.segments, sink.len());
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod cli;
pub mod error;

pub use capture::{replay, CaptureReader, ReplayOptions, ReplaySummary};
pub use error::{CaptureError, Error, Result};
