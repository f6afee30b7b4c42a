//! Capture-file front end.
//!
//! Turns a pcap or pcapng file (optionally gzip-compressed) into the
//! [`Segment`](flowtxn_core::Segment) stream the engine consumes:
//!
//! ```text
//! file -> decompress -> pcap-parser -> etherparse slices -> Segment -> Engine
//! ```
//!
//! Frames that are not TCP over IPv4/IPv6 are skipped and counted in the
//! [`ReplaySummary`]; they never abort a replay.

mod decompress;
mod packet;
mod reader;
mod replay;

pub use decompress::{Compression, DecompressReader};
pub use packet::{decode_segment, linktype, Skip};
pub use reader::{CaptureFormat, CaptureReader, PacketRef};
pub use replay::{replay, ReplayOptions, ReplaySummary};
