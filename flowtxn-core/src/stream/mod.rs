//! Segment input and per-direction stream reassembly.
//!
//! The capture side hands the engine one [`Segment`] per captured TCP
//! packet. Each flow direction owns a [`DirectionalBuffer`] that rejects
//! retransmissions by tracking the highest `seq + len` seen, reports gaps
//! when a segment starts past that mark, and appends everything else to
//! a contiguous buffer the decoder reads from.

mod reassembly;

use std::net::SocketAddr;

pub use reassembly::{DirectionalBuffer, SeqCheck};

/// TCP flags relevant to flow tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags {
        syn: false,
        ack: false,
        fin: false,
        rst: false,
    };

    /// Plain data segment (ACK set).
    pub const ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
    };

    /// FIN+ACK.
    pub const FIN: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
    };
}

/// One captured TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Capture timestamp in microseconds.
    pub timestamp: i64,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Data segment with ACK set.
    pub fn data(timestamp: i64, src: SocketAddr, dst: SocketAddr, seq: u32, payload: &'a [u8]) -> Self {
        Self {
            timestamp,
            src,
            dst,
            seq,
            flags: TcpFlags::ACK,
            payload,
        }
    }

    /// Replace the flags.
    pub fn with_flags(mut self, flags: TcpFlags) -> Self {
        self.flags = flags;
        self
    }
}
