//! Flow identity and per-flow state.

mod key;
mod table;

pub use key::{FlowKey, Transport};
pub use table::FlowTable;

use std::net::SocketAddr;

use crate::config::DecoderOptions;
use crate::decoder::{DecodeContext, Protocol, ProtocolDecoder};
use crate::stream::DirectionalBuffer;

/// Direction relative to the flow's first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Same orientation as the packet that created the flow.
    Original = 0,
    Reverse = 1,
}

impl Direction {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Original => Direction::Reverse,
            Direction::Reverse => Direction::Original,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Original => "original",
            Direction::Reverse => "reverse",
        }
    }
}

/// One direction of a flow: its byte stream and the decoder reading it.
#[derive(Debug)]
pub struct HalfFlow {
    pub buffer: DirectionalBuffer,
    pub decoder: ProtocolDecoder,
}

impl HalfFlow {
    fn new(protocol: Protocol, options: &DecoderOptions) -> Self {
        Self {
            buffer: DirectionalBuffer::new(),
            decoder: ProtocolDecoder::new(protocol, options),
        }
    }

    /// Discard buffered bytes and start over with a fresh decoder.
    pub fn reset(&mut self, options: &DecoderOptions) {
        let protocol = self.decoder.protocol();
        self.buffer.clear();
        self.decoder = ProtocolDecoder::new(protocol, options);
    }
}

/// A tracked TCP connection.
#[derive(Debug)]
pub struct Flow {
    /// Monotonically assigned, never reused within an engine.
    pub id: u64,
    /// Key in the orientation of the first packet.
    pub key: FlowKey,
    pub protocol: Protocol,
    /// Direction whose destination is the configured server port.
    pub server_direction: Direction,
    /// Indexed by [`Direction::index`].
    pub halves: [HalfFlow; 2],
    /// Timing (microseconds).
    pub created: i64,
    pub last_seen: i64,
}

impl Flow {
    pub fn new(
        id: u64,
        key: FlowKey,
        protocol: Protocol,
        server_direction: Direction,
        options: &DecoderOptions,
        timestamp: i64,
    ) -> Self {
        Self {
            id,
            key,
            protocol,
            server_direction,
            halves: [
                HalfFlow::new(protocol, options),
                HalfFlow::new(protocol, options),
            ],
            created: timestamp,
            last_seen: timestamp,
        }
    }

    pub fn half(&self, direction: Direction) -> &HalfFlow {
        &self.halves[direction.index()]
    }

    pub fn half_mut(&mut self, direction: Direction) -> &mut HalfFlow {
        &mut self.halves[direction.index()]
    }

    /// Sender endpoint for packets travelling in `direction`.
    pub fn source(&self, direction: Direction) -> SocketAddr {
        match direction {
            Direction::Original => self.key.src(),
            Direction::Reverse => self.key.dst(),
        }
    }

    /// Receiver endpoint for packets travelling in `direction`.
    pub fn destination(&self, direction: Direction) -> SocketAddr {
        self.source(direction.opposite())
    }

    /// Decoder context for the unconsumed bytes of one direction.
    pub fn decode_context(&self, direction: Direction, fallback_ts: i64) -> DecodeContext {
        let buffer = &self.half(direction).buffer;
        DecodeContext {
            direction,
            timestamp: buffer.pending_since().unwrap_or(fallback_ts),
            to_server: direction == self.server_direction,
            stream_offset: buffer.consumed(),
        }
    }

    /// Both sides sent FIN. Requests still pending at this point can no
    /// longer be answered.
    pub fn is_finished(&self) -> bool {
        self.halves.iter().all(|h| h.buffer.fin_received)
    }

    /// Unconsumed bytes across both directions.
    pub fn buffered_bytes(&self) -> usize {
        self.halves.iter().map(|h| h.buffer.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_by_direction() {
        let client: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let server: SocketAddr = "10.0.0.2:6379".parse().unwrap();
        let flow = Flow::new(
            1,
            FlowKey::tcp(client, server),
            Protocol::Redis,
            Direction::Original,
            &DecoderOptions::default(),
            0,
        );
        assert_eq!(flow.source(Direction::Original), client);
        assert_eq!(flow.destination(Direction::Original), server);
        assert_eq!(flow.source(Direction::Reverse), server);
        assert!(flow.decode_context(Direction::Original, 5).to_server);
        assert!(!flow.decode_context(Direction::Reverse, 5).to_server);
        assert!(!flow.is_finished());
    }

    #[test]
    fn test_finished_once_both_sides_fin() {
        let client: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let server: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let mut flow = Flow::new(
            1,
            FlowKey::tcp(client, server),
            Protocol::Http,
            Direction::Original,
            &DecoderOptions::default(),
            0,
        );
        flow.half_mut(Direction::Reverse).buffer.fin_received = true;
        assert!(!flow.is_finished());
        flow.half_mut(Direction::Original).buffer.fin_received = true;
        assert!(flow.is_finished());
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Original.opposite(), Direction::Reverse);
        assert_eq!(Direction::Reverse.index(), 1);
    }
}
