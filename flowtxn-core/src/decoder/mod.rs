//! Resumable application-protocol decoders.
//!
//! One decoder instance runs per flow direction. The engine hands it the
//! unconsumed bytes of that direction every time new data arrives; the
//! decoder either finishes one message, asks for more bytes, or declares
//! the stream corrupt.
//!
//! ## Contract
//!
//! - [`ParseOutcome::Incomplete`]: partial state is kept and the next call
//!   sees the same bytes plus whatever arrived since. Nothing is consumed.
//! - [`ParseOutcome::Complete`]: `consumed` bytes are released from the
//!   buffer and [`Decoder::prepare_for_new_message`] is called. The message
//!   may be `None` for protocol chatter that carries no transaction
//!   (handshakes, keep-alives, status packets).
//! - [`ParseOutcome::Corrupt`]: the engine discards the direction's buffer
//!   and starts a fresh decoder on the next segment.
//!
//! Decoders never read a fixed-size field without checking the remaining
//! length first (see [`ByteReader`]).
//!
//! ## Protocols
//!
//! | Protocol | Framing | Pairing |
//! |----------|---------|---------|
//! | HTTP/1.x | text headers, length / chunked / until-close body | pipelined |
//! | MySQL    | 3-byte length + sequence id packets | single, statement cache |
//! | PostgreSQL | type byte + 4-byte length | pipelined |
//! | Redis    | RESP | pipelined |
//! | Thrift   | binary protocol, optional frame length | single |

mod http;
mod mysql;
mod pgsql;
mod reader;
mod redis;
mod thrift;

use std::fmt;
use std::str::FromStr;

use compact_str::CompactString;
use serde::Serialize;
use smallvec::SmallVec;

use crate::config::DecoderOptions;
use crate::error::Error;
use crate::flow::Direction;

pub use http::{HttpDecoder, HttpMessage};
pub use mysql::{
    decode_execute_params, ExecuteParams, MysqlCommand, MysqlDecoder, MysqlMessage, ParamType,
};
pub use pgsql::{split_statements, PgsqlDecoder, PgsqlMessage, PgsqlResponse, PgsqlStatus};
pub use reader::{ByteReader, ReadError, ReadResult};
pub use redis::{RedisDecoder, RedisMessage};
pub use thrift::{ThriftDecoder, ThriftMessage, ThriftMessageType};

/// Supported application protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Mysql,
    Pgsql,
    Redis,
    Thrift,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Http,
        Protocol::Mysql,
        Protocol::Pgsql,
        Protocol::Redis,
        Protocol::Thrift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Mysql => "mysql",
            Protocol::Pgsql => "pgsql",
            Protocol::Redis => "redis",
            Protocol::Thrift => "thrift",
        }
    }

    /// Whether several requests may be outstanding on one flow.
    pub fn is_pipelined(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Pgsql | Protocol::Redis)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "mysql" => Ok(Protocol::Mysql),
            "pgsql" | "postgres" | "postgresql" => Ok(Protocol::Pgsql),
            "redis" => Ok(Protocol::Redis),
            "thrift" => Ok(Protocol::Thrift),
            _ => Err(Error::UnknownProtocol { name: s.to_string() }),
        }
    }
}

/// Where and when the bytes handed to a decoder came from.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    pub direction: Direction,
    /// Timestamp of the segment that carried the first unconsumed byte.
    pub timestamp: i64,
    /// The direction points at the configured server port.
    pub to_server: bool,
    /// Stream offset of the first unconsumed byte.
    pub stream_offset: u64,
}

/// One decoded protocol unit.
#[derive(Debug, Clone)]
pub struct Message {
    pub direction: Direction,
    pub is_request: bool,
    pub timestamp: i64,
    /// Stream offset of the first byte.
    pub start: u64,
    /// Wire size in bytes.
    pub size: usize,
    /// Annotations such as packet loss.
    pub notes: SmallVec<[CompactString; 1]>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(ctx: &DecodeContext, is_request: bool, size: usize, body: MessageBody) -> Self {
        Self {
            direction: ctx.direction,
            is_request,
            timestamp: ctx.timestamp,
            start: ctx.stream_offset,
            size,
            notes: SmallVec::new(),
            body,
        }
    }

    /// Stream offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    pub fn with_note(mut self, note: &str) -> Self {
        self.add_note(note);
        self
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.notes.iter().any(|n| n == note) {
            self.notes.push(CompactString::new(note));
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self.body {
            MessageBody::Http(_) => Protocol::Http,
            MessageBody::Mysql(_) => Protocol::Mysql,
            MessageBody::Pgsql(_) => Protocol::Pgsql,
            MessageBody::Redis(_) => Protocol::Redis,
            MessageBody::Thrift(_) => Protocol::Thrift,
        }
    }
}

/// Protocol-specific message content.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Http(HttpMessage),
    Mysql(MysqlMessage),
    Pgsql(PgsqlMessage),
    Redis(RedisMessage),
    Thrift(ThriftMessage),
}

/// Result of one [`Decoder::parse`] call.
#[derive(Debug)]
pub enum ParseOutcome {
    Complete {
        consumed: usize,
        message: Option<Message>,
    },
    Incomplete,
    Corrupt(&'static str),
}

impl ParseOutcome {
    /// Consume bytes without producing a message.
    pub fn skip(consumed: usize) -> Self {
        ParseOutcome::Complete {
            consumed,
            message: None,
        }
    }

    pub fn message(message: Message) -> Self {
        ParseOutcome::Complete {
            consumed: message.size,
            message: Some(message),
        }
    }
}

impl From<ReadError> for ParseOutcome {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Incomplete => ParseOutcome::Incomplete,
            ReadError::Corrupt(reason) => ParseOutcome::Corrupt(reason),
        }
    }
}

/// What to do after bytes were lost inside a direction.
#[derive(Debug)]
pub enum GapOutcome {
    /// Nothing usable; discard the buffer and reset the decoder.
    Drop,
    /// The gap fell somewhere the decoder can step over; keep parsing.
    Continue,
    /// The partial message is worth keeping. It spans the whole buffer.
    Deliver(Message),
}

pub const NOTE_LOSS_REQUEST: &str = "Packet loss while capturing the request";
pub const NOTE_LOSS_RESPONSE: &str = "Packet loss while capturing the response";
pub const NOTE_CLOSED: &str = "Connection closed before the message completed";

/// Loss note for a message of the given role.
pub fn loss_note(is_request: bool) -> &'static str {
    if is_request {
        NOTE_LOSS_REQUEST
    } else {
        NOTE_LOSS_RESPONSE
    }
}

/// Capability set shared by every protocol decoder.
pub trait Decoder {
    /// Try to decode one message from the start of `data`.
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome;

    /// `nbytes` were lost right after `data`.
    fn message_gap(&mut self, data: &[u8], nbytes: usize, ctx: &DecodeContext) -> GapOutcome;

    /// The sender closed its side; finalize a message delimited by close.
    fn on_fin(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        let _ = (data, ctx);
        None
    }

    /// Reset per-message state after a message completed or was discarded.
    fn prepare_for_new_message(&mut self);
}

/// Closed set of decoders, selected from configuration at flow creation.
#[derive(Debug)]
pub enum ProtocolDecoder {
    Http(HttpDecoder),
    Mysql(MysqlDecoder),
    Pgsql(PgsqlDecoder),
    Redis(RedisDecoder),
    Thrift(ThriftDecoder),
}

impl ProtocolDecoder {
    pub fn new(protocol: Protocol, options: &DecoderOptions) -> Self {
        match protocol {
            Protocol::Http => ProtocolDecoder::Http(HttpDecoder::new()),
            Protocol::Mysql => ProtocolDecoder::Mysql(MysqlDecoder::new(options.limits)),
            Protocol::Pgsql => ProtocolDecoder::Pgsql(PgsqlDecoder::new(options.limits)),
            Protocol::Redis => ProtocolDecoder::Redis(RedisDecoder::new(options.limits)),
            Protocol::Thrift => ProtocolDecoder::Thrift(ThriftDecoder::new(
                options.limits,
                options.thrift_transport,
            )),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolDecoder::Http(_) => Protocol::Http,
            ProtocolDecoder::Mysql(_) => Protocol::Mysql,
            ProtocolDecoder::Pgsql(_) => Protocol::Pgsql,
            ProtocolDecoder::Redis(_) => Protocol::Redis,
            ProtocolDecoder::Thrift(_) => Protocol::Thrift,
        }
    }

    fn inner(&mut self) -> &mut dyn Decoder {
        match self {
            ProtocolDecoder::Http(d) => d,
            ProtocolDecoder::Mysql(d) => d,
            ProtocolDecoder::Pgsql(d) => d,
            ProtocolDecoder::Redis(d) => d,
            ProtocolDecoder::Thrift(d) => d,
        }
    }
}

impl Decoder for ProtocolDecoder {
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome {
        self.inner().parse(data, ctx)
    }

    fn message_gap(&mut self, data: &[u8], nbytes: usize, ctx: &DecodeContext) -> GapOutcome {
        self.inner().message_gap(data, nbytes, ctx)
    }

    fn on_fin(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        self.inner().on_fin(data, ctx)
    }

    fn prepare_for_new_message(&mut self) {
        self.inner().prepare_for_new_message()
    }
}

/// Test helpers shared by the decoder unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn ctx(to_server: bool) -> DecodeContext {
        DecodeContext {
            direction: if to_server {
                Direction::Original
            } else {
                Direction::Reverse
            },
            timestamp: 1_000,
            to_server,
            stream_offset: 0,
        }
    }

    /// Decode one message from `data` in a single call.
    pub fn decode_one<D: Decoder>(decoder: &mut D, data: &[u8], to_server: bool) -> Message {
        match decoder.parse(data, &ctx(to_server)) {
            ParseOutcome::Complete {
                consumed,
                message: Some(msg),
            } => {
                assert_eq!(consumed, msg.size);
                decoder.prepare_for_new_message();
                msg
            }
            other => panic!("expected a complete message, got {:?}", other),
        }
    }

    /// Feed `data[..split]` (expecting Incomplete) then all of `data`.
    pub fn decode_split<D: Decoder>(
        decoder: &mut D,
        data: &[u8],
        split: usize,
        to_server: bool,
    ) -> Message {
        let c = ctx(to_server);
        assert!(
            matches!(decoder.parse(&data[..split], &c), ParseOutcome::Incomplete),
            "prefix of {} bytes should be incomplete",
            split
        );
        decode_one(decoder, data, to_server)
    }
}
