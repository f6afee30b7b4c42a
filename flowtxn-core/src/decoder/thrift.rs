//! Thrift binary protocol decoder.
//!
//! Handles strict (versioned) and old non-strict message headers, over
//! either a plain socket or the framed transport. Argument and result
//! structs are rendered to text for display; nothing is kept typed.
//!
//! Rendering follows the Thrift IDL look: strings quoted, lists `[..]`,
//! sets `{..}`, maps `{k: v}`, structs `(id: value)`.

use compact_str::CompactString;

use super::reader::{ByteReader, ReadError, ReadResult};
use super::{
    loss_note, DecodeContext, Decoder, GapOutcome, Message, MessageBody, ParseOutcome, NOTE_CLOSED,
};
use crate::config::{FieldLimits, ThriftTransport};

const VERSION_MASK: u32 = 0xffff_0000;
const VERSION_1: u32 = 0x8001_0000;

/// Longest method name accepted in a non-strict header.
const MAX_METHOD_LEN: i32 = 1024;
/// Largest frame accepted on the framed transport.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
/// Nested containers deeper than this are treated as corrupt.
const MAX_DEPTH: usize = 32;

const T_STOP: u8 = 0;
const T_BOOL: u8 = 2;
const T_BYTE: u8 = 3;
const T_DOUBLE: u8 = 4;
const T_I16: u8 = 6;
const T_I32: u8 = 8;
const T_I64: u8 = 10;
const T_STRING: u8 = 11;
const T_STRUCT: u8 = 12;
const T_MAP: u8 = 13;
const T_SET: u8 = 14;
const T_LIST: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThriftMessageType {
    Call,
    Reply,
    Exception,
    Oneway,
}

impl ThriftMessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ThriftMessageType::Call),
            2 => Some(ThriftMessageType::Reply),
            3 => Some(ThriftMessageType::Exception),
            4 => Some(ThriftMessageType::Oneway),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, ThriftMessageType::Call | ThriftMessageType::Oneway)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThriftMessageType::Call => "call",
            ThriftMessageType::Reply => "reply",
            ThriftMessageType::Exception => "exception",
            ThriftMessageType::Oneway => "oneway",
        }
    }
}

/// Decoded Thrift message.
#[derive(Debug, Clone, PartialEq)]
pub struct ThriftMessage {
    pub method: CompactString,
    pub message_type: ThriftMessageType,
    pub seq_id: i32,
    /// Rendered argument struct (calls) or result struct (replies).
    pub fields: CompactString,
    /// Exception message, or a reply carrying a declared exception.
    pub is_error: bool,
    /// Frame length on the framed transport.
    pub frame_size: Option<u32>,
}

/// Renders values while reading them, honoring the display caps.
struct Renderer {
    limits: FieldLimits,
}

impl Renderer {
    fn count(r: &ByteReader<'_>, raw: i32) -> ReadResult<usize> {
        if raw < 0 {
            return Err(ReadError::Corrupt("negative container size"));
        }
        // Every element takes at least one byte
        if raw as usize > r.remaining() {
            return Err(ReadError::Incomplete);
        }
        Ok(raw as usize)
    }

    fn string(&self, r: &mut ByteReader<'_>, out: &mut String) -> ReadResult<()> {
        let len = r.i32_be()?;
        if len < 0 {
            return Err(ReadError::Corrupt("negative string length"));
        }
        let raw = r.bytes(len as usize)?;
        let max = self.limits.max_string_len;
        out.push('"');
        if max > 0 && raw.len() > max {
            out.push_str(&String::from_utf8_lossy(&raw[..max]));
            out.push_str("...");
        } else {
            out.push_str(&String::from_utf8_lossy(raw));
        }
        out.push('"');
        Ok(())
    }

    /// Render one element, or only skip over it once past the cap.
    fn element(
        &self,
        r: &mut ByteReader<'_>,
        typ: u8,
        index: usize,
        depth: usize,
        out: &mut String,
        scratch: &mut String,
    ) -> ReadResult<()> {
        let cap = self.limits.max_collection_len;
        if cap > 0 && index >= cap {
            scratch.clear();
            return self.value(r, typ, depth, scratch);
        }
        if index > 0 {
            out.push_str(", ");
        }
        self.value(r, typ, depth, out)
    }

    fn close(&self, len: usize, out: &mut String, close: char) {
        let cap = self.limits.max_collection_len;
        if cap > 0 && len > cap {
            out.push_str(", ...");
        }
        out.push(close);
    }

    fn sequence(
        &self,
        r: &mut ByteReader<'_>,
        depth: usize,
        out: &mut String,
        (open, close): (char, char),
    ) -> ReadResult<()> {
        let elem = r.u8()?;
        let raw = r.i32_be()?;
        let len = Self::count(r, raw)?;
        let mut scratch = String::new();
        out.push(open);
        for i in 0..len {
            self.element(r, elem, i, depth + 1, out, &mut scratch)?;
        }
        self.close(len, out, close);
        Ok(())
    }

    fn map(&self, r: &mut ByteReader<'_>, depth: usize, out: &mut String) -> ReadResult<()> {
        let key_type = r.u8()?;
        let value_type = r.u8()?;
        let raw = r.i32_be()?;
        let len = Self::count(r, raw)?;
        let cap = self.limits.max_collection_len;
        let mut scratch = String::new();
        out.push('{');
        for i in 0..len {
            if cap > 0 && i >= cap {
                scratch.clear();
                self.value(r, key_type, depth + 1, &mut scratch)?;
                self.value(r, value_type, depth + 1, &mut scratch)?;
                continue;
            }
            if i > 0 {
                out.push_str(", ");
            }
            self.value(r, key_type, depth + 1, out)?;
            out.push_str(": ");
            self.value(r, value_type, depth + 1, out)?;
        }
        self.close(len, out, '}');
        Ok(())
    }

    /// Render a struct; returns the id of its first field.
    fn structure(
        &self,
        r: &mut ByteReader<'_>,
        depth: usize,
        out: &mut String,
    ) -> ReadResult<Option<i16>> {
        let mut first_id = None;
        let mut scratch = String::new();
        let mut count = 0;
        out.push('(');
        loop {
            let typ = r.u8()?;
            if typ == T_STOP {
                break;
            }
            let max_fields = self.limits.max_struct_fields;
            if max_fields > 0 && count >= max_fields {
                return Err(ReadError::Corrupt("too many struct fields"));
            }
            let id = r.i16_be()?;
            first_id.get_or_insert(id);
            let cap = self.limits.max_collection_len;
            if cap > 0 && count >= cap {
                scratch.clear();
                self.value(r, typ, depth + 1, &mut scratch)?;
            } else {
                if count > 0 {
                    out.push_str(", ");
                }
                out.push_str(&id.to_string());
                out.push_str(": ");
                self.value(r, typ, depth + 1, out)?;
            }
            count += 1;
        }
        self.close(count, out, ')');
        Ok(first_id)
    }

    fn value(&self, r: &mut ByteReader<'_>, typ: u8, depth: usize, out: &mut String) -> ReadResult<()> {
        if depth > MAX_DEPTH {
            return Err(ReadError::Corrupt("thrift nesting too deep"));
        }
        match typ {
            T_BOOL => out.push_str(if r.u8()? != 0 { "true" } else { "false" }),
            T_BYTE => out.push_str(&(r.u8()? as i8).to_string()),
            T_DOUBLE => out.push_str(&r.f64_be()?.to_string()),
            T_I16 => out.push_str(&r.i16_be()?.to_string()),
            T_I32 => out.push_str(&r.i32_be()?.to_string()),
            T_I64 => out.push_str(&r.i64_be()?.to_string()),
            T_STRING => self.string(r, out)?,
            T_STRUCT => {
                self.structure(r, depth, out)?;
            }
            T_MAP => self.map(r, depth, out)?,
            T_SET => self.sequence(r, depth, out, ('{', '}'))?,
            T_LIST => self.sequence(r, depth, out, ('[', ']'))?,
            _ => return Err(ReadError::Corrupt("unknown thrift field type")),
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ThriftDecoder {
    limits: FieldLimits,
    transport: ThriftTransport,
}

impl ThriftDecoder {
    pub fn new(limits: FieldLimits, transport: ThriftTransport) -> Self {
        Self { limits, transport }
    }

    /// Message header: method, type, sequence id.
    fn header(r: &mut ByteReader<'_>) -> ReadResult<(CompactString, ThriftMessageType, i32)> {
        let first = r.i32_be()?;
        let (method, typ) = if first < 0 {
            let word = first as u32;
            if word & VERSION_MASK != VERSION_1 {
                return Err(ReadError::Corrupt("unsupported thrift version"));
            }
            let len = r.i32_be()?;
            if !(0..=MAX_METHOD_LEN).contains(&len) {
                return Err(ReadError::Corrupt("implausible method name length"));
            }
            let name = r.bytes(len as usize)?;
            (name, (word & 0xff) as u8)
        } else {
            if first > MAX_METHOD_LEN {
                return Err(ReadError::Corrupt("implausible method name length"));
            }
            let name = r.bytes(first as usize)?;
            (name, r.u8()?)
        };
        let typ = ThriftMessageType::from_u8(typ)
            .ok_or(ReadError::Corrupt("unknown thrift message type"))?;
        let seq_id = r.i32_be()?;
        Ok((CompactString::from_utf8_lossy(method), typ, seq_id))
    }

    fn message_body(&self, r: &mut ByteReader<'_>) -> ReadResult<ThriftMessage> {
        let (method, message_type, seq_id) = Self::header(r)?;
        let renderer = Renderer {
            limits: self.limits,
        };
        let mut fields = String::new();
        let first_id = renderer.structure(r, 0, &mut fields)?;
        let is_error = match message_type {
            ThriftMessageType::Exception => true,
            // Field 0 is the return value; any other id is a declared exception
            ThriftMessageType::Reply => first_id.is_some_and(|id| id != 0),
            _ => false,
        };
        Ok(ThriftMessage {
            method,
            message_type,
            seq_id,
            fields: CompactString::from(fields),
            is_error,
            frame_size: None,
        })
    }

    fn decode(&self, data: &[u8], ctx: &DecodeContext) -> ReadResult<Message> {
        let mut r = ByteReader::new(data);
        let (body, size) = match self.transport {
            ThriftTransport::Socket => {
                let body = self.message_body(&mut r)?;
                (body, r.position())
            }
            ThriftTransport::Framed => {
                let frame_len = r.u32_be()?;
                if frame_len > MAX_FRAME_LEN {
                    return Err(ReadError::Corrupt("thrift frame too large"));
                }
                let frame = r.bytes(frame_len as usize)?;
                let mut inner = ByteReader::new(frame);
                let mut body = self.message_body(&mut inner).map_err(|e| match e {
                    ReadError::Incomplete => ReadError::Corrupt("thrift message overruns frame"),
                    corrupt => corrupt,
                })?;
                body.frame_size = Some(frame_len);
                (body, r.position())
            }
        };
        let is_request = body.message_type.is_request();
        Ok(Message::new(ctx, is_request, size, MessageBody::Thrift(body)))
    }

    /// Whatever can be recovered from a message cut short: `None` until the
    /// header is complete, then the header plus the fields rendered so far.
    fn partial(&self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        let mut r = ByteReader::new(data);
        let frame_size = match self.transport {
            ThriftTransport::Socket => None,
            ThriftTransport::Framed => Some(r.u32_be().ok()?),
        };
        let (method, message_type, seq_id) = Self::header(&mut r).ok()?;
        let renderer = Renderer {
            limits: self.limits,
        };
        let mut fields = String::new();
        // Stops at the missing bytes; the text rendered up to there is kept
        let _ = renderer.structure(&mut r, 0, &mut fields);
        let body = ThriftMessage {
            method,
            message_type,
            seq_id,
            fields: CompactString::from(fields),
            is_error: message_type == ThriftMessageType::Exception,
            frame_size,
        };
        let is_request = message_type.is_request();
        Some(Message::new(ctx, is_request, data.len(), MessageBody::Thrift(body)))
    }
}

impl Decoder for ThriftDecoder {
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome {
        match self.decode(data, ctx) {
            Ok(msg) => ParseOutcome::message(msg),
            Err(e) => e.into(),
        }
    }

    fn message_gap(&mut self, data: &[u8], _nbytes: usize, ctx: &DecodeContext) -> GapOutcome {
        match self.partial(data, ctx) {
            Some(msg) => {
                let note = loss_note(msg.is_request);
                GapOutcome::Deliver(msg.with_note(note))
            }
            None => GapOutcome::Drop,
        }
    }

    fn on_fin(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        self.partial(data, ctx).map(|msg| msg.with_note(NOTE_CLOSED))
    }

    fn prepare_for_new_message(&mut self) {}
}
