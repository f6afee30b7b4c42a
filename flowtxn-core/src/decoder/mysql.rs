//! MySQL client/server protocol decoder.
//!
//! Every packet starts with a 3-byte little-endian payload length and a
//! sequence id. Client packets with sequence id 0 and one of the tracked
//! commands become requests; everything else the client sends (handshake,
//! pings, `COM_QUIT`) is consumed silently.
//!
//! Server responses are one of:
//!
//! - OK (`0x00`/`0xfe`): affected rows and last insert id;
//! - ERR (`0xff`): error code, SQL state and message;
//! - PREPARE_OK: an OK of exactly 12 bytes, followed by parameter and
//!   column definition blocks;
//! - a result set: column count, column definitions, EOF, rows, EOF.

use compact_str::CompactString;

use super::reader::{ByteReader, ReadError, ReadResult};
use super::{
    loss_note, DecodeContext, Decoder, GapOutcome, Message, MessageBody, ParseOutcome,
    NOTE_CLOSED,
};
use crate::config::FieldLimits;
use crate::field::truncated_string;

const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

/// Payload length of a PREPARE_OK packet.
const PREPARE_OK_LEN: u32 = 12;

/// Client commands that open a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MysqlCommand {
    Query,
    StmtPrepare,
    StmtExecute,
    StmtClose,
}

impl MysqlCommand {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            COM_QUERY => Some(MysqlCommand::Query),
            COM_STMT_PREPARE => Some(MysqlCommand::StmtPrepare),
            COM_STMT_EXECUTE => Some(MysqlCommand::StmtExecute),
            COM_STMT_CLOSE => Some(MysqlCommand::StmtClose),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MysqlCommand::Query => "QUERY",
            MysqlCommand::StmtPrepare => "PREPARE",
            MysqlCommand::StmtExecute => "EXECUTE",
            MysqlCommand::StmtClose => "CLOSE",
        }
    }
}

/// Decoded MySQL request or response.
#[derive(Debug, Clone, PartialEq)]
pub enum MysqlMessage {
    Request {
        command: MysqlCommand,
        /// Query text (`COM_QUERY`, `COM_STMT_PREPARE`).
        query: CompactString,
        /// Statement id (`COM_STMT_EXECUTE`, `COM_STMT_CLOSE`).
        statement_id: Option<u32>,
        /// Undecoded parameter block after the statement id
        /// (`COM_STMT_EXECUTE`); see [`decode_execute_params`].
        params: Vec<u8>,
    },
    Ok {
        affected_rows: u64,
        insert_id: u64,
    },
    PrepareOk {
        statement_id: u32,
        num_columns: u16,
        num_params: u16,
    },
    Error {
        code: u16,
        state: CompactString,
        message: CompactString,
    },
    ResultSet {
        num_fields: u64,
        num_rows: u64,
        /// Distinct `db.table` names from the column definitions.
        tables: Vec<CompactString>,
        /// The first `max_rows` rows, rendered as text.
        rows: Vec<CompactString>,
        /// A rendered row was cut at `max_row_length`.
        truncated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MysqlState {
    Start,
    /// Column definitions still expected before the EOF marker.
    Fields { remaining: u64 },
    Rows,
    /// Definition packets (including EOF markers) following PREPARE_OK.
    PrepareDefs { remaining: u32 },
}

#[derive(Debug, Default)]
struct ResultSetBuilder {
    num_fields: u64,
    num_rows: u64,
    tables: Vec<CompactString>,
    rows: Vec<CompactString>,
    truncated: bool,
}

impl ResultSetBuilder {
    fn build(self) -> MysqlMessage {
        MysqlMessage::ResultSet {
            num_fields: self.num_fields,
            num_rows: self.num_rows,
            tables: self.tables,
            rows: self.rows,
            truncated: self.truncated,
        }
    }
}

#[derive(Debug)]
pub struct MysqlDecoder {
    state: MysqlState,
    /// Start of the next unread packet, relative to the message start.
    offset: usize,
    result: Option<ResultSetBuilder>,
    prepared: Option<MysqlMessage>,
    limits: FieldLimits,
}

impl MysqlDecoder {
    pub fn new(limits: FieldLimits) -> Self {
        Self {
            state: MysqlState::Start,
            offset: 0,
            result: None,
            prepared: None,
            limits,
        }
    }

    fn parse_start(&mut self, data: &[u8], ctx: &DecodeContext) -> ReadResult<Option<Message>> {
        let packet = read_packet(data, 0)?;
        let total = packet.next;

        if ctx.to_server {
            let command = packet.payload.first().copied().and_then(MysqlCommand::from_byte);
            return match command {
                Some(command) if packet.seq == 0 => {
                    let body = parse_request(command, packet.payload)?;
                    Ok(Some(Message::new(ctx, true, total, MessageBody::Mysql(body))))
                }
                _ => {
                    self.offset = total;
                    Ok(None)
                }
            };
        }

        let first = *packet
            .payload
            .first()
            .ok_or(ReadError::Corrupt("empty MySQL packet"))?;
        let body = match first {
            0x00 if packet.len == PREPARE_OK_LEN => {
                let mut r = ByteReader::at(packet.payload, 1);
                let statement_id = in_packet(r.u32_le())?;
                let num_columns = in_packet(r.u16_le())?;
                let num_params = in_packet(r.u16_le())?;
                let block = |n: u16| if n > 0 { n as u32 + 1 } else { 0 };
                let remaining = block(num_params) + block(num_columns);
                let prepared = MysqlMessage::PrepareOk {
                    statement_id,
                    num_columns,
                    num_params,
                };
                if remaining > 0 {
                    self.prepared = Some(prepared);
                    self.state = MysqlState::PrepareDefs { remaining };
                    self.offset = total;
                    return Err(ReadError::Incomplete);
                }
                prepared
            }
            0x00 | 0xfe => {
                let mut r = ByteReader::at(packet.payload, 1);
                let affected_rows = in_packet(read_lenenc_int(&mut r))?;
                let insert_id = in_packet(read_lenenc_int(&mut r))?;
                MysqlMessage::Ok {
                    affected_rows,
                    insert_id,
                }
            }
            0xff => parse_error(packet.payload)?,
            _ => {
                let mut r = ByteReader::new(packet.payload);
                let num_fields = in_packet(read_lenenc_int(&mut r))?;
                if num_fields == 0 {
                    return Err(ReadError::Corrupt("result set without columns"));
                }
                self.result = Some(ResultSetBuilder {
                    num_fields,
                    ..Default::default()
                });
                self.state = MysqlState::Fields {
                    remaining: num_fields,
                };
                self.offset = total;
                return Err(ReadError::Incomplete);
            }
        };
        Ok(Some(Message::new(ctx, false, total, MessageBody::Mysql(body))))
    }

    fn read_column(&mut self, payload: &[u8]) -> ReadResult<()> {
        let mut r = ByteReader::new(payload);
        let _catalog = in_packet(read_lenenc_str(&mut r))?;
        let db = in_packet(read_lenenc_str(&mut r))?.unwrap_or_default();
        let table = in_packet(read_lenenc_str(&mut r))?.unwrap_or_default();
        if table.is_empty() {
            return Ok(());
        }
        let mut name = CompactString::from_utf8_lossy(db);
        name.push('.');
        name.push_str(&String::from_utf8_lossy(table));
        if let Some(result) = self.result.as_mut() {
            if !result.tables.contains(&name) {
                result.tables.push(name);
            }
        }
        Ok(())
    }

    fn read_row(&mut self, payload: &[u8]) -> ReadResult<()> {
        let limits = self.limits;
        let Some(result) = self.result.as_mut() else {
            return Ok(());
        };
        result.num_rows += 1;
        if result.rows.len() >= limits.max_rows {
            return Ok(());
        }

        let mut text = Vec::with_capacity(payload.len());
        let mut r = ByteReader::new(payload);
        let mut first = true;
        while r.remaining() > 0 {
            if !first {
                text.extend_from_slice(b", ");
            }
            first = false;
            match in_packet(read_lenenc_str(&mut r))? {
                Some(value) => text.extend_from_slice(value),
                None => text.extend_from_slice(b"NULL"),
            }
            if limits.max_row_length > 0 && text.len() > limits.max_row_length {
                break;
            }
        }
        let (row, cut) = truncated_string(&text, limits.max_row_length);
        result.truncated |= cut;
        result.rows.push(row);
        Ok(())
    }

    fn step(&mut self, data: &[u8], ctx: &DecodeContext) -> ReadResult<Option<Message>> {
        loop {
            match self.state {
                MysqlState::Start => {
                    let out = self.parse_start(data, ctx);
                    match out {
                        // parse_start moved into a multi-packet state
                        Err(ReadError::Incomplete) if self.state != MysqlState::Start => continue,
                        other => return other,
                    }
                }
                MysqlState::Fields { remaining } => {
                    let packet = read_packet(data, self.offset)?;
                    if remaining == 0 || is_eof(packet.payload) {
                        // EOF is absent with CLIENT_DEPRECATE_EOF
                        if is_eof(packet.payload) {
                            self.offset = packet.next;
                        }
                        self.state = MysqlState::Rows;
                        continue;
                    }
                    self.read_column(packet.payload)?;
                    self.offset = packet.next;
                    self.state = MysqlState::Fields {
                        remaining: remaining - 1,
                    };
                }
                MysqlState::Rows => {
                    let packet = read_packet(data, self.offset)?;
                    if is_eof(packet.payload) {
                        let body = self.result.take().unwrap_or_default().build();
                        return Ok(Some(Message::new(
                            ctx,
                            false,
                            packet.next,
                            MessageBody::Mysql(body),
                        )));
                    }
                    if packet.payload.first() == Some(&0xff) {
                        let body = parse_error(packet.payload)?;
                        return Ok(Some(Message::new(
                            ctx,
                            false,
                            packet.next,
                            MessageBody::Mysql(body),
                        )));
                    }
                    self.read_row(packet.payload)?;
                    self.offset = packet.next;
                }
                MysqlState::PrepareDefs { remaining } => {
                    let packet = read_packet(data, self.offset)?;
                    self.offset = packet.next;
                    if remaining <= 1 {
                        let body = self.prepared.take().ok_or(ReadError::Corrupt(
                            "definitions without PREPARE_OK",
                        ))?;
                        return Ok(Some(Message::new(
                            ctx,
                            false,
                            packet.next,
                            MessageBody::Mysql(body),
                        )));
                    }
                    self.state = MysqlState::PrepareDefs {
                        remaining: remaining - 1,
                    };
                }
            }
        }
    }

    /// Whatever has been decoded of a multi-packet response.
    fn partial(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        let body = match self.state {
            MysqlState::Start => return None,
            MysqlState::Fields { .. } | MysqlState::Rows => self.result.take()?.build(),
            MysqlState::PrepareDefs { .. } => self.prepared.take()?,
        };
        Some(Message::new(ctx, false, data.len(), MessageBody::Mysql(body)))
    }
}

impl Decoder for MysqlDecoder {
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome {
        match self.step(data, ctx) {
            Ok(Some(msg)) => ParseOutcome::message(msg),
            // Ignored client packet
            Ok(None) => ParseOutcome::skip(self.offset),
            Err(e) => e.into(),
        }
    }

    fn message_gap(&mut self, data: &[u8], _nbytes: usize, ctx: &DecodeContext) -> GapOutcome {
        match self.partial(data, ctx) {
            Some(msg) => GapOutcome::Deliver(msg.with_note(loss_note(false))),
            None => GapOutcome::Drop,
        }
    }

    fn on_fin(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        self.partial(data, ctx).map(|msg| msg.with_note(NOTE_CLOSED))
    }

    fn prepare_for_new_message(&mut self) {
        self.state = MysqlState::Start;
        self.offset = 0;
        self.result = None;
        self.prepared = None;
    }
}

struct Packet<'a> {
    len: u32,
    seq: u8,
    payload: &'a [u8],
    /// Offset just past this packet.
    next: usize,
}

/// Read a whole packet starting at `offset`, or report `Incomplete`.
fn read_packet(data: &[u8], offset: usize) -> ReadResult<Packet<'_>> {
    let mut r = ByteReader::at(data, offset);
    let len = r.u24_le()?;
    let seq = r.u8()?;
    let payload = r.bytes(len as usize)?;
    Ok(Packet {
        len,
        seq,
        payload,
        next: r.position(),
    })
}

/// A short read inside a fully received packet means the packet is malformed.
fn in_packet<T>(r: ReadResult<T>) -> ReadResult<T> {
    r.map_err(|e| match e {
        ReadError::Incomplete => ReadError::Corrupt("truncated MySQL packet"),
        corrupt => corrupt,
    })
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

fn parse_request(command: MysqlCommand, payload: &[u8]) -> ReadResult<MysqlMessage> {
    let mut r = ByteReader::at(payload, 1);
    let msg = match command {
        MysqlCommand::Query | MysqlCommand::StmtPrepare => MysqlMessage::Request {
            command,
            query: CompactString::from_utf8_lossy(&payload[1..]),
            statement_id: None,
            params: Vec::new(),
        },
        MysqlCommand::StmtExecute => MysqlMessage::Request {
            command,
            query: CompactString::default(),
            statement_id: Some(in_packet(r.u32_le())?),
            params: payload[r.position()..].to_vec(),
        },
        MysqlCommand::StmtClose => MysqlMessage::Request {
            command,
            query: CompactString::default(),
            statement_id: Some(in_packet(r.u32_le())?),
            params: Vec::new(),
        },
    };
    Ok(msg)
}

/// Column type of a bound `COM_STMT_EXECUTE` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamType {
    pub code: u8,
    pub unsigned: bool,
}

/// Parameter values of one `COM_STMT_EXECUTE`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteParams {
    /// Types sent with this execute; `None` when the client reused the
    /// types bound by an earlier execute of the same statement.
    pub bound_types: Option<Vec<ParamType>>,
    /// One entry per parameter, `None` for SQL NULL.
    pub values: Vec<Option<CompactString>>,
}

/// Decode the parameter block of `COM_STMT_EXECUTE`.
///
/// The block is laid out as flags (1), iteration count (4), a NULL bitmap
/// of `(num_params + 7) / 8` bytes, the new-params-bound flag (1), one
/// `(type, flags)` pair per parameter when that flag is set, then the
/// non-NULL values in binary protocol encoding. `cached_types` are used when
/// the client does not rebind. String values are cut at `max_string_len`.
pub fn decode_execute_params(
    block: &[u8],
    num_params: u16,
    cached_types: &[ParamType],
    limits: &FieldLimits,
) -> ReadResult<ExecuteParams> {
    let n = num_params as usize;
    if n == 0 {
        return Ok(ExecuteParams {
            bound_types: None,
            values: Vec::new(),
        });
    }
    let mut r = ByteReader::new(block);
    r.skip(1 + 4)?;
    let null_bitmap = r.bytes(n.div_ceil(8))?;
    let bound_types = if r.u8()? == 1 {
        let mut types = Vec::with_capacity(n);
        for _ in 0..n {
            let code = r.u8()?;
            let flags = r.u8()?;
            types.push(ParamType {
                code,
                unsigned: flags & 0x80 != 0,
            });
        }
        Some(types)
    } else {
        None
    };
    let types = match &bound_types {
        Some(types) => types.as_slice(),
        None if cached_types.len() == n => cached_types,
        None => return Err(ReadError::Corrupt("parameter types never bound")),
    };

    let mut values = Vec::with_capacity(n);
    for (i, ty) in types.iter().enumerate() {
        let is_null = null_bitmap[i / 8] & (1 << (i % 8)) != 0;
        if is_null || ty.code == 0x06 {
            values.push(None);
            continue;
        }
        values.push(Some(read_binary_value(&mut r, *ty, limits)?));
    }
    Ok(ExecuteParams {
        bound_types,
        values,
    })
}

/// One non-NULL value in binary protocol encoding.
fn read_binary_value(
    r: &mut ByteReader<'_>,
    ty: ParamType,
    limits: &FieldLimits,
) -> ReadResult<CompactString> {
    let text = match (ty.code, ty.unsigned) {
        // TINY
        (0x01, false) => (r.u8()? as i8).to_string(),
        (0x01, true) => r.u8()?.to_string(),
        // SHORT, YEAR
        (0x02 | 0x0d, false) => (r.u16_le()? as i16).to_string(),
        (0x02 | 0x0d, true) => r.u16_le()?.to_string(),
        // LONG, INT24
        (0x03 | 0x09, false) => (r.u32_le()? as i32).to_string(),
        (0x03 | 0x09, true) => r.u32_le()?.to_string(),
        // LONGLONG
        (0x08, false) => (r.u64_le()? as i64).to_string(),
        (0x08, true) => r.u64_le()?.to_string(),
        (0x04, _) => f32::from_bits(r.u32_le()?).to_string(),
        (0x05, _) => f64::from_bits(r.u64_le()?).to_string(),
        // DATE, DATETIME, TIMESTAMP
        (0x07 | 0x0a | 0x0c, _) => {
            let len = r.u8()? as usize;
            let mut d = ByteReader::new(r.bytes(len)?);
            match len {
                0 => "0000-00-00".to_string(),
                4 => format!("{:04}-{:02}-{:02}", d.u16_le()?, d.u8()?, d.u8()?),
                7 | 11 => format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    d.u16_le()?,
                    d.u8()?,
                    d.u8()?,
                    d.u8()?,
                    d.u8()?,
                    d.u8()?
                ),
                _ => return Err(ReadError::Corrupt("invalid date parameter")),
            }
        }
        // TIME
        (0x0b, _) => {
            let len = r.u8()? as usize;
            let mut d = ByteReader::new(r.bytes(len)?);
            match len {
                0 => "00:00:00".to_string(),
                8 | 12 => {
                    let sign = if d.u8()? == 1 { "-" } else { "" };
                    let days = d.u32_le()? as u64;
                    let hours = days * 24 + d.u8()? as u64;
                    format!("{}{:02}:{:02}:{:02}", sign, hours, d.u8()?, d.u8()?)
                }
                _ => return Err(ReadError::Corrupt("invalid time parameter")),
            }
        }
        // VARCHAR, JSON, NEWDECIMAL, ENUM, SET, BLOBs, VAR_STRING, STRING
        (0x0f | 0xf5..=0xfe, _) => {
            let raw = read_lenenc_str(r)?.unwrap_or_default();
            return Ok(truncated_string(raw, limits.max_string_len).0);
        }
        _ => return Err(ReadError::Corrupt("unknown parameter type")),
    };
    Ok(CompactString::from(text))
}

fn parse_error(payload: &[u8]) -> ReadResult<MysqlMessage> {
    let mut r = ByteReader::at(payload, 1);
    let code = in_packet(r.u16_le())?;
    let rest = &payload[r.position()..];
    let (state, message) = match rest.split_first() {
        Some((b'#', tail)) if tail.len() >= 5 => (&tail[..5], &tail[5..]),
        _ => (&[][..], rest),
    };
    Ok(MysqlMessage::Error {
        code,
        state: CompactString::from_utf8_lossy(state),
        message: CompactString::from_utf8_lossy(message),
    })
}

/// Length-encoded integer.
fn read_lenenc_int(r: &mut ByteReader<'_>) -> ReadResult<u64> {
    match r.u8()? {
        0xfc => r.u16_le().map(u64::from),
        0xfd => r.u24_le().map(u64::from),
        0xfe => r.u64_le(),
        0xfb | 0xff => Err(ReadError::Corrupt("invalid length-encoded integer")),
        b => Ok(u64::from(b)),
    }
}

/// Length-encoded string; `None` for SQL NULL (`0xfb`).
fn read_lenenc_str<'a>(r: &mut ByteReader<'a>) -> ReadResult<Option<&'a [u8]>> {
    if r.peek_u8()? == 0xfb {
        r.skip(1)?;
        return Ok(None);
    }
    let len = read_lenenc_int(r)?;
    let len = usize::try_from(len).map_err(|_| ReadError::Corrupt("string too long"))?;
    r.bytes(len).map(Some)
}
