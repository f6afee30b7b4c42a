//! PostgreSQL frontend/backend protocol decoder (protocol 3.0).
//!
//! Typed messages are a type byte followed by a 4-byte big-endian length
//! that counts itself. The client's first packets (startup, SSLRequest,
//! CancelRequest) carry no type byte, and a server refusing or accepting
//! SSL answers with a single `N` or `S` byte; both are consumed silently.
//!
//! A response is assembled from RowDescription (`T`), DataRow (`D`) and is
//! finished by CommandComplete (`C`), EmptyQueryResponse (`I`) or
//! ErrorResponse (`E`). ReadyForQuery and other status chatter in between
//! responses is skipped.

use compact_str::CompactString;
use smallvec::SmallVec;

use super::reader::{ByteReader, ReadError, ReadResult};
use super::{
    loss_note, DecodeContext, Decoder, GapOutcome, Message, MessageBody, ParseOutcome,
    NOTE_CLOSED,
};
use crate::config::FieldLimits;
use crate::field::truncated_string;

const SSL_REQUEST_CODE: u32 = 80_877_103;
const CANCEL_REQUEST_CODE: u32 = 80_877_102;
const PROTOCOL_V3: u32 = 196_608;

/// Largest untyped startup packet accepted.
const MAX_STARTUP_LEN: u32 = 10_000;

/// How a response ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PgsqlStatus {
    #[default]
    Complete,
    EmptyQuery,
    Error,
}

/// Decoded PostgreSQL query response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PgsqlResponse {
    pub status: PgsqlStatus,
    /// CommandComplete tag, e.g. `SELECT 2`.
    pub command_tag: CompactString,
    pub fields: Vec<CompactString>,
    pub num_rows: u64,
    /// The first `max_rows` rows, rendered as text.
    pub rows: Vec<CompactString>,
    pub truncated: bool,
    pub error_severity: CompactString,
    pub error_code: CompactString,
    pub error_message: CompactString,
}

/// Decoded PostgreSQL message.
#[derive(Debug, Clone, PartialEq)]
pub enum PgsqlMessage {
    /// Simple query; may hold several `;`-separated statements.
    Query { query: CompactString },
    Response(PgsqlResponse),
}

#[derive(Debug)]
pub struct PgsqlDecoder {
    /// Start of the next unread backend message, relative to the response start.
    offset: usize,
    response: Option<PgsqlResponse>,
    /// Any server message seen yet (the SSL answer can only come first).
    seen_server: bool,
    limits: FieldLimits,
}

impl PgsqlDecoder {
    pub fn new(limits: FieldLimits) -> Self {
        Self {
            offset: 0,
            response: None,
            seen_server: false,
            limits,
        }
    }

    fn parse_frontend(&mut self, data: &[u8], ctx: &DecodeContext) -> ReadResult<ParseOutcome> {
        let mut r = ByteReader::new(data);
        if r.peek_u8()? == 0 {
            // Untyped: length, then protocol version or request code
            let len = r.u32_be()?;
            if !(8..=MAX_STARTUP_LEN).contains(&len) {
                return Err(ReadError::Corrupt("implausible startup packet length"));
            }
            let code = r.u32_be()?;
            ByteReader::new(data).need(len as usize)?;
            match code {
                SSL_REQUEST_CODE => tracing::trace!("pgsql: SSLRequest"),
                CANCEL_REQUEST_CODE => tracing::trace!("pgsql: CancelRequest"),
                PROTOCOL_V3 => tracing::trace!("pgsql: StartupMessage"),
                other => tracing::debug!(code = other, "pgsql: unknown startup code"),
            }
            return Ok(ParseOutcome::skip(len as usize));
        }

        let (typ, body, next) = read_message(&mut r)?;
        if typ != b'Q' {
            return Ok(ParseOutcome::skip(next));
        }
        let text = body.strip_suffix(&[0]).unwrap_or(body);
        let query = CompactString::from_utf8_lossy(text);
        Ok(ParseOutcome::message(Message::new(
            ctx,
            true,
            next,
            MessageBody::Pgsql(PgsqlMessage::Query { query }),
        )))
    }

    fn parse_backend(&mut self, data: &[u8], ctx: &DecodeContext) -> ReadResult<ParseOutcome> {
        if !self.seen_server && self.offset == 0 {
            let first = ByteReader::new(data).peek_u8()?;
            // A real N/S message has a length whose high byte is 0
            if matches!(first, b'N' | b'S') && data.get(1).map_or(true, |&b| b != 0) {
                self.seen_server = true;
                return Ok(ParseOutcome::skip(1));
            }
        }

        loop {
            let mut r = ByteReader::at(data, self.offset);
            let (typ, body, next) = read_message(&mut r)?;
            self.seen_server = true;

            match typ {
                b'T' => {
                    let fields = parse_row_description(body)?;
                    let response = self.response.get_or_insert_with(Default::default);
                    response.fields = fields;
                }
                b'D' => {
                    let limits = self.limits;
                    let response = self.response.get_or_insert_with(Default::default);
                    read_data_row(body, response, limits)?;
                }
                b'C' | b'I' | b'E' => {
                    let mut response = self.response.take().unwrap_or_default();
                    match typ {
                        b'C' => {
                            let tag = in_body(ByteReader::new(body).cstring())?;
                            response.command_tag = CompactString::from_utf8_lossy(tag);
                        }
                        b'I' => response.status = PgsqlStatus::EmptyQuery,
                        _ => parse_error_fields(body, &mut response)?,
                    }
                    return Ok(ParseOutcome::message(Message::new(
                        ctx,
                        false,
                        next,
                        MessageBody::Pgsql(PgsqlMessage::Response(response)),
                    )));
                }
                _ if self.response.is_none() => return Ok(ParseOutcome::skip(next)),
                _ => {}
            }
            self.offset = next;
        }
    }

    fn partial(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        let response = self.response.take()?;
        Some(Message::new(
            ctx,
            false,
            data.len(),
            MessageBody::Pgsql(PgsqlMessage::Response(response)),
        ))
    }
}

/// Type byte, body, and the offset just past the message.
fn read_message<'a>(r: &mut ByteReader<'a>) -> ReadResult<(u8, &'a [u8], usize)> {
    let typ = r.u8()?;
    let len = r.i32_be()?;
    if len < 4 {
        return Err(ReadError::Corrupt("message length below 4"));
    }
    let body = r.bytes(len as usize - 4)?;
    Ok((typ, body, r.position()))
}

fn in_body<T>(r: ReadResult<T>) -> ReadResult<T> {
    r.map_err(|e| match e {
        ReadError::Incomplete => ReadError::Corrupt("truncated PostgreSQL message"),
        corrupt => corrupt,
    })
}

fn parse_row_description(body: &[u8]) -> ReadResult<Vec<CompactString>> {
    let mut r = ByteReader::new(body);
    let count = in_body(r.i16_be())?;
    let mut fields = Vec::with_capacity(count.clamp(0, 64) as usize);
    for _ in 0..count.max(0) {
        let name = in_body(r.cstring())?;
        // table oid, column, type oid, type len, type mod, format
        in_body(r.skip(18))?;
        fields.push(CompactString::from_utf8_lossy(name));
    }
    Ok(fields)
}

fn read_data_row(body: &[u8], response: &mut PgsqlResponse, limits: FieldLimits) -> ReadResult<()> {
    response.num_rows += 1;
    if response.rows.len() >= limits.max_rows {
        return Ok(());
    }
    let mut r = ByteReader::new(body);
    let count = in_body(r.i16_be())?;
    let mut text = Vec::new();
    for i in 0..count.max(0) {
        if i > 0 {
            text.extend_from_slice(b", ");
        }
        let len = in_body(r.i32_be())?;
        if len < 0 {
            text.extend_from_slice(b"NULL");
        } else {
            text.extend_from_slice(in_body(r.bytes(len as usize))?);
        }
        if limits.max_row_length > 0 && text.len() > limits.max_row_length {
            break;
        }
    }
    let (row, cut) = truncated_string(&text, limits.max_row_length);
    response.truncated |= cut;
    response.rows.push(row);
    Ok(())
}

fn parse_error_fields(body: &[u8], response: &mut PgsqlResponse) -> ReadResult<()> {
    response.status = PgsqlStatus::Error;
    let mut r = ByteReader::new(body);
    loop {
        let code = in_body(r.u8())?;
        if code == 0 {
            return Ok(());
        }
        let value = CompactString::from_utf8_lossy(in_body(r.cstring())?);
        match code {
            b'S' => response.error_severity = value,
            b'C' => response.error_code = value,
            b'M' => response.error_message = value,
            _ => {}
        }
    }
}

/// Split a simple query into its statements on `;` outside quotes.
///
/// An empty query still yields one (empty) statement, matching the single
/// EmptyQueryResponse the server sends for it.
pub fn split_statements(query: &str) -> SmallVec<[&str; 1]> {
    let mut out = SmallVec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in query.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ';') => {
                let stmt = query[start..i].trim();
                if !stmt.is_empty() {
                    out.push(stmt);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = query[start..].trim();
    if !tail.is_empty() || out.is_empty() {
        out.push(tail);
    }
    out
}

impl Decoder for PgsqlDecoder {
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome {
        let result = if ctx.to_server {
            self.parse_frontend(data, ctx)
        } else {
            self.parse_backend(data, ctx)
        };
        result.unwrap_or_else(ParseOutcome::from)
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
        self.offset = 0;
        self.response = None;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ctx, decode_one, decode_split};
    use super::*;

    fn msg(typ: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![typ];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn row_description(names: &[&str]) -> Vec<u8> {
        let mut body = (names.len() as i16).to_be_bytes().to_vec();
        for name in names {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(&[0u8; 18]);
        }
        msg(b'T', &body)
    }

    fn data_row(values: &[Option<&str>]) -> Vec<u8> {
        let mut body = (values.len() as i16).to_be_bytes().to_vec();
        for v in values {
            match v {
                Some(s) => {
                    body.extend_from_slice(&(s.len() as i32).to_be_bytes());
                    body.extend_from_slice(s.as_bytes());
                }
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        msg(b'D', &body)
    }

    fn select_response() -> Vec<u8> {
        let mut data = row_description(&["id", "name"]);
        data.extend(data_row(&[Some("1"), Some("alice")]));
        data.extend(data_row(&[Some("2"), None]));
        data.extend(msg(b'C', b"SELECT 2\0"));
        data
    }

    fn response(m: &Message) -> &PgsqlResponse {
        match &m.body {
            MessageBody::Pgsql(PgsqlMessage::Response(r)) => r,
            other => panic!("not a pgsql response: {:?}", other),
        }
    }

    fn decoder() -> PgsqlDecoder {
        PgsqlDecoder::new(FieldLimits::default())
    }

    #[test]
    fn test_simple_query() {
        let data = msg(b'Q', b"SELECT * FROM users\0");
        let m = decode_one(&mut decoder(), &data, true);
        assert!(m.is_request);
        assert_eq!(m.size, data.len());
        assert!(matches!(
            &m.body,
            MessageBody::Pgsql(PgsqlMessage::Query { query }) if query == "SELECT * FROM users"
        ));
    }

    #[test]
    fn test_select_response() {
        let data = select_response();
        let m = decode_one(&mut decoder(), &data, false);
        assert_eq!(m.size, data.len());
        let r = response(&m);
        assert_eq!(r.status, PgsqlStatus::Complete);
        assert_eq!(r.command_tag, "SELECT 2");
        assert_eq!(r.fields, vec![CompactString::from("id"), CompactString::from("name")]);
        assert_eq!(r.num_rows, 2);
        assert_eq!(r.rows[0], "1, alice");
        assert_eq!(r.rows[1], "2, NULL");
    }

    #[test]
    fn test_response_resumes() {
        let data = select_response();
        let whole = decode_one(&mut decoder(), &data, false);
        for split in [1, 4, 20, 35, data.len() - 1] {
            let m = decode_split(&mut decoder(), &data, split, false);
            assert_eq!(response(&m), response(&whole), "split at {}", split);
        }
    }

    #[test]
    fn test_error_response() {
        let data = msg(
            b'E',
            b"SERROR\0C42P01\0Mrelation \"nope\" does not exist\0\0",
        );
        let m = decode_one(&mut decoder(), &data, false);
        let r = response(&m);
        assert_eq!(r.status, PgsqlStatus::Error);
        assert_eq!(r.error_severity, "ERROR");
        assert_eq!(r.error_code, "42P01");
        assert_eq!(r.error_message, "relation \"nope\" does not exist");
    }

    #[test]
    fn test_ready_for_query_skipped() {
        let data = msg(b'Z', b"I");
        let mut dec = decoder();
        // Not the first server message, so Z is just skipped
        dec.seen_server = true;
        match dec.parse(&data, &ctx(false)) {
            ParseOutcome::Complete { consumed, message } => {
                assert_eq!(consumed, data.len());
                assert!(message.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_startup_and_ssl() {
        let mut dec = decoder();
        let mut ssl = 8u32.to_be_bytes().to_vec();
        ssl.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        assert!(matches!(
            dec.parse(&ssl, &ctx(true)),
            ParseOutcome::Complete { consumed: 8, message: None }
        ));

        let mut server = decoder();
        assert!(matches!(
            server.parse(b"N", &ctx(false)),
            ParseOutcome::Complete { consumed: 1, message: None }
        ));
    }

    #[test]
    fn test_bad_length_is_corrupt() {
        let data = [b'Q', 0, 0, 0, 2];
        assert!(matches!(
            decoder().parse(&data, &ctx(true)),
            ParseOutcome::Corrupt(_)
        ));
    }

    #[test]
    fn test_gap_in_rows_delivers() {
        let mut data = row_description(&["id"]);
        data.extend(data_row(&[Some("1")]));
        let mut dec = decoder();
        let c = ctx(false);
        assert!(matches!(dec.parse(&data, &c), ParseOutcome::Incomplete));
        match dec.message_gap(&data, 100, &c) {
            GapOutcome::Deliver(m) => {
                assert_eq!(m.size, data.len());
                assert_eq!(response(&m).num_rows, 1);
                assert_eq!(m.notes.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gap_between_messages_drops() {
        let mut dec = decoder();
        assert!(matches!(dec.message_gap(&[], 10, &ctx(false)), GapOutcome::Drop));
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(split_statements("SELECT 1; SELECT 2;").as_slice(), &["SELECT 1", "SELECT 2"]);
        assert_eq!(split_statements("SELECT ';'").as_slice(), &["SELECT ';'"]);
        assert_eq!(split_statements("").as_slice(), &[""]);
        assert_eq!(split_statements("BEGIN;;COMMIT").as_slice(), &["BEGIN", "COMMIT"]);
    }
}
