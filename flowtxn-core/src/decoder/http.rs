//! HTTP/1.x decoder.
//!
//! Headers are parsed with `httparse`; the body is then delimited by
//! `Content-Length`, chunked transfer encoding, or (responses only) the
//! connection closing. Requests without either header have no body.
//! Interim `1xx` responses are consumed without producing a message.

use compact_str::CompactString;
use httparse::{Request, Response, Status, EMPTY_HEADER};
use smallvec::SmallVec;

use super::reader::{find_crlf, ReadError, ReadResult};
use super::{
    loss_note, DecodeContext, Decoder, GapOutcome, Message, MessageBody, ParseOutcome,
    NOTE_CLOSED,
};

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

/// Longest chunk-size line accepted before the stream is declared corrupt.
const MAX_CHUNK_LINE: usize = 1024;

/// Decoded HTTP request or response head.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpMessage {
    pub method: Option<CompactString>,
    pub path: Option<CompactString>,
    /// Minor version (HTTP/1.x).
    pub version: u8,
    pub status_code: Option<u16>,
    pub status_phrase: Option<CompactString>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    /// Body bytes, including any lost to capture gaps.
    pub body_len: usize,
    pub host: Option<CompactString>,
    pub content_type: Option<CompactString>,
    pub user_agent: Option<CompactString>,
    pub connection_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpState {
    Start,
    /// Body ends at `end` (offset from the message start).
    Body { end: usize },
    /// Next chunk-size line starts at `pos`.
    Chunked { pos: usize },
    /// Body runs until the sender closes.
    UntilClose,
}

#[derive(Debug)]
pub struct HttpDecoder {
    state: HttpState,
    message: Option<HttpMessage>,
    is_request: bool,
    header_len: usize,
    /// Body bytes lost to gaps.
    skipped: usize,
    notes: SmallVec<[&'static str; 1]>,
}

impl Default for HttpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDecoder {
    pub fn new() -> Self {
        Self {
            state: HttpState::Start,
            message: None,
            is_request: false,
            header_len: 0,
            skipped: 0,
            notes: SmallVec::new(),
        }
    }

    fn parse_head(&mut self, data: &[u8]) -> ReadResult<Option<HttpState>> {
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];

        if data.starts_with(b"HTTP/") {
            let mut resp = Response::new(&mut headers);
            let header_len = match resp.parse(data) {
                Ok(Status::Complete(len)) => len,
                Ok(Status::Partial) => return Err(ReadError::Incomplete),
                Err(_) => return Err(ReadError::Corrupt("invalid HTTP response head")),
            };
            let code = resp.code.unwrap_or(0);
            let mut msg = HttpMessage {
                version: resp.version.unwrap_or(1),
                status_code: Some(code),
                status_phrase: resp.reason.map(CompactString::new),
                ..Default::default()
            };
            extract_headers(&*resp.headers, &mut msg)?;

            self.is_request = false;
            self.header_len = header_len;
            let state = if (100..200).contains(&code) {
                None
            } else if code == 204 || code == 304 {
                Some(HttpState::Body { end: header_len })
            } else if msg.chunked {
                Some(HttpState::Chunked { pos: header_len })
            } else if let Some(len) = msg.content_length {
                Some(HttpState::Body {
                    end: header_len + len,
                })
            } else {
                Some(HttpState::UntilClose)
            };
            self.message = Some(msg);
            Ok(state)
        } else {
            let mut req = Request::new(&mut headers);
            let header_len = match req.parse(data) {
                Ok(Status::Complete(len)) => len,
                Ok(Status::Partial) => return Err(ReadError::Incomplete),
                Err(_) => return Err(ReadError::Corrupt("invalid HTTP request head")),
            };
            let mut msg = HttpMessage {
                method: req.method.map(CompactString::new),
                path: req.path.map(CompactString::new),
                version: req.version.unwrap_or(1),
                ..Default::default()
            };
            extract_headers(&*req.headers, &mut msg)?;

            self.is_request = true;
            self.header_len = header_len;
            let state = if msg.chunked {
                HttpState::Chunked { pos: header_len }
            } else {
                HttpState::Body {
                    end: header_len + msg.content_length.unwrap_or(0),
                }
            };
            self.message = Some(msg);
            Ok(Some(state))
        }
    }

    /// Walk chunks starting at `pos`; returns the message end.
    fn scan_chunks(&mut self, data: &[u8], mut pos: usize) -> ReadResult<usize> {
        loop {
            self.state = HttpState::Chunked { pos };
            let rest = &data[pos..];
            let Some(line_end) = find_crlf(rest) else {
                if rest.len() > MAX_CHUNK_LINE {
                    return Err(ReadError::Corrupt("chunk size line too long"));
                }
                return Err(ReadError::Incomplete);
            };

            let line = std::str::from_utf8(&rest[..line_end])
                .map_err(|_| ReadError::Corrupt("chunk size not ASCII"))?;
            // Chunk extensions follow a semicolon
            let size_part = line.split(';').next().unwrap_or(line).trim();
            let size = usize::from_str_radix(size_part, 16)
                .map_err(|_| ReadError::Corrupt("invalid chunk size"))?;
            let data_start = pos + line_end + 2;

            if size == 0 {
                let trailer = &data[data_start..];
                if trailer.starts_with(b"\r\n") {
                    return Ok(data_start + 2);
                }
                return match trailer.windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(end) => Ok(data_start + end + 4),
                    None => Err(ReadError::Incomplete),
                };
            }

            let chunk_end = data_start
                .checked_add(size)
                .and_then(|e| e.checked_add(2))
                .ok_or(ReadError::Corrupt("chunk size overflow"))?;
            if data.len() < chunk_end {
                return Err(ReadError::Incomplete);
            }
            if &data[chunk_end - 2..chunk_end] != b"\r\n" {
                return Err(ReadError::Corrupt("chunk not terminated by CRLF"));
            }
            pos = chunk_end;
        }
    }

    fn finish(&mut self, end: usize, ctx: &DecodeContext) -> Message {
        let mut http = self.message.take().unwrap_or_default();
        http.body_len = end.saturating_sub(self.header_len) + self.skipped;
        let mut msg = Message::new(ctx, self.is_request, end, MessageBody::Http(http));
        for note in self.notes.drain(..) {
            msg.add_note(note);
        }
        msg
    }

    fn note_loss(&mut self) {
        let note = loss_note(self.is_request);
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }
}

fn header_str(value: &[u8]) -> CompactString {
    CompactString::from_utf8_lossy(value)
}

fn extract_headers(headers: &[httparse::Header], msg: &mut HttpMessage) -> ReadResult<()> {
    for header in headers.iter().filter(|h| !h.name.is_empty()) {
        let name = header.name;
        if name.eq_ignore_ascii_case("content-length") {
            let len = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or(ReadError::Corrupt("invalid Content-Length"))?;
            msg.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            msg.chunked = header_str(header.value)
                .to_ascii_lowercase()
                .contains("chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            msg.connection_close = header.value.eq_ignore_ascii_case(b"close");
        } else if name.eq_ignore_ascii_case("host") {
            msg.host = Some(header_str(header.value));
        } else if name.eq_ignore_ascii_case("content-type") {
            msg.content_type = Some(header_str(header.value));
        } else if name.eq_ignore_ascii_case("user-agent") {
            msg.user_agent = Some(header_str(header.value));
        }
    }
    // Chunked wins over Content-Length (RFC 7230 3.3.3)
    if msg.chunked {
        msg.content_length = None;
    }
    Ok(())
}

impl Decoder for HttpDecoder {
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome {
        loop {
            match self.state {
                HttpState::Start => match self.parse_head(data) {
                    Ok(Some(state)) => self.state = state,
                    Ok(None) => return ParseOutcome::skip(self.header_len),
                    Err(e) => return e.into(),
                },
                HttpState::Body { end } => {
                    if data.len() < end {
                        return ParseOutcome::Incomplete;
                    }
                    return ParseOutcome::message(self.finish(end, ctx));
                }
                HttpState::Chunked { pos } => match self.scan_chunks(data, pos) {
                    Ok(end) => return ParseOutcome::message(self.finish(end, ctx)),
                    Err(e) => return e.into(),
                },
                HttpState::UntilClose => return ParseOutcome::Incomplete,
            }
        }
    }

    fn message_gap(&mut self, data: &[u8], nbytes: usize, ctx: &DecodeContext) -> GapOutcome {
        match self.state {
            HttpState::Start | HttpState::Chunked { .. } => GapOutcome::Drop,
            HttpState::Body { end } => {
                self.note_loss();
                if data.len() + nbytes >= end {
                    // Done, but the tail of the body is gone
                    GapOutcome::Deliver(self.finish(data.len(), ctx))
                } else {
                    self.state = HttpState::Body { end: end - nbytes };
                    self.skipped += nbytes;
                    GapOutcome::Continue
                }
            }
            HttpState::UntilClose => {
                self.note_loss();
                self.skipped += nbytes;
                GapOutcome::Continue
            }
        }
    }

    fn on_fin(&mut self, data: &[u8], ctx: &DecodeContext) -> Option<Message> {
        match self.state {
            HttpState::UntilClose => Some(self.finish(data.len(), ctx)),
            HttpState::Body { .. } | HttpState::Chunked { .. } => {
                Some(self.finish(data.len(), ctx).with_note(NOTE_CLOSED))
            }
            HttpState::Start => None,
        }
    }

    fn prepare_for_new_message(&mut self) {
        self.state = HttpState::Start;
        self.message = None;
        self.header_len = 0;
        self.skipped = 0;
        self.notes.clear();
    }
}
