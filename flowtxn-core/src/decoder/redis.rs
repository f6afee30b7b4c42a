//! Redis serialization protocol (RESP2) decoder.
//!
//! RESP values are small and self-delimiting, so the decoder keeps no
//! partial state: every call re-reads the value from the start of the
//! buffer and reports `Incomplete` until the last CRLF has arrived.

use compact_str::CompactString;

use super::reader::{ByteReader, ReadError, ReadResult};
use super::{DecodeContext, Decoder, GapOutcome, Message, MessageBody, ParseOutcome};
use crate::config::FieldLimits;
use crate::field::truncated_string;

/// Nested arrays deeper than this are treated as corrupt.
const MAX_DEPTH: usize = 16;

/// Bulk strings are capped at 512 MB by the server.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Command names, sorted for binary search.
static COMMANDS: &[&str] = &[
    "APPEND", "AUTH", "BGREWRITEAOF", "BGSAVE", "BITCOUNT", "BITOP", "BITPOS", "BLPOP",
    "BRPOP", "BRPOPLPUSH", "BZPOPMAX", "BZPOPMIN", "CLIENT", "CLUSTER", "COMMAND", "CONFIG",
    "DBSIZE", "DEBUG", "DECR", "DECRBY", "DEL", "DISCARD", "DUMP", "ECHO", "EVAL", "EVALSHA",
    "EXEC", "EXISTS", "EXPIRE", "EXPIREAT", "FLUSHALL", "FLUSHDB", "GEOADD", "GEODIST",
    "GEOHASH", "GEOPOS", "GEORADIUS", "GET", "GETBIT", "GETDEL", "GETEX", "GETRANGE", "GETSET",
    "HDEL", "HELLO", "HEXISTS", "HGET", "HGETALL", "HINCRBY", "HINCRBYFLOAT", "HKEYS", "HLEN",
    "HMGET", "HMSET", "HSCAN", "HSET", "HSETNX", "HSTRLEN", "HVALS", "INCR", "INCRBY",
    "INCRBYFLOAT", "INFO", "KEYS", "LASTSAVE", "LINDEX", "LINSERT", "LLEN", "LMOVE", "LPOP",
    "LPOS", "LPUSH", "LPUSHX", "LRANGE", "LREM", "LSET", "LTRIM", "MEMORY", "MGET", "MIGRATE",
    "MONITOR", "MOVE", "MSET", "MSETNX", "MULTI", "OBJECT", "PERSIST", "PEXPIRE", "PEXPIREAT",
    "PFADD", "PFCOUNT", "PFMERGE", "PING", "PSETEX", "PSUBSCRIBE", "PTTL", "PUBLISH", "PUBSUB",
    "PUNSUBSCRIBE", "QUIT", "RANDOMKEY", "RENAME", "RENAMENX", "RESTORE", "RPOP", "RPOPLPUSH",
    "RPUSH", "RPUSHX", "SADD", "SAVE", "SCAN", "SCARD", "SCRIPT", "SDIFF", "SDIFFSTORE",
    "SELECT", "SET", "SETBIT", "SETEX", "SETNX", "SETRANGE", "SHUTDOWN", "SINTER",
    "SINTERSTORE", "SISMEMBER", "SLAVEOF", "SLOWLOG", "SMEMBERS", "SMOVE", "SORT", "SPOP",
    "SRANDMEMBER", "SREM", "SSCAN", "STRLEN", "SUBSCRIBE", "SUNION", "SUNIONSTORE", "SWAPDB",
    "SYNC", "TIME", "TOUCH", "TTL", "TYPE", "UNLINK", "UNSUBSCRIBE", "UNWATCH", "WAIT",
    "WATCH", "XACK", "XADD", "XDEL", "XLEN", "XRANGE", "XREAD", "XREADGROUP", "XREVRANGE",
    "XTRIM", "ZADD", "ZCARD", "ZCOUNT", "ZINCRBY", "ZINTERSTORE", "ZPOPMAX", "ZPOPMIN",
    "ZRANGE", "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREM", "ZREMRANGEBYLEX",
    "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE", "ZREVRANGE", "ZREVRANGEBYSCORE", "ZREVRANK",
    "ZSCAN", "ZSCORE", "ZUNIONSTORE",
];

/// Upper-cased command name if `word` is a known Redis command.
pub fn command_name(word: &[u8]) -> Option<CompactString> {
    if word.is_empty() || word.len() > 16 {
        return None;
    }
    let upper = CompactString::from_utf8_lossy(word).to_ascii_uppercase();
    COMMANDS
        .binary_search(&upper.as_str())
        .ok()
        .map(|_| CompactString::new(upper))
}

/// Decoded Redis message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedisMessage {
    /// Command name for requests.
    pub method: CompactString,
    /// First command argument, usually the key.
    pub path: CompactString,
    /// Requests: arguments joined by spaces. Responses: rendered reply.
    pub text: CompactString,
    /// The reply is a RESP error.
    pub is_error: bool,
    pub truncated: bool,
}

#[derive(Debug)]
enum Value<'a> {
    Simple(&'a [u8]),
    Error(&'a [u8]),
    Integer(i64),
    Bulk(Option<&'a [u8]>),
    Array(Option<Vec<Value<'a>>>),
}

impl Value<'_> {
    fn render(&self, out: &mut Vec<u8>) {
        match self {
            Value::Simple(s) | Value::Error(s) | Value::Bulk(Some(s)) => out.extend_from_slice(s),
            Value::Integer(n) => out.extend_from_slice(n.to_string().as_bytes()),
            Value::Bulk(None) | Value::Array(None) => out.extend_from_slice(b"nil"),
            Value::Array(Some(items)) => {
                out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.extend_from_slice(b", ");
                    }
                    item.render(out);
                }
                out.push(b']');
            }
        }
    }

    /// Raw bytes of a scalar, for command-name matching.
    fn word(&self) -> Option<&[u8]> {
        match self {
            Value::Simple(s) | Value::Bulk(Some(s)) => Some(s),
            _ => None,
        }
    }
}

fn parse_int(line: &[u8]) -> ReadResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ReadError::Corrupt("invalid RESP integer"))
}

fn read_value<'a>(r: &mut ByteReader<'a>, depth: usize) -> ReadResult<Value<'a>> {
    if depth > MAX_DEPTH {
        return Err(ReadError::Corrupt("RESP nesting too deep"));
    }
    let marker = r.peek_u8()?;
    if !matches!(marker, b'*' | b'$' | b':' | b'+' | b'-') {
        return Err(ReadError::Corrupt("unexpected RESP type marker"));
    }
    let line = &r.line()?[1..];
    match marker {
        b'+' => Ok(Value::Simple(line)),
        b'-' => Ok(Value::Error(line)),
        b':' => parse_int(line).map(Value::Integer),
        b'$' => match parse_int(line)? {
            -1 => Ok(Value::Bulk(None)),
            len if !(0..=MAX_BULK_LEN).contains(&len) => {
                Err(ReadError::Corrupt("invalid bulk string length"))
            }
            len => {
                let value = r.bytes(len as usize)?;
                if r.bytes(2)? != b"\r\n" {
                    return Err(ReadError::Corrupt("bulk string not terminated by CRLF"));
                }
                Ok(Value::Bulk(Some(value)))
            }
        },
        _ => match parse_int(line)? {
            -1 => Ok(Value::Array(None)),
            count if count < -1 => Err(ReadError::Corrupt("negative array length")),
            count => {
                // Every element takes at least 3 bytes
                if count as u64 > r.remaining() as u64 {
                    return Err(ReadError::Incomplete);
                }
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(read_value(r, depth + 1)?);
                }
                Ok(Value::Array(Some(items)))
            }
        },
    }
}

#[derive(Debug)]
pub struct RedisDecoder {
    limits: FieldLimits,
}

impl RedisDecoder {
    pub fn new(limits: FieldLimits) -> Self {
        Self { limits }
    }

    fn decode(&self, data: &[u8], ctx: &DecodeContext) -> ReadResult<Message> {
        let mut r = ByteReader::new(data);
        let value = read_value(&mut r, 0)?;
        let size = r.position();

        let mut msg = RedisMessage::default();
        let mut text = Vec::new();
        let args: &[Value<'_>] = match &value {
            Value::Array(Some(items)) => items,
            _ => &[],
        };
        // A known command in first position makes a request, whichever
        // side sent it
        let command = args.first().and_then(Value::word).and_then(command_name);
        let is_request = command.is_some();

        if let Some(name) = command {
            msg.method = name;
            if let Some(key) = args.get(1).and_then(Value::word) {
                msg.path = truncated_string(key, self.limits.max_string_len).0;
            }
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    text.push(b' ');
                }
                arg.render(&mut text);
            }
        } else {
            msg.is_error = matches!(value, Value::Error(_));
            value.render(&mut text);
        }

        let (text, truncated) = truncated_string(&text, self.limits.max_string_len);
        msg.text = text;
        msg.truncated = truncated;
        Ok(Message::new(ctx, is_request, size, MessageBody::Redis(msg)))
    }
}

impl Decoder for RedisDecoder {
    fn parse(&mut self, data: &[u8], ctx: &DecodeContext) -> ParseOutcome {
        match self.decode(data, ctx) {
            Ok(msg) => ParseOutcome::message(msg),
            Err(e) => e.into(),
        }
    }

    fn message_gap(&mut self, _data: &[u8], _nbytes: usize, _ctx: &DecodeContext) -> GapOutcome {
        GapOutcome::Drop
    }

    fn prepare_for_new_message(&mut self) {}
}
