//! End-to-end tests: segments in, transactions out.
//!
//! Each test drives a single [`Engine`] with hand-built TCP segments and
//! checks the published transactions and engine counters.

use std::net::SocketAddr;
use std::sync::Arc;

use flowtxn_core::correlate::{NOTE_FLOW_CLOSED, NOTE_TIMEOUT, NOTE_UNKNOWN_STATEMENT};
use flowtxn_core::decoder::NOTE_LOSS_RESPONSE;
use flowtxn_core::prelude::*;
use flowtxn_core::{StaticProcessResolver, DEFAULT_TRANSACTION_TIMEOUT_US};

/// One TCP connection with sequence tracking on both sides.
struct Conn {
    client: SocketAddr,
    server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
}

impl Conn {
    fn new(client: &str, server: &str) -> Self {
        Self {
            client: client.parse().unwrap(),
            server: server.parse().unwrap(),
            client_seq: 1000,
            server_seq: 5000,
        }
    }

    fn request(&mut self, ts: i64, payload: &[u8]) -> Segment<'static> {
        let seg = Segment::data(ts, self.client, self.server, self.client_seq, leak(payload));
        self.client_seq = self.client_seq.wrapping_add(payload.len() as u32);
        seg
    }

    fn response(&mut self, ts: i64, payload: &[u8]) -> Segment<'static> {
        let seg = Segment::data(ts, self.server, self.client, self.server_seq, leak(payload));
        self.server_seq = self.server_seq.wrapping_add(payload.len() as u32);
        seg
    }

    /// `n` request bytes that the capture never saw.
    fn lose_request(&mut self, n: u32) {
        self.client_seq = self.client_seq.wrapping_add(n);
    }

    fn lose_response(&mut self, n: u32) {
        self.server_seq = self.server_seq.wrapping_add(n);
    }
}

fn leak(payload: &[u8]) -> &'static [u8] {
    Box::leak(payload.to_vec().into_boxed_slice())
}

fn engine_with(protocol: Protocol, port: u16) -> Engine {
    Engine::new(EngineConfig::empty().with_protocol(ProtocolConfig::new(protocol, [port]))).unwrap()
}

fn redis_cmd(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
    }
    out
}

fn mysql_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_le_bytes()[..3].to_vec();
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

fn mysql_column(name: &str) -> Vec<u8> {
    let mut p = Vec::new();
    for s in ["def", "", "", "", name, name] {
        p.push(s.len() as u8);
        p.extend_from_slice(s.as_bytes());
    }
    p.extend_from_slice(&[0x0c, 0x21, 0x00, 0x0b, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]);
    p
}

fn pg_msg(typ: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![typ];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn pg_select_one(value: &str) -> Vec<u8> {
    let mut desc = 1i16.to_be_bytes().to_vec();
    desc.extend_from_slice(b"?column?\0");
    desc.extend_from_slice(&[0u8; 18]);

    let mut row = 1i16.to_be_bytes().to_vec();
    row.extend_from_slice(&(value.len() as i32).to_be_bytes());
    row.extend_from_slice(value.as_bytes());

    let mut out = pg_msg(b'T', &desc);
    out.extend(pg_msg(b'D', &row));
    out.extend(pg_msg(b'C', b"SELECT 1\0"));
    out
}

#[test]
fn test_http_request_response_latency() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    let req = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let resp = b"HTTP/1.1 404 Not Found\r\nContent-Length: 5\r\n\r\nnope!";
    engine.process_segment(&conn.request(1_000, req), &mut sink);
    assert!(sink.is_empty());
    assert_eq!(engine.pending_requests(), 1);
    engine.process_segment(&conn.response(3_500, resp), &mut sink);

    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.protocol, Protocol::Http);
    assert_eq!(txn.method, "GET");
    assert_eq!(txn.path, "/index.html");
    assert_eq!(txn.timestamp, 1_000);
    assert_eq!(txn.response_time_us, Some(2_500));
    assert_eq!(txn.bytes_in, req.len() as u64);
    assert_eq!(txn.bytes_out, resp.len() as u64);
    assert!(txn.complete);
    assert_eq!(txn.status, Status::Error);
    assert_eq!(txn.field("status_code").and_then(FieldValue::as_u64), Some(404));
    assert_eq!(txn.client.addr(), conn.client);
    assert_eq!(txn.server.addr(), conn.server);

    let stats = engine.stats();
    assert_eq!(stats.flows_created, 1);
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.transactions, 1);
}

#[test]
fn test_consecutive_transactions_pair_in_order() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    let ok = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    engine.process_segment(&conn.request(100, b"GET /a HTTP/1.1\r\n\r\n"), &mut sink);
    engine.process_segment(&conn.response(150, ok), &mut sink);
    engine.process_segment(&conn.request(200, b"GET /b HTTP/1.1\r\n\r\n"), &mut sink);
    engine.process_segment(&conn.response(400, ok), &mut sink);

    let txns = sink.take();
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[0].path, "/a");
    assert_eq!(txns[0].response_time_us, Some(50));
    assert_eq!(txns[1].path, "/b");
    assert_eq!(txns[1].response_time_us, Some(200));
    assert!(txns.iter().all(|t| t.status == Status::Ok && t.flow_id == txns[0].flow_id));
}

#[test]
fn test_segment_split_across_message() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    let cmd = redis_cmd(&["SET", "key1", "Hello"]);
    let (head, tail) = cmd.split_at(7);
    engine.process_segment(&conn.request(10, head), &mut sink);
    engine.process_segment(&conn.request(20, tail), &mut sink);
    engine.process_segment(&conn.response(30, b"+OK\r\n"), &mut sink);

    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.method, "SET");
    assert_eq!(txn.query, "SET key1 Hello");
    // Request time is when its first byte arrived
    assert_eq!(txn.timestamp, 10);
    assert_eq!(txn.field("return_value").and_then(FieldValue::as_str), Some("OK"));
}

#[test]
fn test_redis_pipelined_requests() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    let mut batch = redis_cmd(&["GET", "a"]);
    batch.extend(redis_cmd(&["INCR", "b"]));
    batch.extend(redis_cmd(&["PING"]));
    engine.process_segment(&conn.request(0, &batch), &mut sink);
    assert_eq!(engine.pending_requests(), 3);

    engine.process_segment(&conn.response(100, b"$1\r\nx\r\n:7\r\n+PONG\r\n"), &mut sink);
    let txns = sink.take();
    let methods: Vec<_> = txns.iter().map(|t| t.method.as_str()).collect();
    assert_eq!(methods, ["GET", "INCR", "PING"]);
    let values: Vec<_> = txns
        .iter()
        .map(|t| t.field("return_value").and_then(FieldValue::as_str).unwrap())
        .collect();
    assert_eq!(values, ["x", "7", "PONG"]);
    assert_eq!(engine.pending_requests(), 0);
}

#[test]
fn test_redis_error_reply() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    engine.process_segment(&conn.request(0, &redis_cmd(&["HGET", "k"])), &mut sink);
    engine.process_segment(&conn.response(5, b"-ERR wrong number of arguments\r\n"), &mut sink);

    let txn = &sink.transactions[0];
    assert!(txn.is_error());
    assert_eq!(
        txn.field("error").and_then(FieldValue::as_str),
        Some("ERR wrong number of arguments")
    );
}

#[test]
fn test_unmatched_response_is_counted() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    engine.process_segment(&conn.response(0, b"+OK\r\n"), &mut sink);
    assert!(sink.is_empty());
    assert_eq!(engine.stats().unmatched_responses, 1);
}

#[test]
fn test_replaced_request_is_unmatched() {
    let mut engine = engine_with(Protocol::Mysql, 3306);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:3306");

    engine.process_segment(&conn.request(0, &mysql_packet(0, b"\x03SELECT 1")), &mut sink);
    engine.process_segment(&conn.request(10, &mysql_packet(0, b"\x03SELECT 2")), &mut sink);
    assert_eq!(engine.stats().unmatched_requests, 1);
    assert_eq!(engine.pending_requests(), 1);

    engine.flush(&mut sink);
    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.query, "SELECT 2");
    assert!(!txn.complete);
    assert_eq!(txn.response_time_us, None);
    assert!(txn.notes.iter().any(|n| n == NOTE_FLOW_CLOSED));
    assert_eq!(engine.stats().unmatched_requests, 2);
    assert_eq!(engine.flow_count(), 0);
}

#[test]
fn test_http_pipelined_requests_pair_fifo() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    let batch = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
    engine.process_segment(&conn.request(100, batch), &mut sink);
    assert_eq!(engine.pending_requests(), 2);

    engine.process_segment(
        &conn.response(150, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
        &mut sink,
    );
    engine.process_segment(
        &conn.response(180, b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"),
        &mut sink,
    );

    let txns = sink.take();
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[0].path, "/a");
    assert_eq!(txns[0].field("status_code").and_then(FieldValue::as_u64), Some(200));
    assert_eq!(txns[0].response_time_us, Some(50));
    assert_eq!(txns[1].path, "/b");
    assert_eq!(txns[1].field("status_code").and_then(FieldValue::as_u64), Some(404));
    assert_eq!(txns[1].status, Status::Error);

    let stats = engine.stats();
    assert_eq!(stats.unmatched_requests, 0);
    assert_eq!(stats.unmatched_responses, 0);
    assert_eq!(engine.pending_requests(), 0);
}

#[test]
fn test_sweep_times_out_request() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    engine.process_segment(&conn.request(1_000, &redis_cmd(&["BLPOP", "q", "0"])), &mut sink);
    engine.sweep(1_000 + DEFAULT_TRANSACTION_TIMEOUT_US - 1, &mut sink);
    assert!(sink.is_empty());

    engine.sweep(1_000 + DEFAULT_TRANSACTION_TIMEOUT_US, &mut sink);
    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.method, "BLPOP");
    assert!(!txn.complete);
    assert!(txn.notes.iter().any(|n| n == NOTE_TIMEOUT));
    assert_eq!(engine.stats().timed_out_requests, 1);

    // The late reply has nothing left to pair with
    engine.process_segment(&conn.response(20_000_000, b"*-1\r\n"), &mut sink);
    assert_eq!(sink.len(), 1);
    assert_eq!(engine.stats().unmatched_responses, 1);
}

#[test]
fn test_idle_flow_expires() {
    let mut config = EngineConfig::empty().with_protocol(ProtocolConfig::new(Protocol::Redis, [6379]));
    config.flow_timeout_us = 1_000;
    let mut engine = Engine::new(config).unwrap();
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    engine.process_segment(&conn.request(0, &redis_cmd(&["PING"])), &mut sink);
    engine.sweep(500, &mut sink);
    assert_eq!(engine.flow_count(), 1);

    engine.sweep(2_000, &mut sink);
    assert_eq!(engine.flow_count(), 0);
    assert_eq!(engine.stats().flows_expired, 1);
    assert_eq!(sink.len(), 1);
    assert!(sink.transactions[0].notes.iter().any(|n| n == NOTE_FLOW_CLOSED));
}

#[test]
fn test_retransmission_is_ignored() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    let cmd = redis_cmd(&["GET", "k"]);
    let seg = conn.request(0, &cmd);
    engine.process_segment(&seg, &mut sink);
    engine.process_segment(&seg, &mut sink);
    assert_eq!(engine.pending_requests(), 1);
    assert_eq!(engine.stats().duplicate_segments, 1);

    let resp = conn.response(10, b"$-1\r\n");
    engine.process_segment(&resp, &mut sink);
    engine.process_segment(&resp, &mut sink);
    assert_eq!(sink.len(), 1);
    assert_eq!(engine.stats().unmatched_responses, 0);
}

#[test]
fn test_buffer_overflow_tears_down_flow() {
    let mut config = EngineConfig::empty().with_protocol(ProtocolConfig::new(Protocol::Http, [80]));
    config.max_buffer_bytes = 64;
    let mut engine = Engine::new(config).unwrap();
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    // Headers that never end
    engine.process_segment(&conn.request(0, &[b'a'; 40]), &mut sink);
    assert_eq!(engine.flow_count(), 1);
    engine.process_segment(&conn.request(1, &[b'a'; 40]), &mut sink);

    assert_eq!(engine.flow_count(), 0);
    let stats = engine.stats();
    assert_eq!(stats.buffer_overflows, 1);
    assert_eq!(stats.flows_torn_down, 1);
    assert!(sink.is_empty());
}

#[test]
fn test_corrupt_stream_resets_direction() {
    let mut engine = engine_with(Protocol::Redis, 6379);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    engine.process_segment(&conn.request(0, b"*-5\r\n"), &mut sink);
    assert_eq!(engine.stats().decoder_errors, 1);
    assert_eq!(engine.pending_requests(), 0);

    // The next message on the same direction decodes again
    engine.process_segment(&conn.request(10, &redis_cmd(&["PING"])), &mut sink);
    engine.process_segment(&conn.response(20, b"+PONG\r\n"), &mut sink);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.transactions[0].method, "PING");
}

#[test]
fn test_gap_in_mysql_rows_delivers_partial_result() {
    let mut engine = engine_with(Protocol::Mysql, 3306);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:3306");

    engine.process_segment(&conn.request(0, &mysql_packet(0, b"\x03SELECT v FROM t")), &mut sink);

    let mut head = mysql_packet(1, &[0x01]);
    head.extend(mysql_packet(2, &mysql_column("v")));
    head.extend(mysql_packet(3, &[0xfe, 0x00, 0x00, 0x02, 0x00]));
    head.extend(mysql_packet(4, b"\x01a"));
    engine.process_segment(&conn.response(10, &head), &mut sink);
    assert!(sink.is_empty());

    // The second row is lost; the final EOF arrives
    conn.lose_response(mysql_packet(5, b"\x01b").len() as u32);
    engine.process_segment(&conn.response(20, &mysql_packet(6, &[0xfe, 0x00, 0x00, 0x02, 0x00])), &mut sink);

    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.query, "SELECT v FROM t");
    assert!(txn.complete);
    assert_eq!(txn.response_time_us, Some(10));
    assert_eq!(txn.field("num_rows").and_then(FieldValue::as_u64), Some(1));
    assert!(txn.notes.iter().any(|n| n == NOTE_LOSS_RESPONSE));

    let stats = engine.stats();
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.decoder_errors, 0);
    // The trailing EOF decodes on its own and has no request left
    assert_eq!(stats.unmatched_responses, 1);
}

#[test]
fn test_gap_in_http_body_is_stepped_over() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    engine.process_segment(&conn.request(0, b"GET /file HTTP/1.1\r\n\r\n"), &mut sink);
    engine.process_segment(
        &conn.response(10, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n01234"),
        &mut sink,
    );
    conn.lose_response(3);
    engine.process_segment(&conn.response(20, b"89"), &mut sink);

    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.path, "/file");
    assert_eq!(txn.status, Status::Ok);
    assert_eq!(txn.field("response_body_len").and_then(FieldValue::as_u64), Some(10));
    assert!(txn.notes.iter().any(|n| n == NOTE_LOSS_RESPONSE));
    assert_eq!(engine.stats().gaps, 1);
    assert_eq!(engine.pending_requests(), 0);
}

#[test]
fn test_gap_in_headers_drops_message() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    engine.process_segment(&conn.request(0, b"GET /lost HTTP/1.1\r\nHo"), &mut sink);
    conn.lose_request(12);
    // The direction restarts cleanly at the next request
    engine.process_segment(&conn.request(10, b"GET /next HTTP/1.1\r\n\r\n"), &mut sink);
    engine.process_segment(
        &conn.response(20, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
        &mut sink,
    );

    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.path, "/next");
    assert!(txn.notes.is_empty());

    let stats = engine.stats();
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.decoder_errors, 0);
    assert_eq!(stats.unmatched_requests, 0);
    assert_eq!(stats.unmatched_responses, 0);
}

#[test]
fn test_http_response_delimited_by_close() {
    let mut engine = engine_with(Protocol::Http, 8080);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:8080");

    engine.process_segment(&conn.request(0, b"GET /stream HTTP/1.0\r\n\r\n"), &mut sink);
    engine.process_segment(&conn.response(10, b"HTTP/1.0 200 OK\r\n\r\nhello"), &mut sink);
    assert!(sink.is_empty());

    let fin = conn.response(20, b"").with_flags(TcpFlags::FIN);
    engine.process_segment(&fin, &mut sink);
    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert!(txn.complete);
    assert_eq!(txn.field("response_body_len").and_then(FieldValue::as_u64), Some(5));
    assert_eq!(engine.flow_count(), 1);

    let fin = conn.request(30, b"").with_flags(TcpFlags::FIN);
    engine.process_segment(&fin, &mut sink);
    assert_eq!(engine.flow_count(), 0);
    assert_eq!(engine.stats().flows_torn_down, 1);
    assert_eq!(sink.len(), 1);
}

#[test]
fn test_both_fins_close_flow_with_request_pending() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    engine.process_segment(&conn.request(0, b"GET /slow HTTP/1.1\r\nHost: a\r\n\r\n"), &mut sink);
    engine.process_segment(&conn.request(5, b"").with_flags(TcpFlags::FIN), &mut sink);
    assert_eq!(engine.flow_count(), 1);
    assert!(sink.is_empty());

    engine.process_segment(&conn.response(8, b"").with_flags(TcpFlags::FIN), &mut sink);
    assert_eq!(engine.flow_count(), 0);
    assert_eq!(engine.pending_requests(), 0);
    assert_eq!(sink.len(), 1);
    let txn = &sink.transactions[0];
    assert_eq!(txn.path, "/slow");
    assert!(!txn.complete);
    assert!(txn.notes.iter().any(|n| n == NOTE_FLOW_CLOSED));
    let stats = engine.stats();
    assert_eq!(stats.flows_torn_down, 1);
    assert_eq!(stats.unmatched_requests, 1);
}

#[test]
fn test_reset_emits_pending_request() {
    let mut engine = engine_with(Protocol::Http, 80);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:80");

    engine.process_segment(&conn.request(0, b"POST /upload HTTP/1.1\r\nContent-Length: 0\r\n\r\n"), &mut sink);
    let rst = conn.response(5, b"").with_flags(TcpFlags {
        rst: true,
        ..TcpFlags::NONE
    });
    engine.process_segment(&rst, &mut sink);

    assert_eq!(engine.flow_count(), 0);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.transactions[0].method, "POST");
    assert!(!sink.transactions[0].complete);
    assert!(sink.transactions[0].notes.iter().any(|n| n == NOTE_FLOW_CLOSED));
}

#[test]
fn test_mysql_prepared_statement_lifecycle() {
    let mut engine = engine_with(Protocol::Mysql, 3306);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:3306");

    let sql = "SELECT * FROM orders WHERE id = ?";
    let mut prepare = vec![0x16];
    prepare.extend_from_slice(sql.as_bytes());
    engine.process_segment(&conn.request(0, &mysql_packet(0, &prepare)), &mut sink);

    // stmt id 9, no columns, one parameter
    let ok = [0x00, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
    let mut resp = mysql_packet(1, &ok);
    resp.extend(mysql_packet(2, &mysql_column("?")));
    resp.extend(mysql_packet(3, &[0xfe, 0x00, 0x00, 0x02, 0x00]));
    engine.process_segment(&conn.response(10, &resp), &mut sink);

    // Flags, one iteration, NULL bitmap, types bound: LONG 42
    let execute = [
        0x17, 0x09, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x00, 0x2a,
        0x00, 0x00, 0x00,
    ];
    engine.process_segment(&conn.request(20, &mysql_packet(0, &execute)), &mut sink);
    let affected = [0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
    engine.process_segment(&conn.response(35, &mysql_packet(1, &affected)), &mut sink);

    let close = [0x19, 0x09, 0x00, 0x00, 0x00];
    engine.process_segment(&conn.request(40, &mysql_packet(0, &close)), &mut sink);

    // Executing a closed statement leaves the query unknown
    engine.process_segment(&conn.request(50, &mysql_packet(0, &execute)), &mut sink);
    engine.process_segment(&conn.response(60, &mysql_packet(1, &affected)), &mut sink);

    let txns = sink.take();
    assert_eq!(txns.len(), 3);

    assert_eq!(txns[0].method, "PREPARE");
    assert_eq!(txns[0].query, sql);
    assert_eq!(txns[0].field("statement_id").and_then(FieldValue::as_u64), Some(9));

    assert_eq!(txns[1].method, "SELECT");
    assert_eq!(txns[1].query, sql);
    assert_eq!(txns[1].response_time_us, Some(15));
    assert_eq!(txns[1].field("affected_rows").and_then(FieldValue::as_u64), Some(1));
    assert_eq!(
        txns[1].field("params"),
        Some(&FieldValue::List(vec![FieldValue::str("42")]))
    );

    assert_eq!(txns[2].method, "EXECUTE");
    assert!(txns[2].notes.iter().any(|n| n == NOTE_UNKNOWN_STATEMENT));
    assert!(txns[2].field("params").is_none());
}

#[test]
fn test_pgsql_multi_statement_query() {
    let mut engine = engine_with(Protocol::Pgsql, 5432);
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:5432");

    let query = pg_msg(b'Q', b"SELECT 1; SELECT 2\0");
    engine.process_segment(&conn.request(0, &query), &mut sink);
    assert_eq!(engine.pending_requests(), 2);

    let mut resp = pg_select_one("1");
    resp.extend(pg_select_one("2"));
    resp.extend(pg_msg(b'Z', b"I"));
    engine.process_segment(&conn.response(50, &resp), &mut sink);

    let txns = sink.take();
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[0].query, "SELECT 1");
    assert_eq!(txns[1].query, "SELECT 2");
    assert_eq!(txns[0].bytes_in, query.len() as u64);
    assert_eq!(txns[1].bytes_in, 0);
    for txn in &txns {
        assert_eq!(txn.method, "SELECT");
        assert_eq!(txn.field("num_rows").and_then(FieldValue::as_u64), Some(1));
    }
}

#[test]
fn test_process_attribution() {
    let resolver = StaticProcessResolver::new()
        .with("0.0.0.0".parse().unwrap(), 6379, "redis-server")
        .with("10.0.0.1".parse().unwrap(), 40000, "worker");
    let mut engine = engine_with(Protocol::Redis, 6379).with_resolver(Arc::new(resolver));
    let mut sink = VecSink::new();
    let mut conn = Conn::new("10.0.0.1:40000", "10.0.0.2:6379");

    engine.process_segment(&conn.request(0, &redis_cmd(&["PING"])), &mut sink);
    engine.process_segment(&conn.response(1, b"+PONG\r\n"), &mut sink);

    let txn = &sink.transactions[0];
    assert_eq!(txn.client.process.as_deref(), Some("worker"));
    assert_eq!(txn.server.process.as_deref(), Some("redis-server"));
}

#[test]
fn test_shared_engine_across_threads() {
    let shared = SharedEngine::new(engine_with(Protocol::Redis, 6379));
    let handles: Vec<_> = (0..4u16)
        .map(|i| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let mut sink = VecSink::new();
                let mut conn = Conn::new(&format!("10.0.0.1:{}", 40000 + i), "10.0.0.2:6379");
                shared.process_segment(&conn.request(0, &redis_cmd(&["PING"])), &mut sink);
                shared.process_segment(&conn.response(1, b"+PONG\r\n"), &mut sink);
                sink.len()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 4);
    assert_eq!(shared.stats().transactions, 4);
    assert_eq!(shared.flow_count(), 4);
}
