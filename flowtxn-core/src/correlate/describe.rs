//! Protocol-specific transaction content.
//!
//! A transaction is started from its request message and finished from
//! its response; both steps only copy decoded fields into the envelope.

use compact_str::CompactString;

use crate::decoder::{
    HttpMessage, Message, MessageBody, MysqlCommand, MysqlMessage, PgsqlMessage, PgsqlStatus,
    RedisMessage, ThriftMessage,
};
use crate::field::FieldValue;
use crate::transaction::{Status, Transaction};

/// First word of a SQL statement, upper-cased.
pub fn sql_method(query: &str) -> CompactString {
    let word = query.split_whitespace().next().unwrap_or("");
    CompactString::from(word.to_ascii_uppercase())
}

fn rows(rows: &[CompactString]) -> FieldValue {
    FieldValue::List(rows.iter().cloned().map(FieldValue::Str).collect())
}

/// Fill method, path, query and request fields from a request message.
pub fn request(txn: &mut Transaction, msg: &Message) {
    txn.timestamp = msg.timestamp;
    txn.bytes_in = msg.size as u64;
    for note in &msg.notes {
        txn.add_note(note);
    }
    match &msg.body {
        MessageBody::Http(http) => http_request(txn, http),
        MessageBody::Mysql(MysqlMessage::Request {
            command,
            query,
            statement_id,
            ..
        }) => {
            txn.query = query.clone();
            txn.method = match command {
                MysqlCommand::Query => sql_method(query),
                other => CompactString::new(other.as_str()),
            };
            if let Some(id) = statement_id {
                txn.set("statement_id", *id as u64);
            }
        }
        MessageBody::Pgsql(PgsqlMessage::Query { query }) => {
            txn.method = sql_method(query);
            txn.query = query.clone();
        }
        MessageBody::Redis(redis) => redis_request(txn, redis),
        MessageBody::Thrift(thrift) => thrift_request(txn, thrift),
        other => tracing::debug!(body = ?other, "response body used as a request"),
    }
}

/// Fill status and response fields; marks the transaction complete.
pub fn response(txn: &mut Transaction, msg: &Message) {
    txn.complete = true;
    txn.bytes_out = msg.size as u64;
    txn.response_time_us = Some((msg.timestamp - txn.timestamp).max(0));
    for note in &msg.notes {
        txn.add_note(note);
    }
    match &msg.body {
        MessageBody::Http(http) => http_response(txn, http),
        MessageBody::Mysql(mysql) => mysql_response(txn, mysql),
        MessageBody::Pgsql(PgsqlMessage::Response(resp)) => {
            if resp.status == PgsqlStatus::Error {
                txn.status = Status::Error;
                txn.set("error_code", resp.error_code.clone());
                txn.set("error_message", resp.error_message.clone());
                txn.set("error_severity", resp.error_severity.clone());
            } else {
                txn.set("num_rows", resp.num_rows);
                txn.set("num_fields", resp.fields.len() as u64);
                if !resp.command_tag.is_empty() {
                    txn.set("command_tag", resp.command_tag.clone());
                }
                if !resp.fields.is_empty() {
                    txn.set("columns", resp.fields.clone());
                }
                if !resp.rows.is_empty() {
                    txn.set("rows", rows(&resp.rows));
                }
                if resp.truncated {
                    txn.set("rows_truncated", true);
                }
            }
        }
        MessageBody::Redis(redis) => {
            if redis.is_error {
                txn.status = Status::Error;
                txn.set("error", redis.text.clone());
            } else {
                txn.set("return_value", redis.text.clone());
            }
        }
        MessageBody::Thrift(thrift) => {
            if thrift.is_error {
                txn.status = Status::Error;
                txn.set("exceptions", thrift.fields.clone());
            } else {
                txn.set("return_value", thrift.fields.clone());
            }
        }
        other => tracing::debug!(body = ?other, "request body used as a response"),
    }
}

fn http_request(txn: &mut Transaction, http: &HttpMessage) {
    txn.method = http.method.clone().unwrap_or_default();
    txn.path = http.path.clone().unwrap_or_default();
    txn.query = compact_str::format_compact!("{} {}", txn.method, txn.path);
    txn.set(
        "version",
        compact_str::format_compact!("1.{}", http.version),
    );
    if let Some(host) = &http.host {
        txn.set("host", host.clone());
    }
    if let Some(ua) = &http.user_agent {
        txn.set("user_agent", ua.clone());
    }
    if let Some(ct) = &http.content_type {
        txn.set("request_content_type", ct.clone());
    }
    txn.set("request_body_len", http.body_len as u64);
}

fn http_response(txn: &mut Transaction, http: &HttpMessage) {
    if let Some(code) = http.status_code {
        txn.set("status_code", code as u64);
        if code >= 400 {
            txn.status = Status::Error;
        }
    }
    if let Some(phrase) = &http.status_phrase {
        txn.set("status_phrase", phrase.clone());
    }
    if let Some(ct) = &http.content_type {
        txn.set("response_content_type", ct.clone());
    }
    txn.set("response_body_len", http.body_len as u64);
}

fn mysql_response(txn: &mut Transaction, msg: &MysqlMessage) {
    match msg {
        MysqlMessage::Ok {
            affected_rows,
            insert_id,
        } => {
            txn.set("affected_rows", *affected_rows);
            txn.set("insert_id", *insert_id);
        }
        MysqlMessage::Error {
            code,
            state,
            message,
        } => {
            txn.status = Status::Error;
            txn.set("error_code", *code as u64);
            txn.set("error_message", message.clone());
            if !state.is_empty() {
                txn.set("sql_state", state.clone());
            }
        }
        MysqlMessage::ResultSet {
            num_fields,
            num_rows,
            tables,
            rows: preview,
            truncated,
        } => {
            txn.set("num_fields", *num_fields);
            txn.set("num_rows", *num_rows);
            if !tables.is_empty() {
                txn.path = CompactString::from(tables.join(", "));
                txn.set("tables", tables.clone());
            }
            if !preview.is_empty() {
                txn.set("rows", rows(preview));
            }
            if *truncated {
                txn.set("rows_truncated", true);
            }
        }
        MysqlMessage::PrepareOk {
            statement_id,
            num_columns,
            num_params,
        } => {
            txn.set("statement_id", *statement_id as u64);
            txn.set("num_params", *num_params as u64);
            txn.set("num_fields", *num_columns as u64);
        }
        MysqlMessage::Request { .. } => {
            tracing::debug!("mysql request used as a response")
        }
    }
}

fn redis_request(txn: &mut Transaction, redis: &RedisMessage) {
    txn.method = redis.method.clone();
    txn.path = redis.path.clone();
    txn.query = redis.text.clone();
    if redis.truncated {
        txn.set("query_truncated", true);
    }
}

fn thrift_request(txn: &mut Transaction, thrift: &ThriftMessage) {
    txn.method = thrift.method.clone();
    txn.query = compact_str::format_compact!("{}{}", thrift.method, thrift.fields);
    txn.set("params", thrift.fields.clone());
    txn.set("seq_id", thrift.seq_id as i64);
    txn.set("message_type", thrift.message_type.as_str());
}
