//! Correlated request/response records handed to the publisher.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use compact_str::CompactString;
use serde::Serialize;

use crate::decoder::Protocol;
use crate::field::FieldValue;

/// One side of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    /// Local process name, when attribution is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<CompactString>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            process: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// A request paired with its response, or a request that never got one.
///
/// The envelope (protocol, endpoints, status, latency, byte counts) is the
/// same for every protocol; protocol detail lives in `fields`.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub protocol: Protocol,
    pub flow_id: u64,
    /// Request timestamp (microseconds since the epoch).
    pub timestamp: i64,
    pub client: Endpoint,
    pub server: Endpoint,
    pub status: Status,
    /// The exchange finished: a response was matched, or none was expected.
    pub complete: bool,
    /// Response timestamp minus request timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_us: Option<i64>,
    /// Request size on the wire.
    pub bytes_in: u64,
    /// Response size on the wire.
    pub bytes_out: u64,
    #[serde(skip_serializing_if = "CompactString::is_empty")]
    pub method: CompactString,
    #[serde(skip_serializing_if = "CompactString::is_empty")]
    pub path: CompactString,
    #[serde(skip_serializing_if = "CompactString::is_empty")]
    pub query: CompactString,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<CompactString>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<&'static str, FieldValue>,
}

impl Transaction {
    pub fn new(
        protocol: Protocol,
        flow_id: u64,
        timestamp: i64,
        client: SocketAddr,
        server: SocketAddr,
    ) -> Self {
        Self {
            protocol,
            flow_id,
            timestamp,
            client: Endpoint::new(client),
            server: Endpoint::new(server),
            status: Status::Ok,
            complete: false,
            response_time_us: None,
            bytes_in: 0,
            bytes_out: 0,
            method: CompactString::default(),
            path: CompactString::default(),
            query: CompactString::default(),
            notes: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<FieldValue>) {
        self.fields.insert(key, value.into());
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Append a note unless it is already present.
    pub fn add_note(&mut self, note: &str) {
        if !self.notes.iter().any(|n| n == note) {
            self.notes.push(CompactString::new(note));
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }
}
