//! Request/response correlation.
//!
//! Each flow has at most one pending request for protocols that answer in
//! lockstep (MySQL, Thrift) and a bounded FIFO of pending requests for
//! pipelined ones (HTTP/1.1, Redis, PostgreSQL). Responses are matched in arrival
//! order. Expiry is driven from outside by [`Correlator::expire`]; there are
//! no per-request timers.
//!
//! ```text
//!   request ──► pending ──response──► Transaction (complete)
//!                  │
//!                  ├──timeout────────► Transaction (incomplete)
//!                  └──replaced───────► dropped, unmatched_requests += 1
//! ```

mod describe;
mod statements;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use compact_str::CompactString;

use crate::config::{EngineConfig, FieldLimits};
use crate::decoder::{
    decode_execute_params, split_statements, Message, MessageBody, MysqlCommand, MysqlMessage,
    PgsqlMessage, Protocol, ThriftMessageType,
};
use crate::field::FieldValue;
use crate::queue::{BoundedMessageQueue, QueueLimits};
use crate::stats::EngineStats;
use crate::transaction::Transaction;

pub use describe::sql_method;
pub use statements::{PreparedStatement, StatementCache};

pub const NOTE_TIMEOUT: &str = "No response before the transaction timeout";
pub const NOTE_FLOW_CLOSED: &str = "Connection closed before the response";
pub const NOTE_UNKNOWN_STATEMENT: &str = "The actual query being used is unknown";

/// Identity of the flow a message came from.
#[derive(Debug, Clone, Copy)]
pub struct FlowMeta {
    pub flow_id: u64,
    pub protocol: Protocol,
    pub client: SocketAddr,
    pub server: SocketAddr,
}

/// A request waiting for its response.
#[derive(Debug)]
struct PendingRequest {
    txn: Transaction,
    deadline: i64,
}

#[derive(Debug)]
enum Pending {
    Single(Option<PendingRequest>),
    Pipelined(BoundedMessageQueue<PendingRequest>),
}

impl Pending {
    fn len(&self) -> usize {
        match self {
            Pending::Single(slot) => slot.is_some() as usize,
            Pending::Pipelined(queue) => queue.len(),
        }
    }
}

#[derive(Debug)]
struct FlowPending {
    meta: FlowMeta,
    pending: Pending,
    statements: StatementCache,
}

/// Pairs decoded requests with responses, per flow.
#[derive(Debug)]
pub struct Correlator {
    flows: HashMap<u64, FlowPending>,
    timeouts: HashMap<Protocol, i64>,
    queue_limits: QueueLimits,
    field_limits: FieldLimits,
    stats: Arc<EngineStats>,
}

impl Correlator {
    pub fn new(config: &EngineConfig, stats: Arc<EngineStats>) -> Self {
        let timeouts = Protocol::ALL
            .iter()
            .map(|&p| (p, config.transaction_timeout(p)))
            .collect();
        Self {
            flows: HashMap::new(),
            timeouts,
            queue_limits: config.queue,
            field_limits: config.decoder.limits,
            stats,
        }
    }

    fn timeout(&self, protocol: Protocol) -> i64 {
        self.timeouts
            .get(&protocol)
            .copied()
            .unwrap_or(crate::config::DEFAULT_TRANSACTION_TIMEOUT_US)
    }

    fn flow_entry(&mut self, meta: &FlowMeta) -> &mut FlowPending {
        let limits = self.queue_limits;
        self.flows.entry(meta.flow_id).or_insert_with(|| FlowPending {
            meta: *meta,
            pending: if meta.protocol.is_pipelined() {
                Pending::Pipelined(BoundedMessageQueue::new(limits))
            } else {
                Pending::Single(None)
            },
            statements: StatementCache::default(),
        })
    }

    /// Feed one decoded message; finished transactions are pushed to `out`.
    pub fn on_message(&mut self, meta: &FlowMeta, msg: Message, out: &mut Vec<Transaction>) {
        if msg.is_request {
            self.on_request(meta, msg, out);
        } else {
            self.on_response(meta, msg, out);
        }
    }

    fn on_request(&mut self, meta: &FlowMeta, msg: Message, out: &mut Vec<Transaction>) {
        let deadline = msg.timestamp + self.timeout(meta.protocol);
        let mut txn = Transaction::new(
            meta.protocol,
            meta.flow_id,
            msg.timestamp,
            meta.client,
            meta.server,
        );
        describe::request(&mut txn, &msg);

        match &msg.body {
            MessageBody::Mysql(MysqlMessage::Request {
                command: MysqlCommand::StmtClose,
                statement_id: Some(id),
                ..
            }) => {
                // No response follows a close
                let closed = self.flow_entry(meta).statements.close(*id);
                tracing::trace!(
                    flow = meta.flow_id,
                    id,
                    found = closed.is_some(),
                    "mysql statement closed"
                );
                return;
            }
            MessageBody::Mysql(MysqlMessage::Request {
                command: MysqlCommand::StmtExecute,
                statement_id: Some(id),
                params,
                ..
            }) => {
                let limits = self.field_limits;
                let statements = &mut self.flow_entry(meta).statements;
                let Some(stmt) = statements.get(*id) else {
                    txn.add_note(NOTE_UNKNOWN_STATEMENT);
                    self.push_pending(meta, PendingRequest { txn, deadline });
                    return;
                };
                txn.method = sql_method(&stmt.query);
                txn.query = stmt.query.clone();
                txn.set("num_params", stmt.num_params as u64);
                match decode_execute_params(params, stmt.num_params, &stmt.param_types, &limits) {
                    Ok(decoded) => {
                        if let Some(types) = decoded.bound_types {
                            statements.bind_types(*id, types);
                        }
                        if !decoded.values.is_empty() {
                            let values = decoded
                                .values
                                .into_iter()
                                .map(|v| v.map_or(FieldValue::Null, FieldValue::Str))
                                .collect();
                            txn.set("params", FieldValue::List(values));
                        }
                    }
                    Err(e) => tracing::debug!(
                        flow = meta.flow_id,
                        id,
                        error = ?e,
                        "mysql execute parameters not decoded"
                    ),
                }
            }
            MessageBody::Pgsql(PgsqlMessage::Query { query }) => {
                let statements = split_statements(query);
                if statements.len() > 1 {
                    // One response per statement; the wire size goes to the first
                    for (i, stmt) in statements.iter().enumerate() {
                        let mut part = txn.clone();
                        part.method = sql_method(stmt);
                        part.query = CompactString::new(stmt);
                        if i > 0 {
                            part.bytes_in = 0;
                        }
                        self.push_pending(meta, PendingRequest { txn: part, deadline });
                    }
                    return;
                }
            }
            MessageBody::Thrift(thrift) if thrift.message_type == ThriftMessageType::Oneway => {
                txn.complete = true;
                self.publish(txn, out);
                return;
            }
            _ => {}
        }

        self.push_pending(meta, PendingRequest { txn, deadline });
    }

    fn push_pending(&mut self, meta: &FlowMeta, request: PendingRequest) {
        let stats = Arc::clone(&self.stats);
        let entry = self.flow_entry(meta);
        match &mut entry.pending {
            Pending::Single(slot) => {
                if let Some(old) = slot.replace(request) {
                    tracing::warn!(
                        flow = meta.flow_id,
                        protocol = %meta.protocol,
                        method = %old.txn.method,
                        "two requests without a response, dropping the older one"
                    );
                    EngineStats::incr(&stats.unmatched_requests);
                }
            }
            Pending::Pipelined(queue) => {
                let size = request.txn.bytes_in as usize;
                let evicted = queue.append(request, size);
                if evicted > 0 {
                    tracing::debug!(flow = meta.flow_id, evicted, "pipelined request queue full");
                    EngineStats::add(&stats.queue_evictions, evicted as u64);
                }
            }
        }
    }

    fn on_response(&mut self, meta: &FlowMeta, msg: Message, out: &mut Vec<Transaction>) {
        let request = self.flows.get_mut(&meta.flow_id).and_then(|entry| match &mut entry.pending {
            Pending::Single(slot) => slot.take(),
            Pending::Pipelined(queue) => queue.pop(),
        });
        let Some(PendingRequest { mut txn, .. }) = request else {
            tracing::debug!(
                flow = meta.flow_id,
                protocol = %meta.protocol,
                "response from unknown transaction, ignoring"
            );
            EngineStats::incr(&self.stats.unmatched_responses);
            return;
        };

        describe::response(&mut txn, &msg);

        if let MessageBody::Mysql(MysqlMessage::PrepareOk {
            statement_id,
            num_params,
            ..
        }) = &msg.body
        {
            let query = txn.query.clone();
            self.flow_entry(meta)
                .statements
                .prepare(*statement_id, query, *num_params);
        }

        self.publish(txn, out);
    }

    fn publish(&self, txn: Transaction, out: &mut Vec<Transaction>) {
        EngineStats::incr(&self.stats.transactions);
        out.push(txn);
    }

    /// Emit every request whose deadline has passed as incomplete.
    pub fn expire(&mut self, now: i64, out: &mut Vec<Transaction>) {
        let mut expired = Vec::new();
        for entry in self.flows.values_mut() {
            match &mut entry.pending {
                Pending::Single(slot) => {
                    if slot.as_ref().is_some_and(|r| r.deadline <= now) {
                        expired.extend(slot.take());
                    }
                }
                Pending::Pipelined(queue) => {
                    while queue.front().is_some_and(|r| r.deadline <= now) {
                        expired.extend(queue.pop());
                    }
                }
            }
        }
        for request in expired {
            let mut txn = request.txn;
            tracing::debug!(flow = txn.flow_id, method = %txn.method, "transaction timed out");
            txn.add_note(NOTE_TIMEOUT);
            EngineStats::incr(&self.stats.timed_out_requests);
            self.publish(txn, out);
        }
    }

    /// Forget a flow, emitting its pending requests as incomplete.
    pub fn close_flow(&mut self, flow_id: u64, out: &mut Vec<Transaction>) {
        let Some(entry) = self.flows.remove(&flow_id) else {
            return;
        };
        let pending: Vec<PendingRequest> = match entry.pending {
            Pending::Single(slot) => slot.into_iter().collect(),
            Pending::Pipelined(mut queue) => {
                let drained: Vec<PendingRequest> = queue.drain().collect();
                drained
            }
        };
        if !pending.is_empty() {
            tracing::debug!(
                flow = flow_id,
                protocol = %entry.meta.protocol,
                pending = pending.len(),
                "flow closed with requests pending"
            );
        }
        for request in pending {
            let mut txn = request.txn;
            txn.add_note(NOTE_FLOW_CLOSED);
            EngineStats::incr(&self.stats.unmatched_requests);
            self.publish(txn, out);
        }
    }

    /// Requests currently waiting across all flows.
    pub fn pending_count(&self) -> usize {
        self.flows.values().map(|f| f.pending.len()).sum()
    }

    /// Prepared statements cached for a flow.
    pub fn statements(&self, flow_id: u64) -> Option<&StatementCache> {
        self.flows.get(&flow_id).map(|f| &f.statements)
    }
}
