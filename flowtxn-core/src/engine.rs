//! The segment-to-transaction pipeline.
//!
//! [`Engine`] owns the flow table and the correlator and is driven by three
//! calls: [`process_segment`](Engine::process_segment) for every captured
//! TCP segment, [`sweep`](Engine::sweep) periodically to expire idle flows
//! and unanswered requests, and [`flush`](Engine::flush) at end of input.
//!
//! Nothing a peer sends can make these calls fail. Malformed streams,
//! decoder panics, buffer overflows and lost segments end up as counters in
//! [`EngineStats`], log lines, and at worst a torn-down flow.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{DecoderOptions, EngineConfig};
use crate::correlate::{Correlator, FlowMeta};
use crate::decoder::{Decoder, GapOutcome, Message, ParseOutcome, Protocol};
use crate::error::Result;
use crate::flow::{Direction, Flow, FlowKey, FlowTable};
use crate::publish::{attribute, NoProcessResolver, ProcessResolver, TransactionSink};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::stream::{SeqCheck, Segment};
use crate::transaction::Transaction;

/// What a segment did to its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowFate {
    Keep,
    /// Both sides closed cleanly.
    Closed,
    /// RST seen.
    Reset,
    /// A direction exceeded the buffer cap.
    Overflow,
}

fn flow_meta(flow: &Flow) -> FlowMeta {
    FlowMeta {
        flow_id: flow.id,
        protocol: flow.protocol,
        client: flow.source(flow.server_direction),
        server: flow.destination(flow.server_direction),
    }
}

/// Run a decoder call, converting a panic into `None`.
fn guarded<T>(stats: &EngineStats, flow_id: u64, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Some(v),
        Err(_) => {
            EngineStats::incr(&stats.decoder_panics);
            tracing::error!(flow = flow_id, "decoder panicked, resetting direction");
            None
        }
    }
}

/// Flow-keyed stream reconstruction and transaction correlation.
pub struct Engine {
    config: EngineConfig,
    ports: HashMap<u16, Protocol>,
    flows: FlowTable,
    correlator: Correlator,
    resolver: Arc<dyn ProcessResolver>,
    stats: Arc<EngineStats>,
    /// Transactions waiting to be handed to the sink.
    finished: Vec<Transaction>,
    /// Latest timestamp seen (microseconds).
    now: i64,
}

impl Engine {
    /// Build an engine; fails only on an invalid configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let ports = config.port_map()?;
        let stats = Arc::new(EngineStats::new());
        let correlator = Correlator::new(&config, Arc::clone(&stats));
        tracing::debug!(ports = ports.len(), "engine configured");
        Ok(Self {
            config,
            ports,
            flows: FlowTable::new(),
            correlator,
            resolver: Arc::new(NoProcessResolver),
            stats,
            finished: Vec::new(),
            now: 0,
        })
    }

    /// Attribute transaction endpoints to local processes.
    pub fn with_resolver(mut self, resolver: Arc<dyn ProcessResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters.
    pub fn stats_handle(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Requests waiting for a response across all flows.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Find the flow a segment belongs to, creating it when the segment
    /// opens a connection to a configured port.
    fn locate(&mut self, seg: &Segment<'_>) -> Option<(FlowKey, Direction)> {
        let key = FlowKey::tcp(seg.src, seg.dst);
        if let Some(found) = self.flows.find(&key) {
            return Some(found);
        }

        let (protocol, server_direction) = match self.ports.get(&seg.dst.port()) {
            Some(&p) => (p, Direction::Original),
            None => (*self.ports.get(&seg.src.port())?, Direction::Reverse),
        };
        if seg.flags.rst || (seg.payload.is_empty() && !seg.flags.syn) {
            return None;
        }

        let id = self.flows.next_id();
        self.flows.insert(Flow::new(
            id,
            key,
            protocol,
            server_direction,
            &self.config.decoder,
            seg.timestamp,
        ));
        EngineStats::incr(&self.stats.flows_created);
        tracing::debug!(flow = id, %key, %protocol, "new flow");
        Some((key, Direction::Original))
    }

    /// Feed one captured TCP segment.
    pub fn process_segment(&mut self, seg: &Segment<'_>, sink: &mut dyn TransactionSink) {
        EngineStats::incr(&self.stats.segments);
        self.now = self.now.max(seg.timestamp);

        let Some((stored, direction)) = self.locate(seg) else {
            return;
        };
        let mut messages = Vec::new();
        let (fate, meta) = {
            let Some(flow) = self.flows.get_mut(&stored) else {
                return;
            };
            let fate = handle_segment(
                flow,
                direction,
                seg,
                &self.config,
                &self.stats,
                &mut messages,
            );
            (fate, flow_meta(flow))
        };

        for msg in messages {
            self.correlator.on_message(&meta, msg, &mut self.finished);
        }

        if fate != FlowFate::Keep {
            if let Some(flow) = self.flows.remove(&stored) {
                EngineStats::incr(&self.stats.flows_torn_down);
                tracing::debug!(flow = flow.id, ?fate, "flow torn down");
                // Closed flows already ran their close handlers
                self.retire(flow, fate == FlowFate::Reset);
            }
        }

        self.publish(sink);
    }

    /// Expire unanswered requests and idle flows as of `now` (microseconds).
    pub fn sweep(&mut self, now: i64, sink: &mut dyn TransactionSink) {
        self.now = self.now.max(now);
        self.correlator.expire(now, &mut self.finished);

        let idle = self.flows.expire(now, self.config.flow_timeout_us);
        if !idle.is_empty() {
            tracing::debug!(count = idle.len(), "expiring idle flows");
        }
        for flow in idle {
            EngineStats::incr(&self.stats.flows_expired);
            self.retire(flow, true);
        }
        self.publish(sink);
    }

    /// End of input: close every flow and emit everything still pending.
    pub fn flush(&mut self, sink: &mut dyn TransactionSink) {
        for flow in self.flows.drain() {
            self.retire(flow, true);
        }
        self.publish(sink);
    }

    /// Remove a flow's correlation state, optionally letting its decoders
    /// finish messages delimited by connection close first.
    fn retire(&mut self, mut flow: Flow, finalize: bool) {
        let meta = flow_meta(&flow);
        if finalize {
            let mut messages = Vec::new();
            for direction in [Direction::Original, Direction::Reverse] {
                if !flow.half(direction).buffer.fin_received {
                    close_direction(&mut flow, direction, self.now, &self.stats, &mut messages);
                }
            }
            for msg in messages {
                self.correlator.on_message(&meta, msg, &mut self.finished);
            }
        }
        self.correlator.close_flow(flow.id, &mut self.finished);
    }

    fn publish(&mut self, sink: &mut dyn TransactionSink) {
        for mut txn in self.finished.drain(..) {
            attribute(&mut txn, self.resolver.as_ref());
            sink.publish(txn);
        }
    }
}

/// Apply one segment to its flow; decoded messages are pushed to `messages`.
fn handle_segment(
    flow: &mut Flow,
    direction: Direction,
    seg: &Segment<'_>,
    config: &EngineConfig,
    stats: &EngineStats,
    messages: &mut Vec<Message>,
) -> FlowFate {
    let flow_id = flow.id;
    flow.last_seen = seg.timestamp;
    if seg.flags.rst {
        return FlowFate::Reset;
    }

    if !seg.payload.is_empty() {
        let half = flow.half_mut(direction);
        let payload = match half.buffer.check_seq(seg.seq, seg.payload.len()) {
            SeqCheck::Duplicate => {
                EngineStats::incr(&stats.duplicate_segments);
                tracing::trace!(flow = flow_id, seq = seg.seq, "duplicate segment");
                &[][..]
            }
            SeqCheck::InOrder { skip } => &seg.payload[skip.min(seg.payload.len())..],
            SeqCheck::Gap { missing } => {
                EngineStats::incr(&stats.gaps);
                tracing::debug!(flow = flow_id, missing, "sequence gap");
                handle_gap(flow, direction, missing, seg.timestamp, &config.decoder, stats, messages);
                seg.payload
            }
        };

        let half = flow.half_mut(direction);
        if !half.buffer.append(payload, seg.timestamp, config.max_buffer_bytes) {
            EngineStats::incr(&stats.buffer_overflows);
            tracing::warn!(
                flow = flow_id,
                buffered = half.buffer.len(),
                max = config.max_buffer_bytes,
                "stream buffer overflow, dropping flow"
            );
            return FlowFate::Overflow;
        }
        if !payload.is_empty() {
            decode(flow, direction, seg.timestamp, &config.decoder, stats, messages);
        }
    }

    if seg.flags.fin && !flow.half(direction).buffer.fin_received {
        close_direction(flow, direction, seg.timestamp, stats, messages);
        if flow.is_finished() {
            return FlowFate::Closed;
        }
    }
    FlowFate::Keep
}

/// Run the decoder over a direction until it needs more bytes.
fn decode(
    flow: &mut Flow,
    direction: Direction,
    now: i64,
    options: &DecoderOptions,
    stats: &EngineStats,
    messages: &mut Vec<Message>,
) {
    let flow_id = flow.id;
    loop {
        let ctx = flow.decode_context(direction, now);
        let half = flow.half_mut(direction);
        if half.buffer.is_empty() {
            return;
        }
        let data = half.buffer.unconsumed();
        let decoder = &mut half.decoder;
        let Some(outcome) = guarded(stats, flow_id, || decoder.parse(data, &ctx)) else {
            half.reset(options);
            return;
        };

        match outcome {
            ParseOutcome::Incomplete => return,
            ParseOutcome::Corrupt(reason) => {
                EngineStats::incr(&stats.decoder_errors);
                tracing::warn!(
                    flow = flow_id,
                    direction = direction.as_str(),
                    reason,
                    "corrupt stream, resetting direction"
                );
                half.reset(options);
                return;
            }
            ParseOutcome::Complete { consumed: 0, .. } => {
                EngineStats::incr(&stats.decoder_errors);
                tracing::warn!(flow = flow_id, "decoder made no progress, resetting direction");
                half.reset(options);
                return;
            }
            ParseOutcome::Complete { consumed, message } => {
                half.buffer.consume(consumed, now);
                half.decoder.prepare_for_new_message();
                if let Some(msg) = message {
                    EngineStats::incr(&stats.messages);
                    messages.push(msg);
                }
            }
        }
    }
}

/// Bytes were lost right after the buffered data of a direction.
fn handle_gap(
    flow: &mut Flow,
    direction: Direction,
    missing: usize,
    now: i64,
    options: &DecoderOptions,
    stats: &EngineStats,
    messages: &mut Vec<Message>,
) {
    let flow_id = flow.id;
    let ctx = flow.decode_context(direction, now);
    let half = flow.half_mut(direction);
    let data = half.buffer.unconsumed();
    let decoder = &mut half.decoder;
    match guarded(stats, flow_id, || decoder.message_gap(data, missing, &ctx)) {
        Some(GapOutcome::Continue) => {}
        Some(GapOutcome::Deliver(msg)) => {
            tracing::debug!(flow = flow_id, size = msg.size, "delivering message cut by gap");
            EngineStats::incr(&stats.messages);
            messages.push(msg);
            half.buffer.clear();
            half.decoder.prepare_for_new_message();
        }
        Some(GapOutcome::Drop) | None => half.reset(options),
    }
}

/// The sender of `direction` closed: let the decoder finish a message
/// delimited by close, then discard whatever can no longer complete.
fn close_direction(
    flow: &mut Flow,
    direction: Direction,
    now: i64,
    stats: &EngineStats,
    messages: &mut Vec<Message>,
) {
    let flow_id = flow.id;
    let ctx = flow.decode_context(direction, now);
    let half = flow.half_mut(direction);
    half.buffer.fin_received = true;
    let data = half.buffer.unconsumed();
    let decoder = &mut half.decoder;
    if let Some(Some(msg)) = guarded(stats, flow_id, || decoder.on_fin(data, &ctx)) {
        EngineStats::incr(&stats.messages);
        messages.push(msg);
    }
    half.buffer.clear();
    half.decoder.prepare_for_new_message();
}

/// [`Engine`] behind a mutex, for capture readers on several threads.
///
/// Statistics are read through the shared counters without taking the lock.
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Mutex<Engine>>,
    stats: Arc<EngineStats>,
}

impl SharedEngine {
    pub fn new(engine: Engine) -> Self {
        let stats = engine.stats_handle();
        Self {
            inner: Arc::new(Mutex::new(engine)),
            stats,
        }
    }

    pub fn process_segment(&self, seg: &Segment<'_>, sink: &mut dyn TransactionSink) {
        self.inner.lock().process_segment(seg, sink);
    }

    pub fn sweep(&self, now: i64, sink: &mut dyn TransactionSink) {
        self.inner.lock().sweep(now, sink);
    }

    pub fn flush(&self, sink: &mut dyn TransactionSink) {
        self.inner.lock().flush(sink);
    }

    pub fn flow_count(&self) -> usize {
        self.inner.lock().flow_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
