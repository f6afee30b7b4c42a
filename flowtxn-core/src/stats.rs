//! Engine counters.
//!
//! Everything observable about dropped or unmatched traffic ends up here.
//! Counters are relaxed atomics so a stats reader (the CLI's `--stats`
//! report, or another thread holding an `Arc<EngineStats>`) never takes the
//! engine lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters, shared by the engine and the correlator.
        #[derive(Debug, Default)]
        pub struct EngineStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`EngineStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl EngineStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    /// TCP segments handed to the engine.
    segments,
    flows_created,
    /// Flows removed by the idle sweep.
    flows_expired,
    /// Flows removed by RST, buffer overflow or a clean close.
    flows_torn_down,
    duplicate_segments,
    buffer_overflows,
    /// Sequence gaps detected.
    gaps,
    /// Corrupt streams reported by decoders.
    decoder_errors,
    /// Decoder invocations that panicked.
    decoder_panics,
    /// Messages produced by decoders.
    messages,
    /// Transactions published.
    transactions,
    /// Requests dropped without a response (replaced or abandoned).
    unmatched_requests,
    /// Responses with no pending request.
    unmatched_responses,
    /// Requests that hit the transaction timeout.
    timed_out_requests,
    /// Requests evicted from a full pipelining queue.
    queue_evictions,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
