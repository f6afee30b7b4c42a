//! Offline replay of a capture file through the engine.

use std::io::Read;

use flowtxn_core::{Engine, TransactionSink};
use serde::Serialize;

use super::packet::{decode_segment, Skip};
use super::reader::CaptureReader;
use crate::error::Result;

/// Replay settings.
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Minimum capture time between two engine sweeps (microseconds).
    pub sweep_interval_us: i64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            sweep_interval_us: 1_000_000, // 1 second
        }
    }
}

/// What a replay read and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub frames: u64,
    pub segments: u64,
    pub sweeps: u64,
    pub skipped_link_type: u64,
    pub skipped_not_ip: u64,
    pub skipped_not_tcp: u64,
    pub skipped_fragments: u64,
    pub skipped_truncated: u64,
}

impl ReplaySummary {
    fn skip(&mut self, reason: Skip) {
        let counter = match reason {
            Skip::UnsupportedLinkType => &mut self.skipped_link_type,
            Skip::NotIp => &mut self.skipped_not_ip,
            Skip::NotTcp => &mut self.skipped_not_tcp,
            Skip::Fragment => &mut self.skipped_fragments,
            Skip::Truncated => &mut self.skipped_truncated,
        };
        *counter += 1;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_link_type
            + self.skipped_not_ip
            + self.skipped_not_tcp
            + self.skipped_fragments
            + self.skipped_truncated
    }
}

/// Push every TCP segment of a capture through `engine`.
///
/// The engine is swept whenever capture time has advanced by the sweep
/// interval, and flushed at end of file so requests still waiting for a
/// response come out as incomplete transactions.
pub fn replay<R: Read>(
    reader: &mut CaptureReader<R>,
    engine: &mut Engine,
    sink: &mut dyn TransactionSink,
    options: &ReplayOptions,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    let mut last_sweep: Option<i64> = None;

    reader.process_packets(|packet| {
        summary.frames += 1;
        let segment = match decode_segment(packet.link_type, packet.timestamp_us, packet.data) {
            Ok(segment) => segment,
            Err(reason) => {
                tracing::trace!(frame = packet.frame_number, ?reason, "frame skipped");
                summary.skip(reason);
                return Ok(());
            }
        };

        let now = segment.timestamp;
        match last_sweep {
            None => last_sweep = Some(now),
            Some(last) if now - last >= options.sweep_interval_us => {
                engine.sweep(now, sink);
                summary.sweeps += 1;
                last_sweep = Some(now);
            }
            Some(_) => {}
        }

        engine.process_segment(&segment, sink);
        summary.segments += 1;
        Ok(())
    })?;

    engine.flush(sink);
    if summary.skipped_link_type > 0 {
        tracing::warn!(
            frames = summary.skipped_link_type,
            link_type = reader.link_type(),
            "frames with an unsupported link type were skipped"
        );
    }
    tracing::info!(
        frames = summary.frames,
        segments = summary.segments,
        skipped = summary.skipped(),
        "replay finished"
    );
    Ok(summary)
}
