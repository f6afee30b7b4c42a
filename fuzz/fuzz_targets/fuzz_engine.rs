//! Fuzz target for the engine as a whole.
//!
//! The input is cut into segments; each chunk's first byte picks the
//! direction, flags and a sequence skew, so retransmissions, gaps and
//! teardown all get exercised on every protocol port.

#![no_main]

use std::net::SocketAddr;

use flowtxn_core::{Engine, EngineConfig, Segment, TcpFlags, VecSink};
use libfuzzer_sys::fuzz_target;

const SERVER_PORTS: [u16; 5] = [80, 3306, 5432, 6379, 9090];

fuzz_target!(|data: &[u8]| {
    let Some((&port_sel, rest)) = data.split_first() else {
        return;
    };
    let mut config = EngineConfig::default();
    config.max_buffer_bytes = 4096;
    let Ok(mut engine) = Engine::new(config) else {
        return;
    };
    let mut sink = VecSink::new();

    let client: SocketAddr = ([10, 0, 0, 1], 40000).into();
    let server: SocketAddr = ([10, 0, 0, 2], SERVER_PORTS[(port_sel % 5) as usize]).into();
    let mut seq = [1u32, 1u32];
    let mut ts = 0i64;

    for chunk in rest.chunks(64) {
        let Some((&ctl, payload)) = chunk.split_first() else {
            continue;
        };
        let to_server = ctl & 0x01 == 0;
        let side = usize::from(!to_server);
        let flags = TcpFlags {
            syn: false,
            ack: true,
            fin: ctl & 0x02 != 0,
            rst: ctl & 0x04 == 0x04 && ctl & 0xf0 == 0xf0,
        };
        // Small skews produce overlaps and holes
        let skew = i32::from((ctl >> 3) & 0x03) - 1;
        let start = seq[side].wrapping_add_signed(skew * 8);
        let (src, dst) = if to_server { (client, server) } else { (server, client) };

        ts += 1_000;
        let segment = Segment::data(ts, src, dst, start, payload).with_flags(flags);
        engine.process_segment(&segment, &mut sink);
        seq[side] = start.wrapping_add(payload.len() as u32);

        if ctl & 0x40 != 0 {
            ts += 5_000_000;
            engine.sweep(ts, &mut sink);
        }
    }

    engine.flush(&mut sink);
    assert_eq!(engine.flow_count(), 0);
});
