//! Fuzz target for the protocol decoders.
//!
//! The first byte selects the protocol, the direction and whether a gap is
//! reported before parsing; the rest is the stream. The decoder is driven
//! the way the engine drives it, so a `Complete` must always consume bytes
//! that exist.

#![no_main]

use flowtxn_core::config::{DecoderOptions, ThriftTransport};
use flowtxn_core::decoder::{DecodeContext, Decoder, GapOutcome, ParseOutcome};
use flowtxn_core::{Direction, Protocol, ProtocolDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, mut stream)) = data.split_first() else {
        return;
    };

    let protocol = Protocol::ALL[(selector % 5) as usize];
    let to_server = selector & 0x08 != 0;
    let mut options = DecoderOptions::default();
    if selector & 0x10 != 0 {
        options.thrift_transport = ThriftTransport::Framed;
    }
    let mut decoder = ProtocolDecoder::new(protocol, &options);
    let mut ctx = DecodeContext {
        direction: if to_server {
            Direction::Original
        } else {
            Direction::Reverse
        },
        timestamp: 0,
        to_server,
        stream_offset: 0,
    };

    if selector & 0x20 != 0 {
        if let GapOutcome::Continue = decoder.message_gap(stream, 16, &ctx) {
            ctx.stream_offset += 16;
        } else {
            decoder.prepare_for_new_message();
        }
    }

    while !stream.is_empty() {
        match decoder.parse(stream, &ctx) {
            ParseOutcome::Complete { consumed, .. } => {
                assert!(consumed <= stream.len(), "consumed past the buffer");
                if consumed == 0 {
                    break;
                }
                stream = &stream[consumed..];
                ctx.stream_offset += consumed as u64;
                ctx.timestamp += 1;
                decoder.prepare_for_new_message();
            }
            ParseOutcome::Incomplete => {
                let _ = decoder.on_fin(stream, &ctx);
                break;
            }
            ParseOutcome::Corrupt(_) => break,
        }
    }
});
