//! Exhaustive positive-space fuzzer for packet encoding/decoding.
//!
//! Unlike random fuzzing (packet_decode.rs), this fuzzer exhaustively
//! covers the structured corners:
//! - every ship size-class pair (galaxy through comet, both ends)
//! - edge-case tick nibbles
//! - origin present and absent
//! - empty and small content
//!
//! This catches bugs that live only in specific width combinations the
//! random sampler would be unlikely to assemble.

#![no_main]

use ames_proto::{Origin, Packet, Ship};
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

// one ship per size class, plus in-class boundaries
const SHIPS: &[u128] = &[
    0,
    0xff,
    0x100,
    0xffff,
    0x1_0000,
    0xffff_ffff,
    0x1_0000_0000,
    u64::MAX as u128,
    u64::MAX as u128 + 1,
    u128::MAX,
];

const TICKS: &[u8] = &[0, 1, 15];

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let sndr = Ship(SHIPS[data[0] as usize % SHIPS.len()]);
    let rcvr = Ship(SHIPS[data[1] as usize % SHIPS.len()]);
    let sndr_tick = TICKS[data[2] as usize % TICKS.len()];
    let rcvr_tick = TICKS[data[3] as usize % TICKS.len()];
    let content = Bytes::copy_from_slice(&data[4..]);

    for request in [false, true] {
        for origin in [None, Some(Origin([1, 2, 3, 4, 5, 6]))] {
            let packet = Packet {
                sndr,
                rcvr,
                request,
                sndr_tick,
                rcvr_tick,
                origin,
                content: content.clone(),
            };

            let wire = packet.encode();
            let decoded = Packet::decode(&wire).expect("valid packet must decode");
            assert_eq!(decoded, packet);

            // encoded size is exactly header + ships + origin + content
            let expected = 4
                + sndr.wire_len()
                + rcvr.wire_len()
                + origin.map_or(0, |_| Origin::SIZE)
                + content.len();
            assert_eq!(wire.len(), expected);
        }
    }
});
