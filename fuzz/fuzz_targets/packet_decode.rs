//! Negative-space fuzzer for packet decoding.
//!
//! Arbitrary bytes must never panic the decoder, and anything that does
//! decode must re-encode to an equivalent packet.

#![no_main]

use ames_proto::{OpenPacket, Packet};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::decode(data) {
        let wire = packet.encode();
        let again = Packet::decode(&wire).expect("re-encoded packet must decode");
        assert_eq!(again, packet);
    }

    // open-packet content parsing must be equally total
    let _ = OpenPacket::decode(data);
    let _ = ames_proto::payload::decode_shut(data);
});
