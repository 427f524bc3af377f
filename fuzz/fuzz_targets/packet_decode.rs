//! Fuzz target for uplink packet decoding.
//!
//! # Invariants
//!
//! - Decoding never panics on arbitrary bytes
//! - Anything that decodes re-encodes to the identical byte string

#![no_main]

use libfuzzer_sys::fuzz_target;
use waypost_proto::BeaconLogPacket;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = BeaconLogPacket::decode(data) {
        let encoded = packet.encode().expect("decoded packet must re-encode");
        assert_eq!(encoded, data);
    }
});
