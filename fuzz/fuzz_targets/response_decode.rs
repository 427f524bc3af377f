//! Fuzz target for downlink response decoding.
//!
//! # Invariants
//!
//! - Decoding never panics on arbitrary bytes
//! - Anything that decodes re-encodes to the identical byte string

#![no_main]

use libfuzzer_sys::fuzz_target;
use waypost_proto::BeaconResponsePacket;

fuzz_target!(|data: &[u8]| {
    if let Ok(response) = BeaconResponsePacket::decode(data) {
        let encoded = response.encode().expect("decoded response must re-encode");
        assert_eq!(encoded, data);
    }
});
