#![no_main]

use libfuzzer_sys::fuzz_target;
use tradenet_core::core_router::{BroadcastMessage, NetworkEnvelope};

fuzz_target!(|data: &[u8]| {
    // Arbitrary frames from a peer must never panic the decoder
    if let Ok(envelope) = NetworkEnvelope::from_bytes(data) {
        let _ = envelope.header();
        let _ = BroadcastMessage::from_envelope(&envelope);
    }
});
