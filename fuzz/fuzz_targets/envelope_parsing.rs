//! Fuzz target for envelope decoding
//!
//! Adversarial length fields must never panic, over-allocate or break the
//! re-encode round-trip.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerseal::envelope::Envelope;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::from_bytes(data) {
        // trailing bytes are allowed on input, so only the canonical
        // re-encoding is required to round-trip exactly
        let bytes = envelope.to_bytes();
        let again = Envelope::from_bytes(&bytes).expect("canonical encoding must decode");
        assert_eq!(again, envelope);
    }
});
