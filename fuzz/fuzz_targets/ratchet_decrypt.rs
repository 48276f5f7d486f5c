//! Fuzz target for the receive path
//!
//! Fuzzed envelope fields driven through a live ratchet must never panic
//! and must leave the state unchanged on failure.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerseal::envelope::Envelope;
use peerseal::Ratchet;
use rand_core::OsRng;

fuzz_target!(|data: &[u8]| {
    let mut ratchet = Ratchet::new(&mut OsRng);
    ratchet.initialize(&[5u8; 32], b"fuzzed-session!!");

    let Ok(envelope) = Envelope::from_bytes(data) else {
        return;
    };

    let counter_before = ratchet.recv_counter();
    if ratchet.decrypt(&envelope).is_err() {
        assert_eq!(ratchet.recv_counter(), counter_before);
        assert_eq!(ratchet.skipped_key_count(), 0);
    }
});
