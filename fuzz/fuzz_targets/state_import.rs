//! Fuzz target for ratchet state import
//!
//! Arbitrary blobs must either be rejected or produce a ratchet whose
//! re-export decodes again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerseal::Ratchet;

fuzz_target!(|data: &[u8]| {
    if let Ok(ratchet) = Ratchet::import_state(data) {
        let blob = ratchet.export_state();
        Ratchet::import_state(&blob).expect("re-exported state must import");
    }
});
