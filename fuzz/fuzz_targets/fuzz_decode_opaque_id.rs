//! Fuzz target for opaque connection identifier decoding.
//!
//! Decoding must never panic on arbitrary bytes, raw, `ID:`-prefixed or
//! as bare hex text, and a decoded name is always non-empty, trimmed and within the field.

#![no_main]

use affinity_engine::extractor::decode_opaque_id;
use affinity_engine::handle::NODE_NAME_LEN;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let candidates = [
        data.to_vec(),
        [b"ID:".as_slice(), data].concat(),
        hex::encode(data).into_bytes(),
    ];
    for candidate in candidates {
        if let Some(name) = decode_opaque_id(&candidate) {
            assert!(!name.is_empty());
            assert_eq!(name.trim(), name);
            assert!(name.len() <= NODE_NAME_LEN);
        }
    }
});
