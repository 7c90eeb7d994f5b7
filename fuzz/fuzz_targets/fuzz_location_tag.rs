//! Fuzz target for location tag parsing.
//!
//! `node_name()` and `generation()` must never panic and must always
//! return slices of the original text.

#![no_main]

use affinity_engine::LocationTag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|text: &str| {
    let tag = LocationTag::new(text);
    assert!(text.contains(tag.node_name()));
    if let Some(generation) = tag.generation() {
        assert!(text.contains(generation));
    }

    let prefixed = LocationTag::new(format!("MQCT{text}"));
    let _ = prefixed.node_name();
    let _ = prefixed.generation();
});
