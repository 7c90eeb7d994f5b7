//! Fuzz target for the tier 2 object graph walk.
//!
//! Builds arbitrary graphs (dangling references, cycles, self loops) from
//! the input and checks the scan terminates without panicking.

#![no_main]

use affinity_engine::extractor::FieldScanAdapter;
use affinity_engine::handle::{ObjectGraph, ObjectNode};
use libfuzzer_sys::fuzz_target;

const NAMES: [&str; 6] = ["resolvedTag", "nodeName", "connection", "delegate", "id", "owner"];

fuzz_target!(|data: &[u8]| {
    let mut nodes = Vec::new();
    for chunk in data.chunks(3) {
        let mut node = ObjectNode::new("Node");
        for pair in chunk.windows(2) {
            let name = NAMES[pair[0] as usize % NAMES.len()];
            node = match pair[1] % 3 {
                0 => node.with_str(name, format!("QM{}", pair[1])),
                1 => node.with_ref(name, pair[1] as usize % 8),
                _ => node.with_other(name),
            };
        }
        nodes.push(node);
    }
    let depth = data.first().map(|b| *b as usize % 8).unwrap_or(0);

    let adapter = FieldScanAdapter::new(depth, &["tag".to_string(), "node".to_string()]);
    if let Some(value) = adapter.scan(&ObjectGraph::new(nodes)) {
        assert!(value.starts_with("QM"));
    }
});
