//! Location resolution from opaque handles.
//!
//! [`MetadataExtractor::resolve`] tries three tiers in strict order and the
//! first success wins:
//!
//! ```text
//! 1. Property   handle.property(key) for each configured key, in order
//! 2. Adapter    registered LocationAdapters, then the FieldScanAdapter
//! 3. OpaqueId   decode the node name embedded in handle.opaque_id()
//! ```
//!
//! Resolution never fails. When every tier comes up empty (or the handle is
//! closed, errors, or panics) the result is [`Resolution::Unknown`], logged
//! at debug level only. This makes `resolve` safe to call speculatively and
//! often, including against handles that are mid-teardown.
//!
//! # Profile Adapters
//!
//! Some client profiles only expose the location through internal state.
//! Rather than discovering fields at runtime, such profiles register an
//! explicit [`LocationAdapter`] when the extractor is built:
//!
//! ```rust
//! use affinity_engine::extractor::{LocationAdapter, MetadataExtractor};
//! use affinity_engine::handle::ChannelHandle;
//! use affinity_engine::location::LocationTag;
//! use affinity_engine::config::ExtractionConfig;
//! use std::sync::Arc;
//!
//! struct LegacyProfile;
//!
//! impl LocationAdapter for LegacyProfile {
//!     fn name(&self) -> &str {
//!         "legacy"
//!     }
//!
//!     fn try_resolve_location(&self, handle: &dyn ChannelHandle) -> Option<LocationTag> {
//!         handle.property("legacy.qmgr").ok().flatten().map(LocationTag::from)
//!     }
//! }
//!
//! let extractor = MetadataExtractor::new(ExtractionConfig::default())
//!     .with_adapter(Arc::new(LegacyProfile));
//! ```

use crate::config::ExtractionConfig;
use crate::handle::{
    describe_handle, guarded, ChannelHandle, FieldValue, HandleRef, ObjectGraph, NODE_NAME_LEN,
    NODE_NAME_OFFSET,
};
use crate::location::{ExtractionTier, LocationTag, Resolution};
use crate::metrics;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of the textual (hex) form of the opaque identifier.
const TEXTUAL_ID_PREFIX: &[u8] = b"ID:";

/// Per-profile capability: resolve a location from a handle, if possible.
pub trait LocationAdapter: Send + Sync + 'static {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Try to resolve the handle's location. `None` means "not mine / not
    /// available"; the next adapter or tier is tried.
    fn try_resolve_location(&self, handle: &dyn ChannelHandle) -> Option<LocationTag>;
}

/// Structural fallback: walks [`ChannelHandle::object_graph`] breadth-first,
/// returning the first non-empty string field whose name contains a needle.
#[derive(Debug, Clone)]
pub struct FieldScanAdapter {
    max_depth: usize,
    needles: Vec<String>,
}

impl FieldScanAdapter {
    pub fn new(max_depth: usize, needles: &[String]) -> Self {
        Self {
            max_depth,
            needles: needles.iter().map(|n| n.to_ascii_lowercase()).collect(),
        }
    }

    /// Scan a graph. Cycle-safe and bounded by `max_depth`.
    pub fn scan(&self, graph: &ObjectGraph) -> Option<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((graph.root, 0usize));

        while let Some((index, depth)) = queue.pop_front() {
            if !visited.insert(index) {
                continue;
            }
            let Some(node) = graph.node(index) else {
                continue;
            };

            for (name, value) in &node.fields {
                match value {
                    FieldValue::Str(s) if self.matches(name) => {
                        let trimmed = s.trim();
                        if !trimmed.is_empty() {
                            return Some(trimmed.to_string());
                        }
                    }
                    FieldValue::Ref(next) if depth < self.max_depth && !visited.contains(next) => {
                        queue.push_back((*next, depth + 1));
                    }
                    _ => {}
                }
            }
        }
        None
    }

    fn matches(&self, field_name: &str) -> bool {
        let lower = field_name.to_ascii_lowercase();
        self.needles.iter().any(|needle| lower.contains(needle.as_str()))
    }
}

impl LocationAdapter for FieldScanAdapter {
    fn name(&self) -> &str {
        "field_scan"
    }

    fn try_resolve_location(&self, handle: &dyn ChannelHandle) -> Option<LocationTag> {
        let graph = handle.object_graph()?;
        self.scan(&graph).map(LocationTag::from)
    }
}

/// Resolves node-location tags from opaque handles.
///
/// Holds no mutable state; share one instance behind an `Arc`.
pub struct MetadataExtractor {
    property_keys: Vec<String>,
    adapters: Vec<Arc<dyn LocationAdapter>>,
    field_scan: FieldScanAdapter,
}

impl MetadataExtractor {
    /// Create an extractor with the built-in field scan as the only adapter.
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            field_scan: FieldScanAdapter::new(config.max_depth, &config.field_needles),
            property_keys: config.property_keys,
            adapters: Vec::new(),
        }
    }

    /// Register a profile adapter. Adapters run in registration order,
    /// before the field scan.
    pub fn with_adapter(mut self, adapter: Arc<dyn LocationAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Names of the tier 2 adapters, in the order they are tried.
    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters
            .iter()
            .map(|a| a.name())
            .chain(std::iter::once(self.field_scan.name()))
            .collect()
    }

    /// Resolve the handle's location. Never fails.
    pub fn resolve(&self, handle: &dyn ChannelHandle) -> Resolution {
        let resolution = self.resolve_tiers(handle);
        metrics::record_resolution(resolution.tier());
        resolution
    }

    /// [`resolve`](Self::resolve) on the blocking pool.
    ///
    /// Property reads and opaque id lookups may go to the network on some
    /// profiles, so async callers must not run them on a runtime worker.
    pub async fn resolve_async(self: &Arc<Self>, handle: &HandleRef) -> Resolution {
        let extractor = Arc::clone(self);
        let handle = Arc::clone(handle);
        match tokio::task::spawn_blocking(move || extractor.resolve(handle.as_ref())).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(error = %e, "Resolution task failed, location unknown");
                Resolution::Unknown
            }
        }
    }

    fn resolve_tiers(&self, handle: &dyn ChannelHandle) -> Resolution {
        if guarded(|| Some(handle.is_closed())).unwrap_or(true) {
            debug!(handle = %describe_handle(handle), "Handle closed, location unknown");
            return Resolution::Unknown;
        }

        if let Some(tag) = self.from_properties(handle) {
            return Resolution::Resolved { tag, tier: ExtractionTier::Property };
        }

        if let Some(tag) = self.from_adapters(handle) {
            return Resolution::Resolved { tag, tier: ExtractionTier::Adapter };
        }

        if let Some(name) = guarded(|| handle.opaque_id()).and_then(|id| decode_opaque_id(&id)) {
            return Resolution::Resolved {
                tag: LocationTag::new(name),
                tier: ExtractionTier::OpaqueId,
            };
        }

        debug!(handle = %describe_handle(handle), "All extraction tiers exhausted");
        Resolution::Unknown
    }

    fn from_properties(&self, handle: &dyn ChannelHandle) -> Option<LocationTag> {
        for key in &self.property_keys {
            match guarded(|| Some(handle.property(key))) {
                Some(Ok(Some(value))) => {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        return Some(LocationTag::new(trimmed));
                    }
                }
                Some(Ok(None)) => {}
                Some(Err(e)) => {
                    debug!(handle = %describe_handle(handle), key = %key, error = %e, "Property query failed");
                }
                None => {
                    debug!(handle = %describe_handle(handle), key = %key, "Property query panicked");
                }
            }
        }
        None
    }

    fn from_adapters(&self, handle: &dyn ChannelHandle) -> Option<LocationTag> {
        let adapters = self
            .adapters
            .iter()
            .map(|a| a.as_ref())
            .chain(std::iter::once(&self.field_scan as &dyn LocationAdapter));

        for adapter in adapters {
            if let Some(tag) = guarded(|| adapter.try_resolve_location(handle)) {
                if !tag.as_str().trim().is_empty() {
                    return Some(tag);
                }
            }
        }
        None
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

/// Decode the node name embedded in an opaque connection identifier.
///
/// Accepts the raw byte form, the textual `ID:<hex>` form and bare hex text
/// (as connection id properties report it). The name field starts at
/// [`NODE_NAME_OFFSET`] and spans [`NODE_NAME_LEN`] bytes; it ends at the
/// first NUL or control byte and surrounding spaces are trimmed.
pub fn decode_opaque_id(id: &[u8]) -> Option<String> {
    if let Some(hex_text) = id.strip_prefix(TEXTUAL_ID_PREFIX) {
        let raw = hex::decode(hex_text).ok()?;
        return decode_raw(&raw);
    }
    if is_hex_text(id) {
        let raw = hex::decode(id).ok()?;
        return decode_raw(&raw);
    }
    decode_raw(id)
}

/// Even-length hex text long enough to cover the name field once decoded.
///
/// A raw identifier never qualifies: its eye-catcher is not hex.
fn is_hex_text(id: &[u8]) -> bool {
    id.len() >= 2 * (NODE_NAME_OFFSET + NODE_NAME_LEN)
        && id.len() % 2 == 0
        && id.iter().all(u8::is_ascii_hexdigit)
}

fn decode_raw(id: &[u8]) -> Option<String> {
    let field = id.get(NODE_NAME_OFFSET..NODE_NAME_OFFSET + NODE_NAME_LEN)?;
    let end = field
        .iter()
        .position(|b| *b == 0 || b.is_ascii_control() || !b.is_ascii())
        .unwrap_or(field.len());
    let name = std::str::from_utf8(&field[..end]).ok()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
