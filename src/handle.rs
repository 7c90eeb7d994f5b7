//! Transport handle seam.
//!
//! Connections and sessions belong to the external transport layer. This
//! crate only sees them through [`ChannelHandle`], which exposes exactly
//! what location resolution, coherence checks and reconnection probes need.
//! Every method is optional except [`ChannelHandle::describe`]; the defaults
//! report "nothing available" so a profile implements only what it has.
//!
//! # Example
//!
//! ```rust
//! use affinity_engine::handle::{ChannelHandle, HandleError};
//! use std::any::Any;
//!
//! struct Session { tag: String }
//!
//! impl ChannelHandle for Session {
//!     fn describe(&self) -> String {
//!         "session-1".to_string()
//!     }
//!
//!     fn property(&self, key: &str) -> Result<Option<String>, HandleError> {
//!         Ok((key == "XMSC_WMQ_RESOLVED_CONNECTION_TAG").then(|| self.tag.clone()))
//!     }
//!
//!     fn as_any(&self) -> &dyn Any {
//!         self
//!     }
//! }
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Total length of the opaque connection identifier.
pub const OPAQUE_ID_LEN: usize = 48;

/// Offset of the embedded node name inside the opaque identifier.
pub const NODE_NAME_OFFSET: usize = 4;

/// Length of the embedded node name field (space/NUL padded).
pub const NODE_NAME_LEN: usize = 16;

/// Eye-catcher written by [`encode_opaque_id`]. Never interpreted on decode.
pub const OPAQUE_ID_EYECATCHER: &[u8; NODE_NAME_OFFSET] = b"AMQC";

/// Errors reported by transport handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The handle is closed or being torn down.
    #[error("handle closed")]
    Closed,

    /// This client profile does not support the operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The transport reported an error.
    #[error("transport error {code}: {message}")]
    Transport { code: String, message: String },
}

/// An opaque reference to a parent connection or child session.
///
/// Implementations must be cheap to query and must tolerate being called
/// from any thread, including while the underlying connection is torn down.
pub trait ChannelHandle: Send + Sync + 'static {
    /// Human-readable identity for logs (never parsed).
    fn describe(&self) -> String;

    /// Tier 1: read a string property by key.
    fn property(&self, _key: &str) -> Result<Option<String>, HandleError> {
        Ok(None)
    }

    /// Tier 2: the handle's reachable internal fields, if the profile can
    /// expose them.
    fn object_graph(&self) -> Option<ObjectGraph> {
        None
    }

    /// Tier 3: the fixed-length opaque connection identifier, if exposed.
    fn opaque_id(&self) -> Option<Vec<u8>> {
        None
    }

    /// Whether this profile exposes a location on this handle at all.
    ///
    /// Child sessions on some profiles carry no location of their own; the
    /// coherence check then reports them as inherited rather than verified.
    fn exposes_location(&self) -> bool {
        true
    }

    /// Whether the handle is closed. Closed handles resolve to `UNKNOWN`.
    fn is_closed(&self) -> bool {
        false
    }

    /// Cheap no-op operation that refreshes cached location values.
    fn touch(&self) -> Result<(), HandleError> {
        Ok(())
    }

    /// Cheap reconnection probe (e.g. create and discard a trivial child).
    fn probe(&self) -> Result<(), HandleError> {
        Ok(())
    }

    /// Downcast hook for profile adapters.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle reference as stored in registry records.
pub type HandleRef = Arc<dyn ChannelHandle>;

/// A field value in an [`ObjectGraph`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A string-typed field.
    Str(String),
    /// A reference to another node of the same graph (may form cycles).
    Ref(usize),
    /// Any other field type (numbers, opaque objects); never returned.
    Other,
}

/// A node of an [`ObjectGraph`]: named fields in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectNode {
    pub type_name: String,
    pub fields: Vec<(String, FieldValue)>,
}

impl ObjectNode {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder: add a string field.
    pub fn with_str(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), FieldValue::Str(value.into())));
        self
    }

    /// Builder: add a reference to another node.
    pub fn with_ref(mut self, name: impl Into<String>, node: usize) -> Self {
        self.fields.push((name.into(), FieldValue::Ref(node)));
        self
    }

    /// Builder: add a non-string, non-reference field.
    pub fn with_other(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), FieldValue::Other));
        self
    }
}

/// Arena view of a handle's internal object graph.
///
/// References are node indices, so cycles are representable and walkers
/// guard against them with a visited set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectGraph {
    pub nodes: Vec<ObjectNode>,
    pub root: usize,
}

impl ObjectGraph {
    /// Graph whose root is node 0.
    pub fn new(nodes: Vec<ObjectNode>) -> Self {
        Self { nodes, root: 0 }
    }

    pub fn node(&self, index: usize) -> Option<&ObjectNode> {
        self.nodes.get(index)
    }
}

/// Build a well-formed opaque identifier embedding `node` at
/// [`NODE_NAME_OFFSET`] and `generation` in the trailing bytes.
///
/// Node names longer than [`NODE_NAME_LEN`] are truncated.
pub fn encode_opaque_id(node: &str, generation: u64) -> [u8; OPAQUE_ID_LEN] {
    let mut id = [0u8; OPAQUE_ID_LEN];
    id[..NODE_NAME_OFFSET].copy_from_slice(OPAQUE_ID_EYECATCHER);

    let name = &mut id[NODE_NAME_OFFSET..NODE_NAME_OFFSET + NODE_NAME_LEN];
    name.fill(b' ');
    let bytes = node.as_bytes();
    let len = bytes.len().min(NODE_NAME_LEN);
    name[..len].copy_from_slice(&bytes[..len]);

    let gen_start = NODE_NAME_OFFSET + NODE_NAME_LEN;
    id[gen_start..gen_start + 8].copy_from_slice(&generation.to_be_bytes());
    id
}

/// Run a handle or adapter call, absorbing panics as "nothing found".
///
/// Handles belong to the transport layer and may be torn down underneath us.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Option<T>) -> Option<T> {
    catch_unwind(AssertUnwindSafe(f)).ok().flatten()
}

/// [`ChannelHandle::describe`] for log fields. A handle that panics while
/// being torn down reads as `<unavailable>`.
pub(crate) fn describe_handle(handle: &dyn ChannelHandle) -> String {
    guarded(|| Some(handle.describe())).unwrap_or_else(|| "<unavailable>".to_string())
}
