//! Mock transport handles for testing.
//!
//! A [`NodeCell`] stands in for "the node this connection is currently on".
//! Every handle created from the same cell reports the cell's value, so a
//! parent and its children move together when the test calls
//! [`NodeCell::move_to`], the way multiplexed sessions follow their
//! connection after a reconnect.

use affinity_engine::handle::{encode_opaque_id, ChannelHandle, HandleError, ObjectGraph, ObjectNode};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Primary tier 1 property key.
pub const RESOLVED_TAG_KEY: &str = "XMSC_WMQ_RESOLVED_CONNECTION_TAG";

/// Shared, mutable node location.
#[derive(Clone, Default)]
pub struct NodeCell(Arc<RwLock<Option<String>>>);

#[allow(dead_code)]
impl NodeCell {
    pub fn new(tag: &str) -> Self {
        Self(Arc::new(RwLock::new(Some(tag.to_string()))))
    }

    /// Simulate the connection landing on another node.
    pub fn move_to(&self, tag: &str) {
        *self.0.write().unwrap() = Some(tag.to_string());
    }

    /// Simulate a connection with no node (mid-reconnect).
    pub fn clear(&self) {
        *self.0.write().unwrap() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap().clone()
    }
}

/// Which tier the handle exposes its location through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    /// Tier 1 string property.
    Property,
    /// Tier 2 internal object graph.
    Fields,
    /// Tier 3 48-byte opaque id.
    OpaqueId,
    /// No location on this handle; coherence is inherited from the parent.
    Hidden,
}

/// Scriptable [`ChannelHandle`].
pub struct MockHandle {
    name: String,
    cell: NodeCell,
    exposure: Exposure,
    closed: AtomicBool,
    panics: AtomicBool,
    failing_probes: AtomicUsize,
    stall: Duration,
    probes: AtomicUsize,
    touches: AtomicUsize,
}

#[allow(dead_code)]
impl MockHandle {
    pub fn new(name: &str, cell: &NodeCell) -> Arc<Self> {
        Self::build(name, cell, Exposure::Property, 0, Duration::ZERO)
    }

    pub fn with_exposure(name: &str, cell: &NodeCell, exposure: Exposure) -> Arc<Self> {
        Self::build(name, cell, exposure, 0, Duration::ZERO)
    }

    /// Handle whose first `failures` probes report a transport error.
    pub fn flaky(name: &str, cell: &NodeCell, failures: usize) -> Arc<Self> {
        Self::build(name, cell, Exposure::Property, failures, Duration::ZERO)
    }

    /// Handle whose reconnect attempts block the calling thread for `stall` before
    /// succeeding, like a client waiting out a connect timeout.
    pub fn slow(name: &str, cell: &NodeCell, stall: Duration) -> Arc<Self> {
        Self::build(name, cell, Exposure::Property, 0, stall)
    }

    fn build(
        name: &str,
        cell: &NodeCell,
        exposure: Exposure,
        failures: usize,
        stall: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            cell: cell.clone(),
            exposure,
            closed: AtomicBool::new(false),
            panics: AtomicBool::new(false),
            failing_probes: AtomicUsize::new(failures),
            stall,
            probes: AtomicUsize::new(0),
            touches: AtomicUsize::new(0),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Make every later call panic, like a handle torn down mid-call.
    pub fn poison(&self) {
        self.panics.store(true, Ordering::SeqCst);
    }

    /// Fail every probe from now on.
    pub fn fail_probes_forever(&self) {
        self.failing_probes.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn touch_count(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    fn check_poisoned(&self) {
        if self.panics.load(Ordering::SeqCst) {
            panic!("{} poisoned", self.name);
        }
    }

    fn location(&self, exposure: Exposure) -> Option<String> {
        self.check_poisoned();
        if self.exposure != exposure {
            return None;
        }
        self.cell.get()
    }
}

impl ChannelHandle for MockHandle {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn property(&self, key: &str) -> Result<Option<String>, HandleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HandleError::Closed);
        }
        if key != RESOLVED_TAG_KEY {
            return Ok(None);
        }
        Ok(self.location(Exposure::Property))
    }

    fn object_graph(&self) -> Option<ObjectGraph> {
        let tag = self.location(Exposure::Fields)?;
        // conn -> delegate -> state{resolvedTag}, with a back reference
        Some(ObjectGraph::new(vec![
            ObjectNode::new("Connection").with_other("id").with_ref("delegate", 1),
            ObjectNode::new("Delegate").with_ref("owner", 0).with_ref("state", 2),
            ObjectNode::new("State").with_str("resolvedTag", tag),
        ]))
    }

    fn opaque_id(&self) -> Option<Vec<u8>> {
        let node = self.location(Exposure::OpaqueId)?;
        Some(encode_opaque_id(&node, 1).to_vec())
    }

    fn exposes_location(&self) -> bool {
        self.check_poisoned();
        self.exposure != Exposure::Hidden
    }

    fn is_closed(&self) -> bool {
        self.check_poisoned();
        self.closed.load(Ordering::SeqCst)
    }

    fn touch(&self) -> Result<(), HandleError> {
        self.check_poisoned();
        self.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn probe(&self) -> Result<(), HandleError> {
        self.check_poisoned();
        self.probes.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            std::thread::sleep(self.stall);
        }
        let remaining = self.failing_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failing_probes.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(HandleError::Transport {
                code: "2059".to_string(),
                message: "node not available".to_string(),
            });
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
