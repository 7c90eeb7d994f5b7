//! Affinity group registry.
//!
//! Concurrent in-memory store of [`AffinityGroup`]s keyed by the caller's
//! correlation id. Each group sits behind its own lock, so operations on
//! distinct groups never contend:
//!
//! ```text
//! groups:  DashMap<correlation_id, Arc<GroupSlot>>
//!                                       │
//!                                       └─ RwLock<GroupState { parent, children, history }>
//! parents: DashMap<ParentId, correlation_id>   (index for id lookups)
//! ```
//!
//! Records are only removed by explicit deregistration; there is no
//! background collection. Location tags are seeded by the
//! [`MetadataExtractor`] at registration and afterwards changed only by the
//! failover monitor and the coherence verifier.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(conn: affinity_engine::handle::HandleRef, session: affinity_engine::handle::HandleRef) -> affinity_engine::Result<()> {
//! use affinity_engine::extractor::MetadataExtractor;
//! use affinity_engine::registry::AffinityRegistry;
//! use std::sync::Arc;
//!
//! let registry = AffinityRegistry::new(Arc::new(MetadataExtractor::default()), "orders-app");
//! let parent = registry.register_parent(conn, "orders-1", "ORDERS").await?;
//! registry.register_child(parent.id, session, 0).await?;
//!
//! for group in registry.snapshot().await {
//!     println!("{} has {} children", group.parent.correlation_id, group.children.len());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{AffinityError, Result};
use crate::extractor::MetadataExtractor;
use crate::handle::{describe_handle, HandleRef};
use crate::location::{display_tag, LocationTag};
use crate::metrics;
use crate::monitor::{FailoverEvent, MonitorState};
use crate::verifier::CoherenceReport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identifier of a registered parent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParentId(pub u64);

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Identifier of a registered child session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChildId(pub u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// A registered parent connection.
#[derive(Clone, Serialize)]
pub struct ParentRecord {
    pub id: ParentId,
    pub correlation_id: String,
    pub application_tag: String,
    /// Application identity, for correlation with node-side diagnostics.
    pub application_name: String,
    #[serde(skip)]
    pub handle: HandleRef,
    /// `None` while the location is unknown.
    pub location_tag: Option<LocationTag>,
    pub state: MonitorState,
    /// Epoch millis.
    pub created_at: u64,
}

impl fmt::Debug for ParentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentRecord")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("application_tag", &self.application_tag)
            .field("handle", &describe_handle(self.handle.as_ref()))
            .field("location_tag", &self.location_tag)
            .field("state", &self.state)
            .finish()
    }
}

/// A registered child session.
#[derive(Clone, Serialize)]
pub struct ChildRecord {
    pub id: ChildId,
    pub parent_id: ParentId,
    /// Caller-supplied ordering key.
    pub index: u32,
    #[serde(skip)]
    pub handle: HandleRef,
    pub location_tag: Option<LocationTag>,
    pub created_at: u64,
}

impl fmt::Debug for ChildRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildRecord")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("index", &self.index)
            .field("handle", &describe_handle(self.handle.as_ref()))
            .field("location_tag", &self.location_tag)
            .finish()
    }
}

/// A parent plus its children, ordered by index. Point-in-time copy.
#[derive(Debug, Clone, Serialize)]
pub struct AffinityGroup {
    pub parent: ParentRecord,
    pub children: Vec<ChildRecord>,
}

impl AffinityGroup {
    /// Parent plus children.
    pub fn member_count(&self) -> usize {
        1 + self.children.len()
    }

    /// Whether every child carries the parent's (known) tag.
    pub fn is_coherent(&self) -> bool {
        match &self.parent.location_tag {
            Some(tag) => self
                .children
                .iter()
                .all(|c| c.location_tag.as_ref().is_some_and(|t| t.matches(tag))),
            None => self.children.is_empty(),
        }
    }

    pub fn child(&self, child_id: ChildId) -> Option<&ChildRecord> {
        self.children.iter().find(|c| c.id == child_id)
    }
}

struct GroupState {
    parent: ParentRecord,
    children: Vec<ChildRecord>,
    history: Vec<FailoverEvent>,
    /// Set under the lock by deregistration so late writers see it.
    removed: bool,
}

impl GroupState {
    fn to_group(&self) -> AffinityGroup {
        AffinityGroup {
            parent: self.parent.clone(),
            children: self.children.clone(),
        }
    }
}

struct GroupSlot {
    state: RwLock<GroupState>,
}

/// Concurrent store of affinity groups.
///
/// One instance per process, constructed by the caller and shared by
/// reference (usually inside an `Arc`).
pub struct AffinityRegistry {
    extractor: Arc<MetadataExtractor>,
    application_name: String,
    groups: DashMap<String, Arc<GroupSlot>>,
    parents: DashMap<ParentId, String>,
    next_parent_id: AtomicU64,
    next_child_id: AtomicU64,
}

impl AffinityRegistry {
    pub fn new(extractor: Arc<MetadataExtractor>, application_name: impl Into<String>) -> Self {
        Self {
            extractor,
            application_name: application_name.into(),
            groups: DashMap::new(),
            parents: DashMap::new(),
            next_parent_id: AtomicU64::new(1),
            next_child_id: AtomicU64::new(1),
        }
    }

    /// The extractor used to seed location tags.
    pub fn extractor(&self) -> &Arc<MetadataExtractor> {
        &self.extractor
    }

    /// Register a parent connection under `correlation_id`.
    ///
    /// Fails with [`AffinityError::DuplicateCorrelationId`] if the id is
    /// taken; the existing group is left untouched.
    pub async fn register_parent(
        &self,
        handle: HandleRef,
        correlation_id: &str,
        application_tag: &str,
    ) -> Result<ParentRecord> {
        if self.groups.contains_key(correlation_id) {
            return Err(AffinityError::DuplicateCorrelationId {
                correlation_id: correlation_id.to_string(),
            });
        }

        let location_tag = self.extractor.resolve_async(&handle).await.into_tag();

        let record = match self.groups.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(AffinityError::DuplicateCorrelationId {
                    correlation_id: correlation_id.to_string(),
                });
            }
            Entry::Vacant(vacant) => {
                let record = ParentRecord {
                    id: ParentId(self.next_parent_id.fetch_add(1, Ordering::Relaxed)),
                    correlation_id: correlation_id.to_string(),
                    application_tag: application_tag.to_string(),
                    application_name: self.application_name.clone(),
                    handle,
                    location_tag,
                    state: MonitorState::Connected,
                    created_at: epoch_millis(),
                };
                vacant.insert(Arc::new(GroupSlot {
                    state: RwLock::new(GroupState {
                        parent: record.clone(),
                        children: Vec::new(),
                        history: Vec::new(),
                        removed: false,
                    }),
                }));
                record
            }
        };
        self.parents.insert(record.id, record.correlation_id.clone());

        metrics::set_groups_registered(self.groups.len());
        info!(
            parent_id = %record.id,
            correlation_id = %record.correlation_id,
            location = %display_tag(record.location_tag.as_ref()),
            "Parent registered"
        );
        Ok(record)
    }

    /// Register a child session under `parent_id`.
    ///
    /// The child's location is resolved from its own handle, never copied
    /// from the parent. Children are kept ordered by `index`; equal indices
    /// keep registration order.
    pub async fn register_child(
        &self,
        parent_id: ParentId,
        handle: HandleRef,
        index: u32,
    ) -> Result<ChildRecord> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;

        let location_tag = self.extractor.resolve_async(&handle).await.into_tag();

        let mut state = slot.state.write().await;
        if state.removed {
            return Err(AffinityError::UnknownParent { parent_id });
        }

        let record = ChildRecord {
            id: ChildId(self.next_child_id.fetch_add(1, Ordering::Relaxed)),
            parent_id,
            index,
            handle,
            location_tag,
            created_at: epoch_millis(),
        };
        let position = state.children.partition_point(|c| c.index <= index);
        state.children.insert(position, record.clone());
        drop(state);

        metrics::record_child_registered();
        debug!(
            parent_id = %parent_id,
            child_id = %record.id,
            index,
            location = %display_tag(record.location_tag.as_ref()),
            "Child registered"
        );
        Ok(record)
    }

    /// Point-in-time copy of every group, ordered by parent id.
    ///
    /// Each group is copied under its own read lock, so every group is
    /// internally consistent; groups are not frozen relative to each other.
    pub async fn snapshot(&self) -> Vec<AffinityGroup> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for slot in self.slots() {
            let state = slot.state.read().await;
            if !state.removed {
                groups.push(state.to_group());
            }
        }
        groups.sort_by_key(|g| g.parent.id);
        groups
    }

    /// Remove a parent and all its children. Idempotent.
    ///
    /// Returns the removed group, or `None` if it was already gone.
    pub async fn deregister(&self, parent_id: ParentId) -> Option<AffinityGroup> {
        let (_, correlation_id) = self.parents.remove(&parent_id)?;
        let (_, slot) = self.groups.remove(&correlation_id)?;

        let mut state = slot.state.write().await;
        state.removed = true;
        let group = state.to_group();
        drop(state);

        metrics::set_groups_registered(self.groups.len());
        info!(
            parent_id = %parent_id,
            correlation_id = %correlation_id,
            children = group.children.len(),
            "Parent deregistered"
        );
        Some(group)
    }

    /// Remove a single child.
    pub async fn deregister_child(&self, parent_id: ParentId, child_id: ChildId) -> Result<ChildRecord> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let mut state = slot.state.write().await;
        let position = state
            .children
            .iter()
            .position(|c| c.id == child_id)
            .ok_or(AffinityError::UnknownChild { parent_id, child_id })?;
        let removed = state.children.remove(position);
        debug!(parent_id = %parent_id, child_id = %child_id, "Child deregistered");
        Ok(removed)
    }

    /// Copy of the group registered under `correlation_id`.
    pub async fn group(&self, correlation_id: &str) -> Option<AffinityGroup> {
        let slot = self.groups.get(correlation_id).map(|r| r.value().clone())?;
        let state = slot.state.read().await;
        (!state.removed).then(|| state.to_group())
    }

    /// Copy of the group owned by `parent_id`.
    pub async fn group_by_parent(&self, parent_id: ParentId) -> Option<AffinityGroup> {
        let slot = self.slot(parent_id)?;
        let state = slot.state.read().await;
        (!state.removed).then(|| state.to_group())
    }

    /// Copy of the parent record.
    pub async fn parent(&self, parent_id: ParentId) -> Option<ParentRecord> {
        let slot = self.slot(parent_id)?;
        let state = slot.state.read().await;
        (!state.removed).then(|| state.parent.clone())
    }

    /// Failover history of `parent_id`, oldest first.
    pub async fn history(&self, parent_id: ParentId) -> Result<Vec<FailoverEvent>> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let state = slot.state.read().await;
        Ok(state.history.clone())
    }

    /// Move the parent's monitor state along a valid edge.
    ///
    /// Returns the previous state.
    pub async fn set_state(&self, parent_id: ParentId, next: MonitorState) -> Result<MonitorState> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let mut state = slot.state.write().await;
        if state.removed {
            return Err(AffinityError::UnknownParent { parent_id });
        }
        let previous = state.parent.state;
        if !previous.can_transition_to(next) {
            return Err(AffinityError::InvalidTransition { from: previous, to: next });
        }
        state.parent.state = next;
        metrics::set_monitor_state(&state.parent.correlation_id, next);
        Ok(previous)
    }

    /// Replace the parent's location tag. Returns the previous tag.
    pub async fn update_parent_location(
        &self,
        parent_id: ParentId,
        location_tag: Option<LocationTag>,
    ) -> Result<Option<LocationTag>> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let mut state = slot.state.write().await;
        Ok(std::mem::replace(&mut state.parent.location_tag, location_tag))
    }

    /// Atomically move a CONNECTED parent from `expected` to `next`.
    ///
    /// Returns `false` (and changes nothing) if the parent is no longer
    /// CONNECTED or its tag is no longer `expected`.
    pub async fn compare_and_relocate(
        &self,
        parent_id: ParentId,
        expected: Option<&LocationTag>,
        next: LocationTag,
    ) -> Result<bool> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let mut state = slot.state.write().await;
        if state.removed
            || state.parent.state != MonitorState::Connected
            || state.parent.location_tag.as_ref() != expected
        {
            return Ok(false);
        }
        state.parent.location_tag = Some(next);
        Ok(true)
    }

    /// Write the tags observed by a coherence check back into the records.
    ///
    /// Children removed since the check are skipped.
    pub async fn apply_coherence(&self, parent_id: ParentId, report: &CoherenceReport) -> Result<()> {
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let mut state = slot.state.write().await;
        if report.parent_location_tag.is_some() {
            state.parent.location_tag = report.parent_location_tag.clone();
        }
        for result in &report.children {
            if let Some(child) = state.children.iter_mut().find(|c| c.id == result.child_id) {
                child.location_tag = result.location_tag.clone();
            }
        }
        Ok(())
    }

    /// Append to the parent's failover history.
    pub async fn record_event(&self, event: FailoverEvent) -> Result<()> {
        let parent_id = event.parent_id;
        let slot = self
            .slot(parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        slot.state.write().await.history.push(event);
        Ok(())
    }

    /// Ids of every registered parent.
    pub fn parent_ids(&self) -> Vec<ParentId> {
        let mut ids: Vec<ParentId> = self.parents.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, parent_id: ParentId) -> bool {
        self.parents.contains_key(&parent_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn slot(&self, parent_id: ParentId) -> Option<Arc<GroupSlot>> {
        let correlation_id = self.parents.get(&parent_id).map(|r| r.value().clone())?;
        self.groups.get(&correlation_id).map(|r| r.value().clone())
    }

    /// Clone the slot handles out so no shard lock is held across awaits.
    fn slots(&self) -> Vec<Arc<GroupSlot>> {
        self.groups.iter().map(|r| r.value().clone()).collect()
    }
}

/// Get current epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
