// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Affinity engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Group storage via [`crate::registry::AffinityRegistry`]
//! - Per-parent failover monitors via [`crate::monitor::FailoverMonitor`]
//! - Coherence checks via [`crate::verifier::CoherenceVerifier`]
//! - Node-side cross-checks via [`crate::diagnostics`]
//!
//! # Architecture
//!
//! The engine is constructed once per process and shared by reference. It:
//! 1. Registers parents (spawning one monitor worker each) and children
//! 2. Routes transport failure callbacks to the right monitor (enqueue only)
//! 3. Serves read-only queries: groups, snapshots, history, health
//! 4. Sweeps for silent relocations on request
//! 5. Cancels and drains every monitor on shutdown

mod types;

pub use types::{EngineState, GroupSummary, HealthCheck};

use crate::classification::ClassificationTable;
use crate::config::AffinityConfig;
use crate::diagnostics::{self, CrossCheckReport, NodeInspector};
use crate::error::{AffinityError, Result};
use crate::extractor::MetadataExtractor;
use crate::handle::HandleRef;
use crate::location::display_tag;
use crate::metrics;
use crate::monitor::{FailoverEvent, FailoverMonitor, FailoverOutcome, MonitorContext, MonitorState};
use crate::registry::{epoch_millis, AffinityGroup, AffinityRegistry, ChildId, ChildRecord, ParentId, ParentRecord};
use crate::resilience::BackoffConfig;
use crate::verifier::{CoherenceReport, CoherenceVerifier};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Capacity of the failover event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The affinity engine.
///
/// Owns the registry and one monitor per registered parent.
pub struct AffinityEngine {
    config: AffinityConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    registry: Arc<AffinityRegistry>,

    /// Shared by every monitor worker
    monitor_ctx: Arc<MonitorContext>,

    /// Live monitors, keyed by parent
    monitors: DashMap<ParentId, FailoverMonitor>,
}

impl AffinityEngine {
    /// Create an engine with the default extractor for `config.extraction`.
    pub fn new(config: AffinityConfig) -> Result<Self> {
        let extractor = Arc::new(MetadataExtractor::new(config.extraction.clone()));
        Self::with_extractor(config, extractor)
    }

    /// Create an engine with a caller-built extractor (e.g. extra profile adapters).
    pub fn with_extractor(config: AffinityConfig, extractor: Arc<MetadataExtractor>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(AffinityRegistry::new(
            Arc::clone(&extractor),
            config.application_name.clone(),
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let monitor_ctx = Arc::new(MonitorContext {
            registry: Arc::clone(&registry),
            verifier: CoherenceVerifier::new(extractor),
            classification: ClassificationTable::with_overrides(&config.classification),
            backoff: BackoffConfig::from(&config.reconnect),
            reconnect_enabled: config.reconnect.enabled,
            events,
        });
        let (state_tx, state_rx) = watch::channel(EngineState::Running);
        metrics::set_engine_state("Running");

        info!(
            application = %config.application_name,
            cluster_members = config.cluster.members.len(),
            reconnect = config.reconnect.enabled,
            "Affinity engine running"
        );

        Ok(Self {
            config,
            state_tx,
            state_rx,
            registry,
            monitor_ctx,
            monitors: DashMap::new(),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn config(&self) -> &AffinityConfig {
        &self.config
    }

    /// The underlying registry (for diagnostics and direct queries).
    pub fn registry(&self) -> &Arc<AffinityRegistry> {
        &self.registry
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Registration
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a parent connection and start its failover monitor.
    ///
    /// Must be called from within a tokio runtime. If shutdown begins while
    /// the parent is being registered, the parent is removed again and
    /// [`AffinityError::Shutdown`] is returned.
    pub async fn register_parent(
        &self,
        handle: HandleRef,
        correlation_id: &str,
        application_tag: &str,
    ) -> Result<ParentRecord> {
        self.ensure_running()?;

        let record = self
            .registry
            .register_parent(handle, correlation_id, application_tag)
            .await?;
        let monitor = FailoverMonitor::spawn(
            Arc::clone(&self.monitor_ctx),
            record.id,
            correlation_id,
            self.config.monitor.signal_queue_capacity,
        );
        self.monitors.insert(record.id, monitor);

        // Lost a race with shutdown(): it may have drained before our insert.
        if !self.is_running() {
            if let Some((_, monitor)) = self.monitors.remove(&record.id) {
                monitor.cancel();
            }
            self.registry.deregister(record.id).await;
            debug!(parent_id = %record.id, "Registration raced shutdown, parent removed");
            return Err(AffinityError::Shutdown);
        }
        Ok(record)
    }

    /// Register a child session under an existing parent.
    pub async fn register_child(
        &self,
        parent_id: ParentId,
        handle: HandleRef,
        index: u32,
    ) -> Result<ChildRecord> {
        self.ensure_running()?;
        self.registry.register_child(parent_id, handle, index).await
    }

    /// Stop the parent's monitor, then remove the parent and its children.
    ///
    /// Idempotent: returns `None` if the parent was already gone.
    pub async fn deregister(&self, parent_id: ParentId) -> Option<AffinityGroup> {
        if let Some((_, monitor)) = self.monitors.remove(&parent_id) {
            monitor.stop(self.config.monitor.drain_timeout()).await;
        }
        self.registry.deregister(parent_id).await
    }

    /// Remove a single child.
    pub async fn deregister_child(&self, parent_id: ParentId, child_id: ChildId) -> Result<ChildRecord> {
        self.registry.deregister_child(parent_id, child_id).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Failure signals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Transport failure callback: enqueue a signal for the parent's monitor
    /// and return immediately.
    ///
    /// Returns `Ok(false)` if the signal was dropped because the monitor's
    /// queue was full.
    pub fn on_failure(&self, parent_id: ParentId, code: &str, message: &str) -> Result<bool> {
        self.ensure_running()?;
        let monitor = self
            .monitors
            .get(&parent_id)
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        Ok(monitor.signal(code, message))
    }

    /// Subscribe to every failover event recorded from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FailoverEvent> {
        self.monitor_ctx.events.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_group(&self, correlation_id: &str) -> Option<AffinityGroup> {
        self.registry.group(correlation_id).await
    }

    /// Summaries of every group, ordered by parent id.
    pub async fn list_groups(&self) -> Vec<GroupSummary> {
        let mut summaries = Vec::new();
        for group in self.registry.snapshot().await {
            let failovers = self
                .registry
                .history(group.parent.id)
                .await
                .map(|h| h.len())
                .unwrap_or(0);
            summaries.push(GroupSummary {
                correlation_id: group.parent.correlation_id.clone(),
                parent_id: group.parent.id,
                application_tag: group.parent.application_tag.clone(),
                state: group.parent.state,
                location_tag: group.parent.location_tag.clone(),
                children: group.children.len(),
                coherent: group.is_coherent(),
                failovers,
            });
        }
        summaries
    }

    pub async fn get_failover_history(&self, parent_id: ParentId) -> Result<Vec<FailoverEvent>> {
        self.registry.history(parent_id).await
    }

    /// Point-in-time copy of every group.
    pub async fn snapshot(&self) -> Vec<AffinityGroup> {
        self.registry.snapshot().await
    }

    pub async fn monitor_state(&self, parent_id: ParentId) -> Option<MonitorState> {
        self.registry.parent(parent_id).await.map(|p| p.state)
    }

    /// Run a coherence check on a group now. Read-only: records are not updated.
    pub async fn verify(&self, correlation_id: &str) -> Option<CoherenceReport> {
        let group = self.registry.group(correlation_id).await?;
        match self.monitor_ctx.verifier.verify_async(group).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(correlation_id, error = %e, "Coherence check failed");
                None
            }
        }
    }

    /// Compare a group with its node's own view of active channels.
    pub async fn cross_check(
        &self,
        correlation_id: &str,
        inspector: &dyn NodeInspector,
    ) -> Option<CrossCheckReport> {
        let group = self.registry.group(correlation_id).await?;
        Some(diagnostics::cross_check(&group, inspector).await)
    }

    /// Get health status for monitoring endpoints.
    ///
    /// **Performance**: This method performs no handle I/O. All data is
    /// collected from registry state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let groups = self.list_groups().await;

        let count = |s: MonitorState| groups.iter().filter(|g| g.state == s).count();
        let groups_connected = count(MonitorState::Connected);
        let groups_failed = count(MonitorState::Failed);
        let groups_recovering = groups.iter().filter(|g| g.state.is_recovering()).count();
        let groups_incoherent = groups
            .iter()
            .filter(|g| g.state == MonitorState::Connected && !g.coherent)
            .count();

        let ready = state == EngineState::Running;
        let healthy = ready && groups_failed == 0 && groups_incoherent == 0;

        HealthCheck {
            state,
            ready,
            healthy,
            groups_total: groups.len(),
            groups_connected,
            groups_recovering,
            groups_failed,
            groups_incoherent,
            groups,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Silent relocation sweep
    // ═══════════════════════════════════════════════════════════════════════════

    /// Re-resolve every CONNECTED parent and record a `SilentRelocation`
    /// event for each one whose known tag changed without a failure signal.
    ///
    /// Transparent client reconnects can move a connection to another node
    /// without reporting an error; call this periodically to catch them.
    pub async fn sweep_relocations(&self) -> Result<Vec<FailoverEvent>> {
        self.ensure_running()?;

        let mut events = Vec::new();
        for parent_id in self.registry.parent_ids() {
            match self.sweep_parent(parent_id).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    // Deregistered or mid-episode; the monitor owns it now.
                    debug!(parent_id = %parent_id, error = %e, "Skipping parent in sweep");
                }
            }
        }
        Ok(events)
    }

    async fn sweep_parent(&self, parent_id: ParentId) -> Result<Option<FailoverEvent>> {
        let Some(parent) = self.registry.parent(parent_id).await else {
            return Ok(None);
        };
        if parent.state != MonitorState::Connected {
            return Ok(None);
        }

        let Some(current) = self
            .registry
            .extractor()
            .resolve_async(&parent.handle)
            .await
            .into_tag()
        else {
            return Ok(None);
        };
        if parent.location_tag.as_ref() == Some(&current) {
            return Ok(None);
        }

        let moved = self
            .registry
            .compare_and_relocate(parent_id, parent.location_tag.as_ref(), current.clone())
            .await?;
        if !moved {
            debug!(parent_id = %parent_id, "Parent changed during sweep, skipping");
            return Ok(None);
        }
        let Some(previous) = parent.location_tag.clone() else {
            // First successful resolution, not a relocation.
            debug!(parent_id = %parent_id, location = %current, "Parent location resolved");
            return Ok(None);
        };

        let group = self
            .registry
            .group_by_parent(parent_id)
            .await
            .ok_or(AffinityError::UnknownParent { parent_id })?;
        let report = self.monitor_ctx.verifier.verify_async(group).await?;
        self.registry.apply_coherence(parent_id, &report).await?;
        self.registry.set_state(parent_id, MonitorState::Connected).await?;

        warn!(
            parent_id = %parent_id,
            correlation_id = %parent.correlation_id,
            from = %previous,
            to = %display_tag(report.parent_location_tag.as_ref()),
            coherent = report.all_coherent,
            "Silent relocation detected"
        );
        metrics::record_silent_relocation();
        metrics::record_failover(FailoverOutcome::SilentRelocation.label(), None);

        let now = epoch_millis();
        let event = FailoverEvent {
            parent_id,
            correlation_id: parent.correlation_id.clone(),
            previous_location_tag: Some(previous),
            new_location_tag: report.parent_location_tag.clone(),
            detected_at: now,
            recovered_at: Some(now),
            outcome: FailoverOutcome::SilentRelocation,
            error_code: None,
            error_message: None,
            last_probe_error: None,
            probe_attempts: 0,
            transitions: vec![MonitorState::Connected, MonitorState::Connected],
            coalesced_signals: 0,
            coherence: Some(report),
        };
        self.registry.record_event(event.clone()).await?;
        // No subscribers is fine.
        let _ = self.monitor_ctx.events.send(event.clone());
        Ok(Some(event))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Stop accepting registrations and signals
    /// 2. Cancel every monitor (interrupting probe loops)
    /// 3. Wait for each worker to exit (with drain timeout)
    ///
    /// Registry contents stay queryable afterwards.
    pub async fn shutdown(&self) {
        if self.state() != EngineState::Running {
            return;
        }
        info!("Shutting down affinity engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let parent_ids: Vec<ParentId> = self.monitors.iter().map(|r| *r.key()).collect();
        let monitors: Vec<FailoverMonitor> = parent_ids
            .into_iter()
            .filter_map(|id| self.monitors.remove(&id).map(|(_, m)| m))
            .collect();

        let task_count = monitors.len();
        if task_count > 0 {
            info!(task_count, "Waiting for monitors to drain");
        }

        // Cancel all first so they wind down in parallel.
        for monitor in &monitors {
            monitor.cancel();
        }
        let drain_timeout = self.config.monitor.drain_timeout();
        let results =
            futures::future::join_all(monitors.into_iter().map(|m| m.stop(drain_timeout))).await;
        let timed_out = results.iter().filter(|stopped| !**stopped).count();
        if timed_out > 0 {
            warn!(timed_out, "Some monitors were aborted during shutdown");
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Affinity engine stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            _ => Err(AffinityError::Shutdown),
        }
    }
}
