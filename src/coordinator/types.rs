//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!   new()            shutdown()                 monitors drained
//! ────────→ Running ────────────→ ShuttingDown ──────────────────→ Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Running**: Registrations accepted, monitors react to failure signals.
//! - **ShuttingDown**: `shutdown()` called. Monitors are being cancelled and drained.
//! - **Stopped**: Every monitor has exited. Queries still work; mutations
//!   return [`AffinityError::Shutdown`](crate::error::AffinityError::Shutdown).

use crate::location::LocationTag;
use crate::monitor::MonitorState;
use crate::registry::ParentId;
use serde::Serialize;

/// State of the affinity engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Accepting registrations and failure signals.
    Running,

    /// Shutting down gracefully.
    ///
    /// Monitor workers are being cancelled and awaited.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped. Safe to drop.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// One-line view of a group for listings and health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub correlation_id: String,
    pub parent_id: ParentId,
    pub application_tag: String,
    pub state: MonitorState,
    pub location_tag: Option<LocationTag>,
    pub children: usize,
    /// Whether every child currently carries the parent's tag.
    pub coherent: bool,
    /// Recorded failover events.
    pub failovers: usize,
}

/// Health status of the engine.
///
/// Built from registry state only; no handle is touched.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Engine is accepting registrations.
    pub ready: bool,
    /// Ready, and no group is FAILED or incoherent.
    pub healthy: bool,
    pub groups_total: usize,
    pub groups_connected: usize,
    /// Groups with an episode in progress.
    pub groups_recovering: usize,
    pub groups_failed: usize,
    pub groups_incoherent: usize,
    pub groups: Vec<GroupSummary>,
}
