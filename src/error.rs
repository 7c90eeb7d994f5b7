// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the affinity engine.
//!
//! Only contract violations surface as errors. Location resolution and
//! failure classification never fail: they degrade to
//! [`Resolution::Unknown`](crate::location::Resolution::Unknown) and a
//! non-retryable classification respectively, because speculative resolution
//! is expected to come up empty on some client profiles.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `DuplicateCorrelationId` | No | Correlation id already registered |
//! | `UnknownParent` | No | Parent id not (or no longer) registered |
//! | `UnknownChild` | No | Child id not registered under that parent |
//! | `InvalidTransition` | No | Monitor state machine violation |
//! | `Config` | No | Configuration invalid |
//! | `Handle` | Yes | Transport handle operation failed |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | A blocking handle task panicked or was cancelled |

use crate::monitor::MonitorState;
use crate::registry::{ChildId, ParentId};
use thiserror::Error;

/// Result type alias for affinity operations.
pub type Result<T> = std::result::Result<T, AffinityError>;

/// Errors surfaced to callers of the registry, monitors and engine.
#[derive(Error, Debug)]
pub enum AffinityError {
    /// A group with this correlation id is already registered.
    ///
    /// The existing group is left untouched.
    #[error("Correlation id already registered: {correlation_id}")]
    DuplicateCorrelationId { correlation_id: String },

    /// No parent with this id is registered.
    #[error("Unknown parent: {parent_id}")]
    UnknownParent { parent_id: ParentId },

    /// No child with this id is registered under the parent.
    #[error("Unknown child {child_id} under parent {parent_id}")]
    UnknownChild { parent_id: ParentId, child_id: ChildId },

    /// Monitor state machine violation.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: MonitorState, to: MonitorState },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transport handle operation failed.
    ///
    /// Never produced by location resolution, only by explicit handle calls
    /// such as reconnection probes. The monitor records the message as the
    /// episode's `last_probe_error`.
    #[error("Handle error ({handle}): {message}")]
    Handle { handle: String, message: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AffinityError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handle { .. } => true,
            Self::DuplicateCorrelationId { .. } => false,
            Self::UnknownParent { .. } => false,
            Self::UnknownChild { .. } => false,
            Self::InvalidTransition { .. } => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateCorrelationId { .. } => "duplicate_correlation_id",
            Self::UnknownParent { .. } => "unknown_parent",
            Self::UnknownChild { .. } => "unknown_child",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Config(_) => "config",
            Self::Handle { .. } => "handle",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
