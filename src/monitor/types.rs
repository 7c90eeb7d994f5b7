//! Failover monitor state machine and episode records.
//!
//! # State Transitions
//!
//! ```text
//!                 failure signal
//! CONNECTED ───────────────────────→ SUSPECT
//!    ↑  │                               │
//!    │  │ silent relocation     retryable│ non-retryable
//!    │  └──→ CONNECTED                  ↓         │
//!    │                           RECONNECTING     │
//!    │                           │          │     │
//!    │               probe ok    │          │ budget exhausted
//!    │                           ↓          ↓     ↓
//!    └──────── coherence ─── RECONNECTED   FAILED (sticky)
//! ```
//!
//! # State Descriptions
//!
//! - **CONNECTED**: Steady state. Every child is expected to share the parent's tag.
//! - **SUSPECT**: A failure signal arrived and is being classified.
//! - **RECONNECTING**: Bounded probe loop in progress.
//! - **RECONNECTED**: A probe succeeded; the parent tag is being re-resolved and
//!   the group checked for coherence.
//! - **FAILED**: Terminal for the episode. Further signals are ignored; recovery
//!   is the caller's job (deregister and recreate the parent).

use crate::location::LocationTag;
use crate::registry::ParentId;
use crate::verifier::CoherenceReport;
use serde::Serialize;
use std::fmt;

/// State of a parent's failover monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Connected,
    Suspect,
    Reconnecting,
    Reconnected,
    Failed,
}

impl MonitorState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: MonitorState) -> bool {
        use MonitorState::*;
        matches!(
            (self, next),
            (Connected, Suspect)
                | (Connected, Connected)
                | (Suspect, Reconnecting)
                | (Suspect, Failed)
                | (Reconnecting, Reconnected)
                | (Reconnecting, Failed)
                | (Reconnected, Connected)
        )
    }

    /// Whether an episode is in progress.
    pub fn is_recovering(self) -> bool {
        matches!(
            self,
            MonitorState::Suspect | MonitorState::Reconnecting | MonitorState::Reconnected
        )
    }

    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            MonitorState::Connected => 0.0,
            MonitorState::Suspect => 1.0,
            MonitorState::Reconnecting => 2.0,
            MonitorState::Reconnected => 3.0,
            MonitorState::Failed => 4.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MonitorState::Connected => "CONNECTED",
            MonitorState::Suspect => "SUSPECT",
            MonitorState::Reconnecting => "RECONNECTING",
            MonitorState::Reconnected => "RECONNECTED",
            MonitorState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure notification from the transport, queued for the monitor worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSignal {
    pub code: String,
    pub message: String,
    /// Epoch millis at enqueue time.
    pub received_at: u64,
}

/// Why an episode ended in FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The triggering code is non-retryable (or unknown).
    NonRetryable,
    /// The code was retryable but the reconnect policy is disabled.
    ReconnectDisabled,
    /// The probe budget ran out.
    ReconnectionTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NonRetryable => write!(f, "non_retryable"),
            FailureReason::ReconnectDisabled => write!(f, "reconnect_disabled"),
            FailureReason::ReconnectionTimeout => write!(f, "reconnection_timeout"),
        }
    }
}

/// Outcome of a recorded failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum FailoverOutcome {
    /// A probe succeeded and the group was re-verified.
    Recovered,
    /// The episode ended in FAILED.
    Failed(FailureReason),
    /// The parent moved without any failure signal (found by a sweep).
    SilentRelocation,
}

impl FailoverOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, FailoverOutcome::Failed(_))
    }

    /// Label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailoverOutcome::Recovered => "recovered",
            FailoverOutcome::Failed(_) => "failed",
            FailoverOutcome::SilentRelocation => "silent_relocation",
        }
    }
}

/// One entry of a parent's append-only failover history.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub parent_id: ParentId,
    pub correlation_id: String,
    pub previous_location_tag: Option<LocationTag>,
    pub new_location_tag: Option<LocationTag>,
    /// Epoch millis of the triggering signal.
    pub detected_at: u64,
    /// Epoch millis of recovery; `None` when the episode failed.
    pub recovered_at: Option<u64>,
    pub outcome: FailoverOutcome,
    /// Code of the triggering signal.
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Last probe error seen before the budget ran out.
    pub last_probe_error: Option<String>,
    pub probe_attempts: u32,
    /// States visited during the episode, in order, starting at CONNECTED.
    pub transitions: Vec<MonitorState>,
    /// Signals folded into this episode after the triggering one.
    pub coalesced_signals: u32,
    /// Coherence check run after recovery.
    pub coherence: Option<CoherenceReport>,
}

impl FailoverEvent {
    /// Whether the parent ended up on a different location.
    pub fn relocated(&self) -> bool {
        match (&self.previous_location_tag, &self.new_location_tag) {
            (Some(prev), Some(new)) => prev != new,
            _ => false,
        }
    }

    /// Episode duration in millis, when the episode recovered.
    pub fn recovery_millis(&self) -> Option<u64> {
        self.recovered_at.map(|r| r.saturating_sub(self.detected_at))
    }
}
