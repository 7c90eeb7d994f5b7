//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Registered groups and children
//! - Location resolution by tier
//! - Failure signals and reconnection probes
//! - Failover outcomes and recovery time
//! - Coherence checks
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `affinity_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! The crate only records through the `metrics` facade; installing an
//! exporter is up to the application.
//!
//! # Usage
//!
//! ```rust,no_run
//! use affinity_engine::metrics;
//! use std::time::Duration;
//!
//! // In the monitor after a probe
//! metrics::record_probe_attempt(false);
//!
//! // After an episode completes
//! metrics::record_failover("recovered", Some(Duration::from_millis(850)));
//! ```

use crate::location::ExtractionTier;
use crate::monitor::MonitorState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Set the number of registered groups.
pub fn set_groups_registered(count: usize) {
    gauge!("affinity_groups_registered").set(count as f64);
}

/// Record a child registration.
pub fn record_child_registered() {
    counter!("affinity_children_registered_total").increment(1);
}

/// Record a location resolution. `None` means every tier came up empty.
pub fn record_resolution(tier: Option<ExtractionTier>) {
    let tier = tier.map(|t| t.as_str()).unwrap_or("unknown");
    counter!("affinity_resolutions_total", "tier" => tier).increment(1);
}

/// Record an incoming failure signal and how it was classified.
pub fn record_failure_signal(code: &str, retryable: bool) {
    let retryable = if retryable { "true" } else { "false" };
    counter!(
        "affinity_failure_signals_total",
        "code" => code.to_string(),
        "retryable" => retryable
    )
    .increment(1);
}

/// Record a signal that never started an episode.
pub fn record_signal_dropped(reason: &str) {
    counter!("affinity_failure_signals_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a monitor state change.
///
/// Encoded as a number (see [`MonitorState::as_gauge`]) so it can be graphed.
pub fn set_monitor_state(correlation_id: &str, state: MonitorState) {
    gauge!("affinity_monitor_state", "correlation_id" => correlation_id.to_string())
        .set(state.as_gauge());
}

/// Record a reconnection probe.
pub fn record_probe_attempt(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("affinity_probe_attempts_total", "outcome" => outcome).increment(1);
}

/// Record a completed failover episode.
pub fn record_failover(outcome: &str, recovery: Option<Duration>) {
    counter!("affinity_failovers_total", "outcome" => outcome.to_string()).increment(1);
    if let Some(duration) = recovery {
        histogram!("affinity_failover_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Record a coherence check.
pub fn record_coherence_check(coherent: bool, verified: usize, inherited: usize) {
    let result = if coherent { "coherent" } else { "incoherent" };
    counter!("affinity_coherence_checks_total", "result" => result).increment(1);
    counter!("affinity_coherence_children_total", "mode" => "verified").increment(verified as u64);
    counter!("affinity_coherence_children_total", "mode" => "inherited").increment(inherited as u64);
}

/// Record a silent relocation found by a sweep.
pub fn record_silent_relocation() {
    counter!("affinity_silent_relocations_total").increment(1);
}

/// Record engine state.
pub fn set_engine_state(state: &str) {
    // Map state to numeric value for easier alerting
    let value = match state {
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("affinity_engine_state").set(value);
}
