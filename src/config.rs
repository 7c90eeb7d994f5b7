//! Configuration for the affinity engine.
//!
//! Configuration is passed to [`AffinityEngine::new()`](crate::AffinityEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use affinity_engine::config::AffinityConfig;
//!
//! let config = AffinityConfig {
//!     application_name: "orders-service".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! AffinityConfig
//! ├── application_name: String        # Identity attached to every parent record
//! ├── cluster: ClusterConfig          # Passed through to the transport, never read here
//! ├── reconnect: ReconnectPolicy      # Bounded reconnection polling
//! ├── extraction: ExtractionConfig    # Location resolution tiers
//! ├── monitor: MonitorConfig          # Per-parent worker settings
//! └── classification: Vec<ClassificationEntry>  # Overrides for the failure table
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! application_name: "orders-service"
//!
//! cluster:
//!   members:
//!     - name: "QM1"
//!       endpoint: "10.10.10.10(1414)"
//!
//! reconnect:
//!   enabled: true
//!   max_duration: "120s"
//!   backoff_base: "1s"
//!   max_backoff: "30s"
//!
//! classification:
//!   - code: "MQRC_SSL_INITIALIZATION_ERROR"
//!     retryable: false
//! ```

use crate::error::{AffinityError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to AffinityEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `AffinityEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Application identity attached to each parent record, for correlation
    /// with node-side diagnostics.
    pub application_name: String,

    /// Cluster membership. Only the transport layer interprets this.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Reconnection policy for failover monitors.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Location extraction settings.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Failover monitor worker settings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Additional or overriding failure classifications.
    #[serde(default)]
    pub classification: Vec<ClassificationEntry>,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            application_name: "affinity-engine".to_string(),
            cluster: ClusterConfig::default(),
            reconnect: ReconnectPolicy::default(),
            extraction: ExtractionConfig::default(),
            monitor: MonitorConfig::default(),
            classification: Vec::new(),
        }
    }
}

impl AffinityConfig {
    /// Create a config with fast reconnection budgets for tests.
    pub fn for_testing(application_name: &str) -> Self {
        Self {
            application_name: application_name.to_string(),
            reconnect: ReconnectPolicy::testing(),
            ..Default::default()
        }
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.application_name.trim().is_empty() {
            return Err(AffinityError::Config("application_name is empty".to_string()));
        }
        if self.reconnect.backoff_factor < 1.0 || !self.reconnect.backoff_factor.is_finite() {
            return Err(AffinityError::Config(format!(
                "reconnect.backoff_factor must be >= 1.0, got {}",
                self.reconnect.backoff_factor
            )));
        }
        if self.reconnect.enabled && self.reconnect.max_duration().is_zero() {
            return Err(AffinityError::Config(
                "reconnect.max_duration must be non-zero when reconnect is enabled".to_string(),
            ));
        }
        if self.monitor.signal_queue_capacity == 0 {
            return Err(AffinityError::Config(
                "monitor.signal_queue_capacity must be non-zero".to_string(),
            ));
        }
        if self.extraction.property_keys.is_empty() {
            return Err(AffinityError::Config(
                "extraction.property_keys must name at least one key".to_string(),
            ));
        }
        for entry in &self.classification {
            if entry.code.trim().is_empty() {
                return Err(AffinityError::Config(
                    "classification entry with empty code".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: opaque to this crate
// ═══════════════════════════════════════════════════════════════════════════════

/// Cluster membership description handed to the transport factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

/// One backend node as the transport layer addresses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub endpoint: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconnectPolicy: bounded reconnection polling
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconnection policy for failover monitors.
///
/// Durations are humantime strings (`"120s"`, `"500ms"`), parsed on access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Whether monitors poll for reconnection at all. When disabled, every
    /// failure signal ends the episode in `FAILED`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Total polling budget per episode.
    #[serde(default = "default_max_duration")]
    pub max_duration: String,

    /// Delay after the first failed probe.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    /// Ceiling for the exponential backoff.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// Backoff multiplier (e.g., 2.0 = double delay each probe).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_true() -> bool {
    true
}

fn default_max_duration() -> String {
    "120s".to_string()
}

fn default_backoff_base() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_duration: default_max_duration(),
            backoff_base: default_backoff_base(),
            max_backoff: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReconnectPolicy {
    /// Fast-fail policy for tests.
    pub fn testing() -> Self {
        Self {
            enabled: true,
            max_duration: "500ms".to_string(),
            backoff_base: "10ms".to_string(),
            max_backoff: "50ms".to_string(),
            backoff_factor: 2.0,
        }
    }

    /// Reconnection turned off: failures go straight to `FAILED`.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Parse `max_duration` to a Duration.
    pub fn max_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_duration).unwrap_or(Duration::from_secs(120))
    }

    /// Parse `backoff_base` to a Duration.
    pub fn backoff_base(&self) -> Duration {
        humantime::parse_duration(&self.backoff_base).unwrap_or(Duration::from_secs(1))
    }

    /// Parse `max_backoff` to a Duration.
    pub fn max_backoff(&self) -> Duration {
        humantime::parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ExtractionConfig: location resolution tiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Location extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Tier 1 property keys, in preference order.
    #[serde(default = "default_property_keys")]
    pub property_keys: Vec<String>,

    /// Tier 2 maximum walk depth from the root object.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Tier 2 field-name substrings (matched case-insensitively).
    #[serde(default = "default_field_needles")]
    pub field_needles: Vec<String>,
}

fn default_property_keys() -> Vec<String> {
    vec![
        "XMSC_WMQ_RESOLVED_CONNECTION_TAG".to_string(),
        "JMS_IBM_CONNECTION_TAG".to_string(),
        "XMSC_WMQ_CONNECTION_TAG".to_string(),
    ]
}

fn default_max_depth() -> usize {
    4
}

fn default_field_needles() -> Vec<String> {
    vec!["tag".to_string(), "node".to_string(), "conn".to_string()]
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            property_keys: default_property_keys(),
            max_depth: default_max_depth(),
            field_needles: default_field_needles(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MonitorConfig / ClassificationEntry
// ═══════════════════════════════════════════════════════════════════════════════

/// Failover monitor worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Capacity of each monitor's failure-signal queue. Signals arriving
    /// while the queue is full are dropped (an episode is already pending).
    #[serde(default = "default_signal_queue_capacity")]
    pub signal_queue_capacity: usize,

    /// How long `shutdown()` waits for each monitor worker to exit.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_signal_queue_capacity() -> usize {
    16
}

fn default_drain_timeout() -> String {
    "5s".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            signal_queue_capacity: default_signal_queue_capacity(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl MonitorConfig {
    /// Parse `drain_timeout` to a Duration.
    pub fn drain_timeout(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// One failure classification override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationEntry {
    pub code: String,
    pub retryable: bool,
}
