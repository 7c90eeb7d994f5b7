//! Shared test utilities for scenario and chaos tests.
//!
//! This module provides:
//! - A scriptable [`MockHandle`] whose location follows a shared node cell
//! - A [`MockInspector`] returning canned node-side channel listings
//! - Engine, event and log helpers

pub mod mock_handle;
pub mod mock_inspector;

pub use mock_handle::*;
pub use mock_inspector::*;

use affinity_engine::{AffinityConfig, AffinityEngine, FailoverEvent};
use std::time::Duration;
use tokio::sync::broadcast;

/// Route engine logs to the test harness. Set `RUST_LOG=affinity_engine=debug`
/// to see monitor transitions.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine with fast reconnection budgets.
#[allow(dead_code)]
pub fn test_engine(name: &str) -> AffinityEngine {
    init_tracing();
    AffinityEngine::new(AffinityConfig::for_testing(name)).expect("valid test config")
}

/// Wait for the next failover event, failing the test after `secs` seconds.
#[allow(dead_code)]
pub async fn next_event(rx: &mut broadcast::Receiver<FailoverEvent>, secs: u64) -> FailoverEvent {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("timed out waiting for failover event")
        .expect("event channel closed")
}
