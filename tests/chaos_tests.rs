// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or cross-group interference.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use affinity_engine::{
    AffinityError, FailoverOutcome, FailureReason, HandleRef, MonitorState, ResolutionMode,
};
use common::{next_event, test_engine, MockHandle, NodeCell};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;

// =============================================================================
// Concurrent Registration
// =============================================================================

/// Test: Many groups registered from many tasks end up complete and separate
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_keeps_groups_separate() {
    let engine = Arc::new(test_engine("chaos-register"));

    let mut handles = Vec::new();
    for g in 0..16 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let cell = NodeCell::new(&format!("QM{g}@1"));
            let conn = MockHandle::new(&format!("conn-{g}"), &cell);
            let parent = engine
                .register_parent(conn as HandleRef, &format!("group-{g}"), "CHAOS")
                .await
                .unwrap();
            for i in 0..10u32 {
                let session = MockHandle::new(&format!("s-{g}-{i}"), &cell);
                engine
                    .register_child(parent.id, session as HandleRef, i)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.expect("registration task panicked");
    }

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.len(), 16);
    for group in &snapshot {
        assert_eq!(group.children.len(), 10);
        assert!(group.is_coherent());
        assert!(group.children.iter().all(|c| c.parent_id == group.parent.id));
    }
    engine.shutdown().await;
}

/// Test: Racing registrations of one correlation id admit exactly one
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_registration_race_admits_one() {
    let engine = Arc::new(test_engine("chaos-dupes"));
    let cell = NodeCell::new("QM1@1");

    let mut handles = Vec::new();
    for n in 0..8 {
        let engine = Arc::clone(&engine);
        let cell = cell.clone();
        handles.push(tokio::spawn(async move {
            let conn = MockHandle::new(&format!("conn-{n}"), &cell);
            engine.register_parent(conn as HandleRef, "contested", "CHAOS").await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(AffinityError::DuplicateCorrelationId { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(engine.snapshot().await.len(), 1);
    engine.shutdown().await;
}

// =============================================================================
// Misbehaving Handles
// =============================================================================

/// Test: A panicking child is reported unresolved instead of taking the engine down
#[tokio::test]
async fn panicking_child_is_unresolved() {
    let engine = test_engine("chaos-panic-child");
    let cell = NodeCell::new("QM1@1");
    let conn = MockHandle::new("conn", &cell);
    let parent = engine.register_parent(conn as HandleRef, "g1", "CHAOS").await.unwrap();
    let healthy = MockHandle::new("healthy", &cell);
    let broken = MockHandle::new("broken", &cell);
    engine.register_child(parent.id, healthy as HandleRef, 0).await.unwrap();
    let broken_child = engine
        .register_child(parent.id, broken.clone() as HandleRef, 1)
        .await
        .unwrap();

    broken.poison();
    let report = engine.verify("g1").await.unwrap();
    assert!(!report.all_coherent);
    let entry = report
        .children
        .iter()
        .find(|c| c.child_id == broken_child.id)
        .unwrap();
    assert_eq!(entry.mode, ResolutionMode::Unresolved);
    assert!(entry.location_tag.is_none());
    assert_eq!(report.incoherent().count(), 1);
    engine.shutdown().await;
}

/// Test: A parent whose probe panics exhausts its budget and fails cleanly
#[tokio::test]
async fn panicking_probe_fails_episode() {
    let engine = test_engine("chaos-panic-probe");
    let mut events = engine.subscribe_events();
    let cell = NodeCell::new("QM1@1");
    let conn = MockHandle::new("conn", &cell);
    let parent = engine.register_parent(conn.clone() as HandleRef, "g1", "CHAOS").await.unwrap();

    conn.poison();
    engine.on_failure(parent.id, "2009", "").unwrap();

    let event = next_event(&mut events, 5).await;
    assert_eq!(
        event.outcome,
        FailoverOutcome::Failed(FailureReason::ReconnectionTimeout)
    );
    let last_error = event.last_probe_error.unwrap_or_default();
    assert!(last_error.starts_with("Handle error"), "{last_error}");
    assert!(last_error.ends_with("probe panicked"), "{last_error}");

    // The engine is still serving other work.
    let other = NodeCell::new("QM2@1");
    engine
        .register_parent(MockHandle::new("conn-2", &other) as HandleRef, "g2", "CHAOS")
        .await
        .unwrap();
    assert_eq!(engine.snapshot().await.len(), 2);
    engine.shutdown().await;
}

/// Test: Handles closed mid-episode never produce a location
#[tokio::test]
async fn closed_handle_never_recovers() {
    let engine = test_engine("chaos-closed");
    let mut events = engine.subscribe_events();
    let cell = NodeCell::new("QM1@1");
    let conn = MockHandle::new("conn", &cell);
    let parent = engine.register_parent(conn.clone() as HandleRef, "g1", "CHAOS").await.unwrap();

    conn.close();
    engine.on_failure(parent.id, "MQRC_CONNECTION_BROKEN", "").unwrap();

    let event = next_event(&mut events, 5).await;
    assert_eq!(
        event.outcome,
        FailoverOutcome::Failed(FailureReason::ReconnectionTimeout)
    );
    let last_error = event.last_probe_error.unwrap_or_default();
    assert!(last_error.ends_with("location unknown after probe"), "{last_error}");
    engine.shutdown().await;
}

// =============================================================================
// Cancellation
// =============================================================================

/// Test: Shutdown interrupts a probe loop promptly and records no event
#[tokio::test]
async fn shutdown_cancels_probe_loop() {
    let engine = test_engine("chaos-shutdown");
    let mut events = engine.subscribe_events();
    let cell = NodeCell::new("QM1@1");
    let conn = MockHandle::new("conn", &cell);
    conn.fail_probes_forever();
    let parent = engine.register_parent(conn.clone() as HandleRef, "g1", "CHAOS").await.unwrap();

    engine.on_failure(parent.id, "2009", "").unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(conn.probe_count() >= 1);

    let started = Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(engine.get_failover_history(parent.id).await.unwrap().is_empty());
    assert_eq!(
        engine.monitor_state(parent.id).await,
        Some(MonitorState::Reconnecting)
    );

    // Probing stopped with the monitor. An attempt already handed to the
    // blocking pool may still land, so let it settle first.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let probes = conn.probe_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.probe_count(), probes);
}

/// Test: Deregistering mid-episode stops the monitor without an event
#[tokio::test]
async fn deregister_during_episode() {
    let engine = test_engine("chaos-deregister");
    let mut events = engine.subscribe_events();
    let cell = NodeCell::new("QM1@1");
    let conn = MockHandle::new("conn", &cell);
    conn.fail_probes_forever();
    let parent = engine.register_parent(conn.clone() as HandleRef, "g1", "CHAOS").await.unwrap();

    engine.on_failure(parent.id, "2009", "").unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let removed = engine.deregister(parent.id).await.unwrap();
    assert_eq!(removed.parent.correlation_id, "g1");
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(engine.get_group("g1").await.is_none());
    engine.shutdown().await;
}

/// Test: Shutdown is idempotent and safe to race
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_shutdown_calls() {
    let engine = Arc::new(test_engine("chaos-double-shutdown"));
    let cell = NodeCell::new("QM1@1");
    for g in 0..4 {
        let conn = MockHandle::new(&format!("conn-{g}"), &cell);
        engine.register_parent(conn as HandleRef, &format!("g{g}"), "CHAOS").await.unwrap();
    }

    let a = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.shutdown().await }
    });
    let b = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.shutdown().await }
    });
    a.await.unwrap();
    b.await.unwrap();
    engine.shutdown().await;

    assert!(!engine.is_running());
    assert_eq!(engine.snapshot().await.len(), 4);
}

/// Test: Registrations racing shutdown leave no orphaned groups behind
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_racing_shutdown_leaves_no_orphans() {
    let engine = Arc::new(test_engine("chaos-register-shutdown"));
    let cell = NodeCell::new("QM1@1");

    let mut tasks = Vec::new();
    for g in 0..64 {
        let engine = Arc::clone(&engine);
        let cell = cell.clone();
        tasks.push(tokio::spawn(async move {
            let conn = MockHandle::new(&format!("conn-{g}"), &cell);
            engine
                .register_parent(conn as HandleRef, &format!("g{g}"), "CHAOS")
                .await
        }));
    }
    tokio::task::yield_now().await;
    engine.shutdown().await;

    let mut registered = 0;
    for task in tasks {
        match task.await.expect("registration task panicked") {
            Ok(_) => registered += 1,
            Err(AffinityError::Shutdown) => {}
            Err(e) => panic!("unexpected registration error: {e}"),
        }
    }
    assert!(!engine.is_running());
    assert_eq!(engine.snapshot().await.len(), registered);
    assert_eq!(engine.health_check().await.groups_total, registered);
}

// =============================================================================
// Signal Floods
// =============================================================================

/// Test: A burst of signals is bounded by the queue and folded into one episode
#[tokio::test]
async fn signal_flood_is_bounded() {
    let engine = test_engine("chaos-flood");
    let mut events = engine.subscribe_events();
    let cell = NodeCell::new("QM1@1");
    let conn = MockHandle::new("conn", &cell);
    conn.fail_probes_forever();
    let parent = engine.register_parent(conn as HandleRef, "g1", "CHAOS").await.unwrap();

    let mut accepted = 0u32;
    let mut dropped = 0u32;
    for n in 0..1_000 {
        if engine.on_failure(parent.id, "2009", &format!("burst {n}")).unwrap() {
            accepted += 1;
        } else {
            dropped += 1;
        }
    }
    assert!(dropped > 0);
    assert!(accepted <= 17);

    let event = next_event(&mut events, 5).await;
    assert_eq!(event.coalesced_signals, accepted - 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.get_failover_history(parent.id).await.unwrap().len(), 1);
    engine.shutdown().await;
}

/// Test: Simultaneous episodes on many groups all complete independently
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_failovers() {
    let engine = test_engine("chaos-storm");
    let mut events = engine.subscribe_events();

    let mut cells = Vec::new();
    let mut parents = Vec::new();
    for g in 0..8 {
        let cell = NodeCell::new(&format!("QM{g}@1"));
        let conn = MockHandle::flaky(&format!("conn-{g}"), &cell, g % 3);
        let parent = engine
            .register_parent(conn as HandleRef, &format!("g{g}"), "CHAOS")
            .await
            .unwrap();
        for i in 0..3u32 {
            let session = MockHandle::new(&format!("s-{g}-{i}"), &cell);
            engine.register_child(parent.id, session as HandleRef, i).await.unwrap();
        }
        cells.push(cell);
        parents.push(parent.id);
    }

    for (g, (cell, parent_id)) in cells.iter().zip(&parents).enumerate() {
        cell.move_to(&format!("QM{}@2", g + 100));
        engine.on_failure(*parent_id, "2009", "").unwrap();
    }

    let mut recovered = Vec::new();
    for _ in 0..parents.len() {
        let event = next_event(&mut events, 10).await;
        assert_eq!(event.outcome, FailoverOutcome::Recovered);
        assert!(event.coherence.as_ref().unwrap().all_coherent);
        recovered.push(event.parent_id);
    }
    recovered.sort();
    let mut expected = parents.clone();
    expected.sort();
    assert_eq!(recovered, expected);

    let health = engine.health_check().await;
    assert_eq!(health.groups_connected, 8);
    assert!(health.healthy);
    engine.shutdown().await;
}
