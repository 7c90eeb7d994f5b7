// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-parent failover monitor.
//!
//! Each registered parent gets one [`FailoverMonitor`]: a tokio task that
//! owns the parent's state machine (see [`types`]) and a handle used to feed
//! it failure signals and cancel it.
//!
//! # Signal Flow
//!
//! ```text
//! transport callback ──signal()──→ mpsc queue ──→ worker task
//!      (never blocks)     try_send                   │
//!                                                    ├─ classify code
//!                                                    ├─ probe loop (backoff, budget)
//!                                                    ├─ re-resolve parent
//!                                                    ├─ verify coherence
//!                                                    └─ record FailoverEvent
//! ```
//!
//! The transport's callback thread only enqueues. If the queue is full the
//! signal is dropped with a warning: an episode is already pending and the
//! extra signal would be coalesced into it anyway.
//!
//! # Cancellation
//!
//! [`FailoverMonitor::stop`] flips a `watch` flag. The worker checks it
//! between signals, during every backoff sleep and while a probe is in
//! flight, and exits without recording an event for an interrupted episode.
//!
//! # Blocking Handle Calls
//!
//! Probes, resolution and coherence checks call into the client library,
//! which may block. They run on tokio's blocking pool so a slow node stalls
//! only its own group's episode. A probe abandoned by cancellation finishes
//! on the pool and its result is discarded.

pub mod types;

pub use types::{FailoverEvent, FailoverOutcome, FailureReason, FailureSignal, MonitorState};

use crate::classification::ClassificationTable;
use crate::error::{AffinityError, Result};
use crate::extractor::MetadataExtractor;
use crate::handle::{describe_handle, guarded, HandleRef};
use crate::location::{display_tag, LocationTag};
use crate::metrics;
use crate::registry::{epoch_millis, AffinityRegistry, ParentId};
use crate::resilience::{cancellable_sleep, BackoffConfig};
use crate::verifier::CoherenceVerifier;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every monitor worker of one engine.
pub struct MonitorContext {
    pub registry: Arc<AffinityRegistry>,
    pub verifier: CoherenceVerifier,
    pub classification: ClassificationTable,
    pub backoff: BackoffConfig,
    /// When false, retryable signals fail immediately without probing.
    pub reconnect_enabled: bool,
    /// Every recorded event is also published here.
    pub events: broadcast::Sender<FailoverEvent>,
}

/// Handle to one parent's monitor worker.
pub struct FailoverMonitor {
    parent_id: ParentId,
    correlation_id: String,
    signal_tx: mpsc::Sender<FailureSignal>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FailoverMonitor {
    /// Spawn the worker for `parent_id`.
    pub fn spawn(
        ctx: Arc<MonitorContext>,
        parent_id: ParentId,
        correlation_id: &str,
        queue_capacity: usize,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(queue_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let worker = Worker {
            ctx,
            parent_id,
            correlation_id: correlation_id.to_string(),
            signal_rx,
            cancel_rx,
        };
        let task = tokio::spawn(worker.run());

        debug!(parent_id = %parent_id, correlation_id = %correlation_id, "Failover monitor started");
        Self {
            parent_id,
            correlation_id: correlation_id.to_string(),
            signal_tx,
            cancel_tx,
            task,
        }
    }

    pub fn parent_id(&self) -> ParentId {
        self.parent_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Enqueue a failure signal and return immediately.
    ///
    /// Returns `false` if the signal was dropped (queue full or worker gone).
    pub fn signal(&self, code: &str, message: &str) -> bool {
        let signal = FailureSignal {
            code: code.to_string(),
            message: message.to_string(),
            received_at: epoch_millis(),
        };
        match self.signal_tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                metrics::record_signal_dropped("queue_full");
                warn!(
                    parent_id = %self.parent_id,
                    code = %signal.code,
                    "Failure signal queue full, dropping signal"
                );
                false
            }
            Err(TrySendError::Closed(signal)) => {
                metrics::record_signal_dropped("closed");
                debug!(
                    parent_id = %self.parent_id,
                    code = %signal.code,
                    "Failure monitor stopped, dropping signal"
                );
                false
            }
        }
    }

    /// Ask the worker to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the worker and wait up to `drain_timeout` for it to exit.
    ///
    /// Returns `true` if the worker exited in time; otherwise it is aborted.
    pub async fn stop(self, drain_timeout: Duration) -> bool {
        self.cancel();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(drain_timeout, self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    parent_id = %self.parent_id,
                    timeout_ms = drain_timeout.as_millis(),
                    "Failover monitor did not stop in time, aborting"
                );
                abort.abort();
                false
            }
        }
    }
}

/// Run one reconnection probe on the blocking pool. The probe and the
/// following resolve both go to the transport and may block for as long as
/// the client's own timeouts allow.
async fn probe_off_runtime(extractor: Arc<MetadataExtractor>, handle: HandleRef) -> Result<LocationTag> {
    let description = describe_handle(handle.as_ref());
    tokio::task::spawn_blocking(move || probe_handle(&extractor, &handle))
        .await
        .map_err(|e| AffinityError::Internal(format!("probe task for {} failed: {}", description, e)))?
}

/// A probe succeeds when the handle accepts a trivial operation and
/// resolves to a known location.
fn probe_handle(extractor: &MetadataExtractor, handle: &HandleRef) -> Result<LocationTag> {
    let failed = |message: String| AffinityError::Handle {
        handle: describe_handle(handle.as_ref()),
        message,
    };
    match guarded(|| Some(handle.probe())) {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(failed(e.to_string())),
        None => return Err(failed("probe panicked".to_string())),
    }
    extractor
        .resolve(handle.as_ref())
        .into_tag()
        .ok_or_else(|| failed("location unknown after probe".to_string()))
}

/// How an episode ended, from the worker loop's point of view.
enum EpisodeEnd {
    Completed,
    Cancelled,
    ParentGone,
}

struct Worker {
    ctx: Arc<MonitorContext>,
    parent_id: ParentId,
    correlation_id: String,
    signal_rx: mpsc::Receiver<FailureSignal>,
    cancel_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.cancel_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        break;
                    }
                }

                maybe_signal = self.signal_rx.recv() => {
                    let Some(signal) = maybe_signal else {
                        break;
                    };
                    match self.run_episode(signal).await {
                        EpisodeEnd::Completed => {}
                        EpisodeEnd::Cancelled => {
                            info!(parent_id = %self.parent_id, "Failover episode cancelled");
                            break;
                        }
                        EpisodeEnd::ParentGone => break,
                    }
                }
            }
        }
        debug!(parent_id = %self.parent_id, "Failover monitor stopped");
    }

    async fn run_episode(&mut self, signal: FailureSignal) -> EpisodeEnd {
        let Some(parent) = self.ctx.registry.parent(self.parent_id).await else {
            return EpisodeEnd::ParentGone;
        };

        if parent.state == MonitorState::Failed {
            metrics::record_signal_dropped("failed");
            debug!(
                parent_id = %self.parent_id,
                code = %signal.code,
                "Monitor FAILED, ignoring signal"
            );
            return EpisodeEnd::Completed;
        }

        let classification = self.ctx.classification.classify(&signal.code);
        metrics::record_failure_signal(&signal.code, classification.retryable);

        let mut episode = Episode {
            signal,
            previous_tag: parent.location_tag.clone(),
            transitions: vec![parent.state],
            probe_attempts: 0,
            last_probe_error: None,
        };

        if let Err(e) = self.transition(&mut episode, MonitorState::Suspect).await {
            return self.abandon(e);
        }
        info!(
            parent_id = %self.parent_id,
            correlation_id = %self.correlation_id,
            code = %episode.signal.code,
            retryable = classification.retryable,
            known = classification.known,
            "Failure signal received"
        );

        if !classification.retryable {
            return self.fail(episode, FailureReason::NonRetryable).await;
        }
        if !self.ctx.reconnect_enabled {
            return self.fail(episode, FailureReason::ReconnectDisabled).await;
        }

        if let Err(e) = self.transition(&mut episode, MonitorState::Reconnecting).await {
            return self.abandon(e);
        }

        match self.poll_reconnect(&parent.handle, &mut episode).await {
            PollResult::Reconnected(tag) => self.recover(episode, tag).await,
            PollResult::Exhausted => self.fail(episode, FailureReason::ReconnectionTimeout).await,
            PollResult::Cancelled => EpisodeEnd::Cancelled,
        }
    }

    /// Probe until success, budget exhaustion or cancellation.
    ///
    /// The first probe runs immediately; later probes wait
    /// `delay_for_attempt(n)` clipped to what is left of the budget.
    async fn poll_reconnect(&mut self, handle: &HandleRef, episode: &mut Episode) -> PollResult {
        let started = Instant::now();
        loop {
            if *self.cancel_rx.borrow() {
                return PollResult::Cancelled;
            }

            episode.probe_attempts += 1;
            let extractor = Arc::clone(self.ctx.registry.extractor());
            let attempt = tokio::select! {
                biased;

                _ = self.cancel_rx.changed() => return PollResult::Cancelled,
                result = probe_off_runtime(extractor, Arc::clone(handle)) => result,
            };
            match attempt {
                Ok(tag) => {
                    metrics::record_probe_attempt(true);
                    debug!(
                        parent_id = %self.parent_id,
                        attempt = episode.probe_attempts,
                        location = %tag,
                        "Reconnection probe succeeded"
                    );
                    return PollResult::Reconnected(tag);
                }
                Err(e) => {
                    metrics::record_probe_attempt(false);
                    episode.last_probe_error = Some(e.to_string());
                }
            }

            let attempt = episode.probe_attempts as usize;
            let Some(delay) = self.ctx.backoff.next_delay(attempt, started.elapsed()) else {
                return PollResult::Exhausted;
            };
            debug!(
                parent_id = %self.parent_id,
                attempt,
                delay_ms = delay.as_millis(),
                error = episode.last_probe_error.as_deref().unwrap_or(""),
                "Reconnection probe failed, retrying"
            );
            if !cancellable_sleep(delay, &mut self.cancel_rx).await {
                return PollResult::Cancelled;
            }
        }
    }

    async fn recover(&mut self, mut episode: Episode, tag: LocationTag) -> EpisodeEnd {
        if let Err(e) = self.transition(&mut episode, MonitorState::Reconnected).await {
            return self.abandon(e);
        }
        let recovered_at = epoch_millis();

        let registry = &self.ctx.registry;
        if let Err(e) = registry.update_parent_location(self.parent_id, Some(tag.clone())).await {
            return self.abandon(e);
        }
        let Some(group) = registry.group_by_parent(self.parent_id).await else {
            return EpisodeEnd::ParentGone;
        };
        let report = match self.ctx.verifier.verify_async(group).await {
            Ok(report) => report,
            Err(e) => return self.abandon(e),
        };
        if let Err(e) = registry.apply_coherence(self.parent_id, &report).await {
            return self.abandon(e);
        }
        if let Err(e) = self.transition(&mut episode, MonitorState::Connected).await {
            return self.abandon(e);
        }

        let new_tag = report.parent_location_tag.clone().or(Some(tag));
        info!(
            parent_id = %self.parent_id,
            correlation_id = %self.correlation_id,
            from = %display_tag(episode.previous_tag.as_ref()),
            to = %display_tag(new_tag.as_ref()),
            attempts = episode.probe_attempts,
            coherent = report.all_coherent,
            "Failover recovered"
        );

        let event = self.event(episode, FailoverOutcome::Recovered, new_tag, Some(recovered_at), Some(report));
        self.record(event).await
    }

    async fn fail(&mut self, mut episode: Episode, reason: FailureReason) -> EpisodeEnd {
        if let Err(e) = self.transition(&mut episode, MonitorState::Failed).await {
            return self.abandon(e);
        }
        error!(
            parent_id = %self.parent_id,
            correlation_id = %self.correlation_id,
            code = %episode.signal.code,
            reason = %reason,
            attempts = episode.probe_attempts,
            last_error = episode.last_probe_error.as_deref().unwrap_or(""),
            "Failover FAILED"
        );

        let event = self.event(episode, FailoverOutcome::Failed(reason), None, None, None);
        self.record(event).await
    }

    fn event(
        &mut self,
        episode: Episode,
        outcome: FailoverOutcome,
        new_location_tag: Option<LocationTag>,
        recovered_at: Option<u64>,
        coherence: Option<crate::verifier::CoherenceReport>,
    ) -> FailoverEvent {
        let coalesced_signals = self.drain_pending();
        FailoverEvent {
            parent_id: self.parent_id,
            correlation_id: self.correlation_id.clone(),
            previous_location_tag: episode.previous_tag,
            new_location_tag,
            detected_at: episode.signal.received_at,
            recovered_at,
            outcome,
            error_code: Some(episode.signal.code),
            error_message: Some(episode.signal.message),
            last_probe_error: episode.last_probe_error,
            probe_attempts: episode.probe_attempts,
            transitions: episode.transitions,
            coalesced_signals,
            coherence,
        }
    }

    /// Fold signals that queued up during the episode into it.
    fn drain_pending(&mut self) -> u32 {
        let mut drained = 0;
        while self.signal_rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(parent_id = %self.parent_id, drained, "Coalesced signals into episode");
        }
        drained
    }

    async fn record(&self, event: FailoverEvent) -> EpisodeEnd {
        metrics::record_failover(
            event.outcome.label(),
            event.recovery_millis().map(Duration::from_millis),
        );
        if self.ctx.registry.record_event(event.clone()).await.is_err() {
            return EpisodeEnd::ParentGone;
        }
        // No subscribers is fine.
        let _ = self.ctx.events.send(event);
        EpisodeEnd::Completed
    }

    async fn transition(&self, episode: &mut Episode, next: MonitorState) -> Result<()> {
        let previous = self.ctx.registry.set_state(self.parent_id, next).await?;
        episode.transitions.push(next);
        debug!(parent_id = %self.parent_id, from = %previous, to = %next, "Monitor transition");
        Ok(())
    }

    fn abandon(&self, err: AffinityError) -> EpisodeEnd {
        match err {
            AffinityError::UnknownParent { .. } => {
                debug!(parent_id = %self.parent_id, "Parent deregistered mid-episode");
            }
            other => {
                warn!(parent_id = %self.parent_id, error = %other, "Failover episode abandoned");
            }
        }
        EpisodeEnd::ParentGone
    }
}

struct Episode {
    signal: FailureSignal,
    previous_tag: Option<LocationTag>,
    transitions: Vec<MonitorState>,
    probe_attempts: u32,
    last_probe_error: Option<String>,
}

enum PollResult {
    Reconnected(LocationTag),
    Exhausted,
    Cancelled,
}
