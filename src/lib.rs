//! # Affinity Engine
//!
//! Tracks groups of sessions multiplexed over one shared connection to a
//! clustered backend node, and verifies that each group relocates as a unit
//! when its node fails and the client reconnects elsewhere.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            AffinityEngine                                 │
//! │                                                                           │
//! │  on_failure() ──► ┌──────────────────┐   probe / re-resolve               │
//! │   (enqueue)       │ FailoverMonitor  │──────────────┐                     │
//! │                   │ (task per parent)│              ▼                     │
//! │                   └──────────────────┘     ┌───────────────────┐          │
//! │                            │               │ MetadataExtractor │          │
//! │                            ▼               │ property/adapter/ │          │
//! │                   ┌──────────────────┐     │ opaque id         │          │
//! │                   │ CoherenceVerifier│────►└───────────────────┘          │
//! │                   └──────────────────┘              ▲                     │
//! │                            │                        │                     │
//! │                            ▼                        │                     │
//! │                   ┌──────────────────────────────────────┐                │
//! │                   │ AffinityRegistry (lock per group)    │                │
//! │                   │ parent + children + failover history │                │
//! │                   └──────────────────────────────────────┘                │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use affinity_engine::{AffinityConfig, AffinityEngine};
//! # use affinity_engine::handle::HandleRef;
//!
//! # async fn example(conn: HandleRef, sessions: Vec<HandleRef>) -> affinity_engine::Result<()> {
//! let engine = AffinityEngine::new(AffinityConfig::default())?;
//!
//! let parent = engine.register_parent(conn, "orders-1", "ORDERS").await?;
//! for (index, session) in sessions.into_iter().enumerate() {
//!     engine.register_child(parent.id, session, index as u32).await?;
//! }
//!
//! // Wired into the transport's exception listener:
//! engine.on_failure(parent.id, "MQRC_CONNECTION_BROKEN", "connection reset")?;
//!
//! let mut events = engine.subscribe_events();
//! let event = events.recv().await.expect("event");
//! println!("{:?} coherent={:?}", event.outcome, event.coherence.map(|c| c.all_coherent));
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod classification;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod extractor;
pub mod handle;
pub mod location;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod resilience;
pub mod verifier;

// Re-exports for convenience
pub use classification::{ClassificationTable, FailureClassification};
pub use config::{AffinityConfig, ExtractionConfig, MonitorConfig, ReconnectPolicy};
pub use coordinator::{AffinityEngine, EngineState, GroupSummary, HealthCheck};
pub use error::{AffinityError, Result};
pub use extractor::{LocationAdapter, MetadataExtractor};
pub use handle::{ChannelHandle, HandleError, HandleRef};
pub use location::{LocationTag, Resolution};
pub use monitor::{FailoverEvent, FailoverOutcome, FailureReason, MonitorState};
pub use registry::{AffinityGroup, AffinityRegistry, ChildId, ChildRecord, ParentId, ParentRecord};
pub use verifier::{CoherenceReport, CoherenceVerifier, ResolutionMode};
