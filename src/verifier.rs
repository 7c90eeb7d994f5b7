//! Coherence verification.
//!
//! After a failover the verifier re-resolves every member of a group and
//! reports whether the children followed the parent. Each child result
//! carries the [`ResolutionMode`] it was established with, so an
//! empirically confirmed location can be told apart from a structural one:
//!
//! | Mode | Evidence | Counts as coherent when |
//! |------|----------|-------------------------|
//! | `Verified` | The child's own handle yielded a tag | tag matches parent tag |
//! | `Inherited` | Profile exposes no location on the child | parent tag is known |
//! | `Unresolved` | Child should expose a tag but resolution came up empty | never |
//!
//! Tags are compared with [`LocationTag::matches`], so a child resolved from
//! its opaque id (node name only) still matches a parent whose property
//! carries the full connection tag.

use crate::error::{AffinityError, Result};
use crate::extractor::MetadataExtractor;
use crate::handle::guarded;
use crate::location::{display_tag, ExtractionTier, LocationTag};
use crate::metrics;
use crate::registry::{epoch_millis, AffinityGroup, ChildId, ParentId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a child's location was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Independently resolved from the child's own handle.
    Verified,
    /// Assumed equal to the parent's tag; the profile exposes nothing.
    Inherited,
    /// The child should expose a tag but none was found.
    Unresolved,
}

impl ResolutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionMode::Verified => "verified",
            ResolutionMode::Inherited => "inherited",
            ResolutionMode::Unresolved => "unresolved",
        }
    }
}

/// Result for one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildCoherence {
    pub child_id: ChildId,
    pub index: u32,
    pub mode: ResolutionMode,
    /// The tag the child is now considered to carry.
    pub location_tag: Option<LocationTag>,
    /// Tier that produced `location_tag`; `None` unless `Verified`.
    pub tier: Option<ExtractionTier>,
    pub coherent: bool,
}

/// Result of verifying one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoherenceReport {
    pub parent_id: ParentId,
    pub correlation_id: String,
    /// Freshly resolved parent tag, or the recorded one if resolution failed.
    pub parent_location_tag: Option<LocationTag>,
    /// Per-child results in index order.
    pub children: Vec<ChildCoherence>,
    /// True iff every child matches the parent, regardless of mode.
    pub all_coherent: bool,
    /// Epoch millis.
    pub checked_at: u64,
}

impl CoherenceReport {
    /// Child id → coherent.
    pub fn per_child(&self) -> BTreeMap<ChildId, bool> {
        self.children.iter().map(|c| (c.child_id, c.coherent)).collect()
    }

    pub fn count_mode(&self, mode: ResolutionMode) -> usize {
        self.children.iter().filter(|c| c.mode == mode).count()
    }

    /// Children whose location was confirmed from their own handle.
    pub fn verified_count(&self) -> usize {
        self.count_mode(ResolutionMode::Verified)
    }

    pub fn inherited_count(&self) -> usize {
        self.count_mode(ResolutionMode::Inherited)
    }

    pub fn incoherent(&self) -> impl Iterator<Item = &ChildCoherence> {
        self.children.iter().filter(|c| !c.coherent)
    }
}

/// Re-resolves group members and compares them with the parent.
#[derive(Clone)]
pub struct CoherenceVerifier {
    extractor: Arc<MetadataExtractor>,
}

impl CoherenceVerifier {
    pub fn new(extractor: Arc<MetadataExtractor>) -> Self {
        Self { extractor }
    }

    /// Verify a group snapshot. Reads handles only; never touches the registry.
    pub fn verify(&self, group: &AffinityGroup) -> CoherenceReport {
        let parent = &group.parent;
        let parent_tag = self
            .extractor
            .resolve(parent.handle.as_ref())
            .into_tag()
            .or_else(|| parent.location_tag.clone());

        let children: Vec<ChildCoherence> = group
            .children
            .iter()
            .map(|child| {
                // Some profiles cache the location until an operation runs.
                if let Some(Err(e)) = guarded(|| Some(child.handle.touch())) {
                    debug!(child_id = %child.id, error = %e, "Touch failed before resolve");
                }

                let exposes = guarded(|| Some(child.handle.exposes_location())).unwrap_or(true);
                let (mode, location_tag, tier) = if !exposes {
                    (ResolutionMode::Inherited, parent_tag.clone(), None)
                } else {
                    let resolution = self.extractor.resolve(child.handle.as_ref());
                    let tier = resolution.tier();
                    match resolution.into_tag() {
                        Some(tag) => (ResolutionMode::Verified, Some(tag), tier),
                        None => (ResolutionMode::Unresolved, None, None),
                    }
                };

                let coherent = mode != ResolutionMode::Unresolved
                    && match (&location_tag, &parent_tag) {
                        (Some(child_tag), Some(parent_tag)) => child_tag.matches(parent_tag),
                        _ => false,
                    };

                ChildCoherence {
                    child_id: child.id,
                    index: child.index,
                    mode,
                    location_tag,
                    tier,
                    coherent,
                }
            })
            .collect();

        let all_coherent = children.iter().all(|c| c.coherent);
        let report = CoherenceReport {
            parent_id: parent.id,
            correlation_id: parent.correlation_id.clone(),
            parent_location_tag: parent_tag,
            children,
            all_coherent,
            checked_at: epoch_millis(),
        };

        metrics::record_coherence_check(
            report.all_coherent,
            report.verified_count(),
            report.inherited_count(),
        );

        if report.all_coherent {
            info!(
                parent_id = %parent.id,
                correlation_id = %parent.correlation_id,
                location = %display_tag(report.parent_location_tag.as_ref()),
                verified = report.verified_count(),
                inherited = report.inherited_count(),
                "Group coherent"
            );
        } else {
            warn!(
                parent_id = %parent.id,
                correlation_id = %parent.correlation_id,
                location = %display_tag(report.parent_location_tag.as_ref()),
                incoherent = report.incoherent().count(),
                "Group incoherent"
            );
        }

        report
    }

    /// [`verify`](Self::verify) on the blocking pool. Handle reads may block
    /// on the transport, so async callers go through here.
    pub async fn verify_async(&self, group: AffinityGroup) -> Result<CoherenceReport> {
        let verifier = self.clone();
        let parent_id = group.parent.id;
        tokio::task::spawn_blocking(move || verifier.verify(&group))
            .await
            .map_err(|e| {
                AffinityError::Internal(format!("coherence check for {} failed: {}", parent_id, e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{encode_opaque_id, ChannelHandle, HandleError, HandleRef};
    use crate::monitor::MonitorState;
    use crate::registry::{ChildRecord, ParentRecord};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::RwLock;

    struct Member {
        tag: RwLock<Option<String>>,
        exposes: bool,
        touches: AtomicUsize,
    }

    impl Member {
        fn new(tag: Option<&str>, exposes: bool) -> Arc<Self> {
            Arc::new(Self {
                tag: RwLock::new(tag.map(str::to_string)),
                exposes,
                touches: AtomicUsize::new(0),
            })
        }
    }

    impl ChannelHandle for Member {
        fn describe(&self) -> String {
            "member".to_string()
        }

        fn property(&self, key: &str) -> std::result::Result<Option<String>, HandleError> {
            if key != "XMSC_WMQ_RESOLVED_CONNECTION_TAG" {
                return Ok(None);
            }
            Ok(self.tag.read().map(|t| t.clone()).unwrap_or(None))
        }

        fn exposes_location(&self) -> bool {
            self.exposes
        }

        fn touch(&self) -> std::result::Result<(), HandleError> {
            self.touches.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Exposes only the opaque connection id, which carries the node name.
    struct OpaqueMember(&'static str);

    impl ChannelHandle for OpaqueMember {
        fn describe(&self) -> String {
            format!("opaque-member({})", self.0)
        }

        fn opaque_id(&self) -> Option<Vec<u8>> {
            Some(encode_opaque_id(self.0, 7).to_vec())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    const QM1_CONNTAG: &str = "MQCT7B4AC66800610040QM1_2025-09-05_02.13.42";

    fn group(parent: HandleRef, recorded: Option<&str>, children: Vec<HandleRef>) -> AffinityGroup {
        let parent_id = ParentId(1);
        AffinityGroup {
            parent: ParentRecord {
                id: parent_id,
                correlation_id: "g1".to_string(),
                application_tag: "APP".to_string(),
                application_name: "test".to_string(),
                handle: parent,
                location_tag: recorded.map(LocationTag::new),
                state: MonitorState::Reconnected,
                created_at: 0,
            },
            children: children
                .into_iter()
                .enumerate()
                .map(|(i, handle)| ChildRecord {
                    id: ChildId(i as u64 + 10),
                    parent_id,
                    index: i as u32,
                    handle,
                    location_tag: None,
                    created_at: 0,
                })
                .collect(),
        }
    }

    fn verifier() -> CoherenceVerifier {
        CoherenceVerifier::new(Arc::new(MetadataExtractor::default()))
    }

    #[test]
    fn test_all_verified_coherent() {
        let child = Member::new(Some("NodeB"), true);
        let g = group(
            Member::new(Some("NodeB"), true),
            Some("NodeA"),
            vec![child.clone(), Member::new(Some("NodeB"), true)],
        );
        let report = verifier().verify(&g);
        assert!(report.all_coherent);
        assert_eq!(report.parent_location_tag, Some(LocationTag::new("NodeB")));
        assert_eq!(report.verified_count(), 2);
        assert_eq!(child.touches.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_straggler_is_reported() {
        let g = group(
            Member::new(Some("NodeB"), true),
            None,
            vec![Member::new(Some("NodeB"), true), Member::new(Some("NodeA"), true)],
        );
        let report = verifier().verify(&g);
        assert!(!report.all_coherent);
        let per_child = report.per_child();
        assert_eq!(per_child.get(&ChildId(10)), Some(&true));
        assert_eq!(per_child.get(&ChildId(11)), Some(&false));
    }

    #[test]
    fn test_inherited_mode_is_flagged() {
        let g = group(
            Member::new(Some("NodeB"), true),
            None,
            vec![Member::new(None, false), Member::new(Some("NodeB"), true)],
        );
        let report = verifier().verify(&g);
        assert!(report.all_coherent);
        assert_eq!(report.children[0].mode, ResolutionMode::Inherited);
        assert_eq!(report.children[0].location_tag, Some(LocationTag::new("NodeB")));
        assert_eq!(report.children[1].mode, ResolutionMode::Verified);
        assert_eq!(report.inherited_count(), 1);
    }

    #[test]
    fn test_unresolved_child_is_incoherent() {
        let g = group(
            Member::new(Some("NodeB"), true),
            None,
            vec![Member::new(None, true)],
        );
        let report = verifier().verify(&g);
        assert!(!report.all_coherent);
        assert_eq!(report.children[0].mode, ResolutionMode::Unresolved);
    }

    #[test]
    fn test_parent_falls_back_to_recorded_tag() {
        let g = group(
            Member::new(None, true),
            Some("NodeA"),
            vec![Member::new(Some("NodeA"), true)],
        );
        let report = verifier().verify(&g);
        assert_eq!(report.parent_location_tag, Some(LocationTag::new("NodeA")));
        assert!(report.all_coherent);
    }

    #[test]
    fn test_unknown_parent_makes_inherited_children_incoherent() {
        let g = group(Member::new(None, true), None, vec![Member::new(None, false)]);
        let report = verifier().verify(&g);
        assert!(!report.all_coherent);
        assert_eq!(report.children[0].mode, ResolutionMode::Inherited);
    }

    #[test]
    fn test_node_name_child_matches_full_connection_tag() {
        let g = group(
            Member::new(Some(QM1_CONNTAG), true),
            None,
            vec![Arc::new(OpaqueMember("QM1")), Member::new(Some(QM1_CONNTAG), true)],
        );
        let report = verifier().verify(&g);
        assert!(report.all_coherent);
        assert_eq!(report.children[0].mode, ResolutionMode::Verified);
        assert_eq!(report.children[0].tier, Some(ExtractionTier::OpaqueId));
        assert_eq!(report.children[0].location_tag, Some(LocationTag::new("QM1")));
        assert_eq!(report.children[1].tier, Some(ExtractionTier::Property));
    }

    #[test]
    fn test_node_name_child_on_other_node_is_incoherent() {
        let g = group(
            Member::new(Some(QM1_CONNTAG), true),
            None,
            vec![Arc::new(OpaqueMember("QM2"))],
        );
        let report = verifier().verify(&g);
        assert!(!report.all_coherent);
        assert_eq!(report.children[0].tier, Some(ExtractionTier::OpaqueId));
    }

    #[test]
    fn test_inherited_child_has_no_tier() {
        let g = group(Member::new(Some("NodeB"), true), None, vec![Member::new(None, false)]);
        let report = verifier().verify(&g);
        assert_eq!(report.children[0].tier, None);
    }

    #[tokio::test]
    async fn test_verify_async_matches_verify() {
        let g = group(
            Member::new(Some("NodeB"), true),
            None,
            vec![Member::new(Some("NodeB"), true), Member::new(Some("NodeA"), true)],
        );
        let v = verifier();
        let blocking = v.verify(&g);
        let off_runtime = v.verify_async(g).await.unwrap();
        assert_eq!(off_runtime.per_child(), blocking.per_child());
        assert_eq!(off_runtime.parent_location_tag, blocking.parent_location_tag);
    }

    #[test]
    fn test_childless_group_is_coherent() {
        let g = group(Member::new(Some("NodeA"), true), None, vec![]);
        assert!(verifier().verify(&g).all_coherent);
    }
}
