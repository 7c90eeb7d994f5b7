//! Node-side diagnostics cross-check.
//!
//! A node can usually list the channels it is serving (through a management
//! or command protocol). [`cross_check`] compares that view with a group's
//! client-side resolution. The node's answer is **advisory**: a cross-check
//! never modifies the registry and never overrides a resolved tag.
//!
//! # Example
//!
//! ```rust
//! use affinity_engine::diagnostics::{ActiveChannel, InspectorResult, NodeInspector};
//! use futures::future::BoxFuture;
//!
//! struct Static(Vec<ActiveChannel>);
//!
//! impl NodeInspector for Static {
//!     fn list_active_channels<'a>(
//!         &'a self,
//!         _node_id: &'a str,
//!     ) -> BoxFuture<'a, InspectorResult<Vec<ActiveChannel>>> {
//!         Box::pin(async move { Ok(self.0.clone()) })
//!     }
//! }
//! ```

use crate::location::LocationTag;
use crate::registry::AffinityGroup;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

/// Result type for inspector calls.
pub type InspectorResult<T> = std::result::Result<T, InspectorError>;

/// Opaque inspector failure.
#[derive(Debug, Clone)]
pub struct InspectorError(pub String);

impl std::fmt::Display for InspectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InspectorError {}

/// One channel as the node reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveChannel {
    pub application_tag: String,
    pub location_tag: LocationTag,
}

/// Read-only view of the channels a node is serving.
pub trait NodeInspector: Send + Sync {
    /// List channels currently active on `node_id`.
    fn list_active_channels<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BoxFuture<'a, InspectorResult<Vec<ActiveChannel>>>;
}

/// Outcome of comparing a group with its node's own view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossCheckReport {
    pub correlation_id: String,
    /// Node queried; `None` when the parent's location is unknown.
    pub node_id: Option<String>,
    /// Members the client side believes are on the node (parent + children).
    pub expected_members: usize,
    /// Channels the node reports for the group's application tag.
    pub observed_members: usize,
    /// Observed channels whose node matches the parent's.
    pub agreeing: usize,
    pub disagreeing: usize,
    /// Always true: the node's view never overrides client-side resolution.
    pub advisory: bool,
    pub error: Option<String>,
}

impl CrossCheckReport {
    /// The node saw the group and every observed channel agrees.
    pub fn agrees(&self) -> bool {
        self.error.is_none() && self.observed_members > 0 && self.disagreeing == 0
    }

    fn failed(group: &AffinityGroup, node_id: Option<String>, error: String) -> Self {
        Self {
            correlation_id: group.parent.correlation_id.clone(),
            node_id,
            expected_members: group.member_count(),
            observed_members: 0,
            agreeing: 0,
            disagreeing: 0,
            advisory: true,
            error: Some(error),
        }
    }
}

/// Compare a group's resolved location with the node's active channels.
///
/// Channels are matched by application tag; agreement is judged on node
/// name, since nodes may render the generation part differently.
pub async fn cross_check(group: &AffinityGroup, inspector: &dyn NodeInspector) -> CrossCheckReport {
    let Some(parent_tag) = group.parent.location_tag.as_ref() else {
        return CrossCheckReport::failed(group, None, "parent location unknown".to_string());
    };
    let node_id = parent_tag.node_name().to_string();

    let channels = match inspector.list_active_channels(&node_id).await {
        Ok(channels) => channels,
        Err(e) => {
            warn!(
                correlation_id = %group.parent.correlation_id,
                node_id = %node_id,
                error = %e,
                "Node inspection failed"
            );
            return CrossCheckReport::failed(group, Some(node_id), e.to_string());
        }
    };

    let observed: Vec<&ActiveChannel> = channels
        .iter()
        .filter(|c| c.application_tag == group.parent.application_tag)
        .collect();
    let agreeing = observed
        .iter()
        .filter(|c| c.location_tag.node_name() == node_id)
        .count();

    let report = CrossCheckReport {
        correlation_id: group.parent.correlation_id.clone(),
        node_id: Some(node_id),
        expected_members: group.member_count(),
        observed_members: observed.len(),
        agreeing,
        disagreeing: observed.len() - agreeing,
        advisory: true,
        error: None,
    };
    debug!(
        correlation_id = %report.correlation_id,
        expected = report.expected_members,
        observed = report.observed_members,
        disagreeing = report.disagreeing,
        "Cross-check complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ChannelHandle, HandleRef};
    use crate::monitor::MonitorState;
    use crate::registry::{ChildId, ChildRecord, ParentId, ParentRecord};
    use std::any::Any;
    use std::sync::Arc;

    struct Opaque;

    impl ChannelHandle for Opaque {
        fn describe(&self) -> String {
            "opaque".to_string()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Fixed(InspectorResult<Vec<ActiveChannel>>);

    impl NodeInspector for Fixed {
        fn list_active_channels<'a>(
            &'a self,
            _node_id: &'a str,
        ) -> BoxFuture<'a, InspectorResult<Vec<ActiveChannel>>> {
            Box::pin(async move { self.0.clone() })
        }
    }

    fn group(tag: Option<&str>, children: usize) -> AffinityGroup {
        let handle: HandleRef = Arc::new(Opaque);
        AffinityGroup {
            parent: ParentRecord {
                id: ParentId(1),
                correlation_id: "g1".to_string(),
                application_tag: "ORDERS".to_string(),
                application_name: "test".to_string(),
                handle: Arc::clone(&handle),
                location_tag: tag.map(LocationTag::new),
                state: MonitorState::Connected,
                created_at: 0,
            },
            children: (0..children)
                .map(|i| ChildRecord {
                    id: ChildId(i as u64),
                    parent_id: ParentId(1),
                    index: i as u32,
                    handle: Arc::clone(&handle),
                    location_tag: tag.map(LocationTag::new),
                    created_at: 0,
                })
                .collect(),
        }
    }

    fn channel(app: &str, tag: &str) -> ActiveChannel {
        ActiveChannel {
            application_tag: app.to_string(),
            location_tag: LocationTag::new(tag),
        }
    }

    #[tokio::test]
    async fn test_cross_check_agrees() {
        let inspector = Fixed(Ok(vec![
            channel("ORDERS", "MQCT1111111111111111QM1_2025-01-01_10.00.00"),
            channel("ORDERS", "MQCT2222222222222222QM1_2025-01-01_10.00.01"),
            channel("OTHER", "MQCT3333333333333333QM1_2025-01-01_10.00.02"),
        ]));
        let g = group(Some("MQCT1111111111111111QM1_2025-01-01_10.00.00"), 1);

        let report = cross_check(&g, &inspector).await;
        assert_eq!(report.node_id.as_deref(), Some("QM1"));
        assert_eq!(report.expected_members, 2);
        assert_eq!(report.observed_members, 2);
        assert_eq!(report.agreeing, 2);
        assert!(report.advisory);
        assert!(report.agrees());
    }

    #[tokio::test]
    async fn test_cross_check_reports_disagreement() {
        let inspector = Fixed(Ok(vec![channel("ORDERS", "QM1@1"), channel("ORDERS", "QM2@7")]));
        let g = group(Some("QM1@1"), 1);

        let report = cross_check(&g, &inspector).await;
        assert_eq!(report.agreeing, 1);
        assert_eq!(report.disagreeing, 1);
        assert!(!report.agrees());
    }

    #[tokio::test]
    async fn test_cross_check_inspector_error() {
        let inspector = Fixed(Err(InspectorError("command server down".to_string())));
        let g = group(Some("QM1"), 2);

        let report = cross_check(&g, &inspector).await;
        assert_eq!(report.observed_members, 0);
        assert_eq!(report.error.as_deref(), Some("command server down"));
        assert!(report.advisory);
        assert!(!report.agrees());
    }

    #[tokio::test]
    async fn test_cross_check_unknown_parent_location() {
        let inspector = Fixed(Ok(vec![]));
        let report = cross_check(&group(None, 0), &inspector).await;
        assert_eq!(report.node_id, None);
        assert!(report.error.is_some());
    }
}
