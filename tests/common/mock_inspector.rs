//! Mock node inspector for cross-check tests.
//!
//! Returns a fixed channel list for every node and records which nodes
//! were queried.

use affinity_engine::diagnostics::{ActiveChannel, InspectorError, InspectorResult, NodeInspector};
use affinity_engine::LocationTag;
use futures::future::BoxFuture;
use std::sync::Mutex;

#[derive(Default)]
pub struct MockInspector {
    channels: Vec<ActiveChannel>,
    error: Option<String>,
    queried: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockInspector {
    pub fn with_channels(channels: &[(&str, &str)]) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|(app, tag)| ActiveChannel {
                    application_tag: app.to_string(),
                    location_tag: LocationTag::new(*tag),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

impl NodeInspector for MockInspector {
    fn list_active_channels<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BoxFuture<'a, InspectorResult<Vec<ActiveChannel>>> {
        Box::pin(async move {
            self.queried.lock().unwrap().push(node_id.to_string());
            match &self.error {
                Some(message) => Err(InspectorError(message.clone())),
                None => Ok(self.channels.clone()),
            }
        })
    }
}
