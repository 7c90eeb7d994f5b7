//! Location tags and resolution outcomes.
//!
//! A [`LocationTag`] names the backend node instance (and generation) a
//! connection or session is attached to. Two tags are equal iff their text
//! is equal. The common tag shapes can be split into a node name and a
//! generation:
//!
//! ```text
//! MQCT7B4AC66800610040QM2_2025-09-05_02.13.42   node = QM2, generation = 7B4AC66800610040
//! nodeA@42                                      node = nodeA, generation = 42
//! NodeX                                         node = NodeX, generation = None
//! ```
//!
//! Tags produced by different extraction tiers differ in shape: a property
//! carries the full connection tag while the opaque id only yields the node
//! name. [`LocationTag::matches`] compares them on what both carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of connection tags issued by the server at connect time.
const CONNTAG_PREFIX: &str = "MQCT";

/// Length of the `MQCT` prefix plus the 16 hex character handle.
const CONNTAG_HEADER_LEN: usize = 20;

/// Opaque, comparable identifier of a backend node instance plus generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationTag(String);

impl LocationTag {
    /// Create a tag from its textual form.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The full tag text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The node portion of the tag.
    pub fn node_name(&self) -> &str {
        if let Some((node, _)) = self.split_conntag() {
            return node;
        }
        match self.0.split_once('@') {
            Some((node, _)) if !node.is_empty() => node,
            _ => &self.0,
        }
    }

    /// The handle/generation portion of the tag, when the tag carries one.
    pub fn generation(&self) -> Option<&str> {
        if let Some((_, generation)) = self.split_conntag() {
            return Some(generation);
        }
        match self.0.split_once('@') {
            Some((node, generation)) if !node.is_empty() && !generation.is_empty() => {
                Some(generation)
            }
            _ => None,
        }
    }

    /// True when both tags name the same location. Equal text always
    /// matches; when either side carries no generation only the node names
    /// are compared.
    pub fn matches(&self, other: &LocationTag) -> bool {
        if self == other {
            return true;
        }
        if self.generation().is_some() && other.generation().is_some() {
            return false;
        }
        self.node_name() == other.node_name()
    }

    /// Split `MQCT<16 hex><node>_<timestamp>` into (node, handle).
    fn split_conntag(&self) -> Option<(&str, &str)> {
        let tag = self.0.as_str();
        if !tag.starts_with(CONNTAG_PREFIX) || tag.len() <= CONNTAG_HEADER_LEN {
            return None;
        }
        if !tag.is_char_boundary(CONNTAG_HEADER_LEN) {
            return None;
        }
        let handle = &tag[CONNTAG_PREFIX.len()..CONNTAG_HEADER_LEN];
        if !handle.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let rest = &tag[CONNTAG_HEADER_LEN..];
        // Node names may contain '_'; the timestamp starts with `_YYYY-`.
        let bytes = rest.as_bytes();
        let end = (0..bytes.len())
            .find(|&i| is_timestamp_start(&bytes[i..]))
            .unwrap_or(rest.len());
        let node = rest[..end].trim();
        if node.is_empty() {
            return None;
        }
        Some((node, handle))
    }
}

fn is_timestamp_start(bytes: &[u8]) -> bool {
    bytes.len() >= 6
        && bytes[0] == b'_'
        && bytes[1..5].iter().all(u8::is_ascii_digit)
        && bytes[5] == b'-'
}

impl fmt::Display for LocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LocationTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which extraction tier produced a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    /// Tier 1: well-known property key.
    Property,
    /// Tier 2: profile adapter / structural scan.
    Adapter,
    /// Tier 3: decoded from the opaque identifier bytes.
    OpaqueId,
}

impl ExtractionTier {
    /// Metric/log label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionTier::Property => "property",
            ExtractionTier::Adapter => "adapter",
            ExtractionTier::OpaqueId => "opaque_id",
        }
    }
}

impl fmt::Display for ExtractionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a handle's location. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A tier produced a tag.
    Resolved { tag: LocationTag, tier: ExtractionTier },
    /// All tiers came up empty (the `UNKNOWN` sentinel).
    Unknown,
}

impl Resolution {
    /// The resolved tag, if any.
    pub fn tag(&self) -> Option<&LocationTag> {
        match self {
            Resolution::Resolved { tag, .. } => Some(tag),
            Resolution::Unknown => None,
        }
    }

    /// Consume into the resolved tag, if any.
    pub fn into_tag(self) -> Option<LocationTag> {
        match self {
            Resolution::Resolved { tag, .. } => Some(tag),
            Resolution::Unknown => None,
        }
    }

    /// The tier that produced the tag, if any.
    pub fn tier(&self) -> Option<ExtractionTier> {
        match self {
            Resolution::Resolved { tier, .. } => Some(*tier),
            Resolution::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Resolution::Unknown)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Resolved { tag, .. } => write!(f, "{}", tag),
            Resolution::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Render an optional tag the way reports show it.
pub fn display_tag(tag: Option<&LocationTag>) -> &str {
    tag.map(LocationTag::as_str).unwrap_or("UNKNOWN")
}
