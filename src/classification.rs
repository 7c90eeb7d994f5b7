//! Failure classification policy.
//!
//! Maps transport error codes to retry behavior. Codes arrive in either
//! symbolic (`MQRC_CONNECTION_BROKEN`) or numeric (`2009`) form and both are
//! listed. Lookup is case-insensitive on the trimmed code.
//!
//! # Built-in Table
//!
//! | Code | Retryable | Meaning |
//! |------|-----------|---------|
//! | `RETRYABLE_TIMEOUT` | Yes | Transport timed out talking to the node |
//! | `MQRC_CONNECTION_BROKEN` / `2009` | Yes | Connection to the node dropped |
//! | `MQRC_Q_MGR_NOT_AVAILABLE` / `2059` | Yes | Node not reachable |
//! | `MQRC_Q_MGR_QUIESCING` / `2161` | Yes | Node shutting down |
//! | `MQRC_Q_MGR_STOPPING` / `2162` | Yes | Node stopping |
//! | `MQRC_CONNECTION_STOPPING` / `2203` | Yes | Connection being stopped |
//! | `MQRC_CONNECTION_ERROR` / `2273` | Yes | Generic connection error |
//! | `MQRC_HOST_NOT_AVAILABLE` / `2538` | Yes | Host unreachable |
//! | `MQRC_RECONNECTING` / `2544` | Yes | Client is reconnecting |
//! | `MQRC_RECONNECTED` / `2545` | Yes | Client reconnected to a node |
//! | `MQJMS2002` / `MQJMS2008` / `MQJMS1107` | Yes | Client-side connection loss |
//! | `AUTH_REJECTED` | No | Credentials rejected |
//! | `MQRC_NOT_AUTHORIZED` / `2035` | No | Not authorized |
//! | `MQRC_Q_MGR_NAME_ERROR` / `2058` | No | Node name invalid |
//! | `MQRC_RECONNECT_INCOMPATIBLE` / `2547` | No | Reconnect not possible |
//! | `MQRC_RECONNECT_FAILED` / `2548` | No | Client gave up reconnecting |
//!
//! Anything else is **unknown** and classified non-retryable, so an
//! unrecognized condition can never spin a monitor forever.

use crate::config::ClassificationEntry;
use serde::Serialize;
use std::collections::HashMap;

const RETRYABLE: &[&str] = &[
    "RETRYABLE_TIMEOUT",
    "MQRC_CONNECTION_BROKEN",
    "2009",
    "MQRC_Q_MGR_NOT_AVAILABLE",
    "2059",
    "MQRC_Q_MGR_QUIESCING",
    "2161",
    "MQRC_Q_MGR_STOPPING",
    "2162",
    "MQRC_CONNECTION_STOPPING",
    "2203",
    "MQRC_CONNECTION_ERROR",
    "2273",
    "MQRC_HOST_NOT_AVAILABLE",
    "2538",
    "MQRC_RECONNECTING",
    "2544",
    "MQRC_RECONNECTED",
    "2545",
    "MQJMS2002",
    "MQJMS2008",
    "MQJMS1107",
];

const NON_RETRYABLE: &[&str] = &[
    "AUTH_REJECTED",
    "MQRC_NOT_AUTHORIZED",
    "2035",
    "MQRC_Q_MGR_NAME_ERROR",
    "2058",
    "MQRC_RECONNECT_INCOMPATIBLE",
    "2547",
    "MQRC_RECONNECT_FAILED",
    "2548",
];

/// Retry policy for one error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureClassification {
    /// The code as reported by the transport.
    pub code: String,
    /// Whether the monitor should poll for reconnection.
    pub retryable: bool,
    /// Whether the code was found in the table.
    pub known: bool,
}

/// Static policy table of error code → retry behavior.
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    entries: HashMap<String, bool>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        let mut entries = HashMap::with_capacity(RETRYABLE.len() + NON_RETRYABLE.len());
        for code in RETRYABLE {
            entries.insert(normalize(code), true);
        }
        for code in NON_RETRYABLE {
            entries.insert(normalize(code), false);
        }
        Self { entries }
    }
}

impl ClassificationTable {
    /// Built-in table with `overrides` merged on top.
    pub fn with_overrides(overrides: &[ClassificationEntry]) -> Self {
        let mut table = Self::default();
        for entry in overrides {
            table.insert(&entry.code, entry.retryable);
        }
        table
    }

    /// An empty table: every code is unknown.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add or replace a classification.
    pub fn insert(&mut self, code: &str, retryable: bool) {
        self.entries.insert(normalize(code), retryable);
    }

    /// Classify a transport error code. Unknown codes are non-retryable.
    pub fn classify(&self, code: &str) -> FailureClassification {
        match self.entries.get(&normalize(code)) {
            Some(&retryable) => FailureClassification {
                code: code.to_string(),
                retryable,
                known: true,
            },
            None => FailureClassification {
                code: code.to_string(),
                retryable: false,
                known: false,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
