//! Event log records.
//!
//! Events are immutable once appended. The store assigns each one a strictly
//! increasing `seq`; the heartbeat consumes them in `seq` order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event payload: ordered so that rendering and storage are deterministic.
pub type Payload = BTreeMap<String, Value>;

/// Well-known event types emitted by the workflow core.
pub mod kinds {
    pub const PROPOSAL_CREATED: &str = "proposal_created";
    pub const PROPOSAL_COMPLETED: &str = "proposal_completed";
    pub const PROPOSAL_FAILED: &str = "proposal_failed";
    pub const PROPOSAL_CANCELLED: &str = "proposal_cancelled";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_FAILED: &str = "step_failed";
    pub const STEP_REQUEUED: &str = "step_requeued";
}

/// A logged system occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned sequence number.
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Payload,
    /// Unix seconds.
    pub occurred_at: u64,
}

impl Event {
    /// Look up a payload value by dotted path (`"a.b"` descends into objects).
    pub fn payload_path(&self, path: &[String]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.payload.get(first)?;
        for key in rest {
            current = current.as_object()?.get(key)?;
        }
        Some(current)
    }
}

/// Build a payload from `(key, value)` pairs.
pub fn payload<K, I>(entries: I) -> Payload
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
