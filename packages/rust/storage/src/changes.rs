//! Change feed: ordered insert/modify/remove notifications for captured tables.
//!
//! Delivery is at-least-once. A consumer reads a batch, handles it, and
//! acknowledges the highest sequence number only when the whole batch
//! succeeded; an unacknowledged batch is delivered again on the next read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use lexiforge_shared::Result;

pub const EVENT_INSERT: &str = "INSERT";
pub const EVENT_MODIFY: &str = "MODIFY";
pub const EVENT_REMOVE: &str = "REMOVE";

/// Raw change notification as produced by a store. Decoded into a typed
/// event at the dispatcher boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub table: String,
    pub event_name: String,
    #[serde(default)]
    pub keys: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<Value>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Up to `limit` unacknowledged records, in sequence order.
    async fn read_batch(&self, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Mark every record up to and including `seq` as handled.
    async fn ack(&self, seq: i64) -> Result<()>;
}
