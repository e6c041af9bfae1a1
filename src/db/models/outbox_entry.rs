//! Guaranteed-delivery queue entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One encoded batch waiting in the outbox. `seq` gives the FIFO order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub seq: i64,
    pub message_id: Uuid,
    pub session_key: String,
    pub reading_count: u64,
    /// Wire-encoded message, exactly as it will be handed to the peer.
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}
