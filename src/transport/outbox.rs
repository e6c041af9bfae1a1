use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{Database, NewOutboxEntry};
use crate::models::Batch;

use super::{link::PairedLink, wire};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const FLUSH_PAGE: usize = 64;

/// Durable FIFO of batches awaiting the peer's receipt.
///
/// Entries are written to SQLite before `enqueue` returns and removed only
/// after the link accepted them, so a batch can be delivered more than once
/// (crash between delivery and ack) but is never lost.
#[derive(Clone)]
pub struct Outbox {
    db: Database,
    capacity: usize,
    flush_lock: Arc<Mutex<()>>,
}

impl Outbox {
    pub fn new(db: Database, capacity: usize) -> Self {
        Self {
            db,
            capacity: capacity.max(1),
            flush_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Persists `batch` with a fresh message id. Fails once the queue holds
    /// `capacity` entries.
    pub async fn enqueue(&self, batch: &Batch) -> Result<Uuid> {
        let message_id = batch.message_id.unwrap_or_else(Uuid::new_v4);
        let stamped = Batch {
            session_key: batch.session_key.clone(),
            readings: batch.readings.clone(),
            message_id: Some(message_id),
        };

        let entry = NewOutboxEntry {
            message_id,
            session_key: stamped.session_key.clone(),
            reading_count: stamped.readings.len() as u64,
            payload: wire::encode(&stamped)?,
        };

        self.db
            .enqueue_outbox(entry, self.capacity)
            .await
            .with_context(|| format!("failed to queue batch for session {}", batch.session_key))?;
        Ok(message_id)
    }

    pub async fn len(&self) -> Result<u64> {
        self.db.outbox_len().await
    }

    /// Delivers queued entries oldest first until the queue is empty or the
    /// peer stops accepting. Returns how many were delivered.
    pub async fn flush(&self, link: &PairedLink) -> Result<usize> {
        // One flusher at a time keeps delivery in queue order.
        let _guard = self.flush_lock.lock().await;
        let mut delivered = 0;

        'pages: loop {
            let entries = self.db.outbox_front(FLUSH_PAGE).await?;
            if entries.is_empty() {
                break;
            }

            for entry in entries {
                if let Err(err) = link.deliver(entry.payload.into_bytes()).await {
                    log_debug!(
                        "outbox flush paused at seq {} ({} delivered): {err}",
                        entry.seq,
                        delivered
                    );
                    break 'pages;
                }

                if !self.db.ack_outbox(entry.seq).await? {
                    log_warn!("outbox entry {} vanished before ack", entry.seq);
                }
                delivered += 1;
            }
        }

        Ok(delivered)
    }
}
