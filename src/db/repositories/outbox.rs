use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, to_i64, to_u64},
    models::OutboxEntry,
};

/// A batch about to enter the outbox.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub message_id: Uuid,
    pub session_key: String,
    pub reading_count: u64,
    pub payload: String,
}

impl Database {
    /// Appends to the outbox unless it already holds `capacity` entries.
    /// Returns the entry's sequence number.
    pub async fn enqueue_outbox(&self, entry: NewOutboxEntry, capacity: usize) -> Result<i64> {
        let capacity = to_i64(capacity as u64)?;
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open outbox transaction")?;

            let queued: i64 = tx.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
            if queued >= capacity {
                bail!("outbox full: {queued} batches queued (capacity {capacity})");
            }

            tx.execute(
                "INSERT INTO outbox (message_id, session_key, reading_count, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.message_id.to_string(),
                    entry.session_key,
                    to_i64(entry.reading_count)?,
                    entry.payload,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("failed to insert outbox entry")?;
            let seq = tx.last_insert_rowid();

            tx.commit().context("failed to commit outbox entry")?;
            Ok(seq)
        })
        .await
    }

    /// Oldest entries first.
    pub async fn outbox_front(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let limit = to_i64(limit as u64)?;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, message_id, session_key, reading_count, payload, enqueued_at
                 FROM outbox
                 ORDER BY seq ASC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let message_id: String = row.get(1)?;
                entries.push(OutboxEntry {
                    seq: row.get(0)?,
                    message_id: Uuid::parse_str(&message_id)
                        .map_err(|err| anyhow!("invalid outbox message id '{message_id}': {err}"))?,
                    session_key: row.get(2)?,
                    reading_count: to_u64(row.get(3)?, "reading_count")?,
                    payload: row.get(4)?,
                    enqueued_at: parse_datetime(&row.get::<_, String>(5)?, "enqueued_at")?,
                });
            }

            Ok(entries)
        })
        .await
    }

    /// Removes an entry once the peer accepted it. Returns false when it was
    /// already gone.
    pub async fn ack_outbox(&self, seq: i64) -> Result<bool> {
        self.execute(move |conn| {
            let removed = conn
                .execute("DELETE FROM outbox WHERE seq = ?1", params![seq])
                .context("failed to remove outbox entry")?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn outbox_len(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
            to_u64(count, "outbox count")
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> NewOutboxEntry {
        NewOutboxEntry {
            message_id: Uuid::new_v4(),
            session_key: key.to_string(),
            reading_count: 1,
            payload: format!("{{\"sessionKey\":\"{key}\"}}"),
        }
    }

    #[tokio::test]
    async fn fifo_order_and_ack() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("outbox.sqlite3")).unwrap();

        let first = db.enqueue_outbox(entry("a"), 10).await.unwrap();
        let second = db.enqueue_outbox(entry("b"), 10).await.unwrap();
        assert!(first < second);

        let front = db.outbox_front(10).await.unwrap();
        let keys: Vec<_> = front.iter().map(|e| e.session_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert!(db.ack_outbox(first).await.unwrap());
        assert!(!db.ack_outbox(first).await.unwrap());
        assert_eq!(db.outbox_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("outbox.sqlite3")).unwrap();

        db.enqueue_outbox(entry("a"), 2).await.unwrap();
        db.enqueue_outbox(entry("a"), 2).await.unwrap();
        let err = db.enqueue_outbox(entry("a"), 2).await.unwrap_err();
        assert!(err.to_string().contains("outbox full"));
        assert_eq!(db.outbox_len().await.unwrap(), 2);
    }
}
