use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::connection::Database;

impl Database {
    /// The last successfully written session map, if any.
    pub async fn load_session_blob(&self) -> Result<Option<String>> {
        self.execute(|conn| {
            conn.query_row(
                "SELECT payload FROM session_blob WHERE id = 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read session blob")
        })
        .await
    }

    /// Replaces the stored session map in one statement, so a failed write
    /// leaves the previous blob untouched.
    pub async fn save_session_blob(&self, payload: String) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO session_blob (id, payload, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![payload, Utc::now().to_rfc3339()],
            )
            .context("failed to write session blob")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blob_round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("blob.sqlite3")).unwrap();

        assert!(db.load_session_blob().await.unwrap().is_none());

        db.save_session_blob("{\"a\":[]}".into()).await.unwrap();
        db.save_session_blob("{\"b\":[]}".into()).await.unwrap();

        assert_eq!(
            db.load_session_blob().await.unwrap().as_deref(),
            Some("{\"b\":[]}")
        );
    }
}
