//! Session map with whole-blob persistence.
//!
//! Every mutation rewrites the full `key -> readings` map as one JSON blob in
//! SQLite. The blob is written before the in-memory map changes: when the
//! write fails the caller gets the error and both memory and disk keep the
//! last good state.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use log::info;
use serde::{ser::SerializeMap, Serialize, Serializer};
use tokio::sync::Mutex;

use crate::db::Database;
use crate::models::Reading;

type SessionMap = BTreeMap<String, Arc<Vec<Reading>>>;

/// Result of an [`SessionStore::update`] closure.
#[derive(Debug)]
pub enum Change {
    Keep,
    Replace(Vec<Reading>),
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    pub reading_count: usize,
    /// Offset of the last reading, in seconds.
    pub last_offset: f64,
}

struct StoreInner {
    db: Database,
    sessions: RwLock<SessionMap>,
    write_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Loads the last persisted blob. A blob that does not parse is a
    /// startup error.
    pub async fn open(db: Database) -> Result<Self> {
        let sessions: SessionMap = match db.load_session_blob().await? {
            Some(payload) => {
                let decoded: BTreeMap<String, Vec<Reading>> = serde_json::from_str(&payload)
                    .context("stored session blob is corrupt")?;
                decoded
                    .into_iter()
                    .map(|(key, readings)| (key, Arc::new(readings)))
                    .collect()
            }
            None => SessionMap::new(),
        };

        info!("Session store loaded with {} sessions", sessions.len());

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                sessions: RwLock::new(sessions),
                write_lock: Mutex::new(()),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        match self.inner.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        match self.inner.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<Reading>>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Session keys in ascending order (keys are timestamps, so oldest first).
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.read()
            .iter()
            .map(|(key, readings)| SessionSummary {
                key: key.clone(),
                reading_count: readings.len(),
                last_offset: readings.last().map(|r| r.time).unwrap_or(0.0),
            })
            .collect()
    }

    /// Replaces or creates a session.
    pub async fn put(&self, key: &str, readings: Vec<Reading>) -> Result<()> {
        self.update(key, move |_| (Change::Replace(readings), ()))
            .await
    }

    /// Appends to an existing session or creates it. Returns the new length.
    pub async fn append_or_create(&self, key: &str, readings: Vec<Reading>) -> Result<usize> {
        self.update(key, move |existing| {
            let mut next = existing.map(<[Reading]>::to_vec).unwrap_or_default();
            next.extend(readings);
            let len = next.len();
            (Change::Replace(next), len)
        })
        .await
    }

    /// Removes a whole session. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.update(key, |existing| match existing {
            Some(_) => (Change::Remove, true),
            None => (Change::Keep, false),
        })
        .await
    }

    /// The single mutation primitive. `f` sees the current readings for
    /// `key` and decides the change; writers are serialized, so nothing
    /// changes between `f` running and the change landing.
    pub async fn update<F, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(Option<&[Reading]>) -> (Change, T),
    {
        let _writer = self.inner.write_lock.lock().await;

        let current = self.get(key);
        let (change, output) = f(current.as_deref().map(Vec::as_slice));

        let next = match change {
            Change::Keep => return Ok(output),
            Change::Replace(readings) => Some(Arc::new(readings)),
            Change::Remove => None,
        };

        let payload = {
            let sessions = self.read();
            let view = BlobView {
                sessions: &sessions,
                key,
                next: next.as_deref().map(Vec::as_slice),
            };
            serde_json::to_string(&view).context("failed to serialize session blob")?
        };

        self.inner
            .db
            .save_session_blob(payload)
            .await
            .with_context(|| format!("failed to persist change to session {key}"))?;

        let mut sessions = self.write();
        match next {
            Some(readings) => {
                sessions.insert(key.to_string(), readings);
            }
            None => {
                sessions.remove(key);
            }
        }

        Ok(output)
    }
}

/// The session map as it will look after one pending change, serialized
/// without cloning the untouched sessions.
struct BlobView<'a> {
    sessions: &'a SessionMap,
    key: &'a str,
    next: Option<&'a [Reading]>,
}

impl Serialize for BlobView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let replaced = usize::from(self.sessions.contains_key(self.key));
        let len = self.sessions.len() - replaced + usize::from(self.next.is_some());

        let mut map = serializer.serialize_map(Some(len))?;
        for (key, readings) in self.sessions {
            if key != self.key {
                map.serialize_entry(key, readings.as_slice())?;
            }
        }
        if let Some(next) = self.next {
            map.serialize_entry(self.key, next)?;
        }
        map.end()
    }
}
