//! Merges received batches into the session store.
//!
//! All merges run on one task that owns the write side of the store; the
//! transport hands batches over through a mailbox, so two batches for the
//! same session can never race.

pub mod merge;

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::models::{Batch, Reading};
use crate::store::{Change, SessionStore};
use crate::transport::wire;

pub use merge::{merge_readings, MergeOutcome, MergePolicy};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const MAILBOX_CAPACITY: usize = 256;
const RECENT_MESSAGE_IDS: usize = 4096;

/// Bounded memory of applied message ids.
struct RecentIds {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    fn remember(&mut self, id: Uuid) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReassemblerStats {
    pub batches_applied: u64,
    pub duplicate_batches: u64,
    pub readings_accepted: u64,
    pub readings_skipped: u64,
    /// Payloads that failed to decode.
    pub rejected: u64,
    /// Merges the store refused to persist.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    batches_applied: AtomicU64,
    duplicate_batches: AtomicU64,
    readings_accepted: AtomicU64,
    readings_skipped: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReassemblerStats {
        ReassemblerStats {
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            duplicate_batches: self.duplicate_batches.load(Ordering::Relaxed),
            readings_accepted: self.readings_accepted.load(Ordering::Relaxed),
            readings_skipped: self.readings_skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct Reassembler {
    store: SessionStore,
    policy: MergePolicy,
    recent: RecentIds,
    counters: Arc<Counters>,
}

impl Reassembler {
    pub fn new(store: SessionStore, policy: MergePolicy) -> Self {
        Self {
            store,
            policy,
            recent: RecentIds::new(RECENT_MESSAGE_IDS),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.counters.snapshot()
    }

    /// Creates the session on its first batch, merges into it afterwards.
    pub async fn on_batch_received(
        &mut self,
        session_key: &str,
        readings: Vec<Reading>,
    ) -> Result<MergeOutcome> {
        let policy = self.policy;
        let result = self
            .store
            .update(session_key, move |existing| {
                let (next, outcome) = merge_readings(existing, readings, policy);
                let change = match next {
                    Some(readings) => Change::Replace(readings),
                    None => Change::Keep,
                };
                (change, outcome)
            })
            .await;

        match result {
            Ok(outcome) => {
                self.counters.batches_applied.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .readings_accepted
                    .fetch_add(outcome.accepted as u64, Ordering::Relaxed);
                self.counters
                    .readings_skipped
                    .fetch_add(outcome.skipped as u64, Ordering::Relaxed);

                if outcome.created {
                    log_info!("session {session_key} created with {} readings", outcome.accepted);
                }
                if outcome.reordered {
                    log_debug!("session {session_key} re-sorted after a late batch");
                }
                Ok(outcome)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Applies a batch, recognising redeliveries by message id under the
    /// idempotent policy.
    pub async fn apply(&mut self, batch: Batch) -> Result<MergeOutcome> {
        if self.policy == MergePolicy::Idempotent {
            if let Some(id) = batch.message_id {
                if self.recent.contains(&id) {
                    self.counters
                        .duplicate_batches
                        .fetch_add(1, Ordering::Relaxed);
                    log_debug!("ignoring redelivered batch {id} for session {}", batch.session_key);
                    return Ok(MergeOutcome {
                        skipped: batch.readings.len(),
                        session_len: self.store.get(&batch.session_key).map_or(0, |r| r.len()),
                        ..MergeOutcome::default()
                    });
                }
            }
        }

        let message_id = batch.message_id;
        let outcome = self.on_batch_received(&batch.session_key, batch.readings).await?;
        if let Some(id) = message_id {
            self.recent.remember(id);
        }
        Ok(outcome)
    }

    /// Decodes a wire payload and applies it. Malformed payloads are
    /// rejected before they reach the store.
    pub async fn apply_payload(&mut self, payload: &[u8]) -> Result<MergeOutcome> {
        let batch = match wire::decode(payload) {
            Ok(batch) => batch,
            Err(err) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        self.apply(batch).await
    }

    /// Moves the reassembler onto its own task.
    pub fn spawn(self) -> ReassemblerHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let counters = Arc::clone(&self.counters);
        let task = tokio::spawn(self.run(rx));

        ReassemblerHandle {
            tx,
            counters,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Batch { batch, reply } => {
                    let key = batch.session_key.clone();
                    let result = self.apply(batch).await;
                    if let Err(err) = &result {
                        log_error!("failed to merge batch for session {key}: {err:?}");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::Payload(payload) => {
                    if let Err(err) = self.apply_payload(&payload).await {
                        log_warn!("dropped inbound payload ({} bytes): {err:#}", payload.len());
                    }
                }
                Command::Barrier(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        log_info!("reassembler mailbox closed");
    }
}

enum Command {
    Batch {
        batch: Batch,
        reply: Option<oneshot::Sender<Result<MergeOutcome>>>,
    },
    Payload(Vec<u8>),
    Barrier(oneshot::Sender<()>),
}

/// Mailbox handle to a running [`Reassembler`].
#[derive(Clone)]
pub struct ReassemblerHandle {
    tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ReassemblerHandle {
    /// Merges `batch` and waits for the outcome.
    pub async fn submit(&self, batch: Batch) -> Result<MergeOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Batch {
                batch,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| anyhow!("reassembler stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("reassembler dropped the reply"))?
    }

    /// Queues a raw inbound payload; decode or merge failures are logged
    /// and counted, not returned.
    pub async fn deliver(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(Command::Payload(payload))
            .await
            .map_err(|_| anyhow!("reassembler stopped"))
    }

    /// Resolves once everything queued before it has been merged.
    pub async fn barrier(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Barrier(reply_tx))
            .await
            .map_err(|_| anyhow!("reassembler stopped"))?;
        reply_rx.await.context("reassembler stopped before the barrier")
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.counters.snapshot()
    }

    /// Closes this handle's side of the mailbox and waits for the task once
    /// every other handle is gone too.
    pub async fn shutdown(self) -> Result<()> {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(self.tx);
        if let Some(task) = task {
            task.await.context("reassembler task failed to join")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const KEY: &str = "2024-07-02 12:00:00";

    async fn store(dir: &tempfile::TempDir) -> SessionStore {
        let db = Database::new(dir.path().join("r.sqlite3")).unwrap();
        SessionStore::open(db).await.unwrap()
    }

    fn batch(times: &[f64]) -> Batch {
        Batch::new(KEY, times.iter().map(|t| Reading::at(*t)).collect())
    }

    fn times(store: &SessionStore) -> Vec<f64> {
        store.get(KEY).unwrap().iter().map(|r| r.time).collect()
    }

    #[tokio::test]
    async fn first_batch_creates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut reassembler = Reassembler::new(store.clone(), MergePolicy::Append);

        let first = reassembler.apply(batch(&[0.0])).await.unwrap();
        let second = reassembler.apply(batch(&[0.01])).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(times(&store), vec![0.0, 0.01]);
    }

    #[tokio::test]
    async fn append_policy_duplicates_redelivered_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut reassembler = Reassembler::new(store.clone(), MergePolicy::Append);

        let redelivered = batch(&[0.0, 0.01]).with_message_id(Uuid::new_v4());
        reassembler.apply(redelivered.clone()).await.unwrap();
        reassembler.apply(redelivered).await.unwrap();

        assert_eq!(times(&store), vec![0.0, 0.01, 0.0, 0.01]);
    }

    #[tokio::test]
    async fn idempotent_policy_makes_redelivery_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut reassembler = Reassembler::new(store.clone(), MergePolicy::Idempotent);

        let redelivered = batch(&[0.0, 0.01]).with_message_id(Uuid::new_v4());
        reassembler.apply(redelivered.clone()).await.unwrap();
        let outcome = reassembler.apply(redelivered).await.unwrap();

        assert_eq!(outcome.accepted, 0);
        assert_eq!(times(&store), vec![0.0, 0.01]);
        assert_eq!(reassembler.stats().duplicate_batches, 1);

        // Same readings under a new id (e.g. after a restart) are still caught.
        reassembler.apply(batch(&[0.0, 0.01])).await.unwrap();
        assert_eq!(times(&store), vec![0.0, 0.01]);
    }

    #[tokio::test]
    async fn malformed_payloads_never_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut reassembler = Reassembler::new(store.clone(), MergePolicy::Idempotent);

        assert!(reassembler
            .apply_payload(br#"{"sessionKey":"k","readings":[{"time":0}]}"#)
            .await
            .is_err());
        assert!(store.is_empty());
        assert_eq!(reassembler.stats().rejected, 1);
    }

    #[tokio::test]
    async fn mailbox_preserves_order_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let handle = Reassembler::new(store.clone(), MergePolicy::Append).spawn();

        for (key, time) in [("a", 0.0), ("b", 0.0), ("a", 0.01), ("b", 0.01), ("a", 0.02)] {
            let payload = wire::encode(&Batch::new(key, vec![Reading::at(time)])).unwrap();
            handle.deliver(payload.into_bytes()).await.unwrap();
        }
        handle.deliver(b"garbage".to_vec()).await.unwrap();
        handle.barrier().await.unwrap();

        let a: Vec<f64> = store.get("a").unwrap().iter().map(|r| r.time).collect();
        assert_eq!(a, vec![0.0, 0.01, 0.02]);
        assert_eq!(store.get("b").unwrap().len(), 2);

        let stats = handle.stats();
        assert_eq!(stats.batches_applied, 5);
        assert_eq!(stats.rejected, 1);

        let outcome = handle.submit(Batch::new("c", vec![Reading::at(0.0)])).await.unwrap();
        assert!(outcome.created);

        handle.shutdown().await.unwrap();
    }
}
