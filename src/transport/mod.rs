pub mod chunker;
pub mod link;
pub mod outbox;
pub mod wire;

use std::{
    future::Future,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::Batch;

pub use chunker::{batches, chunk};
pub use link::{LinkState, PairedLink};
pub use outbox::Outbox;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryMode {
    /// Fire-and-forget. Dropped if the peer is unreachable at send time.
    BestEffort,
    /// Queued durably until the peer confirms receipt. At-least-once.
    Guaranteed,
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "besteffort" => Ok(DeliveryMode::BestEffort),
            "guaranteed" | "queued" => Ok(DeliveryMode::Guaranteed),
            other => Err(anyhow!("unknown delivery mode '{other}'")),
        }
    }
}

/// What happened to one batch handed to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Delivery {
    Sent,
    Dropped,
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// Best-effort batches the peer accepted.
    pub sent: u64,
    /// Best-effort batches lost because the peer was unreachable.
    pub dropped: u64,
    /// Guaranteed batches written to the outbox.
    pub queued: u64,
    /// Outbox entries the peer accepted.
    pub delivered: u64,
}

/// Moves batches from the watch to its paired phone.
pub trait Transport: Send + Sync {
    fn send_best_effort(&self, batch: &Batch) -> impl Future<Output = Result<Delivery>> + Send;

    fn send_guaranteed(&self, batch: &Batch) -> impl Future<Output = Result<Delivery>> + Send;

    /// Pushes whatever is deliverable right now. Returns the count delivered.
    fn flush(&self) -> impl Future<Output = Result<usize>> + Send;

    fn stats(&self) -> TransportStats;

    fn send(&self, batch: &Batch, mode: DeliveryMode) -> impl Future<Output = Result<Delivery>> + Send {
        async move {
            match mode {
                DeliveryMode::BestEffort => self.send_best_effort(batch).await,
                DeliveryMode::Guaranteed => self.send_guaranteed(batch).await,
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    queued: AtomicU64,
    delivered: AtomicU64,
}

/// `Transport` over a `PairedLink`, with an SQLite-backed outbox for
/// guaranteed sends.
#[derive(Clone)]
pub struct LinkTransport {
    link: PairedLink,
    outbox: Outbox,
    counters: Arc<Counters>,
}

impl LinkTransport {
    pub fn new(link: PairedLink, outbox: Outbox) -> Self {
        Self {
            link,
            outbox,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn link(&self) -> &PairedLink {
        &self.link
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Background task retrying the outbox every `interval` and whenever the
    /// link becomes active.
    pub fn spawn_flusher(&self, interval: Duration, cancel_token: CancellationToken) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move { transport.flush_loop(interval, cancel_token).await })
    }

    async fn flush_loop(self, interval: Duration, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut states = self.link.subscribe_state();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel_token.cancelled() => {
                    log_info!("outbox flusher shutting down");
                    break;
                }
            }

            if !self.link.is_reachable() {
                continue;
            }
            if let Err(err) = self.flush().await {
                log_error!("outbox flush failed: {err:?}");
            }
        }
    }
}

impl Transport for LinkTransport {
    async fn send_best_effort(&self, batch: &Batch) -> Result<Delivery> {
        let payload = wire::encode(batch)?;

        match self.link.deliver(payload.into_bytes()).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(Delivery::Sent)
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log_warn!(
                    "dropped best-effort batch of {} readings for session {}: {err}",
                    batch.len(),
                    batch.session_key
                );
                Ok(Delivery::Dropped)
            }
        }
    }

    async fn send_guaranteed(&self, batch: &Batch) -> Result<Delivery> {
        self.outbox.enqueue(batch).await?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);

        if self.link.is_reachable() {
            if let Err(err) = self.flush().await {
                log_warn!("opportunistic outbox flush failed: {err:?}");
            }
        }
        Ok(Delivery::Queued)
    }

    async fn flush(&self) -> Result<usize> {
        let delivered = self.outbox.flush(&self.link).await?;
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Reading;

    fn transport(dir: &tempfile::TempDir, capacity: usize) -> LinkTransport {
        let db = Database::new(dir.path().join("transport.sqlite3")).unwrap();
        LinkTransport::new(PairedLink::new(), Outbox::new(db, capacity))
    }

    fn batch(time: f64) -> Batch {
        Batch::new("2024-07-02 12:00:00", vec![Reading::at(time)])
    }

    #[test]
    fn delivery_mode_parses_common_spellings() {
        assert_eq!("bestEffort".parse::<DeliveryMode>().unwrap(), DeliveryMode::BestEffort);
        assert_eq!("best_effort".parse::<DeliveryMode>().unwrap(), DeliveryMode::BestEffort);
        assert_eq!("Guaranteed".parse::<DeliveryMode>().unwrap(), DeliveryMode::Guaranteed);
        assert!("maybe".parse::<DeliveryMode>().is_err());
    }

    #[tokio::test]
    async fn best_effort_drops_when_unreachable_and_says_so() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir, 10);
        let mut inbound = transport.link().take_inbound().unwrap();

        assert_eq!(transport.send_best_effort(&batch(0.0)).await.unwrap(), Delivery::Dropped);

        transport.link().activate().await.unwrap();
        assert_eq!(transport.send_best_effort(&batch(0.01)).await.unwrap(), Delivery::Sent);

        let stats = transport.stats();
        assert_eq!((stats.sent, stats.dropped), (1, 1));

        let received = wire::decode(&inbound.recv().await.unwrap()).unwrap();
        assert_eq!(received.readings[0].time, 0.01);
        assert!(received.message_id.is_none());
    }

    #[tokio::test]
    async fn guaranteed_queues_until_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir, 10);
        let mut inbound = transport.link().take_inbound().unwrap();

        transport.link().activate().await.unwrap();
        transport.link().set_reachable(false);

        for time in [0.0, 0.01] {
            assert_eq!(
                transport.send(&batch(time), DeliveryMode::Guaranteed).await.unwrap(),
                Delivery::Queued
            );
        }
        assert!(inbound.try_recv().is_err());
        assert_eq!(transport.outbox().len().await.unwrap(), 2);

        transport.link().set_reachable(true);
        assert_eq!(transport.flush().await.unwrap(), 2);

        let first = wire::decode(&inbound.recv().await.unwrap()).unwrap();
        let second = wire::decode(&inbound.recv().await.unwrap()).unwrap();
        assert_eq!(first.readings[0].time, 0.0);
        assert_eq!(second.readings[0].time, 0.01);

        let stats = transport.stats();
        assert_eq!((stats.queued, stats.delivered), (2, 2));
    }

    #[tokio::test]
    async fn full_outbox_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir, 1);

        transport.send_guaranteed(&batch(0.0)).await.unwrap();
        assert!(transport.send_guaranteed(&batch(0.01)).await.is_err());
        assert_eq!(transport.stats().queued, 1);
    }

    #[tokio::test]
    async fn flusher_drains_after_activation() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(&dir, 10);
        let mut inbound = transport.link().take_inbound().unwrap();

        transport.send_guaranteed(&batch(0.0)).await.unwrap();

        let cancel = CancellationToken::new();
        let flusher = transport.spawn_flusher(Duration::from_millis(20), cancel.clone());

        transport.link().activate().await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire::decode(&payload).unwrap().session_key, "2024-07-02 12:00:00");

        cancel.cancel();
        flusher.await.unwrap();
    }
}
