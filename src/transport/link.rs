//! In-process pairing between the watch and the phone.
//!
//! The link owns the activation state machine and the inbound channel the
//! host subscribes to. Payloads cross it already wire-encoded, so the host
//! side exercises the same decode path a real radio link would.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{anyhow, bail, Result};
use log::info;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Inactive,
    Activating,
    Active,
}

struct LinkInner {
    supported: bool,
    reachable: AtomicBool,
    state_tx: watch::Sender<LinkState>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

#[derive(Clone)]
pub struct PairedLink {
    inner: Arc<LinkInner>,
}

impl PairedLink {
    pub fn new() -> Self {
        Self::with_support(true)
    }

    /// A link on hardware without pairing support; activation always fails.
    pub fn unsupported() -> Self {
        Self::with_support(false)
    }

    fn with_support(supported: bool) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Inactive);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        Self {
            inner: Arc::new(LinkInner {
                supported,
                reachable: AtomicBool::new(true),
                state_tx,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    /// Walks `Inactive → Activating → Active`. Activating an active link is
    /// a no-op.
    pub async fn activate(&self) -> Result<LinkState> {
        match self.state() {
            LinkState::Active => return Ok(LinkState::Active),
            LinkState::Activating => bail!("link activation already in progress"),
            LinkState::Inactive => {}
        }

        if !self.inner.supported {
            bail!("pairing is not supported on this device");
        }

        self.inner.state_tx.send_replace(LinkState::Activating);
        // Handshake point; lets state subscribers observe Activating.
        tokio::task::yield_now().await;
        self.inner.state_tx.send_replace(LinkState::Active);
        info!("Link activated");
        Ok(LinkState::Active)
    }

    pub fn deactivate(&self) {
        if self.inner.state_tx.send_replace(LinkState::Inactive) != LinkState::Inactive {
            info!("Link deactivated");
        }
    }

    /// Models the peer walking out of range or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.state() == LinkState::Active && self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Hands the inbound stream to its single consumer (the host).
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        match self.inner.inbound_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Delivers one payload to the peer. `Ok` is the peer's receipt.
    pub(crate) async fn deliver(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_reachable() {
            bail!("peer unreachable");
        }
        self.inner
            .inbound_tx
            .send(payload)
            .await
            .map_err(|_| anyhow!("peer closed the inbound channel"))
    }
}

impl Default for PairedLink {
    fn default() -> Self {
        Self::new()
    }
}
