//! Phone-side receiver: owns the session store, the reassembler task and the
//! pump that feeds inbound link payloads into it.

use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use log::info;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::Database,
    export::{export_sessions, ExportOptions, ExportReport},
    models::Reading,
    reassembly::{Reassembler, ReassemblerHandle, ReassemblerStats},
    settings::Settings,
    store::{SessionStore, SessionSummary},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

struct Pump {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    sync_tx: mpsc::Sender<oneshot::Sender<()>>,
}

pub struct Host {
    settings: Settings,
    store: SessionStore,
    reassembler: ReassemblerHandle,
    pump: Option<Pump>,
}

impl Host {
    /// Opens the database, loads the stored sessions and starts the
    /// reassembler. Any failure here is a startup error.
    pub async fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let db_path = settings.database_path();
        let db = Database::new(db_path.clone())
            .with_context(|| format!("failed to open session database {}", db_path.display()))?;
        let store = SessionStore::open(db).await?;
        let reassembler = Reassembler::new(store.clone(), settings.merge_policy).spawn();

        info!(
            "Host ready with {} stored sessions ({:?} merge policy)",
            store.len(),
            settings.merge_policy
        );

        Ok(Self {
            settings,
            store,
            reassembler,
            pump: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Starts forwarding `inbound` payloads to the reassembler.
    pub fn attach(&mut self, inbound: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        if self.pump.is_some() {
            bail!("host already attached to a link");
        }

        let cancel_token = CancellationToken::new();
        let (sync_tx, sync_rx) = mpsc::channel(8);
        let handle = tokio::spawn(pump_loop(
            inbound,
            sync_rx,
            self.reassembler.clone(),
            cancel_token.clone(),
        ));

        self.pump = Some(Pump {
            handle,
            cancel_token,
            sync_tx,
        });
        Ok(())
    }

    /// Resolves once every payload already waiting on the link has been
    /// merged into the store.
    pub async fn sync(&self) -> Result<()> {
        if let Some(pump) = &self.pump {
            let (reply_tx, reply_rx) = oneshot::channel();
            pump.sync_tx
                .send(reply_tx)
                .await
                .context("inbound pump stopped")?;
            reply_rx.await.context("inbound pump stopped before syncing")?;
        }
        self.reassembler.barrier().await
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.store.summaries()
    }

    pub fn session(&self, key: &str) -> Option<Arc<Vec<Reading>>> {
        self.store.get(key)
    }

    /// Removes whole sessions. Returns how many existed.
    pub async fn delete_sessions(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.store.delete(key).await? {
                deleted += 1;
            }
        }
        info!("Deleted {deleted} of {} requested sessions", keys.len());
        Ok(deleted)
    }

    /// Exports `keys` to `dir`, or to the configured export directory.
    pub async fn export(&self, keys: &[String], dir: Option<&Path>) -> Result<ExportReport> {
        let out_dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => self.settings.export_dir(),
        };
        let options = ExportOptions {
            batch_rows: self.settings.export_batch_rows(),
        };
        export_sessions(&self.store, keys, &out_dir, options).await
    }

    pub async fn export_all(&self, dir: Option<&Path>) -> Result<ExportReport> {
        self.export(&self.store.keys(), dir).await
    }

    pub fn reassembly_stats(&self) -> ReassemblerStats {
        self.reassembler.stats()
    }

    /// Stops the pump after it forwards whatever the link already handed
    /// over, then lets the reassembler merge everything queued.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            pump.cancel_token.cancel();
            pump.handle.await.context("inbound pump failed to join")?;
        }
        self.reassembler.shutdown().await?;
        info!("Host shut down");
        Ok(())
    }
}

async fn pump_loop(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut sync_rx: mpsc::Receiver<oneshot::Sender<()>>,
    reassembler: ReassemblerHandle,
    cancel_token: CancellationToken,
) {
    log_info!("inbound pump started");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                // The link counts a queued payload as received, so nothing
                // already in the channel may be dropped.
                inbound.close();
                let mut forwarded = 0;
                while let Ok(payload) = inbound.try_recv() {
                    if reassembler.deliver(payload).await.is_err() {
                        log_error!("reassembler stopped with inbound payloads left");
                        return;
                    }
                    forwarded += 1;
                }
                if forwarded > 0 {
                    log_info!("forwarded {forwarded} buffered payloads before stopping");
                }
                break;
            }
            Some(reply) = sync_rx.recv() => {
                while let Ok(payload) = inbound.try_recv() {
                    if reassembler.deliver(payload).await.is_err() {
                        log_error!("reassembler stopped while syncing");
                        return;
                    }
                }
                let _ = reply.send(());
            }
            payload = inbound.recv() => {
                let Some(payload) = payload else {
                    log_info!("link closed its inbound channel");
                    break;
                };
                if reassembler.deliver(payload).await.is_err() {
                    log_error!("reassembler stopped; inbound pump exiting");
                    break;
                }
            }
        }
    }

    log_info!("inbound pump stopped");
}
