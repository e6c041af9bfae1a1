pub mod db;
pub mod export;
pub mod host;
pub mod models;
pub mod reassembly;
pub mod recorder;
pub mod sampler;
pub mod settings;
pub mod store;
pub mod transport;
pub mod utils;

use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use db::Database;
use host::Host;
use recorder::Recorder;
use sampler::{Sampler, SimulatedSource};
use settings::{Settings, SettingsStore};
use transport::{LinkTransport, Outbox, PairedLink, Transport};

const DEMO_RECORDING: Duration = Duration::from_secs(2);
const OUTBOX_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Settings from `<data dir>/settings.json`, with `SENSORCOLLECT_*`
/// environment variables taking precedence.
pub fn load_settings() -> Result<Settings> {
    let mut bootstrap = Settings::default();
    bootstrap.apply_env_overrides()?;

    let store = SettingsStore::new(bootstrap.data_dir.join("settings.json"))?;
    let mut settings = store.settings();
    settings.apply_env_overrides()?;
    settings.validate()?;
    Ok(settings)
}

/// Runs the demo pipeline: a simulated watch records a short session and
/// saves it over a paired link, the host reassembles it and every stored
/// session is exported to CSV.
pub fn run() -> Result<()> {
    let settings = load_settings()?;
    utils::logging::init(settings.debug);

    info!("SensorCollect starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(run_pipeline(settings))
}

async fn run_pipeline(settings: Settings) -> Result<()> {
    let mut host = Host::open(settings.clone()).await?;

    let link = PairedLink::new();
    let inbound = link
        .take_inbound()
        .context("link inbound stream already taken")?;
    host.attach(inbound)?;

    let watch_db = Database::new(settings.data_dir.join("watch.sqlite3"))
        .context("failed to open watch outbox database")?;
    let transport = LinkTransport::new(
        link.clone(),
        Outbox::new(watch_db, settings.max_queued_batches),
    );

    link.activate().await?;
    let cancel_token = CancellationToken::new();
    let flusher = transport.spawn_flusher(OUTBOX_RETRY_INTERVAL, cancel_token.clone());

    let sampler = Sampler::new(Box::new(SimulatedSource::new()), settings.sample_interval());
    let recorder = Recorder::new(
        sampler,
        transport.clone(),
        settings.chunk_size(),
        settings.delivery,
    );

    recorder.start().await?;
    tokio::time::sleep(DEMO_RECORDING).await;
    recorder.pause().await?;

    let report = recorder.save().await?;
    info!(
        "Saved {}: {} readings in {} batches ({} sent, {} queued, {} dropped)",
        report.session_key, report.readings, report.batches, report.sent, report.queued, report.dropped
    );

    let delivered = transport.flush().await?;
    if delivered > 0 {
        info!("Flushed {delivered} queued batches");
    }
    host.sync().await?;

    let export = host.export_all(None).await?;
    for (key, file) in export.succeeded() {
        info!("{key}: {} rows -> {}", file.rows, file.path.display());
    }
    for (key, err) in export.failed() {
        warn!("{key}: export failed: {err:#}");
    }

    cancel_token.cancel();
    flusher.await.context("outbox flusher failed to join")?;
    host.shutdown().await?;

    info!("SensorCollect finished ({:?})", transport.stats());
    Ok(())
}
