use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use crate::reassembly::MergePolicy;
use crate::transport::DeliveryMode;

pub const ENV_DATA_DIR: &str = "SENSORCOLLECT_DATA_DIR";
pub const ENV_DELIVERY: &str = "SENSORCOLLECT_DELIVERY";
pub const ENV_MERGE_POLICY: &str = "SENSORCOLLECT_MERGE_POLICY";
pub const ENV_DEBUG: &str = "SENSORCOLLECT_DEBUG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Holds the SQLite database (session blob + outbox).
    pub data_dir: PathBuf,
    /// Where CSV exports land. Defaults to `<data_dir>/exports`.
    pub export_dir: Option<PathBuf>,
    pub sample_interval_ms: u64,
    /// Readings per transported batch.
    pub chunk_size: usize,
    pub delivery: DeliveryMode,
    /// Cap on batches waiting in the guaranteed-delivery outbox.
    pub max_queued_batches: usize,
    pub merge_policy: MergePolicy,
    /// Rows formatted per write during CSV export.
    pub export_batch_rows: usize,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("sensorcollect-data"),
            export_dir: None,
            sample_interval_ms: 10,
            chunk_size: 100,
            delivery: DeliveryMode::Guaranteed,
            max_queued_batches: 10_000,
            merge_policy: MergePolicy::Idempotent,
            export_batch_rows: 1000,
            debug: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            bail!("sampleIntervalMs must be greater than zero");
        }
        if self.chunk_size == 0 {
            bail!("chunkSize must be greater than zero");
        }
        if self.export_batch_rows == 0 {
            bail!("exportBatchRows must be greater than zero");
        }
        if self.max_queued_batches == 0 {
            bail!("maxQueuedBatches must be greater than zero");
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn chunk_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.chunk_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn export_batch_rows(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.export_batch_rows).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sensorcollect.sqlite3")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("exports"))
    }

    /// Applies `SENSORCOLLECT_*` overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup(ENV_DELIVERY) {
            self.delivery = mode.parse()?;
        }
        if let Some(policy) = lookup(ENV_MERGE_POLICY) {
            self.merge_policy = policy.parse()?;
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }
}

/// Settings persisted as pretty JSON next to the data.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid settings file {}", path.display()))?
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Settings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
