//! CSV export of stored sessions, one file per session.

pub mod csv;

use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use crate::models::{is_safe_session_key, Reading};
use crate::store::SessionStore;

pub use self::csv::{export_session_to_writer, format_value, CSV_HEADER};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const DEFAULT_BATCH_ROWS: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub batch_rows: NonZeroUsize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            batch_rows: NonZeroUsize::new(DEFAULT_BATCH_ROWS).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
    pub path: PathBuf,
    pub rows: usize,
    /// Row batches written to the file.
    pub flushes: usize,
}

/// Per-session outcome, in request order.
#[derive(Debug)]
pub struct ExportReport {
    pub sessions: Vec<(String, Result<ExportedFile>)>,
}

impl ExportReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &ExportedFile)> {
        self.sessions
            .iter()
            .filter_map(|(key, result)| result.as_ref().ok().map(|file| (key.as_str(), file)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &anyhow::Error)> {
        self.sessions
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|err| (key.as_str(), err)))
    }

    pub fn is_complete(&self) -> bool {
        self.sessions.iter().all(|(_, result)| result.is_ok())
    }

    pub fn get(&self, key: &str) -> Option<&Result<ExportedFile>> {
        self.sessions
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, result)| result)
    }
}

/// `2024-07-02 12:00:00` -> `2024-07-02 12-00-00.csv`
pub fn export_file_name(session_key: &str) -> String {
    format!("{}.csv", session_key.replace(':', "-"))
}

/// Exports each requested session on its own blocking worker. Failures are
/// reported per session; the only shared failure is an unusable `out_dir`.
pub async fn export_sessions(
    store: &SessionStore,
    keys: &[String],
    out_dir: &Path,
    options: ExportOptions,
) -> Result<ExportReport> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

    let mut requested = HashSet::new();
    // File name -> the key that claimed it first in this request.
    let mut claimed: HashMap<String, &str> = HashMap::new();
    let mut pending = Vec::with_capacity(keys.len());

    for key in keys {
        if !requested.insert(key.as_str()) {
            continue;
        }

        let file_name = export_file_name(key);
        let readings = if !is_safe_session_key(key) {
            Err(anyhow!("session key {key:?} is not usable as a file name"))
        } else if let Some(owner) = claimed.get(&file_name) {
            Err(anyhow!("{file_name} is already taken by session {owner:?}"))
        } else {
            store
                .get(key)
                .ok_or_else(|| anyhow!("no session named {key:?}"))
        };

        let job = readings.map(|readings| {
            claimed.insert(file_name.clone(), key.as_str());
            let path = out_dir.join(&file_name);
            let batch_rows = options.batch_rows;
            tokio::task::spawn_blocking(move || write_session_file(&readings, &path, batch_rows))
        });
        pending.push((key.clone(), job));
    }

    let mut sessions = Vec::with_capacity(pending.len());
    for (key, job) in pending {
        let result = match job {
            Ok(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(anyhow!("export worker for {key} failed: {err}")),
            },
            Err(err) => Err(err),
        };

        match &result {
            Ok(file) => log_info!("exported {} rows of {key} to {}", file.rows, file.path.display()),
            Err(err) => log_warn!("export of {key} failed: {err:#}"),
        }
        sessions.push((key, result));
    }

    Ok(ExportReport { sessions })
}

fn write_session_file(
    readings: &Arc<Vec<Reading>>,
    path: &Path,
    batch_rows: NonZeroUsize,
) -> Result<ExportedFile> {
    let partial = path.with_extension("csv.part");

    let written = File::create(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))
        .and_then(|mut file| {
            let flushes = export_session_to_writer(readings, &mut file, batch_rows)?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", partial.display()))?;
            Ok(flushes)
        })
        .and_then(|flushes| {
            if path.is_dir() {
                bail!("{} is a directory", path.display());
            }
            fs::rename(&partial, path)
                .with_context(|| format!("failed to move export into {}", path.display()))?;
            Ok(flushes)
        });

    match written {
        Ok(flushes) => Ok(ExportedFile {
            path: path.to_path_buf(),
            rows: readings.len(),
            flushes,
        }),
        Err(err) => {
            let _ = fs::remove_file(&partial);
            Err(err)
        }
    }
}
