use std::num::NonZeroUsize;

use anyhow::{bail, Context, Result};
use chrono::Local;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    models::{Reading, SessionKeyGenerator},
    sampler::{ArmOutcome, Sampler, SamplerController},
    transport::{batches, Delivery, DeliveryMode, Transport},
};

use super::{RecorderState, RecorderStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSnapshot {
    pub state: RecorderState,
    /// Session-relative seconds, including the running window.
    pub elapsed_seconds: f64,
    pub buffered: usize,
    /// Readings from an earlier save that did not make it to the transport.
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub session_key: String,
    pub readings: usize,
    pub batches: usize,
    pub sent: usize,
    pub queued: usize,
    /// Best-effort batches the peer never saw.
    pub dropped: usize,
}

/// Readings drained by a save that has not finished handing them over.
struct PendingSave {
    session_key: String,
    readings: Vec<Reading>,
}

struct RecorderInner {
    state: RecorderState,
    controller: SamplerController,
    keys: SessionKeyGenerator,
    pending: Option<PendingSave>,
}

/// Watch-side control surface: start, pause, save, reset.
pub struct Recorder<T: Transport> {
    inner: Mutex<RecorderInner>,
    sampler: Sampler,
    transport: T,
    chunk_size: NonZeroUsize,
    delivery: DeliveryMode,
}

impl<T: Transport> Recorder<T> {
    pub fn new(sampler: Sampler, transport: T, chunk_size: NonZeroUsize, delivery: DeliveryMode) -> Self {
        Self {
            inner: Mutex::new(RecorderInner {
                state: RecorderState::new(),
                controller: SamplerController::new(),
                keys: SessionKeyGenerator::new(),
                pending: None,
            }),
            sampler,
            transport,
            chunk_size,
            delivery,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        let inner = self.inner.lock().await;
        let elapsed_seconds = match inner.state.status {
            RecorderStatus::Running => self.sampler.next_offset(),
            _ => inner.state.elapsed,
        };
        RecorderSnapshot {
            state: inner.state.clone(),
            elapsed_seconds,
            buffered: self.sampler.buffered_len(),
            pending: inner.pending.as_ref().map_or(0, |p| p.readings.len()),
        }
    }

    /// Arms the sampler at the current elapsed offset and starts the
    /// sampling loop.
    pub async fn start(&self) -> Result<ArmOutcome> {
        let mut inner = self.inner.lock().await;
        if !inner.state.can_start() {
            bail!("recording already running");
        }

        let outcome = self.sampler.arm(inner.state.elapsed)?;
        if let Err(err) = inner.controller.start_sampling(self.sampler.clone()) {
            self.sampler.disarm();
            return Err(err);
        }

        inner
            .state
            .begin_run(Local::now(), outcome == ArmOutcome::Degraded);
        info!("Recording started at {:.2}s ({outcome:?})", inner.state.elapsed);
        Ok(outcome)
    }

    /// Stops sampling and keeps the elapsed offset for a later resume.
    pub async fn pause(&self) -> Result<RecorderState> {
        let mut inner = self.inner.lock().await;
        if inner.state.status != RecorderStatus::Running {
            bail!("recording is not running");
        }

        inner.controller.stop_sampling().await?;
        self.sampler.disarm();
        inner.state.pause(self.sampler.next_offset());

        info!(
            "Recording paused at {:.2}s with {} readings buffered",
            inner.state.elapsed,
            self.sampler.buffered_len()
        );
        Ok(inner.state.clone())
    }

    /// Drains the capture, splits it into batches and hands each one to the
    /// transport, then resets for the next session.
    ///
    /// A transport error stops the save; the readings not yet handed over
    /// stay pending under the same session key and go out with the next
    /// save.
    pub async fn save(&self) -> Result<SaveReport> {
        let mut inner = self.inner.lock().await;
        if inner.state.status == RecorderStatus::Running {
            bail!("pause the recording before saving");
        }

        let drained = self.sampler.drain();
        let mut pending = match inner.pending.take() {
            Some(pending) => pending,
            None => {
                if drained.is_empty() {
                    bail!("nothing recorded");
                }
                let started_at = inner.state.started_at.unwrap_or_else(Local::now);
                PendingSave {
                    session_key: inner.keys.next_key_at(started_at),
                    readings: Vec::new(),
                }
            }
        };
        pending.readings.extend(drained);

        let mut report = SaveReport {
            session_key: pending.session_key.clone(),
            readings: pending.readings.len(),
            batches: 0,
            sent: 0,
            queued: 0,
            dropped: 0,
        };

        let mut failure = None;
        for batch in batches(&pending.session_key, &pending.readings, self.chunk_size) {
            match self.transport.send(&batch, self.delivery).await {
                Ok(Delivery::Sent) => report.sent += 1,
                Ok(Delivery::Queued) => report.queued += 1,
                Ok(Delivery::Dropped) => report.dropped += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
            report.batches += 1;
        }

        if let Some(err) = failure {
            let handed_over = report.batches * self.chunk_size.get();
            pending.readings.drain(..handed_over);
            let remaining = pending.readings.len();
            let key = pending.session_key.clone();
            inner.pending = Some(pending);
            return Err(err).with_context(|| {
                format!("save of {key} stopped with {remaining} readings still pending")
            });
        }

        if report.dropped > 0 {
            warn!(
                "Session {} saved with {} of {} batches dropped",
                report.session_key, report.dropped, report.batches
            );
        } else {
            info!(
                "Session {} saved: {} readings in {} batches",
                report.session_key, report.readings, report.batches
            );
        }

        inner.state.reset();
        self.sampler.reset_clock();
        Ok(report)
    }

    /// Discards everything captured and returns to idle.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.controller.stop_sampling().await?;
        self.sampler.disarm();

        let discarded = self.sampler.drain().len();
        self.sampler.reset_clock();
        inner.pending = None;
        inner.state.reset();

        if discarded > 0 {
            info!("Recording reset, {discarded} readings discarded");
        }
        Ok(())
    }
}
