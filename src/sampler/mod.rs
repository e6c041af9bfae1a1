//! Fixed-rate motion capture with a session-relative clock.
//!
//! The sampler never does I/O. The sampling loop calls [`Sampler::tick`] once
//! per period; the control layer pulls readings out with [`Sampler::drain`].

pub mod controller;
pub mod loop_worker;
pub mod source;

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{bail, Result};
use chrono::Local;
use log::{info, warn};
use serde::Serialize;

use crate::models::{format_timestamp, Reading};

pub use controller::SamplerController;
pub use source::{MotionSource, ReplaySource, SimulatedSource, UnavailableSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArmOutcome {
    Armed,
    /// Sensor unavailable; the run captures nothing.
    Degraded,
}

struct ArmedRun {
    start_offset: f64,
    produced: u64,
}

struct SamplerInner {
    source: Box<dyn MotionSource>,
    run: Option<ArmedRun>,
    degraded: bool,
    /// Offset the next sample would carry; survives disarm so a paused
    /// recording can resume where it left off.
    next_offset: f64,
    buffer: Vec<Reading>,
}

#[derive(Clone)]
pub struct Sampler {
    inner: Arc<Mutex<SamplerInner>>,
    period: Duration,
}

impl Sampler {
    pub fn new(source: Box<dyn MotionSource>, period: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SamplerInner {
                source,
                run: None,
                degraded: false,
                next_offset: 0.0,
                buffer: Vec::new(),
            })),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn lock(&self) -> MutexGuard<'_, SamplerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts a run whose k-th sample carries `start_offset + k * period`.
    pub fn arm(&self, start_offset: f64) -> Result<ArmOutcome> {
        if !start_offset.is_finite() || start_offset < 0.0 {
            bail!("invalid start offset {start_offset}");
        }

        let mut inner = self.lock();
        if inner.run.is_some() {
            bail!("sampler already armed");
        }

        inner.next_offset = start_offset;
        if !inner.source.is_available() {
            inner.degraded = true;
            warn!("Motion sensor unavailable; capture degraded to an empty run");
            return Ok(ArmOutcome::Degraded);
        }

        inner.degraded = false;
        inner.source.start();
        inner.run = Some(ArmedRun {
            start_offset,
            produced: 0,
        });
        info!("Sampler armed at offset {start_offset:.2}s");
        Ok(ArmOutcome::Armed)
    }

    /// Stops producing. The buffer is left for `drain`.
    pub fn disarm(&self) {
        let mut inner = self.lock();
        inner.degraded = false;
        if inner.run.take().is_some() {
            inner.source.stop();
            info!(
                "Sampler disarmed at offset {:.2}s ({} readings buffered)",
                inner.next_offset,
                inner.buffer.len()
            );
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().run.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    /// Takes one sample. Returns whether a reading was produced.
    pub fn tick(&self) -> bool {
        let period = self.period.as_secs_f64();
        let mut inner = self.lock();
        let SamplerInner {
            source,
            run,
            next_offset,
            buffer,
            ..
        } = &mut *inner;

        let Some(run) = run.as_mut() else {
            return false;
        };
        let Some(sample) = source.read() else {
            return false;
        };

        // Multiply rather than accumulate so offsets never drift.
        let time = run.start_offset + run.produced as f64 * period;
        run.produced += 1;
        *next_offset = run.start_offset + run.produced as f64 * period;

        buffer.push(Reading::new(
            time,
            Some(format_timestamp(Local::now())),
            sample,
        ));
        true
    }

    /// Returns and clears everything captured so far. Works armed or not.
    pub fn drain(&self) -> Vec<Reading> {
        std::mem::take(&mut self.lock().buffer)
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn next_offset(&self) -> f64 {
        self.lock().next_offset
    }

    /// Forgets the session clock. The buffer is untouched.
    pub fn reset_clock(&self) {
        self.lock().next_offset = 0.0;
    }
}
