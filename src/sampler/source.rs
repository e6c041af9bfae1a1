//! Motion hardware seam.

use std::f64::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::models::MotionSample;

/// A device-motion sensor. `read` is polled once per sampling tick.
pub trait MotionSource: Send {
    /// False when the hardware is missing or switched off.
    fn is_available(&self) -> bool;

    /// Called when the sampler arms.
    fn start(&mut self) {}

    /// Latest fused sample, or `None` if the sensor had nothing this tick.
    fn read(&mut self) -> Option<MotionSample>;

    /// Called when the sampler disarms.
    fn stop(&mut self) {}
}

/// Sensor on a device without motion hardware.
#[derive(Debug, Default)]
pub struct UnavailableSource;

impl MotionSource for UnavailableSource {
    fn is_available(&self) -> bool {
        false
    }

    fn read(&mut self) -> Option<MotionSample> {
        None
    }
}

/// Plausible wrist motion: a slow arm swing plus sensor noise, with gravity
/// mostly along -z. Used by the demo binary and anywhere real hardware is
/// absent.
pub struct SimulatedSource {
    rng: StdRng,
    phase: f64,
    /// Swing frequency in cycles per tick.
    step: f64,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            phase: 0.0,
            // ~1 Hz swing at 100 Hz sampling
            step: 0.01,
        }
    }

    fn noise(&mut self, scale: f64) -> f64 {
        self.rng.gen_range(-scale..=scale)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionSource for SimulatedSource {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&mut self) {
        self.phase = 0.0;
    }

    fn read(&mut self) -> Option<MotionSample> {
        let swing = (self.phase * TAU).sin();
        let pitch = 0.4 * swing;
        self.phase = (self.phase + self.step) % 1.0;

        Some(MotionSample {
            user_acceleration: [
                0.3 * swing + self.noise(0.02),
                self.noise(0.02),
                0.1 * swing.abs() + self.noise(0.02),
            ],
            rotation_rate: [
                1.2 * (self.phase * TAU).cos() + self.noise(0.05),
                self.noise(0.05),
                self.noise(0.05),
            ],
            gravity: [pitch.sin(), 0.0, -pitch.cos()],
            attitude: [pitch, self.noise(0.01), self.noise(0.01)],
        })
    }
}

/// Replays a fixed list of samples, cycling when it runs out.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    samples: Vec<MotionSample>,
    position: usize,
}

impl ReplaySource {
    pub fn new(samples: Vec<MotionSample>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl MotionSource for ReplaySource {
    fn is_available(&self) -> bool {
        !self.samples.is_empty()
    }

    fn read(&mut self) -> Option<MotionSample> {
        let sample = self.samples.get(self.position).copied()?;
        self.position = (self.position + 1) % self.samples.len();
        Some(sample)
    }
}
