//! Motion reading data model.
//!
//! A `Reading` is one sample as it travels over the wire, sits in the store
//! and lands in a CSV row. Field names are serialized in camelCase so the
//! JSON form matches the flat record the watch sends.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Raw motion values for one sensor tick, before the sampler stamps time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionSample {
    /// User acceleration [x, y, z] in g, gravity removed.
    pub user_acceleration: [f64; 3],
    /// Rotation rate [x, y, z] in rad/s.
    pub rotation_rate: [f64; 3],
    /// Gravity vector [x, y, z] in g.
    pub gravity: [f64; 3],
    /// Attitude as (pitch, roll, yaw) in radians.
    pub attitude: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Session-relative offset in seconds.
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub acceleration_x: f64,
    pub acceleration_y: f64,
    pub acceleration_z: f64,
    pub rotation_rate_x: f64,
    pub rotation_rate_y: f64,
    pub rotation_rate_z: f64,
    pub gravity_x: f64,
    pub gravity_y: f64,
    pub gravity_z: f64,
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

impl Reading {
    pub fn new(time: f64, timestamp: Option<String>, sample: MotionSample) -> Self {
        let [acceleration_x, acceleration_y, acceleration_z] = sample.user_acceleration;
        let [rotation_rate_x, rotation_rate_y, rotation_rate_z] = sample.rotation_rate;
        let [gravity_x, gravity_y, gravity_z] = sample.gravity;
        let [pitch, roll, yaw] = sample.attitude;

        Self {
            time,
            timestamp,
            acceleration_x,
            acceleration_y,
            acceleration_z,
            rotation_rate_x,
            rotation_rate_y,
            rotation_rate_z,
            gravity_x,
            gravity_y,
            gravity_z,
            pitch,
            roll,
            yaw,
        }
    }

    /// Zero-valued reading at `time`. Handy for fixtures and tests.
    pub fn at(time: f64) -> Self {
        Self::new(time, None, MotionSample::default())
    }

    /// The twelve motion scalars in CSV column order.
    pub fn motion_values(&self) -> [f64; 12] {
        [
            self.acceleration_x,
            self.acceleration_y,
            self.acceleration_z,
            self.rotation_rate_x,
            self.rotation_rate_y,
            self.rotation_rate_z,
            self.gravity_x,
            self.gravity_y,
            self.gravity_z,
            self.pitch,
            self.roll,
            self.yaw,
        ]
    }

    /// Rejects readings that cannot have come from the sampler.
    pub fn validate(&self) -> Result<()> {
        if !self.time.is_finite() || self.time < 0.0 {
            bail!("reading has invalid time offset {}", self.time);
        }
        if let Some(index) = self.motion_values().iter().position(|v| !v.is_finite()) {
            bail!(
                "reading at t={} has non-finite value in column {}",
                self.time,
                index + 2
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_flat_camel_case_record() {
        let reading = Reading::new(
            0.01,
            Some("2024-07-02 12:00:00.010".into()),
            MotionSample {
                user_acceleration: [0.1, 0.2, 0.3],
                rotation_rate: [0.4, 0.5, 0.6],
                gravity: [0.7, 0.8, 0.9],
                attitude: [1.0, 1.1, 1.2],
            },
        );

        let value = serde_json::to_value(&reading).unwrap();
        assert_eq!(value["accelerationX"], 0.1);
        assert_eq!(value["rotationRateZ"], 0.6);
        assert_eq!(value["gravityY"], 0.8);
        assert_eq!(value["yaw"], 1.2);
        assert_eq!(value["timestamp"], "2024-07-02 12:00:00.010");
    }

    #[test]
    fn timestamp_is_optional_but_numbers_are_not() {
        let without_timestamp = r#"{"time":0.0,"accelerationX":0,"accelerationY":0,"accelerationZ":0,
            "rotationRateX":0,"rotationRateY":0,"rotationRateZ":0,"gravityX":0,"gravityY":0,
            "gravityZ":-1,"pitch":0,"roll":0,"yaw":0}"#;
        let reading: Reading = serde_json::from_str(without_timestamp).unwrap();
        assert!(reading.timestamp.is_none());
        assert_eq!(reading.gravity_z, -1.0);

        let missing_yaw = r#"{"time":0.0,"accelerationX":0,"accelerationY":0,"accelerationZ":0,
            "rotationRateX":0,"rotationRateY":0,"rotationRateZ":0,"gravityX":0,"gravityY":0,
            "gravityZ":0,"pitch":0,"roll":0}"#;
        assert!(serde_json::from_str::<Reading>(missing_yaw).is_err());
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        let mut reading = Reading::at(0.5);
        assert!(reading.validate().is_ok());

        reading.roll = f64::NAN;
        assert!(reading.validate().is_err());

        let negative = Reading::at(-0.01);
        assert!(negative.validate().is_err());
    }
}
