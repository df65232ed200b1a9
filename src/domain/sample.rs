//! Raw inertial sample types.

use serde::{Deserialize, Serialize};

/// A three-axis sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// X axis component.
    pub x: f64,
    /// Y axis component.
    pub y: f64,
    /// Z axis component.
    pub z: f64,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean magnitude.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A fused accelerometer + gyroscope sample.
///
/// Accelerometer values are in units of g (1.0 = resting in Earth gravity),
/// gyroscope values in rad/s. The timestamp is monotonic milliseconds; all
/// detection arithmetic (candidate windows, quarantine, dwell) is carried out
/// on these timestamps, never on wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Accelerometer reading in g.
    pub accel: Vec3,
    /// Gyroscope reading in rad/s.
    pub gyro: Vec3,
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: u64,
}

impl SensorSample {
    /// Create a new fused sample.
    pub fn new(timestamp_ms: u64, accel: Vec3, gyro: Vec3) -> Self {
        Self {
            accel,
            gyro,
            timestamp_ms,
        }
    }

    /// Magnitude of acceleration in g.
    pub fn accel_magnitude(&self) -> f64 {
        self.accel.magnitude()
    }

    /// Magnitude of rotational velocity in rad/s.
    pub fn gyro_magnitude(&self) -> f64 {
        self.gyro.magnitude()
    }

    /// Deviation from resting gravity: `||a| - 1.0|` in g.
    ///
    /// Zero when the device is stationary in Earth's gravity regardless of
    /// orientation, large during impacts and free fall alike.
    pub fn gravity_deviation(&self) -> f64 {
        (self.accel_magnitude() - 1.0).abs()
    }
}
