//! Scalar velocity estimation from linear acceleration.

use crate::domain::SensorSample;

/// Gravitational acceleration used to convert g to m/s².
const GRAVITY_MPS2: f64 = 9.81;

/// Per-step decay applied to the velocity estimate.
///
/// Keeps the integral from drifting without bound on sensor bias and gives
/// the estimate a short effective memory (about 20 samples at a 50 ms
/// cadence).
const VELOCITY_DECAY: f64 = 0.95;

/// Configuration for the velocity estimator.
#[derive(Debug, Clone, Copy)]
pub struct VelocityEstimatorConfig {
    /// Fallback integration step in milliseconds when two samples carry the
    /// same timestamp.
    pub default_step_ms: u64,
}

impl Default for VelocityEstimatorConfig {
    fn default() -> Self {
        Self { default_step_ms: 50 }
    }
}

/// Leaky integrator turning net acceleration into a scalar speed estimate.
///
/// The output is an estimate, never ground truth; it only gates which impact
/// threshold applies. Gravity is removed on the vertical axis before
/// integration.
#[derive(Debug, Clone)]
pub struct VelocityEstimator {
    config: VelocityEstimatorConfig,
    velocity_mps: f64,
    last_timestamp_ms: Option<u64>,
}

impl VelocityEstimator {
    /// Create a new estimator at rest.
    pub fn new(config: VelocityEstimatorConfig) -> Self {
        Self {
            config,
            velocity_mps: 0.0,
            last_timestamp_ms: None,
        }
    }

    /// Integrate one sample into the estimate.
    pub fn update(&mut self, sample: &SensorSample) {
        let dt_ms = match self.last_timestamp_ms {
            Some(last) => {
                let dt = sample.timestamp_ms.saturating_sub(last);
                if dt == 0 {
                    self.config.default_step_ms
                } else {
                    dt
                }
            }
            None => self.config.default_step_ms,
        };
        self.last_timestamp_ms = Some(sample.timestamp_ms);

        let net_x = sample.accel.x * GRAVITY_MPS2;
        let net_y = sample.accel.y * GRAVITY_MPS2;
        let net_z = (sample.accel.z - 1.0) * GRAVITY_MPS2;
        let net_magnitude = (net_x * net_x + net_y * net_y + net_z * net_z).sqrt();

        let dt_s = dt_ms as f64 / 1_000.0;
        self.velocity_mps = VELOCITY_DECAY * self.velocity_mps + net_magnitude * dt_s;
    }

    /// Current speed estimate in m/s, non-negative.
    pub fn speed(&self) -> f64 {
        self.velocity_mps.max(0.0)
    }

    /// Restore a persisted estimate, used when a context resumes.
    pub fn restore(&mut self, velocity_mps: f64) {
        self.velocity_mps = velocity_mps.max(0.0);
    }

    /// Drop back to rest.
    pub fn reset(&mut self) {
        self.velocity_mps = 0.0;
        self.last_timestamp_ms = None;
    }
}

impl Default for VelocityEstimator {
    fn default() -> Self {
        Self::new(VelocityEstimatorConfig::default())
    }
}
