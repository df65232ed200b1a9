//! Speed-aware impact detection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{DetectorState, SensorSample};

/// Which rule a sample tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Gravity deviation above the effective acceleration threshold.
    Impact,
    /// Near-zero total acceleration, the device is falling freely.
    FreeFall,
    /// Elevated total acceleration, tumbling or violent shaking.
    Shake,
    /// Rotational velocity above the gyroscope threshold.
    Rotation,
}

/// How a candidate was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Triggering samples persisted for the full impact duration.
    Sustained,
    /// A single sample exceeded twice the effective threshold.
    SevereImmediate,
}

/// Per-sample assessment produced by the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assessment {
    /// Nothing anomalous; any open candidate window was closed.
    Stable,
    /// The sample triggered; the candidate window is open but not yet old
    /// enough to escalate.
    Triggered(Trigger),
    /// The candidate escalated and should enter fall validation.
    Escalated {
        /// Escalation cause. When both sustained duration and a severe spike
        /// hold on the same sample they count as one escalation; the severe
        /// cause is reported.
        cause: Escalation,
        /// Gravity deviation of the escalating sample, in g.
        magnitude: f64,
    },
}

/// Threshold selection strategy.
///
/// The speed-aware variant is the production default. The baseline variant
/// keeps the legacy single-threshold behavior and exists only as a fallback
/// for hosts without a usable velocity estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DetectionMode {
    /// High/low thresholds chosen by estimated speed.
    #[default]
    SpeedAware,
    /// Single legacy threshold, speed ignored.
    Baseline,
}

/// Configuration for the impact detector.
#[derive(Debug, Clone, Copy)]
pub struct ImpactDetectorConfig {
    /// Threshold selection strategy.
    pub mode: DetectionMode,
    /// Legacy baseline threshold in g.
    pub acceleration_threshold_g: f64,
    /// Threshold applied above the speed gate, in g.
    pub high_speed_threshold_g: f64,
    /// Threshold applied below the speed gate, in g.
    pub low_speed_threshold_g: f64,
    /// Speed separating the high and low threshold regimes, in m/s.
    pub speed_detection_threshold_mps: f64,
    /// Rotation trigger threshold in rad/s.
    pub gyroscope_threshold_rps: f64,
    /// Free-fall trigger: total acceleration below this, in g.
    pub free_fall_threshold_g: f64,
    /// Shake trigger: total acceleration above this, in g.
    pub shake_threshold_g: f64,
    /// Candidate window age required for a sustained escalation, in ms.
    pub impact_duration_ms: u64,
}

impl Default for ImpactDetectorConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::SpeedAware,
            acceleration_threshold_g: 2.5,
            high_speed_threshold_g: 15.0,
            low_speed_threshold_g: 5.0,
            speed_detection_threshold_mps: 3.0,
            gyroscope_threshold_rps: 5.0,
            free_fall_threshold_g: 0.5,
            shake_threshold_g: 2.0,
            impact_duration_ms: 500,
        }
    }
}

/// Detects potential-fall candidates from fused sensor samples.
///
/// Real equestrian falls at canter or gallop produce brief extreme spikes
/// that can be accepted from a single sample; low-speed falls show lower
/// peaks but sustained anomalous motion, so they must clear a lower
/// threshold for a longer window. The candidate window itself lives in
/// [`DetectorState`] so both execution contexts resume it from the store.
#[derive(Debug, Clone, Default)]
pub struct ImpactDetector {
    config: ImpactDetectorConfig,
}

impl ImpactDetector {
    /// Create a detector with the given configuration.
    pub fn new(config: ImpactDetectorConfig) -> Self {
        Self { config }
    }

    /// Effective acceleration threshold for the given speed estimate, in g.
    pub fn effective_threshold_g(&self, speed_mps: f64) -> f64 {
        match self.config.mode {
            DetectionMode::Baseline => self.config.acceleration_threshold_g,
            DetectionMode::SpeedAware => {
                if speed_mps > self.config.speed_detection_threshold_mps {
                    self.config.high_speed_threshold_g
                } else {
                    self.config.low_speed_threshold_g
                }
            }
        }
    }

    /// Assess one sample, updating the candidate window in `state`.
    pub fn assess(
        &self,
        sample: &SensorSample,
        speed_mps: f64,
        state: &mut DetectorState,
    ) -> Assessment {
        let deviation = sample.gravity_deviation();
        let accel_mag = sample.accel_magnitude();
        let gyro_mag = sample.gyro_magnitude();
        let threshold = self.effective_threshold_g(speed_mps);

        let trigger = if deviation > threshold {
            Some(Trigger::Impact)
        } else if accel_mag < self.config.free_fall_threshold_g {
            Some(Trigger::FreeFall)
        } else if accel_mag > self.config.shake_threshold_g {
            Some(Trigger::Shake)
        } else if gyro_mag > self.config.gyroscope_threshold_rps {
            Some(Trigger::Rotation)
        } else {
            None
        };

        let Some(trigger) = trigger else {
            state.potential_fall_start_ms = None;
            state.last_stable_ms = sample.timestamp_ms;
            return Assessment::Stable;
        };

        let window_start = *state
            .potential_fall_start_ms
            .get_or_insert(sample.timestamp_ms);

        let severe = deviation > 2.0 * threshold;
        let sustained =
            sample.timestamp_ms.saturating_sub(window_start) >= self.config.impact_duration_ms;

        if severe || sustained {
            debug!(
                timestamp_ms = sample.timestamp_ms,
                deviation, threshold, severe, sustained, "impact candidate escalated"
            );
            state.potential_fall_start_ms = None;
            return Assessment::Escalated {
                cause: if severe {
                    Escalation::SevereImmediate
                } else {
                    Escalation::Sustained
                },
                magnitude: deviation,
            };
        }

        Assessment::Triggered(trigger)
    }

    /// Detector configuration.
    pub fn config(&self) -> &ImpactDetectorConfig {
        &self.config
    }
}
