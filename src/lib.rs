//! # EquiHUB Fall Detection & Emergency Alert Engine
//!
//! Detects rider falls from fused inertial sensor streams, validates them
//! against GPS-derived movement evidence, and dispatches emergency alerts
//! with a server-preferred, device-fallback delivery pipeline.
//!
//! ## Architecture
//!
//! The crate follows a bounded-context layout:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       equihub-fde                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌──────────┐  ┌─────────┐  ┌──────────┐ │
//! │  │ detection │  │ tracking │  │ engine  │  │ alerting │ │
//! │  │ (VE + ID) │  │   (MT)   │  │(FSM+EC) │  │   (AD)   │ │
//! │  └─────┬─────┘  └────┬─────┘  └────┬────┘  └────┬─────┘ │
//! │        └─────────────┴─────┬───────┴─────────────┘      │
//! │                      ┌─────▼─────┐   ┌──────────┐       │
//! │                      │  storage  │   │   host   │       │
//! │                      │   (PL)    │   │ (ports)  │       │
//! │                      └───────────┘   └──────────┘       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Two execution contexts (a high-rate foreground loop and a low-rate
//! background loop) run the same detector logic and share state only through
//! the persistence layer; the durable `has_pending_alert` flag guarantees at
//! most one alert in flight per rider.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use equihub_fde::{FallDetectionEngine, FdeConfig};
//! use equihub_fde::storage::MemoryKeyValueStore;
//! # use equihub_fde::host::*;
//! # async fn example(
//! #     sensors: Arc<dyn SensorSource>,
//! #     location: Arc<dyn LocationSource>,
//! #     permissions: Arc<dyn PermissionGateway>,
//! #     notifications: Arc<dyn NotificationScheduler>,
//! #     sms: Arc<dyn SmsChannel>,
//! #     rpc: Arc<dyn EmergencyRpc>,
//! #     scheduler: Arc<dyn DwellScheduler>,
//! # ) -> Result<(), equihub_fde::FdeError> {
//! let config = FdeConfig::builder().enabled(true).build()?;
//! let engine = FallDetectionEngine::new(
//!     config,
//!     equihub_fde::engine::HostAdapters {
//!         sensors,
//!         location,
//!         permissions,
//!         notifications,
//!         sms,
//!         rpc,
//!         scheduler,
//!         kv: Arc::new(MemoryKeyValueStore::new()),
//!     },
//! );
//! let started = engine.start_monitoring("rider-1", Vec::new()).await?;
//! assert!(started);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod alerting;
pub mod detection;
pub mod domain;
pub mod engine;
pub mod host;
pub mod storage;
pub mod tracking;

use serde::{Deserialize, Serialize};

pub use alerting::{AlertDispatcher, AlertOutcome, DeliveryMethod};
pub use detection::{DetectionMode, ImpactDetector, ImpactDetectorConfig, VelocityEstimator};
pub use domain::{
    DetectorState, EmergencyContact, EngineEvent, FallEvent, FallEventId, GpsQuality,
    LocationPoint, MovementWindow, PendingFall, RejectionReason, SensorSample, Vec3,
};
pub use engine::{ExecutionCoordinator, FallDetectionEngine, FallStateMachine, HostAdapters};
pub use storage::{KeyValueStore, StateStore};
pub use tracking::{MovementTracker, MovementTrackerConfig};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common result type for engine operations.
pub type Result<T> = std::result::Result<T, FdeError>;

/// Unified error type for the fall detection engine.
#[derive(Debug, thiserror::Error)]
pub enum FdeError {
    /// A required platform permission was denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A required sensor is missing or failed to subscribe.
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// No usable location fix could be obtained.
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    /// The durable key-value store failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The emergency server function failed.
    #[error("rpc failure: {0}")]
    Rpc(String),

    /// The device cannot send SMS.
    #[error("SMS unavailable: {0}")]
    SmsUnavailable(String),

    /// No enabled emergency contact exists.
    #[error("no eligible emergency contacts")]
    NoEligibleContacts,

    /// The host wakeup scheduler failed.
    #[error("scheduler failure: {0}")]
    Scheduler(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Engine configuration.
///
/// Persisted to the `fde/config` blob at monitoring start and replaced
/// atomically as a whole, so a deferred wakeup after a process restart runs
/// with the values that scheduled it; see [`FdeConfig::builder`] for
/// programmatic construction with validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdeConfig {
    /// Master switch for fall detection.
    pub enabled: bool,
    /// Legacy baseline acceleration threshold in g.
    pub acceleration_threshold_g: f64,
    /// Impact threshold above the speed gate, in g.
    pub high_speed_threshold_g: f64,
    /// Impact threshold below the speed gate, in g.
    pub low_speed_threshold_g: f64,
    /// Speed separating the threshold regimes, in m/s.
    pub speed_detection_threshold_mps: f64,
    /// Rotation trigger threshold in rad/s.
    pub gyroscope_threshold_rps: f64,
    /// Free-fall trigger bound in g.
    pub free_fall_threshold_g: f64,
    /// Shake trigger bound in g.
    pub shake_threshold_g: f64,
    /// Candidate age for sustained escalation, in ms.
    pub impact_duration_ms: u64,
    /// Foreground sensor cadence in ms.
    pub sensor_interval_fg_ms: u64,
    /// Background sensor cadence in ms.
    pub sensor_interval_bg_ms: u64,
    /// Grace period past the dwell window before a foreground dwell whose
    /// owner died is recovered from persisted history, in ms.
    pub recovery_timeout_fg_ms: u64,
    /// Grace period past the dwell window before a background dwell whose
    /// wakeup never fired is recovered, in ms.
    pub recovery_timeout_bg_ms: u64,
    /// Pre-fall gate distance in meters.
    pub pre_fall_distance_m: f64,
    /// Pre-fall gate window in ms.
    pub pre_fall_window_ms: u64,
    /// Post-fall dwell window in ms.
    pub post_fall_dwell_ms: u64,
    /// Dwell location poll cadence in ms.
    pub dwell_poll_interval_ms: u64,
    /// Quarantine after a state reset, in ms.
    pub reset_quarantine_ms: u64,
    /// Background single-sample watchdog, in ms.
    pub sample_watchdog_ms: u64,
    /// Threshold selection strategy.
    #[serde(default)]
    pub detection_mode: DetectionMode,
}

impl Default for FdeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            acceleration_threshold_g: 2.5,
            high_speed_threshold_g: 15.0,
            low_speed_threshold_g: 5.0,
            speed_detection_threshold_mps: 3.0,
            gyroscope_threshold_rps: 5.0,
            free_fall_threshold_g: 0.5,
            shake_threshold_g: 2.0,
            impact_duration_ms: 500,
            sensor_interval_fg_ms: 50,
            sensor_interval_bg_ms: 100,
            recovery_timeout_fg_ms: 10_000,
            recovery_timeout_bg_ms: 20_000,
            pre_fall_distance_m: 25.0,
            pre_fall_window_ms: 15_000,
            post_fall_dwell_ms: 15_000,
            dwell_poll_interval_ms: 2_000,
            reset_quarantine_ms: 2_000,
            sample_watchdog_ms: 200,
            detection_mode: DetectionMode::SpeedAware,
        }
    }
}

impl FdeConfig {
    /// Start building a configuration.
    pub fn builder() -> FdeConfigBuilder {
        FdeConfigBuilder::default()
    }

    /// Validate field ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.low_speed_threshold_g <= 0.0 || self.high_speed_threshold_g <= 0.0 {
            return Err(FdeError::InvalidConfig(
                "impact thresholds must be positive".to_string(),
            ));
        }
        if self.high_speed_threshold_g < self.low_speed_threshold_g {
            return Err(FdeError::InvalidConfig(
                "high-speed threshold below low-speed threshold".to_string(),
            ));
        }
        if self.free_fall_threshold_g >= self.shake_threshold_g {
            return Err(FdeError::InvalidConfig(
                "free-fall bound must sit below the shake bound".to_string(),
            ));
        }
        if self.sensor_interval_fg_ms == 0 || self.sensor_interval_bg_ms == 0 {
            return Err(FdeError::InvalidConfig(
                "sensor cadence must be non-zero".to_string(),
            ));
        }
        if self.post_fall_dwell_ms == 0 || self.pre_fall_window_ms == 0 {
            return Err(FdeError::InvalidConfig(
                "gate and dwell windows must be non-zero".to_string(),
            ));
        }
        if self.dwell_poll_interval_ms > self.post_fall_dwell_ms {
            return Err(FdeError::InvalidConfig(
                "dwell poll interval exceeds dwell window".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the impact detector configuration.
    pub fn impact_config(&self) -> ImpactDetectorConfig {
        ImpactDetectorConfig {
            mode: self.detection_mode,
            acceleration_threshold_g: self.acceleration_threshold_g,
            high_speed_threshold_g: self.high_speed_threshold_g,
            low_speed_threshold_g: self.low_speed_threshold_g,
            speed_detection_threshold_mps: self.speed_detection_threshold_mps,
            gyroscope_threshold_rps: self.gyroscope_threshold_rps,
            free_fall_threshold_g: self.free_fall_threshold_g,
            shake_threshold_g: self.shake_threshold_g,
            impact_duration_ms: self.impact_duration_ms,
        }
    }

    /// Derive the movement tracker configuration.
    pub fn tracker_config(&self) -> MovementTrackerConfig {
        MovementTrackerConfig {
            poll_interval_ms: self.dwell_poll_interval_ms,
            ..MovementTrackerConfig::default()
        }
    }
}

/// Builder for [`FdeConfig`].
#[derive(Debug, Default)]
pub struct FdeConfigBuilder {
    config: FdeConfig,
}

impl FdeConfigBuilder {
    /// Enable or disable detection.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the high-speed impact threshold in g.
    pub fn high_speed_threshold_g(mut self, threshold: f64) -> Self {
        self.config.high_speed_threshold_g = threshold.max(0.0);
        self
    }

    /// Set the low-speed impact threshold in g.
    pub fn low_speed_threshold_g(mut self, threshold: f64) -> Self {
        self.config.low_speed_threshold_g = threshold.max(0.0);
        self
    }

    /// Set the speed gate in m/s.
    pub fn speed_detection_threshold_mps(mut self, threshold: f64) -> Self {
        self.config.speed_detection_threshold_mps = threshold.max(0.0);
        self
    }

    /// Set the gyroscope trigger threshold in rad/s.
    pub fn gyroscope_threshold_rps(mut self, threshold: f64) -> Self {
        self.config.gyroscope_threshold_rps = threshold.max(0.0);
        self
    }

    /// Set the sustained-impact duration in ms.
    pub fn impact_duration_ms(mut self, duration_ms: u64) -> Self {
        self.config.impact_duration_ms = duration_ms;
        self
    }

    /// Set the post-fall dwell window in ms.
    pub fn post_fall_dwell_ms(mut self, dwell_ms: u64) -> Self {
        self.config.post_fall_dwell_ms = dwell_ms;
        self
    }

    /// Set the dwell location poll cadence in ms.
    pub fn dwell_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.dwell_poll_interval_ms = interval_ms.max(1);
        self
    }

    /// Set the pre-fall gate distance in meters.
    pub fn pre_fall_distance_m(mut self, distance_m: f64) -> Self {
        self.config.pre_fall_distance_m = distance_m.max(0.0);
        self
    }

    /// Set the pre-fall gate window in ms.
    pub fn pre_fall_window_ms(mut self, window_ms: u64) -> Self {
        self.config.pre_fall_window_ms = window_ms;
        self
    }

    /// Set the threshold selection strategy.
    pub fn detection_mode(mut self, mode: DetectionMode) -> Self {
        self.config.detection_mode = mode;
        self
    }

    /// Set the foreground sensor cadence in ms.
    pub fn sensor_interval_fg_ms(mut self, interval_ms: u64) -> Self {
        self.config.sensor_interval_fg_ms = interval_ms;
        self
    }

    /// Set the background sensor cadence in ms.
    pub fn sensor_interval_bg_ms(mut self, interval_ms: u64) -> Self {
        self.config.sensor_interval_bg_ms = interval_ms;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<FdeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AlertDispatcher, AlertOutcome, DeliveryMethod, DetectorState, EmergencyContact,
        EngineEvent, ExecutionCoordinator, FallDetectionEngine, FallEvent, FallEventId,
        FallStateMachine, FdeConfig, FdeError, GpsQuality, HostAdapters, LocationPoint,
        MovementTracker, MovementWindow, Result, SensorSample, Vec3,
    };
}
