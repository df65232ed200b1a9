//! Inertial feature extraction: velocity estimation and impact detection.

pub mod impact;
pub mod velocity;

pub use impact::{
    Assessment, DetectionMode, Escalation, ImpactDetector, ImpactDetectorConfig, Trigger,
};
pub use velocity::{VelocityEstimator, VelocityEstimatorConfig};
