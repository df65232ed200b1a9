//! Domain types for fall detection and emergency alerting.

pub mod contact;
pub mod detector_state;
pub mod events;
pub mod fall_event;
pub mod location;
pub mod sample;

pub use contact::EmergencyContact;
pub use detector_state::{DetectorState, PendingFall};
pub use events::{EngineEvent, RejectionReason};
pub use fall_event::{FallEvent, FallEventId};
pub use location::{
    adaptive_threshold, haversine_m, GpsQuality, LocationPoint, MovementWindow, EARTH_RADIUS_M,
};
pub use sample::{SensorSample, Vec3};
