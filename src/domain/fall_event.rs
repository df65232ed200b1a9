//! Recorded fall events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::LocationPoint;

/// Unique identifier for a recorded fall event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallEventId(Uuid);

impl FallEventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FallEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FallEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A confirmed fall, immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallEvent {
    /// Event identifier.
    pub id: FallEventId,
    /// Monotonic timestamp of the impact in milliseconds.
    pub timestamp_ms: u64,
    /// Wall-clock time of confirmation, for message rendering and records.
    pub recorded_at: DateTime<Utc>,
    /// Peak acceleration magnitude at the impact, in g.
    pub acceleration_magnitude: f64,
    /// Rotational magnitude at the impact, in rad/s.
    pub gyroscope_magnitude: f64,
    /// Best available location: live fix preferred, last admitted tracker
    /// point as fallback, absent when neither exists.
    pub location: Option<LocationPoint>,
    /// Whether an emergency alert was successfully delivered.
    pub alert_sent: bool,
    /// Wall-clock time the alert was delivered, if it was.
    pub alert_sent_at: Option<DateTime<Utc>>,
    /// Whether the background context detected this fall.
    pub detected_in_background: bool,
}

impl FallEvent {
    /// Record a new confirmed fall.
    pub fn new(
        timestamp_ms: u64,
        acceleration_magnitude: f64,
        gyroscope_magnitude: f64,
        location: Option<LocationPoint>,
        detected_in_background: bool,
    ) -> Self {
        Self {
            id: FallEventId::new(),
            timestamp_ms,
            recorded_at: Utc::now(),
            acceleration_magnitude,
            gyroscope_magnitude,
            location,
            alert_sent: false,
            alert_sent_at: None,
            detected_in_background,
        }
    }

    /// Copy of this event marked as alerted.
    pub fn with_alert_sent(mut self) -> Self {
        self.alert_sent = true;
        self.alert_sent_at = Some(Utc::now());
        self
    }
}
