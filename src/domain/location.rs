//! GPS location types and accuracy-weighted distance thresholds.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters, used for haversine distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A single GPS fix.
///
/// `accuracy` is the horizontal error estimate in meters as reported by the
/// positioning host; `None` when the host does not provide one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Horizontal accuracy estimate in meters, if reported.
    pub accuracy: Option<f64>,
}

impl LocationPoint {
    /// Create a new fix.
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: u64, accuracy: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            accuracy,
        }
    }

    /// Great-circle distance to another point in meters.
    pub fn distance_m(&self, other: &LocationPoint) -> f64 {
        haversine_m(self, other)
    }

    /// Google Maps URL for this fix, used in alert messages.
    pub fn maps_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={},{}",
            self.latitude, self.longitude
        )
    }
}

/// Great-circle distance between two fixes in meters.
pub fn haversine_m(a: &LocationPoint, b: &LocationPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// GPS fix quality classified from the reported horizontal accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpsQuality {
    /// Accuracy within 5 m.
    Excellent,
    /// Accuracy within 10 m.
    Good,
    /// Accuracy within 20 m.
    Fair,
    /// Accuracy within 40 m.
    Poor,
    /// Worse than 40 m.
    VeryPoor,
}

impl GpsQuality {
    /// Accuracy bound in meters for excellent fixes.
    pub const EXCELLENT_M: f64 = 5.0;
    /// Accuracy bound in meters for good fixes.
    pub const GOOD_M: f64 = 10.0;
    /// Accuracy bound in meters for fair fixes.
    pub const FAIR_M: f64 = 20.0;
    /// Accuracy bound in meters for poor fixes.
    pub const POOR_M: f64 = 40.0;

    /// Classify a reported accuracy value.
    pub fn classify(accuracy_m: f64) -> Self {
        if accuracy_m <= Self::EXCELLENT_M {
            GpsQuality::Excellent
        } else if accuracy_m <= Self::GOOD_M {
            GpsQuality::Good
        } else if accuracy_m <= Self::FAIR_M {
            GpsQuality::Fair
        } else if accuracy_m <= Self::POOR_M {
            GpsQuality::Poor
        } else {
            GpsQuality::VeryPoor
        }
    }

    /// Distance-threshold multiplier for this quality band.
    ///
    /// Worse fixes require proportionally more raw displacement before it
    /// counts as evidence of movement, so GPS drift is absorbed instead of
    /// being mistaken for recovery.
    pub fn multiplier(&self) -> f64 {
        match self {
            GpsQuality::Excellent => 1.0,
            GpsQuality::Good => 1.2,
            GpsQuality::Fair => 1.6,
            GpsQuality::Poor => 2.2,
            GpsQuality::VeryPoor => 3.0,
        }
    }
}

/// Multiplier applied when no accuracy estimate is available.
pub const UNKNOWN_ACCURACY_MULTIPLIER: f64 = 2.0;

/// Scale a base distance threshold by recent GPS accuracy.
///
/// Monotonically non-decreasing in `avg_accuracy_m`.
pub fn adaptive_threshold(base_m: f64, avg_accuracy_m: Option<f64>) -> f64 {
    match avg_accuracy_m {
        Some(acc) => base_m * GpsQuality::classify(acc).multiplier(),
        None => base_m * UNKNOWN_ACCURACY_MULTIPLIER,
    }
}

/// Result of a movement query over a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementWindow {
    /// Admitted fixes inside the window, oldest first.
    pub points: Vec<LocationPoint>,
    /// Total pairwise haversine distance in meters.
    pub total_distance_m: f64,
    /// Average speed over the window in m/s.
    pub avg_speed_mps: f64,
    /// Whether total distance exceeded the adaptive threshold.
    pub is_moving: bool,
}

impl MovementWindow {
    /// An empty window with no evidence of movement.
    pub fn empty() -> Self {
        Self {
            points: Vec::new(),
            total_distance_m: 0.0,
            avg_speed_mps: 0.0,
            is_moving: false,
        }
    }
}
