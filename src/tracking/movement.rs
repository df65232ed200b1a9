//! GPS movement tracking with accuracy-weighted thresholds.

use std::collections::VecDeque;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::domain::{adaptive_threshold, GpsQuality, LocationPoint, MovementWindow};
use crate::host::LocationSource;
use crate::storage::StateStore;
use crate::FdeError;

/// Configuration for the movement tracker.
#[derive(Debug, Clone, Copy)]
pub struct MovementTrackerConfig {
    /// In-memory ring capacity.
    pub in_memory_cap: usize,
    /// Displacements below this are drift candidates, in meters.
    pub min_move_filter_m: f64,
    /// Derived speeds above this are rejected as unrealistic, in m/s.
    pub max_realistic_speed_mps: f64,
    /// Fixes with worse accuracy than this are rejected outright, in meters.
    pub max_accuracy_m: f64,
    /// Poll cadence for dwell monitoring, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for MovementTrackerConfig {
    fn default() -> Self {
        Self {
            in_memory_cap: 100,
            min_move_filter_m: 3.0,
            max_realistic_speed_mps: 25.0,
            max_accuracy_m: 2.0 * GpsQuality::POOR_M,
            poll_interval_ms: 2_000,
        }
    }
}

/// Ring-buffered location history answering movement-evidence queries.
///
/// The tracker exclusively owns its buffer; all other components query it
/// through methods. Two query shapes exist: "was the rider moving in the
/// window before an impact" (pre-fall gate) and "monitor movement for the
/// next window" (post-fall dwell).
pub struct MovementTracker {
    config: MovementTrackerConfig,
    points: RwLock<VecDeque<LocationPoint>>,
}

impl MovementTracker {
    /// Create an empty tracker.
    pub fn new(config: MovementTrackerConfig) -> Self {
        Self {
            config,
            points: RwLock::new(VecDeque::new()),
        }
    }

    /// Seed the buffer from persisted history (already age-pruned on load).
    pub async fn load_persisted(&self, store: &StateStore, now_ms: u64) -> Result<(), FdeError> {
        let persisted = store.load_locations(now_ms).await?;
        let mut points = self.points.write();
        points.clear();
        points.extend(persisted);
        Ok(())
    }

    /// Snapshot the buffer into the store (store enforces the persisted cap).
    pub async fn persist(&self, store: &StateStore) -> Result<(), FdeError> {
        let snapshot: Vec<LocationPoint> = self.points.read().iter().copied().collect();
        if let Err(e) = store.save_locations(&snapshot).await {
            // A failed append degrades to in-memory history only.
            warn!(error = %e, "failed to persist location history");
        }
        Ok(())
    }

    /// Admit or reject a new fix. Returns `true` when admitted.
    ///
    /// Rejection rules, in order: hopeless accuracy, unrealistic derived
    /// speed, and sub-filter displacement on a low-quality fix (drift).
    pub fn record(&self, point: LocationPoint) -> bool {
        if let Some(accuracy) = point.accuracy {
            if accuracy > self.config.max_accuracy_m {
                debug!(accuracy, "rejecting fix: accuracy beyond usable range");
                return false;
            }
        }

        let mut points = self.points.write();
        if let Some(previous) = points.back() {
            let distance = previous.distance_m(&point);
            let dt_ms = point.timestamp_ms.saturating_sub(previous.timestamp_ms);

            if dt_ms > 0 {
                let speed = distance / (dt_ms as f64 / 1_000.0);
                if speed > self.config.max_realistic_speed_mps {
                    debug!(speed, distance, "rejecting fix: unrealistic speed");
                    return false;
                }
            }

            let poor_fix = point
                .accuracy
                .map(|a| a > GpsQuality::FAIR_M)
                .unwrap_or(false);
            if distance < self.config.min_move_filter_m && poor_fix {
                debug!(distance, "rejecting fix: drift below movement filter");
                return false;
            }
        }

        points.push_back(point);
        while points.len() > self.config.in_memory_cap {
            points.pop_front();
        }
        true
    }

    /// Most recent admitted fix.
    pub fn last_point(&self) -> Option<LocationPoint> {
        self.points.read().back().copied()
    }

    /// Snapshot of the admitted history, oldest first.
    pub fn recent_points(&self) -> Vec<LocationPoint> {
        self.points.read().iter().copied().collect()
    }

    /// Number of admitted fixes currently buffered.
    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    /// Arithmetic mean accuracy of admitted fixes in `[now-window, now]`,
    /// or `None` when no windowed fix reports accuracy.
    pub fn recent_gps_accuracy(&self, window_ms: u64, now_ms: u64) -> Option<f64> {
        let points = self.points.read();
        let mut sum = 0.0;
        let mut count = 0u32;
        for p in points.iter() {
            if now_ms.saturating_sub(p.timestamp_ms) <= window_ms {
                if let Some(accuracy) = p.accuracy {
                    sum += accuracy;
                    count += 1;
                }
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    /// Compute the movement evidence over `[now-window, now]` against the
    /// accuracy-scaled threshold derived from `base_distance_m`.
    pub fn movement_window(
        &self,
        base_distance_m: f64,
        window_ms: u64,
        now_ms: u64,
    ) -> MovementWindow {
        let points = self.points.read();
        let windowed: Vec<LocationPoint> = points
            .iter()
            .filter(|p| now_ms.saturating_sub(p.timestamp_ms) <= window_ms)
            .copied()
            .collect();
        drop(points);

        if windowed.len() < 2 {
            return MovementWindow::empty();
        }

        let total_distance_m: f64 = windowed
            .windows(2)
            .map(|pair| pair[0].distance_m(&pair[1]))
            .sum();

        let span_ms = windowed
            .last()
            .map(|last| last.timestamp_ms - windowed[0].timestamp_ms)
            .unwrap_or(0);
        let avg_speed_mps = if span_ms > 0 {
            total_distance_m / (span_ms as f64 / 1_000.0)
        } else {
            0.0
        };

        let avg_accuracy = self.recent_gps_accuracy(window_ms, now_ms);
        let threshold_m = adaptive_threshold(base_distance_m, avg_accuracy);

        MovementWindow {
            points: windowed,
            total_distance_m,
            avg_speed_mps,
            is_moving: total_distance_m > threshold_m,
        }
    }

    /// Pre-fall gate: was the rider moving at least the adaptive-scaled
    /// `base_distance_m` during the window ending at `now_ms`?
    pub fn was_moving_distance(&self, base_distance_m: f64, window_ms: u64, now_ms: u64) -> bool {
        self.movement_window(base_distance_m, window_ms, now_ms)
            .is_moving
    }

    /// The adaptive threshold that currently applies over the window.
    pub fn adaptive_threshold_m(&self, base_distance_m: f64, window_ms: u64, now_ms: u64) -> f64 {
        adaptive_threshold(
            base_distance_m,
            self.recent_gps_accuracy(window_ms, now_ms),
        )
    }

    /// Post-fall dwell: poll the location source for `window_ms` and return
    /// the movement evidence accumulated during the dwell.
    ///
    /// Individual poll failures are tolerated; a dwell that produces no fix
    /// at all is a [`FdeError::LocationUnavailable`], which the state machine
    /// treats as fail-safe confirmation.
    pub async fn monitor_movement_for(
        &self,
        base_distance_m: f64,
        window_ms: u64,
        source: &dyn LocationSource,
    ) -> Result<MovementWindow, FdeError> {
        let poll_interval = self.config.poll_interval_ms.max(1);
        let polls = (window_ms / poll_interval).max(1);

        let mut first_fix_ms: Option<u64> = None;
        let mut last_fix_ms: Option<u64> = None;
        let mut fixes = 0u32;

        for i in 0..=polls {
            match source.current_position().await {
                Ok(fix) => {
                    fixes += 1;
                    first_fix_ms.get_or_insert(fix.timestamp_ms);
                    last_fix_ms = Some(fix.timestamp_ms);
                    self.record(fix);
                }
                Err(e) => {
                    debug!(error = %e, "dwell poll returned no fix");
                }
            }
            if i < polls {
                tokio::time::sleep(std::time::Duration::from_millis(poll_interval)).await;
            }
        }

        if fixes == 0 {
            return Err(FdeError::LocationUnavailable(
                "no location fix during dwell window".to_string(),
            ));
        }

        // Measure only over the fixes the dwell itself produced.
        let now_ms = last_fix_ms.unwrap_or(0);
        let span = now_ms.saturating_sub(first_fix_ms.unwrap_or(now_ms));
        Ok(self.movement_window(base_distance_m, span, now_ms))
    }

    /// Tracker configuration.
    pub fn config(&self) -> &MovementTrackerConfig {
        &self.config
    }
}

impl Default for MovementTracker {
    fn default() -> Self {
        Self::new(MovementTrackerConfig::default())
    }
}
