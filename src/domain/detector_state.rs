//! Shared detector state persisted across execution contexts.

use serde::{Deserialize, Serialize};

use super::Vec3;

/// Snapshot of the escalation that took the alert lock, kept until the
/// dwell resolves so a lost resolution can be recovered from the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingFall {
    /// Timestamp of the escalating sample.
    pub fall_ms: u64,
    /// Total acceleration of the escalating sample, in g.
    pub magnitude: f64,
    /// Rotational velocity of the escalating sample, in rad/s.
    pub rotational_magnitude: f64,
}

/// Mutable detection state for one execution context.
///
/// Both the foreground and background contexts run the same detector logic
/// against their own copy of this state; copies are reconciled through the
/// persistence layer. `has_pending_alert` is the durable lock that keeps at
/// most one alert in flight per rider: the context that persists the
/// `false → true` flip first owns dispatch, the other yields on its next
/// store read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectorState {
    /// Start of the current candidate window, if one is open.
    pub potential_fall_start_ms: Option<u64>,
    /// Last sample timestamp that did not trigger any detection rule.
    pub last_stable_ms: u64,
    /// Timestamp of the most recent state reset. Escalations inside the
    /// quarantine window after this are suppressed.
    pub last_reset_ms: u64,
    /// Durable single-owner alert lock.
    pub has_pending_alert: bool,
    /// True while a post-fall dwell window is being monitored.
    pub is_monitoring_post_fall: bool,
    /// The escalation awaiting dwell resolution, while the lock is held.
    #[serde(default)]
    pub pending_fall: Option<PendingFall>,
    /// Current integrated velocity estimate in m/s.
    pub current_velocity_mps: f64,
    /// Most recent accelerometer reading, for velocity integration restarts.
    pub last_accel: Vec3,
}

impl DetectorState {
    /// Fresh state at monitoring start.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything except the reset timestamp.
    ///
    /// Idempotent: resetting twice at the same instant leaves state
    /// identical to resetting once.
    pub fn reset(&mut self, now_ms: u64) {
        self.potential_fall_start_ms = None;
        self.has_pending_alert = false;
        self.is_monitoring_post_fall = false;
        self.pending_fall = None;
        self.current_velocity_mps = 0.0;
        self.last_accel = Vec3::default();
        self.last_reset_ms = now_ms;
    }

    /// Whether an escalation at `now_ms` falls inside the reset quarantine.
    pub fn in_quarantine(&self, now_ms: u64, quarantine_ms: u64) -> bool {
        self.last_reset_ms > 0 && now_ms.saturating_sub(self.last_reset_ms) < quarantine_ms
    }
}
