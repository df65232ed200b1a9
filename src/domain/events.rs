//! Engine events surfaced to the host application.

use serde::{Deserialize, Serialize};

use super::{FallEventId, LocationPoint};

/// Reason a candidate never became an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// No pre-impact movement: the device was most likely dropped, not the
    /// rider falling.
    NoPreFallMovement,
    /// Escalation arrived inside the post-reset quarantine window.
    ResetQuarantine,
    /// Another execution context already owns a pending alert.
    AlertAlreadyPending,
}

/// Observable engine events, in arrival order per execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A triggering sample opened a candidate window.
    CandidateStarted {
        /// Start of the candidate window.
        timestamp_ms: u64,
        /// Gravity deviation of the opening sample, in g.
        gravity_deviation: f64,
    },

    /// A candidate escalated to fall validation.
    Escalated {
        /// Escalation timestamp.
        timestamp_ms: u64,
        /// Peak acceleration magnitude, in g.
        magnitude: f64,
        /// Whether a single severe sample escalated immediately.
        severe_immediate: bool,
    },

    /// An escalation was rejected before the dwell started.
    GateRejected {
        /// Rejection timestamp.
        timestamp_ms: u64,
        /// Why the escalation was discarded.
        reason: RejectionReason,
    },

    /// The dwell window observed recovery movement; no alert.
    DwellDismissed {
        /// Dismissal timestamp.
        timestamp_ms: u64,
        /// Movement measured during the dwell, in meters.
        movement_m: f64,
        /// Adaptive threshold the movement was measured against.
        threshold_m: f64,
    },

    /// A fall was confirmed and recorded.
    FallConfirmed {
        /// Recorded event identifier.
        event_id: FallEventId,
        /// Impact timestamp.
        timestamp_ms: u64,
        /// Location attached to the event, if any.
        location: Option<LocationPoint>,
    },

    /// The dispatcher finished delivering (or failing to deliver) an alert.
    AlertDispatched {
        /// Recorded event identifier.
        event_id: FallEventId,
        /// Dispatch timestamp.
        timestamp_ms: u64,
        /// Whether any recipient was reached.
        success: bool,
        /// Number of recipients reached.
        sent_count: u32,
    },
}

impl EngineEvent {
    /// Monotonic timestamp of the event.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::CandidateStarted { timestamp_ms, .. } => *timestamp_ms,
            Self::Escalated { timestamp_ms, .. } => *timestamp_ms,
            Self::GateRejected { timestamp_ms, .. } => *timestamp_ms,
            Self::DwellDismissed { timestamp_ms, .. } => *timestamp_ms,
            Self::FallConfirmed { timestamp_ms, .. } => *timestamp_ms,
            Self::AlertDispatched { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    /// Event type name for logs and host-side filtering.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CandidateStarted { .. } => "CandidateStarted",
            Self::Escalated { .. } => "Escalated",
            Self::GateRejected { .. } => "GateRejected",
            Self::DwellDismissed { .. } => "DwellDismissed",
            Self::FallConfirmed { .. } => "FallConfirmed",
            Self::AlertDispatched { .. } => "AlertDispatched",
        }
    }
}
