//! GPS-derived movement evidence.

pub mod movement;

pub use movement::{MovementTracker, MovementTrackerConfig};
