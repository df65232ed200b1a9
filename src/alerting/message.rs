//! Emergency message templates.
//!
//! The wire text is fixed: receiving contacts and the server-side SMS
//! function both expect these exact shapes.

use chrono::{DateTime, Local, Utc};

use crate::domain::{FallEvent, LocationPoint};

fn local_clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

/// Render the fall alert message for an event.
pub fn fall_alert(event: &FallEvent) -> String {
    let mut message = format!(
        "🚨 FALL DETECTED 🚨\n\
         EquiHUB: Fall during ride\n\
         Time: {}\n\
         Impact: {:.1}g\n\
         Check safety!",
        local_clock(event.recorded_at),
        event.acceleration_magnitude,
    );

    if let Some(location) = &event.location {
        message.push_str(&format!("\n\nMy location: {}", location.maps_url()));
    }

    message
}

/// Render the test alert message.
pub fn test_alert(at: DateTime<Utc>) -> String {
    format!(
        "🧪 TEST 🧪\n\
         EquiHUB emergency test\n\
         Time: {}\n\
         System working!",
        local_clock(at),
    )
}

/// Fixed probe location attached to test alerts.
pub fn test_probe_location() -> LocationPoint {
    LocationPoint::new(47.3769, 8.5417, 0, Some(5.0))
}
