//! Emergency contact records.

use serde::{Deserialize, Serialize};

/// A contact eligible to receive emergency SMS alerts.
///
/// Contact management lives in the host application; the engine only reads
/// these records when dispatching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    /// Stable contact identifier from the host.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Phone number in the host's dialable format.
    pub phone_number: String,
    /// Whether this contact opted in to alerts.
    pub is_enabled: bool,
}

impl EmergencyContact {
    /// Create an enabled contact.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phone_number: phone_number.into(),
            is_enabled: true,
        }
    }

    /// Disable alerts for this contact.
    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_defaults_enabled() {
        let contact = EmergencyContact::new("c1", "Alex", "+41790000001");
        assert!(contact.is_enabled);
        assert!(!contact.disabled().is_enabled);
    }
}
