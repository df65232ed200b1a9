//! Emergency alert dispatch: server channel with local-device fallback.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::message;
use crate::domain::{EmergencyContact, FallEvent};
use crate::host::{EmergencyRpc, EmergencySmsRequest, SmsChannel, SmsSubmission};

/// Which channel ultimately carried the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMethod {
    /// Remote emergency-SMS function.
    Server,
    /// Device-local SMS composer.
    Direct,
}

/// Per-dispatch delivery report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertOutcome {
    /// Whether any recipient was reached.
    pub success: bool,
    /// Number of recipients reached.
    pub sent_count: u32,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Server-assigned message id for the server path.
    pub message_id: Option<String>,
    /// Channel that carried (or last attempted) the alert.
    pub method: DeliveryMethod,
}

impl AlertOutcome {
    fn failure(method: DeliveryMethod, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sent_count: 0,
            error: Some(error.into()),
            message_id: None,
            method,
        }
    }
}

/// Delivers emergency notifications for confirmed falls.
///
/// The server path is preferred; any server failure falls through to a
/// single multi-recipient device SMS. The dispatcher never retries on its
/// own: idempotency is the state machine's `has_pending_alert` gate, and a
/// failed outcome is reported, not re-attempted.
pub struct AlertDispatcher {
    rpc: Arc<dyn EmergencyRpc>,
    sms: Arc<dyn SmsChannel>,
}

impl AlertDispatcher {
    /// Create a dispatcher over the host channels.
    pub fn new(rpc: Arc<dyn EmergencyRpc>, sms: Arc<dyn SmsChannel>) -> Self {
        Self { rpc, sms }
    }

    /// Deliver a fall alert to all eligible contacts.
    pub async fn dispatch(
        &self,
        event: &FallEvent,
        user_id: &str,
        contacts: &[EmergencyContact],
    ) -> AlertOutcome {
        let enabled: Vec<&EmergencyContact> =
            contacts.iter().filter(|c| c.is_enabled).collect();
        if enabled.is_empty() {
            warn!(user_id, "fall alert not dispatched: no eligible contacts");
            return AlertOutcome::failure(DeliveryMethod::Direct, "no eligible contacts");
        }

        let text = message::fall_alert(event);

        let request = EmergencySmsRequest {
            user_id: user_id.to_string(),
            message: text.clone(),
            location: event.location,
            emergency_type: "fall".to_string(),
            timestamp: event.recorded_at.to_rfc3339(),
        };

        match self.rpc.send_emergency_sms(request).await {
            Ok(response) if response.success => {
                info!(
                    user_id,
                    sent_count = response.sent_count,
                    message_id = ?response.message_id,
                    "fall alert delivered via server"
                );
                AlertOutcome {
                    success: true,
                    sent_count: response.sent_count,
                    error: None,
                    message_id: response.message_id,
                    method: DeliveryMethod::Server,
                }
            }
            Ok(response) => {
                warn!(
                    user_id,
                    error = ?response.error,
                    "server rejected fall alert, falling back to direct SMS"
                );
                self.dispatch_direct(&enabled, &text).await
            }
            Err(e) => {
                warn!(
                    user_id,
                    error = %e,
                    "server dispatch failed, falling back to direct SMS"
                );
                self.dispatch_direct(&enabled, &text).await
            }
        }
    }

    /// Deliver a clearly marked test alert through the server path.
    ///
    /// Test alerts bypass the pre-fall gate and the post-fall dwell; success
    /// requires the server to accept AND report at least one recipient.
    pub async fn send_test_alert(&self, user_id: &str) -> AlertOutcome {
        let now = Utc::now();
        let request = EmergencySmsRequest {
            user_id: user_id.to_string(),
            message: message::test_alert(now),
            location: Some(message::test_probe_location()),
            emergency_type: "test".to_string(),
            timestamp: now.to_rfc3339(),
        };

        match self.rpc.send_emergency_sms(request).await {
            Ok(response) if response.success && response.sent_count >= 1 => AlertOutcome {
                success: true,
                sent_count: response.sent_count,
                error: None,
                message_id: response.message_id,
                method: DeliveryMethod::Server,
            },
            Ok(response) => AlertOutcome {
                success: false,
                sent_count: response.sent_count,
                error: response
                    .error
                    .or_else(|| Some("test alert reached no recipient".to_string())),
                message_id: response.message_id,
                method: DeliveryMethod::Server,
            },
            Err(e) => AlertOutcome::failure(DeliveryMethod::Server, e.to_string()),
        }
    }

    async fn dispatch_direct(
        &self,
        enabled: &[&EmergencyContact],
        text: &str,
    ) -> AlertOutcome {
        if !self.sms.is_available().await {
            return AlertOutcome::failure(DeliveryMethod::Direct, "device SMS unavailable");
        }

        let recipients: Vec<String> =
            enabled.iter().map(|c| c.phone_number.clone()).collect();

        match self.sms.send_to(&recipients, text).await {
            Ok(SmsSubmission::Sent) => {
                info!(
                    recipients = recipients.len(),
                    "fall alert delivered via direct SMS"
                );
                AlertOutcome {
                    success: true,
                    sent_count: recipients.len() as u32,
                    error: None,
                    message_id: None,
                    method: DeliveryMethod::Direct,
                }
            }
            Ok(SmsSubmission::Failed(reason)) => {
                AlertOutcome::failure(DeliveryMethod::Direct, format!("SMS not sent: {reason}"))
            }
            Err(e) => AlertOutcome::failure(DeliveryMethod::Direct, e.to_string()),
        }
    }
}
