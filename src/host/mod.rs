//! Host-adapter ports.
//!
//! The engine never talks to platform APIs directly. Every outward concern
//! (sensors, positioning, permissions, notifications, SMS, the emergency
//! RPC, background wakeups) is a trait implemented by the embedding
//! application; tests drive the engine with scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{LocationPoint, Vec3};
use crate::FdeError;

/// Inertial sensor kinds the engine subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Three-axis accelerometer, values in g.
    Accelerometer,
    /// Three-axis gyroscope, values in rad/s.
    Gyroscope,
}

/// Platform permissions the engine needs before monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Foreground and background location access.
    Location,
    /// Local notification delivery.
    Notifications,
}

/// One timestamped reading from a single sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Axis values in device units for the subscribed kind.
    pub values: Vec3,
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: u64,
}

/// An active sensor subscription.
///
/// Handles are stored on the engine and unsubscribed deterministically on
/// stop; there is no global registry of removers.
#[derive(Debug)]
pub struct SensorSubscription {
    /// Host-assigned subscription id, passed back to unsubscribe.
    pub id: u64,
    /// Which sensor this subscription delivers.
    pub kind: SensorKind,
    receiver: mpsc::Receiver<SensorReading>,
}

impl SensorSubscription {
    /// Create a subscription from a host delivery channel.
    pub fn new(id: u64, kind: SensorKind, receiver: mpsc::Receiver<SensorReading>) -> Self {
        Self { id, kind, receiver }
    }

    /// Receive the next reading; `None` when the host closed the stream.
    pub async fn recv(&mut self) -> Option<SensorReading> {
        self.receiver.recv().await
    }

    /// Non-blocking receive of the most recent buffered reading.
    pub fn try_recv_latest(&mut self) -> Option<SensorReading> {
        let mut latest = None;
        while let Ok(reading) = self.receiver.try_recv() {
            latest = Some(reading);
        }
        latest
    }
}

/// Inertial sensor provider.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Whether the device exposes the given sensor at all.
    async fn is_available(&self, kind: SensorKind) -> bool;

    /// Subscribe at the given cadence.
    async fn subscribe(
        &self,
        kind: SensorKind,
        interval_ms: u64,
    ) -> Result<SensorSubscription, FdeError>;

    /// Tear down a subscription by id.
    async fn unsubscribe(&self, id: u64);
}

/// Options for a continuous location watch.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Desired accuracy in meters.
    pub accuracy_m: f64,
    /// Minimum time between fixes in milliseconds.
    pub time_interval_ms: u64,
    /// Minimum displacement between fixes in meters.
    pub distance_interval_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            accuracy_m: 5.0,
            time_interval_ms: 5_000,
            distance_interval_m: 5.0,
        }
    }
}

/// An active location watch.
#[derive(Debug)]
pub struct LocationSubscription {
    /// Host-assigned watch id.
    pub id: u64,
    receiver: mpsc::Receiver<LocationPoint>,
}

impl LocationSubscription {
    /// Create a watch handle from a host delivery channel.
    pub fn new(id: u64, receiver: mpsc::Receiver<LocationPoint>) -> Self {
        Self { id, receiver }
    }

    /// Receive the next fix; `None` when the host closed the stream.
    pub async fn recv(&mut self) -> Option<LocationPoint> {
        self.receiver.recv().await
    }
}

/// GPS positioning provider.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// One-shot position request, bounded by the host.
    async fn current_position(&self) -> Result<LocationPoint, FdeError>;

    /// Start a continuous watch.
    async fn watch(&self, options: WatchOptions) -> Result<LocationSubscription, FdeError>;

    /// Stop a watch by id.
    async fn stop_watch(&self, id: u64);
}

/// Platform permission prompts.
#[async_trait]
pub trait PermissionGateway: Send + Sync {
    /// Request a permission; `true` when granted.
    async fn request(&self, permission: Permission) -> bool;
}

/// A local notification to surface on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNotification {
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Whether to play the alert sound.
    pub sound: bool,
}

/// Local notification delivery.
#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    /// Schedule an immediate notification, returning its host id.
    async fn schedule(&self, notification: LocalNotification) -> Result<String, FdeError>;

    /// Cancel a scheduled notification.
    async fn cancel(&self, id: &str);
}

/// Result reported by the device SMS composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsSubmission {
    /// The host reports the message as sent.
    Sent,
    /// Submission failed or was cancelled, with the host's reason.
    Failed(String),
}

/// Device-local SMS channel, the direct fallback path.
#[async_trait]
pub trait SmsChannel: Send + Sync {
    /// Whether the device can send SMS at all.
    async fn is_available(&self) -> bool;

    /// Submit one multi-recipient message.
    async fn send_to(&self, recipients: &[String], text: &str)
        -> Result<SmsSubmission, FdeError>;
}

/// Request payload for the server emergency-SMS function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencySmsRequest {
    /// Rider identifier.
    pub user_id: String,
    /// Rendered alert message.
    pub message: String,
    /// Location to forward, if known.
    pub location: Option<LocationPoint>,
    /// `"fall"` or `"test"`.
    pub emergency_type: String,
    /// Wall-clock timestamp in RFC 3339.
    pub timestamp: String,
}

/// Response from the server emergency-SMS function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencySmsResponse {
    /// Whether the server accepted and delivered the alert.
    pub success: bool,
    /// Recipients reached server-side.
    pub sent_count: u32,
    /// Server-assigned message id, if delivered.
    pub message_id: Option<String>,
    /// Server error description, if any.
    pub error: Option<String>,
}

/// Remote emergency dispatch, the preferred path.
#[async_trait]
pub trait EmergencyRpc: Send + Sync {
    /// Invoke the `send-emergency-sms` server function.
    async fn send_emergency_sms(
        &self,
        request: EmergencySmsRequest,
    ) -> Result<EmergencySmsResponse, FdeError>;
}

/// Opaque payload carried by a scheduled post-fall wakeup.
///
/// Hosts must round-trip the primitive fields faithfully; no richer payload
/// fidelity is assumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellWakeup {
    /// Payload tag, always `"post_fall_dwell"`.
    pub kind: String,
    /// Rider identifier.
    pub user_id: String,
    /// Impact timestamp in monotonic milliseconds.
    pub fall_timestamp_ms: u64,
    /// Impact acceleration magnitude in g.
    pub magnitude: f64,
    /// Impact rotational magnitude in rad/s.
    pub rotational_magnitude: f64,
}

impl DwellWakeup {
    /// Payload tag value.
    pub const KIND: &'static str = "post_fall_dwell";

    /// Create a tagged wakeup payload.
    pub fn new(
        user_id: impl Into<String>,
        fall_timestamp_ms: u64,
        magnitude: f64,
        rotational_magnitude: f64,
    ) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            user_id: user_id.into(),
            fall_timestamp_ms,
            magnitude,
            rotational_magnitude,
        }
    }
}

/// Deferred wakeup scheduling for the background dwell.
#[async_trait]
pub trait DwellScheduler: Send + Sync {
    /// Schedule a wakeup after `delay_ms`, returning its host id.
    async fn schedule_wakeup(&self, wakeup: DwellWakeup, delay_ms: u64)
        -> Result<String, FdeError>;

    /// Cancel a scheduled wakeup.
    async fn cancel(&self, id: &str);
}
