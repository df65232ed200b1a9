//! Orchestration: the fall state machine and the execution coordinator.

pub mod background;
pub mod coordinator;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod testkit;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::alerting::AlertDispatcher;
use crate::domain::EngineEvent;
use crate::host::{
    DwellScheduler, EmergencyRpc, LocationSource, NotificationScheduler, PermissionGateway,
    SensorSource, SmsChannel,
};
use crate::storage::{KeyValueStore, StateStore};
use crate::tracking::MovementTracker;

pub use background::BackgroundSampler;
pub use coordinator::{ExecutionCoordinator, FallDetectionEngine};
pub use state_machine::FallStateMachine;

/// Host-side adapters the engine is constructed over.
///
/// Everything here is shared, long-lived, and implemented by the embedding
/// application (or by scripted fakes in tests).
#[derive(Clone)]
pub struct HostAdapters {
    /// Inertial sensors.
    pub sensors: Arc<dyn SensorSource>,
    /// GPS positioning.
    pub location: Arc<dyn LocationSource>,
    /// Platform permission prompts.
    pub permissions: Arc<dyn PermissionGateway>,
    /// Local notifications.
    pub notifications: Arc<dyn NotificationScheduler>,
    /// Device SMS composer.
    pub sms: Arc<dyn SmsChannel>,
    /// Emergency server function.
    pub rpc: Arc<dyn EmergencyRpc>,
    /// Background wakeup scheduler.
    pub scheduler: Arc<dyn DwellScheduler>,
    /// Durable key-value storage.
    pub kv: Arc<dyn KeyValueStore>,
}

/// Shared services handed to every state machine instance.
#[derive(Clone)]
pub(crate) struct EngineServices {
    pub tracker: Arc<MovementTracker>,
    pub store: StateStore,
    pub dispatcher: Arc<AlertDispatcher>,
    pub location: Arc<dyn LocationSource>,
    pub notifications: Arc<dyn NotificationScheduler>,
    pub scheduler: Arc<dyn DwellScheduler>,
    pub events: broadcast::Sender<EngineEvent>,
    /// Host id of the currently scheduled dwell wakeup, cancelled on stop.
    pub pending_wakeup: Arc<Mutex<Option<String>>>,
}
