//! Scripted host fakes shared by the engine unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::alerting::AlertDispatcher;
use crate::domain::{EmergencyContact, EngineEvent, LocationPoint, SensorSample, Vec3};
use crate::host::{
    DwellScheduler, DwellWakeup, EmergencyRpc, EmergencySmsRequest, EmergencySmsResponse,
    LocalNotification, LocationSource, LocationSubscription, NotificationScheduler, Permission,
    PermissionGateway, SensorKind, SensorReading, SensorSource, SensorSubscription, SmsChannel,
    SmsSubmission, WatchOptions,
};
use crate::storage::{MemoryKeyValueStore, StateStore};
use crate::tracking::MovementTracker;
use crate::{FdeConfig, FdeError};

use super::EngineServices;

/// One-shot fix queue plus an optional watch stream.
pub(crate) struct ScriptedLocations {
    fixes: Mutex<VecDeque<LocationPoint>>,
    watch_rx: Mutex<Option<mpsc::Receiver<LocationPoint>>>,
    pub stopped_watches: Mutex<Vec<u64>>,
}

impl ScriptedLocations {
    pub fn queue(fixes: Vec<LocationPoint>) -> Arc<Self> {
        Arc::new(Self {
            fixes: Mutex::new(fixes.into()),
            watch_rx: Mutex::new(None),
            stopped_watches: Mutex::new(Vec::new()),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Self::queue(Vec::new())
    }

    /// A source whose watch stream is fed by the returned sender.
    pub fn with_watch(fixes: Vec<LocationPoint>) -> (Arc<Self>, mpsc::Sender<LocationPoint>) {
        let (tx, rx) = mpsc::channel(64);
        let source = Self::queue(fixes);
        *source.watch_rx.lock() = Some(rx);
        (source, tx)
    }
}

#[async_trait]
impl LocationSource for ScriptedLocations {
    async fn current_position(&self) -> Result<LocationPoint, FdeError> {
        self.fixes
            .lock()
            .pop_front()
            .ok_or_else(|| FdeError::LocationUnavailable("no fix".to_string()))
    }

    async fn watch(&self, _options: WatchOptions) -> Result<LocationSubscription, FdeError> {
        let rx = match self.watch_rx.lock().take() {
            Some(rx) => rx,
            None => mpsc::channel(1).1,
        };
        Ok(LocationSubscription::new(7, rx))
    }

    async fn stop_watch(&self, id: u64) {
        self.stopped_watches.lock().push(id);
    }
}

/// Sensor source that hands a fresh channel to every subscriber and exposes
/// the feeding ends to the test.
pub(crate) struct ScriptedSensors {
    pub senders: Mutex<Vec<(u64, SensorKind, mpsc::Sender<SensorReading>)>>,
    pub unsubscribed: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    accel_available: bool,
}

impl ScriptedSensors {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            accel_available: true,
        })
    }

    pub fn without_accelerometer() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            accel_available: false,
        })
    }

    /// Feeding end of the `n`-th subscription of the given kind.
    pub fn sender(&self, kind: SensorKind, n: usize) -> Option<mpsc::Sender<SensorReading>> {
        self.senders
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .nth(n)
            .map(|(_, _, tx)| tx.clone())
    }
}

#[async_trait]
impl SensorSource for ScriptedSensors {
    async fn is_available(&self, kind: SensorKind) -> bool {
        match kind {
            SensorKind::Accelerometer => self.accel_available,
            SensorKind::Gyroscope => true,
        }
    }

    async fn subscribe(
        &self,
        kind: SensorKind,
        _interval_ms: u64,
    ) -> Result<SensorSubscription, FdeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(256);
        self.senders.lock().push((id, kind, tx));
        Ok(SensorSubscription::new(id, kind, rx))
    }

    async fn unsubscribe(&self, id: u64) {
        self.unsubscribed.lock().push(id);
    }
}

pub(crate) struct GrantAll;

#[async_trait]
impl PermissionGateway for GrantAll {
    async fn request(&self, _permission: Permission) -> bool {
        true
    }
}

pub(crate) struct DenyLocation;

#[async_trait]
impl PermissionGateway for DenyLocation {
    async fn request(&self, permission: Permission) -> bool {
        permission != Permission::Location
    }
}

pub(crate) struct RecordingNotifications {
    pub sent: Mutex<Vec<LocalNotification>>,
}

impl RecordingNotifications {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl NotificationScheduler for RecordingNotifications {
    async fn schedule(&self, notification: LocalNotification) -> Result<String, FdeError> {
        let mut sent = self.sent.lock();
        sent.push(notification);
        Ok(format!("n{}", sent.len()))
    }

    async fn cancel(&self, _id: &str) {}
}

pub(crate) struct RecordingScheduler {
    pub scheduled: Mutex<Vec<(DwellWakeup, u64)>>,
    pub cancelled: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingScheduler {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            scheduled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            scheduled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail: true,
        })
    }
}

#[async_trait]
impl DwellScheduler for RecordingScheduler {
    async fn schedule_wakeup(
        &self,
        wakeup: DwellWakeup,
        delay_ms: u64,
    ) -> Result<String, FdeError> {
        if self.fail {
            return Err(FdeError::Scheduler("host rejected wakeup".to_string()));
        }
        let mut scheduled = self.scheduled.lock();
        scheduled.push((wakeup, delay_ms));
        Ok(format!("w{}", scheduled.len()))
    }

    async fn cancel(&self, id: &str) {
        self.cancelled.lock().push(id.to_string());
    }
}

pub(crate) struct CountingRpc {
    pub requests: Mutex<Vec<EmergencySmsRequest>>,
    succeed: bool,
}

impl CountingRpc {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            succeed: true,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            succeed: false,
        })
    }
}

#[async_trait]
impl EmergencyRpc for CountingRpc {
    async fn send_emergency_sms(
        &self,
        request: EmergencySmsRequest,
    ) -> Result<EmergencySmsResponse, FdeError> {
        self.requests.lock().push(request);
        if self.succeed {
            Ok(EmergencySmsResponse {
                success: true,
                sent_count: 2,
                message_id: Some("msg-1".to_string()),
                error: None,
            })
        } else {
            Err(FdeError::Rpc("server outage".to_string()))
        }
    }
}

pub(crate) struct RecordingSms {
    pub sent_to: Mutex<Vec<String>>,
    available: bool,
}

impl RecordingSms {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            sent_to: Mutex::new(Vec::new()),
            available: true,
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            sent_to: Mutex::new(Vec::new()),
            available: false,
        })
    }
}

#[async_trait]
impl SmsChannel for RecordingSms {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn send_to(
        &self,
        recipients: &[String],
        _text: &str,
    ) -> Result<SmsSubmission, FdeError> {
        self.sent_to.lock().extend(recipients.iter().cloned());
        Ok(SmsSubmission::Sent)
    }
}

/// A wired-up services bundle over in-memory fakes.
pub(crate) struct TestRig {
    pub services: EngineServices,
    pub store: StateStore,
    pub tracker: Arc<MovementTracker>,
    pub location: Arc<ScriptedLocations>,
    pub rpc: Arc<CountingRpc>,
    pub sms: Arc<RecordingSms>,
    pub notifications: Arc<RecordingNotifications>,
    pub scheduler: Arc<RecordingScheduler>,
    pub events: broadcast::Receiver<EngineEvent>,
}

impl TestRig {
    pub fn new(config: &FdeConfig, location: Arc<ScriptedLocations>) -> Self {
        Self::build(config, location, CountingRpc::succeeding(), RecordingScheduler::working())
    }

    pub fn build(
        config: &FdeConfig,
        location: Arc<ScriptedLocations>,
        rpc: Arc<CountingRpc>,
        scheduler: Arc<RecordingScheduler>,
    ) -> Self {
        let store = StateStore::new(Arc::new(MemoryKeyValueStore::new()));
        let tracker = Arc::new(MovementTracker::new(config.tracker_config()));
        let sms = RecordingSms::working();
        let notifications = RecordingNotifications::new();
        let dispatcher = Arc::new(AlertDispatcher::new(rpc.clone(), sms.clone()));
        let (events_tx, events) = broadcast::channel(64);

        let services = EngineServices {
            tracker: tracker.clone(),
            store: store.clone(),
            dispatcher,
            location: location.clone(),
            notifications: notifications.clone(),
            scheduler: scheduler.clone(),
            events: events_tx,
            pending_wakeup: Arc::new(Mutex::new(None)),
        };

        Self {
            services,
            store,
            tracker,
            location,
            rpc,
            sms,
            notifications,
            scheduler,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Roughly `meters` of northward displacement in degrees latitude.
pub(crate) fn north_of(lat: f64, meters: f64) -> f64 {
    lat + meters / 111_195.0
}

/// A plausible riding track: 10 m hops every 2 s, good accuracy.
pub(crate) fn moving_track(start_ms: u64, hops: usize) -> Vec<LocationPoint> {
    let mut lat = 47.0;
    (0..hops)
        .map(|i| {
            lat = north_of(lat, 10.0);
            LocationPoint::new(lat, 8.0, start_ms + i as u64 * 2_000, Some(5.0))
        })
        .collect()
}

/// Stationary fixes at the given position.
pub(crate) fn stationary_fixes(
    lat: f64,
    lon: f64,
    start_ms: u64,
    count: usize,
    step_ms: u64,
) -> Vec<LocationPoint> {
    (0..count)
        .map(|i| LocationPoint::new(lat, lon, start_ms + i as u64 * step_ms, Some(5.0)))
        .collect()
}

/// A single-sample severe impact: 35 g of gravity deviation.
pub(crate) fn severe_sample(timestamp_ms: u64) -> SensorSample {
    SensorSample::new(
        timestamp_ms,
        Vec3::new(0.0, 0.0, 36.0),
        Vec3::new(2.0, 1.0, 0.0),
    )
}

pub(crate) fn quiet_sample(timestamp_ms: u64) -> SensorSample {
    SensorSample::new(timestamp_ms, Vec3::new(0.0, 0.0, 1.0), Vec3::default())
}

pub(crate) fn contacts() -> Vec<EmergencyContact> {
    vec![
        EmergencyContact::new("c1", "Alex", "+41790000001"),
        EmergencyContact::new("c2", "Sam", "+41790000002"),
    ]
}
