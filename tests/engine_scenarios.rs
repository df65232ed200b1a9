//! End-to-end scenarios driving the public engine API over scripted hosts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use equihub_fde::host::{
    DwellScheduler, DwellWakeup, EmergencyRpc, EmergencySmsRequest, EmergencySmsResponse,
    LocalNotification, LocationSource, LocationSubscription, NotificationScheduler, Permission,
    PermissionGateway, SensorKind, SensorReading, SensorSource, SensorSubscription, SmsChannel,
    SmsSubmission, WatchOptions,
};
use equihub_fde::storage::{Context, MemoryKeyValueStore};
use equihub_fde::{
    EmergencyContact, EngineEvent, FallDetectionEngine, FdeConfig, FdeError, HostAdapters,
    LocationPoint, RejectionReason, Vec3,
};

// ---------------------------------------------------------------------------
// Scripted hosts
// ---------------------------------------------------------------------------

struct FakeSensors {
    senders: Mutex<Vec<(SensorKind, mpsc::Sender<SensorReading>)>>,
    next_id: AtomicU64,
}

impl FakeSensors {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Feeding end of the `n`-th subscription of a kind, in subscribe order.
    /// The foreground subscribes before the background loop starts.
    fn sender(&self, kind: SensorKind, n: usize) -> Option<mpsc::Sender<SensorReading>> {
        self.senders
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .nth(n)
            .map(|(_, tx)| tx.clone())
    }

    async fn wait_for_subscriptions(&self, count: usize) {
        while self.senders.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl SensorSource for FakeSensors {
    async fn is_available(&self, _kind: SensorKind) -> bool {
        true
    }

    async fn subscribe(
        &self,
        kind: SensorKind,
        _interval_ms: u64,
    ) -> Result<SensorSubscription, FdeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(256);
        self.senders.lock().push((kind, tx));
        Ok(SensorSubscription::new(id, kind, rx))
    }

    async fn unsubscribe(&self, _id: u64) {}
}

struct FakeLocation {
    one_shots: Mutex<VecDeque<LocationPoint>>,
    watch_rx: Mutex<Option<mpsc::Receiver<LocationPoint>>>,
}

impl FakeLocation {
    /// A source with a test-fed watch stream and a queue of one-shot fixes.
    fn new(one_shots: Vec<LocationPoint>) -> (Arc<Self>, mpsc::Sender<LocationPoint>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                one_shots: Mutex::new(one_shots.into()),
                watch_rx: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl LocationSource for FakeLocation {
    async fn current_position(&self) -> Result<LocationPoint, FdeError> {
        self.one_shots
            .lock()
            .pop_front()
            .ok_or_else(|| FdeError::LocationUnavailable("no fix".to_string()))
    }

    async fn watch(&self, _options: WatchOptions) -> Result<LocationSubscription, FdeError> {
        let rx = match self.watch_rx.lock().take() {
            Some(rx) => rx,
            None => mpsc::channel(1).1,
        };
        Ok(LocationSubscription::new(1, rx))
    }

    async fn stop_watch(&self, _id: u64) {}
}

struct GrantAll;

#[async_trait]
impl PermissionGateway for GrantAll {
    async fn request(&self, _permission: Permission) -> bool {
        true
    }
}

struct FakeNotifications {
    sent: Mutex<Vec<LocalNotification>>,
}

#[async_trait]
impl NotificationScheduler for FakeNotifications {
    async fn schedule(&self, notification: LocalNotification) -> Result<String, FdeError> {
        let mut sent = self.sent.lock();
        sent.push(notification);
        Ok(format!("n{}", sent.len()))
    }

    async fn cancel(&self, _id: &str) {}
}

struct FakeSms {
    sent_to: Mutex<Vec<String>>,
}

#[async_trait]
impl SmsChannel for FakeSms {
    async fn is_available(&self) -> bool {
        true
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

struct FakeRpc {
    requests: Mutex<Vec<EmergencySmsRequest>>,
    succeed: bool,
}

#[async_trait]
impl EmergencyRpc for FakeRpc {
    async fn send_emergency_sms(
        &self,
        request: EmergencySmsRequest,
    ) -> Result<EmergencySmsResponse, FdeError> {
        self.requests.lock().push(request);
        if self.succeed {
            Ok(EmergencySmsResponse {
                success: true,
                sent_count: 2,
                message_id: Some("srv-1".to_string()),
                error: None,
            })
        } else {
            Err(FdeError::Rpc("server outage".to_string()))
        }
    }
}

struct FakeScheduler {
    scheduled: Mutex<Vec<(DwellWakeup, u64)>>,
}

#[async_trait]
impl DwellScheduler for FakeScheduler {
    async fn schedule_wakeup(
        &self,
        wakeup: DwellWakeup,
        delay_ms: u64,
    ) -> Result<String, FdeError> {
        let mut scheduled = self.scheduled.lock();
        scheduled.push((wakeup, delay_ms));
        Ok(format!("w{}", scheduled.len()))
    }

    async fn cancel(&self, _id: &str) {}
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    engine: FallDetectionEngine,
    sensors: Arc<FakeSensors>,
    watch_tx: mpsc::Sender<LocationPoint>,
    rpc: Arc<FakeRpc>,
    sms: Arc<FakeSms>,
    notifications: Arc<FakeNotifications>,
    scheduler: Arc<FakeScheduler>,
    events: tokio::sync::broadcast::Receiver<EngineEvent>,
}

impl Harness {
    fn new(one_shot_fixes: Vec<LocationPoint>, server_up: bool) -> Self {
        // Short dwell so scenario runs stay compact; the semantics do not
        // depend on the window length.
        let config = FdeConfig::builder()
            .post_fall_dwell_ms(4_000)
            .dwell_poll_interval_ms(1_000)
            .build()
            .expect("valid config");

        let sensors = FakeSensors::new();
        let (location, watch_tx) = FakeLocation::new(one_shot_fixes);
        let rpc = Arc::new(FakeRpc {
            requests: Mutex::new(Vec::new()),
            succeed: server_up,
        });
        let sms = Arc::new(FakeSms {
            sent_to: Mutex::new(Vec::new()),
        });
        let notifications = Arc::new(FakeNotifications {
            sent: Mutex::new(Vec::new()),
        });
        let scheduler = Arc::new(FakeScheduler {
            scheduled: Mutex::new(Vec::new()),
        });

        let engine = FallDetectionEngine::new(
            config,
            HostAdapters {
                sensors: sensors.clone(),
                location,
                permissions: Arc::new(GrantAll),
                notifications: notifications.clone(),
                sms: sms.clone(),
                rpc: rpc.clone(),
                scheduler: scheduler.clone(),
                kv: Arc::new(MemoryKeyValueStore::new()),
            },
        );
        let events = engine.subscribe_events();

        Self {
            engine,
            sensors,
            watch_tx,
            rpc,
            sms,
            notifications,
            scheduler,
            events,
        }
    }

    async fn start(&self) {
        assert!(self
            .engine
            .start_monitoring("rider-1", riders_contacts())
            .await
            .unwrap());
        self.sensors.wait_for_subscriptions(4).await;
    }

    /// Feed a plausible 70 m ride through the location watch and wait until
    /// the tracker absorbed it.
    async fn ride_until(&self, end_ms: u64) {
        for fix in moving_track(47.0, 0, 8) {
            self.watch_tx.send(fix).await.unwrap();
        }
        loop {
            if let Some(last) = self.engine.last_known_location() {
                if last.timestamp_ms >= end_ms {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send_impact(&self, context_idx: usize, timestamp_ms: u64) {
        let accel = self
            .sensors
            .sender(SensorKind::Accelerometer, context_idx)
            .expect("accelerometer subscription");
        accel
            .send(SensorReading {
                values: Vec3::new(0.0, 0.0, 36.0),
                timestamp_ms,
            })
            .await
            .unwrap();
    }

    /// Wait for the next event of the given type, skipping others.
    async fn await_event(&mut self, event_type: &str) -> EngineEvent {
        for _ in 0..600 {
            match self.events.try_recv() {
                Ok(event) if event.event_type() == event_type => return event,
                Ok(_) => {}
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        panic!("timed out waiting for {event_type}");
    }
}

fn riders_contacts() -> Vec<EmergencyContact> {
    vec![
        EmergencyContact::new("c1", "Alex", "+41790000001"),
        EmergencyContact::new("c2", "Sam", "+41790000002"),
    ]
}

fn north_of(lat: f64, meters: f64) -> f64 {
    lat + meters / 111_195.0
}

/// 10 m hops every 2 s at good accuracy, starting just north of `lat`.
fn moving_track(lat: f64, start_ms: u64, hops: usize) -> Vec<LocationPoint> {
    let mut lat = lat;
    (0..hops)
        .map(|i| {
            lat = north_of(lat, 10.0);
            LocationPoint::new(lat, 8.0, start_ms + i as u64 * 2_000, Some(5.0))
        })
        .collect()
}

/// Where the standard 8-hop ride from latitude 47.0 ends.
const RIDE_END_LAT: f64 = 47.0 + 80.0 / 111_195.0;

fn stationary_fixes(start_ms: u64, count: usize, step_ms: u64) -> Vec<LocationPoint> {
    (0..count)
        .map(|i| LocationPoint::new(RIDE_END_LAT, 8.0, start_ms + i as u64 * step_ms, Some(5.0)))
        .collect()
}

/// A downed rider shifting in place: 2 m hops every second at good accuracy,
/// admitted by the tracker but far below the dismissal threshold.
fn shuffling_fixes(start_ms: u64, count: usize) -> Vec<LocationPoint> {
    let mut lat = RIDE_END_LAT;
    (0..count)
        .map(|i| {
            lat = north_of(lat, 2.0);
            LocationPoint::new(lat, 8.0, start_ms + i as u64 * 1_000, Some(5.0))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A rider falls at speed and stays down: the alert goes out via the server.
#[tokio::test(start_paused = true)]
async fn scenario_fall_at_speed_dispatches_server_alert() {
    let mut harness = Harness::new(stationary_fixes(16_000, 8, 1_000), true);
    harness.start().await;
    harness.ride_until(14_000).await;

    harness.send_impact(0, 15_000).await;

    let dispatched = harness.await_event("AlertDispatched").await;
    let EngineEvent::AlertDispatched { success, sent_count, .. } = dispatched else {
        unreachable!();
    };
    assert!(success);
    assert_eq!(sent_count, 2);

    let requests = harness.rpc.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].emergency_type, "fall");
    assert!(requests[0].message.contains("FALL DETECTED"));
    assert!(requests[0].location.is_some());
    // The direct channel was never needed.
    assert!(harness.sms.sent_to.lock().is_empty());

    let recorded = harness
        .engine
        .recorded_events(Context::Foreground)
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].alert_sent);

    harness.engine.stop_monitoring().await.unwrap();
}

/// A low-speed dismount fall: no single severe spike, but anomalous motion
/// sustained past the impact duration escalates, and an 8 m shuffle during
/// the dwell is not enough to dismiss.
#[tokio::test(start_paused = true)]
async fn scenario_low_speed_sustained_fall_confirms() {
    let mut harness = Harness::new(shuffling_fixes(16_000, 8), true);
    harness.start().await;
    harness.ride_until(14_000).await;

    // 6 g of gravity deviation held for 600 ms on the foreground stream.
    let accel = harness
        .sensors
        .sender(SensorKind::Accelerometer, 0)
        .expect("accelerometer subscription");
    for i in 0..13u64 {
        accel
            .send(SensorReading {
                values: Vec3::new(0.0, 0.0, 7.0),
                timestamp_ms: 15_000 + i * 50,
            })
            .await
            .unwrap();
    }

    let escalated = harness.await_event("Escalated").await;
    let EngineEvent::Escalated { severe_immediate, .. } = escalated else {
        unreachable!();
    };
    assert!(!severe_immediate);

    let dispatched = harness.await_event("AlertDispatched").await;
    assert!(matches!(
        dispatched,
        EngineEvent::AlertDispatched { success: true, .. }
    ));
    assert_eq!(harness.rpc.requests.lock().len(), 1);

    let recorded = harness
        .engine
        .recorded_events(Context::Foreground)
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].alert_sent);

    harness.engine.stop_monitoring().await.unwrap();
}

/// The phone slips off a table: a severe spike with no ride before it is
/// rejected as a dropped device.
#[tokio::test(start_paused = true)]
async fn scenario_dropped_device_is_rejected() {
    let mut harness = Harness::new(Vec::new(), true);
    harness.start().await;

    harness.send_impact(0, 1_000).await;

    let rejected = harness.await_event("GateRejected").await;
    assert!(matches!(
        rejected,
        EngineEvent::GateRejected {
            reason: RejectionReason::NoPreFallMovement,
            ..
        }
    ));
    assert!(harness.rpc.requests.lock().is_empty());
    assert!(harness.scheduler.scheduled.lock().is_empty());

    harness.engine.stop_monitoring().await.unwrap();
}

/// The rider comes off but gets up and walks to the horse: movement during
/// the dwell dismisses the alert.
#[tokio::test(start_paused = true)]
async fn scenario_recovery_walk_dismisses_alert() {
    // Dwell one-shots continue the ride northwards, 10 m per second.
    let harness_fixes = moving_track(RIDE_END_LAT, 16_000, 6)
        .into_iter()
        .map(|mut p| {
            p.timestamp_ms = 16_000 + (p.timestamp_ms - 16_000) / 2;
            p
        })
        .collect();
    let mut harness = Harness::new(harness_fixes, true);
    harness.start().await;
    harness.ride_until(14_000).await;

    harness.send_impact(0, 15_000).await;

    let dismissed = harness.await_event("DwellDismissed").await;
    let EngineEvent::DwellDismissed { movement_m, threshold_m, .. } = dismissed else {
        unreachable!();
    };
    assert!(movement_m > threshold_m);
    assert!(harness.rpc.requests.lock().is_empty());

    // The rider is told, quietly.
    let sent = harness.notifications.sent.lock();
    assert!(sent.iter().any(|n| !n.sound));
    drop(sent);

    harness.engine.stop_monitoring().await.unwrap();
}

/// A fall while the app is backgrounded: the dwell is deferred to a host
/// wakeup, which later confirms and dispatches.
#[tokio::test(start_paused = true)]
async fn scenario_background_fall_confirms_via_wakeup() {
    let mut harness = Harness::new(Vec::new(), true);
    harness.start().await;
    harness.ride_until(14_000).await;

    // Impact arrives on the background stream (subscription index 1).
    harness.send_impact(1, 15_000).await;

    harness.await_event("Escalated").await;
    let (wakeup, delay_ms) = loop {
        if let Some(entry) = harness.scheduler.scheduled.lock().first().cloned() {
            break entry;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(delay_ms, 4_000);
    assert_eq!(wakeup.fall_timestamp_ms, 15_000);
    // Nothing dispatched yet.
    assert!(harness.rpc.requests.lock().is_empty());

    // The rider stays down; the watch keeps reporting the same spot.
    for fix in stationary_fixes(16_000, 4, 1_000) {
        harness.watch_tx.send(fix).await.unwrap();
    }
    loop {
        if let Some(last) = harness.engine.last_known_location() {
            if last.timestamp_ms >= 19_000 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    harness.engine.handle_dwell_wakeup(wakeup).await.unwrap();

    assert_eq!(harness.rpc.requests.lock().len(), 1);
    let recorded = harness
        .engine
        .recorded_events(Context::Background)
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].detected_in_background);
    assert!(recorded[0].alert_sent);

    harness.engine.stop_monitoring().await.unwrap();
}

/// The emergency server is down: the alert still reaches every enabled
/// contact through the device SMS composer.
#[tokio::test(start_paused = true)]
async fn scenario_server_outage_falls_back_to_direct_sms() {
    let mut harness = Harness::new(stationary_fixes(16_000, 8, 1_000), false);
    harness.start().await;
    harness.ride_until(14_000).await;

    harness.send_impact(0, 15_000).await;

    let dispatched = harness.await_event("AlertDispatched").await;
    let EngineEvent::AlertDispatched { success, sent_count, .. } = dispatched else {
        unreachable!();
    };
    assert!(success);
    assert_eq!(sent_count, 2);

    // The server was tried first, then both contacts got the direct SMS.
    assert_eq!(harness.rpc.requests.lock().len(), 1);
    assert_eq!(
        harness.sms.sent_to.lock().as_slice(),
        ["+41790000001", "+41790000002"]
    );

    harness.engine.stop_monitoring().await.unwrap();
}

/// Degraded GPS during the dwell: raw drift stays under the accuracy-scaled
/// threshold, so a real fall is not mistaken for recovery.
#[tokio::test(start_paused = true)]
async fn scenario_gps_drift_does_not_mask_a_fall() {
    // 12 m of drift per second at 80 m accuracy; raw total stays below the
    // 25 m * 3.0 adaptive threshold.
    let mut lat = RIDE_END_LAT;
    let drifting: Vec<LocationPoint> = (0..6)
        .map(|i| {
            lat = north_of(lat, 12.0);
            LocationPoint::new(lat, 8.0, 16_000 + i * 1_000, Some(80.0))
        })
        .collect();
    let mut harness = Harness::new(drifting, true);
    harness.start().await;
    harness.ride_until(14_000).await;

    harness.send_impact(0, 15_000).await;

    let dispatched = harness.await_event("AlertDispatched").await;
    assert!(matches!(
        dispatched,
        EngineEvent::AlertDispatched { success: true, .. }
    ));
    assert_eq!(harness.rpc.requests.lock().len(), 1);

    harness.engine.stop_monitoring().await.unwrap();
}
