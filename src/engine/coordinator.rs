//! Execution coordination across the foreground and background contexts.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerting::{AlertDispatcher, AlertOutcome};
use crate::domain::{DetectorState, EmergencyContact, EngineEvent, FallEvent, LocationPoint, SensorSample};
use crate::host::{DwellWakeup, Permission, SensorKind, SensorSource, SensorSubscription, WatchOptions};
use crate::storage::{Context, StateStore};
use crate::tracking::MovementTracker;
use crate::{FdeConfig, Result};

use super::background::BackgroundSampler;
use super::state_machine::FallStateMachine;
use super::{EngineServices, HostAdapters};

/// Wall-clock milliseconds, the engine's time base for persistence pruning.
/// Hosts are expected to stamp samples and fixes on the same clock.
fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

struct RunningSession {
    stop_tx: watch::Sender<bool>,
    fg_task: JoinHandle<()>,
    bg_task: JoinHandle<()>,
    location_task: Option<JoinHandle<()>>,
    watch_id: Option<u64>,
}

/// Owns the monitoring session: permissions, subscriptions, the two
/// sampling loops, and deterministic teardown.
///
/// Starting is idempotent while a session is live; stopping tears every
/// subscription and task down before clearing the background keys, so a
/// later start finds no stale state.
pub struct ExecutionCoordinator {
    config: Arc<FdeConfig>,
    adapters: HostAdapters,
    services: EngineServices,
    session: Mutex<Option<RunningSession>>,
}

impl ExecutionCoordinator {
    /// Wire the coordinator over the host adapters.
    pub fn new(config: Arc<FdeConfig>, adapters: HostAdapters) -> Self {
        let store = StateStore::new(adapters.kv.clone());
        let tracker = Arc::new(MovementTracker::new(config.tracker_config()));
        let dispatcher = Arc::new(AlertDispatcher::new(
            adapters.rpc.clone(),
            adapters.sms.clone(),
        ));
        let (events_tx, _) = broadcast::channel(256);

        let services = EngineServices {
            tracker,
            store,
            dispatcher,
            location: adapters.location.clone(),
            notifications: adapters.notifications.clone(),
            scheduler: adapters.scheduler.clone(),
            events: events_tx,
            pending_wakeup: Arc::new(Mutex::new(None)),
        };

        Self {
            config,
            adapters,
            services,
            session: Mutex::new(None),
        }
    }

    /// Start monitoring for the given rider.
    ///
    /// Returns `Ok(false)` when monitoring cannot start for a reason the
    /// rider must resolve (detection disabled, location permission denied,
    /// no accelerometer); hard faults surface as errors.
    pub async fn start_monitoring(
        &self,
        user_id: &str,
        contacts: Vec<EmergencyContact>,
    ) -> Result<bool> {
        self.config.validate()?;
        if !self.config.enabled {
            info!("fall detection is disabled, not starting");
            return Ok(false);
        }
        if self.session.lock().is_some() {
            warn!("monitoring already running");
            return Ok(true);
        }

        if !self.adapters.permissions.request(Permission::Location).await {
            warn!("location permission denied, cannot monitor");
            return Ok(false);
        }
        if !self
            .adapters
            .permissions
            .request(Permission::Notifications)
            .await
        {
            // Alerts still reach contacts; only the rider-facing surface is
            // degraded.
            warn!("notification permission denied, proceeding without");
        }

        if !self
            .adapters
            .sensors
            .is_available(SensorKind::Accelerometer)
            .await
        {
            warn!("no accelerometer on this device, cannot monitor");
            return Ok(false);
        }

        let store = &self.services.store;
        store.save_user(user_id).await?;
        store.save_contacts(&contacts).await?;
        store.save_config(self.config.as_ref()).await?;
        store
            .save_state(Context::Foreground, &DetectorState::new())
            .await?;
        store
            .save_state(Context::Background, &DetectorState::new())
            .await?;
        self.services.tracker.load_persisted(store, now_ms()).await?;

        let (stop_tx, stop_rx) = watch::channel(false);

        let (watch_id, location_task) = match self
            .adapters
            .location
            .watch(WatchOptions::default())
            .await
        {
            Ok(subscription) => {
                let id = subscription.id;
                let task = self.spawn_location_feed(subscription, stop_rx.clone());
                (Some(id), Some(task))
            }
            Err(e) => {
                warn!(error = %e, "location watch unavailable, movement evidence degrades");
                (None, None)
            }
        };

        // Foreground subscriptions happen here so a failure aborts the start
        // instead of dying inside a task.
        let cadence = self.config.sensor_interval_fg_ms;
        let accel = self
            .adapters
            .sensors
            .subscribe(SensorKind::Accelerometer, cadence)
            .await?;
        let gyro = match self
            .adapters
            .sensors
            .subscribe(SensorKind::Gyroscope, cadence)
            .await
        {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(error = %e, "foreground gyroscope unavailable, proceeding without");
                None
            }
        };

        let mut fg_fsm = FallStateMachine::new(
            self.config.clone(),
            Context::Foreground,
            user_id,
            contacts.clone(),
            self.services.clone(),
        );
        fg_fsm.set_stop_signal(stop_rx.clone());
        fg_fsm.restore().await?;
        let fg_task = tokio::spawn(run_foreground(
            fg_fsm,
            accel,
            gyro,
            self.adapters.sensors.clone(),
            stop_rx.clone(),
        ));

        let bg_fsm = FallStateMachine::new(
            self.config.clone(),
            Context::Background,
            user_id,
            contacts,
            self.services.clone(),
        );
        let sampler = BackgroundSampler::new(
            self.config.clone(),
            self.adapters.sensors.clone(),
            self.services.store.clone(),
            bg_fsm,
        );
        let bg_task = tokio::spawn(async move {
            if let Err(e) = sampler.run(stop_rx).await {
                warn!(error = %e, "background sampler exited");
            }
        });

        *self.session.lock() = Some(RunningSession {
            stop_tx,
            fg_task,
            bg_task,
            location_task,
            watch_id,
        });
        info!(user_id, "fall detection monitoring started");
        Ok(true)
    }

    /// Stop monitoring and tear down every subscription and task.
    pub async fn stop_monitoring(&self) -> Result<()> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };
        let _ = session.stop_tx.send(true);

        if let Some(id) = self.services.pending_wakeup.lock().take() {
            self.adapters.scheduler.cancel(&id).await;
        }
        if let Some(watch_id) = session.watch_id {
            self.adapters.location.stop_watch(watch_id).await;
        }

        let _ = session.fg_task.await;
        let _ = session.bg_task.await;
        if let Some(task) = session.location_task {
            let _ = task.await;
        }

        self.services.tracker.persist(&self.services.store).await?;
        self.services.store.clear_background_keys().await?;
        info!("fall detection monitoring stopped");
        Ok(())
    }

    /// Whether a monitoring session is live.
    pub fn is_monitoring(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Resolve a deferred background dwell delivered by the host.
    ///
    /// Works with or without a live session: everything the decision needs
    /// was persisted before the process may have died.
    pub async fn handle_dwell_wakeup(&self, wakeup: DwellWakeup) -> Result<()> {
        if wakeup.kind != DwellWakeup::KIND {
            warn!(kind = %wakeup.kind, "ignoring wakeup with a foreign payload tag");
            return Ok(());
        }
        if self.services.tracker.is_empty() {
            self.services
                .tracker
                .load_persisted(&self.services.store, now_ms())
                .await?;
        }
        // The process may have restarted with a default config; the one that
        // scheduled this wakeup was persisted at monitoring start.
        let config = match self.services.store.load_config::<FdeConfig>().await? {
            Some(persisted) => Arc::new(persisted),
            None => self.config.clone(),
        };
        let contacts = self.services.store.load_contacts().await?;
        let mut fsm = FallStateMachine::new(
            config,
            Context::Background,
            wakeup.user_id.clone(),
            contacts,
            self.services.clone(),
        );
        fsm.handle_dwell_wakeup(&wakeup).await
    }

    /// Send a clearly marked test alert through the server path.
    pub async fn send_test_alert(&self, user_id: &str) -> AlertOutcome {
        self.services.dispatcher.send_test_alert(user_id).await
    }

    /// Subscribe to the engine event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.events.subscribe()
    }

    /// Recorded fall events for a context, oldest first.
    pub async fn recorded_events(&self, context: Context) -> Result<Vec<FallEvent>> {
        self.services.store.load_fall_events(context).await
    }

    /// Most recent admitted location fix.
    pub fn last_known_location(&self) -> Option<LocationPoint> {
        self.services.tracker.last_point()
    }

    /// Admitted location history, oldest first.
    pub fn recent_locations(&self) -> Vec<LocationPoint> {
        self.services.tracker.recent_points()
    }

    /// Reset detection state in both contexts and release any alert lock.
    ///
    /// Idempotent; also cancels a scheduled dwell wakeup if one is pending.
    pub async fn reset_state(&self) -> Result<()> {
        if let Some(id) = self.services.pending_wakeup.lock().take() {
            self.adapters.scheduler.cancel(&id).await;
        }
        let store = &self.services.store;
        store
            .save_state(Context::Foreground, &DetectorState::new())
            .await?;
        store
            .save_state(Context::Background, &DetectorState::new())
            .await?;
        info!("detector state reset");
        Ok(())
    }

    fn spawn_location_feed(
        &self,
        mut subscription: crate::host::LocationSubscription,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = self.services.tracker.clone();
        let store = self.services.store.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    fix = subscription.recv() => {
                        let Some(fix) = fix else { break };
                        if tracker.record(fix) {
                            let _ = tracker.persist(&store).await;
                        }
                    }
                }
            }
        })
    }
}

async fn run_foreground(
    mut fsm: FallStateMachine,
    mut accel: SensorSubscription,
    mut gyro: Option<SensorSubscription>,
    sensors: Arc<dyn SensorSource>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            reading = accel.recv() => {
                let Some(reading) = reading else {
                    warn!("foreground accelerometer stream ended");
                    break;
                };
                let gyro_values = gyro
                    .as_mut()
                    .and_then(|g| g.try_recv_latest())
                    .map(|r| r.values)
                    .unwrap_or_default();
                let sample = SensorSample::new(reading.timestamp_ms, reading.values, gyro_values);
                if let Err(e) = fsm.process_sample(&sample).await {
                    warn!(error = %e, "foreground sample processing failed");
                }
            }
        }
    }
    sensors.unsubscribe(accel.id).await;
    if let Some(gyro) = &gyro {
        sensors.unsubscribe(gyro.id).await;
    }
}

/// The engine's public face: one value per rider, owned by the host
/// application for the lifetime of the monitoring session.
pub struct FallDetectionEngine {
    coordinator: ExecutionCoordinator,
}

impl FallDetectionEngine {
    /// Build an engine over the host adapters.
    pub fn new(config: FdeConfig, adapters: HostAdapters) -> Self {
        Self {
            coordinator: ExecutionCoordinator::new(Arc::new(config), adapters),
        }
    }

    /// Start monitoring; see [`ExecutionCoordinator::start_monitoring`].
    pub async fn start_monitoring(
        &self,
        user_id: &str,
        contacts: Vec<EmergencyContact>,
    ) -> Result<bool> {
        self.coordinator.start_monitoring(user_id, contacts).await
    }

    /// Stop monitoring and release every platform resource.
    pub async fn stop_monitoring(&self) -> Result<()> {
        self.coordinator.stop_monitoring().await
    }

    /// Whether a monitoring session is live.
    pub fn is_monitoring(&self) -> bool {
        self.coordinator.is_monitoring()
    }

    /// Resolve a deferred background dwell delivered by the host.
    pub async fn handle_dwell_wakeup(&self, wakeup: DwellWakeup) -> Result<()> {
        self.coordinator.handle_dwell_wakeup(wakeup).await
    }

    /// Send a clearly marked test alert through the server path.
    pub async fn send_test_alert(&self, user_id: &str) -> AlertOutcome {
        self.coordinator.send_test_alert(user_id).await
    }

    /// Subscribe to the engine event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.coordinator.subscribe_events()
    }

    /// Recorded fall events for a context, oldest first.
    pub async fn recorded_events(&self, context: Context) -> Result<Vec<FallEvent>> {
        self.coordinator.recorded_events(context).await
    }

    /// Most recent admitted location fix.
    pub fn last_known_location(&self) -> Option<LocationPoint> {
        self.coordinator.last_known_location()
    }

    /// Admitted location history, oldest first.
    pub fn recent_locations(&self) -> Vec<LocationPoint> {
        self.coordinator.recent_locations()
    }

    /// Reset detection state in both contexts and release any alert lock.
    pub async fn reset_state(&self) -> Result<()> {
        self.coordinator.reset_state().await
    }

    /// The engine configuration.
    pub fn config(&self) -> &FdeConfig {
        &self.coordinator.config
    }
}
