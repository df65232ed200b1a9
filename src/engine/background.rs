//! Low-rate background sampling loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::SensorSample;
use crate::host::{SensorKind, SensorSource, SensorSubscription};
use crate::storage::StateStore;
use crate::{FdeConfig, FdeError, Result};

use super::state_machine::FallStateMachine;

/// Drives detection while the application is backgrounded.
///
/// Each tick pulls one accelerometer reading under a short watchdog, fuses
/// the latest buffered gyroscope reading, appends the sample to the durable
/// sensor ring, and runs it through the same state machine logic as the
/// foreground. A tick whose reading does not arrive in time is abandoned;
/// the loop itself never blocks on a stalled sensor.
pub struct BackgroundSampler {
    config: Arc<FdeConfig>,
    sensors: Arc<dyn SensorSource>,
    store: StateStore,
    fsm: FallStateMachine,
}

impl BackgroundSampler {
    pub(crate) fn new(
        config: Arc<FdeConfig>,
        sensors: Arc<dyn SensorSource>,
        store: StateStore,
        fsm: FallStateMachine,
    ) -> Self {
        Self {
            config,
            sensors,
            store,
            fsm,
        }
    }

    /// Run the sampling loop until `stop` flips to `true` or the sensor
    /// stream ends.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let cadence = self.config.sensor_interval_bg_ms;
        let mut accel = self
            .sensors
            .subscribe(SensorKind::Accelerometer, cadence)
            .await?;
        let mut gyro = match self.sensors.subscribe(SensorKind::Gyroscope, cadence).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(error = %e, "background gyroscope unavailable, proceeding without");
                None
            }
        };

        self.fsm.restore().await?;
        info!(cadence_ms = cadence, "background sampling started");

        let mut ticker = interval(Duration::from_millis(cadence));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break Ok(());
                    }
                }
                _ = ticker.tick() => {
                    match self.tick(&mut accel, gyro.as_mut()).await {
                        TickOutcome::Continue => {}
                        TickOutcome::StreamEnded => {
                            break Err(FdeError::SensorUnavailable(
                                "background accelerometer stream ended".to_string(),
                            ));
                        }
                    }
                }
            }
        };

        self.sensors.unsubscribe(accel.id).await;
        if let Some(gyro) = &gyro {
            self.sensors.unsubscribe(gyro.id).await;
        }
        info!("background sampling stopped");
        result
    }

    async fn tick(
        &mut self,
        accel: &mut SensorSubscription,
        gyro: Option<&mut SensorSubscription>,
    ) -> TickOutcome {
        let watchdog = Duration::from_millis(self.config.sample_watchdog_ms);
        let reading = match timeout(watchdog, accel.recv()).await {
            Ok(Some(reading)) => reading,
            Ok(None) => return TickOutcome::StreamEnded,
            Err(_) => {
                debug!("accelerometer reading missed the watchdog, abandoning tick");
                return TickOutcome::Continue;
            }
        };

        let gyro_values = gyro
            .and_then(|g| g.try_recv_latest())
            .map(|r| r.values)
            .unwrap_or_default();
        let sample = SensorSample::new(reading.timestamp_ms, reading.values, gyro_values);

        if let Err(e) = self.store.append_sensor_sample(&sample).await {
            warn!(error = %e, "failed to append to the background sensor ring");
        }
        if let Err(e) = self.fsm.process_sample(&sample).await {
            warn!(error = %e, "background sample processing failed");
        }
        TickOutcome::Continue
    }
}

enum TickOutcome {
    Continue,
    StreamEnded,
}
