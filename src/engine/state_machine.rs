//! Two-phase fall state machine.
//!
//! Escalated impact candidates pass through the pre-fall gate (was the rider
//! actually moving before the impact?) and, if admitted, a post-fall dwell
//! (did the rider recover afterwards?). Only a candidate that survives both
//! phases becomes a dispatched emergency alert.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::detection::{
    Assessment, Escalation, ImpactDetector, VelocityEstimator, VelocityEstimatorConfig,
};
use crate::domain::{
    DetectorState, EmergencyContact, EngineEvent, FallEvent, PendingFall, RejectionReason,
    SensorSample,
};
use crate::host::{DwellWakeup, LocalNotification};
use crate::storage::Context;
use crate::{FdeConfig, Result};

use super::EngineServices;

/// Per-context fall state machine.
///
/// One instance exists per execution context; instances never share memory
/// and observe each other only through the persisted [`DetectorState`]. The
/// `has_pending_alert` flag is flipped and persisted before any dispatch I/O
/// starts, so a crash mid-dispatch can never produce a second alert for the
/// same fall.
pub struct FallStateMachine {
    config: Arc<FdeConfig>,
    context: Context,
    user_id: String,
    contacts: Vec<EmergencyContact>,
    detector: ImpactDetector,
    velocity: VelocityEstimator,
    state: DetectorState,
    services: EngineServices,
    stop: Option<watch::Receiver<bool>>,
}

impl FallStateMachine {
    pub(crate) fn new(
        config: Arc<FdeConfig>,
        context: Context,
        user_id: impl Into<String>,
        contacts: Vec<EmergencyContact>,
        services: EngineServices,
    ) -> Self {
        let step_ms = match context {
            Context::Foreground => config.sensor_interval_fg_ms,
            Context::Background => config.sensor_interval_bg_ms,
        };
        let detector = ImpactDetector::new(config.impact_config());
        Self {
            config,
            context,
            user_id: user_id.into(),
            contacts,
            detector,
            velocity: VelocityEstimator::new(VelocityEstimatorConfig {
                default_step_ms: step_ms,
            }),
            state: DetectorState::new(),
            services,
            stop: None,
        }
    }

    /// Attach the session stop signal; a foreground dwell in flight is
    /// abandoned when it flips.
    pub(crate) fn set_stop_signal(&mut self, stop: watch::Receiver<bool>) {
        self.stop = Some(stop);
    }

    /// Resume from the persisted state for this context.
    pub async fn restore(&mut self) -> Result<()> {
        self.state = self.services.store.load_state(self.context).await?;
        self.velocity.restore(self.state.current_velocity_mps);
        Ok(())
    }

    /// Current detector state.
    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    /// Execution context this machine runs in.
    pub fn context(&self) -> Context {
        self.context
    }

    /// Feed one fused sensor sample through detection and, when a candidate
    /// escalates, through the gate and dwell phases.
    ///
    /// In the foreground this call blocks for the whole dwell window when a
    /// fall is being validated (a session stop terminates the dwell early);
    /// the caller's sample backlog is absorbed by the subscription channel
    /// and drained afterwards.
    pub async fn process_sample(&mut self, sample: &SensorSample) -> Result<()> {
        self.velocity.update(sample);
        self.state.current_velocity_mps = self.velocity.speed();
        self.state.last_accel = sample.accel;

        if self.state.is_monitoring_post_fall {
            // A dwell is in flight for this context. Another party (the
            // wakeup handler, or a stop) may have resolved it; observe that
            // only through the store.
            if let Ok(persisted) = self.services.store.load_state(self.context).await {
                self.state = persisted;
                self.velocity.restore(self.state.current_velocity_mps);
            }
            if self.state.is_monitoring_post_fall {
                return self.recover_stale_dwell(sample.timestamp_ms).await;
            }
        }

        let had_candidate = self.state.potential_fall_start_ms.is_some();
        let assessment = self
            .detector
            .assess(sample, self.velocity.speed(), &mut self.state);

        match assessment {
            Assessment::Stable => {
                if had_candidate {
                    self.persist().await;
                }
            }
            Assessment::Triggered(_) => {
                if !had_candidate {
                    self.emit(EngineEvent::CandidateStarted {
                        timestamp_ms: sample.timestamp_ms,
                        gravity_deviation: sample.gravity_deviation(),
                    });
                    self.persist().await;
                }
            }
            Assessment::Escalated { cause, .. } => {
                self.handle_escalation(sample, cause).await?;
            }
        }
        Ok(())
    }

    /// Resolve a deferred background dwell.
    ///
    /// Movement evidence was accumulated passively while the process slept;
    /// the decision is made over the persisted location history alone. A
    /// wakeup arriving after the alert was already resolved is a no-op.
    pub async fn handle_dwell_wakeup(&mut self, wakeup: &DwellWakeup) -> Result<()> {
        self.state = self.services.store.load_state(self.context).await?;
        if !self.state.has_pending_alert {
            debug!("dwell wakeup without a pending alert, ignoring");
            return Ok(());
        }
        *self.services.pending_wakeup.lock() = None;

        let base = self.config.pre_fall_distance_m;
        let dwell_ms = self.config.post_fall_dwell_ms;
        let end_ms = wakeup.fall_timestamp_ms + dwell_ms;
        let window = self.services.tracker.movement_window(base, dwell_ms, end_ms);

        if window.is_moving {
            let threshold = self
                .services
                .tracker
                .adaptive_threshold_m(base, dwell_ms, end_ms);
            self.dismiss(end_ms, window.total_distance_m, threshold).await
        } else {
            self.confirm(
                wakeup.fall_timestamp_ms,
                wakeup.magnitude,
                wakeup.rotational_magnitude,
                end_ms,
            )
            .await
        }
    }

    /// Clear all pending detection state and start the reset quarantine.
    pub async fn reset(&mut self, now_ms: u64) {
        self.state.reset(now_ms);
        self.velocity.reset();
        self.persist().await;
    }

    /// Resolve a dwell whose owner is gone.
    ///
    /// A foreground dwell dies with its process; a background dwell depends
    /// on a host wakeup that may never fire. Once the dwell window plus the
    /// context's recovery timeout has elapsed with the lock still held, the
    /// decision is made here over the passive location history.
    async fn recover_stale_dwell(&mut self, now_ms: u64) -> Result<()> {
        let Some(pending) = self.state.pending_fall else {
            return Ok(());
        };
        let grace_ms = match self.context {
            Context::Foreground => self.config.recovery_timeout_fg_ms,
            Context::Background => self.config.recovery_timeout_bg_ms,
        };
        let dwell_ms = self.config.post_fall_dwell_ms;
        if now_ms <= pending.fall_ms + dwell_ms + grace_ms {
            return Ok(());
        }
        warn!(
            fall_ms = pending.fall_ms,
            "dwell resolution overdue, recovering from passive history"
        );
        *self.services.pending_wakeup.lock() = None;

        let base = self.config.pre_fall_distance_m;
        let end_ms = pending.fall_ms + dwell_ms;
        let window = self.services.tracker.movement_window(base, dwell_ms, end_ms);
        if window.is_moving {
            let threshold = self
                .services
                .tracker
                .adaptive_threshold_m(base, dwell_ms, end_ms);
            self.dismiss(end_ms, window.total_distance_m, threshold).await
        } else {
            self.confirm(
                pending.fall_ms,
                pending.magnitude,
                pending.rotational_magnitude,
                end_ms,
            )
            .await
        }
    }

    async fn handle_escalation(&mut self, sample: &SensorSample, cause: Escalation) -> Result<()> {
        let now_ms = sample.timestamp_ms;

        if self.state.in_quarantine(now_ms, self.config.reset_quarantine_ms) {
            debug!(timestamp_ms = now_ms, "escalation inside reset quarantine");
            self.emit(EngineEvent::GateRejected {
                timestamp_ms: now_ms,
                reason: RejectionReason::ResetQuarantine,
            });
            self.persist().await;
            return Ok(());
        }

        let other = match self.context {
            Context::Foreground => Context::Background,
            Context::Background => Context::Foreground,
        };
        let other_pending = self
            .services
            .store
            .load_state(other)
            .await
            .map(|s| s.has_pending_alert)
            .unwrap_or(false);
        if self.state.has_pending_alert || other_pending {
            debug!(timestamp_ms = now_ms, "escalation while an alert is pending");
            self.emit(EngineEvent::GateRejected {
                timestamp_ms: now_ms,
                reason: RejectionReason::AlertAlreadyPending,
            });
            return Ok(());
        }

        let moving_before = self.services.tracker.was_moving_distance(
            self.config.pre_fall_distance_m,
            self.config.pre_fall_window_ms,
            now_ms,
        );
        if !moving_before {
            info!(
                timestamp_ms = now_ms,
                "impact without pre-fall movement, treating as dropped device"
            );
            self.emit(EngineEvent::GateRejected {
                timestamp_ms: now_ms,
                reason: RejectionReason::NoPreFallMovement,
            });
            self.persist().await;
            return Ok(());
        }

        let magnitude = sample.accel_magnitude();
        let rotational = sample.gyro_magnitude();

        // Take the alert lock and make it durable before any dispatch I/O.
        // The escalation snapshot travels with it so a lost dwell can be
        // recovered from the store alone.
        self.state.has_pending_alert = true;
        self.state.is_monitoring_post_fall = true;
        self.state.pending_fall = Some(PendingFall {
            fall_ms: now_ms,
            magnitude,
            rotational_magnitude: rotational,
        });
        if let Err(e) = self.services.store.save_state(self.context, &self.state).await {
            warn!(error = %e, "failed to persist the alert lock");
        }
        info!(
            timestamp_ms = now_ms,
            magnitude, rotational, ?cause, "potential fall escalated, validating"
        );
        self.emit(EngineEvent::Escalated {
            timestamp_ms: now_ms,
            magnitude,
            severe_immediate: cause == Escalation::SevereImmediate,
        });

        match self.context {
            Context::Foreground => self.run_dwell(now_ms, magnitude, rotational).await,
            Context::Background => self.schedule_dwell(now_ms, magnitude, rotational).await,
        }
    }

    /// Foreground dwell: actively poll location for the whole window.
    ///
    /// A stop request terminates the dwell early: the lock is released and
    /// nothing is dispatched.
    async fn run_dwell(&mut self, fall_ms: u64, magnitude: f64, rotational: f64) -> Result<()> {
        let base = self.config.pre_fall_distance_m;
        let dwell_ms = self.config.post_fall_dwell_ms;

        let tracker = self.services.tracker.clone();
        let location = self.services.location.clone();
        let mut stop = self.stop.clone();
        let outcome = {
            let monitor = tracker.monitor_movement_for(base, dwell_ms, location.as_ref());
            tokio::pin!(monitor);
            match stop.as_mut() {
                Some(stop) => tokio::select! {
                    result = &mut monitor => Some(result),
                    _ = stop_requested(stop) => None,
                },
                None => Some(monitor.await),
            }
        };

        let Some(result) = outcome else {
            info!("monitoring stopped during the dwell, abandoning the alert");
            self.reset(fall_ms).await;
            return Ok(());
        };

        match result {
            Ok(window) => {
                let end_ms = window
                    .points
                    .last()
                    .map(|p| p.timestamp_ms)
                    .unwrap_or(fall_ms + dwell_ms);
                if window.is_moving {
                    let threshold = self
                        .services
                        .tracker
                        .adaptive_threshold_m(base, dwell_ms, end_ms);
                    self.dismiss(end_ms, window.total_distance_m, threshold).await
                } else {
                    self.confirm(fall_ms, magnitude, rotational, end_ms).await
                }
            }
            Err(e) => {
                // No movement evidence at all: fail safe and alert.
                warn!(error = %e, "dwell produced no location evidence, confirming");
                self.confirm(fall_ms, magnitude, rotational, fall_ms + dwell_ms)
                    .await
            }
        }
    }

    /// Background dwell: hand the wait to the host wakeup scheduler.
    async fn schedule_dwell(&mut self, fall_ms: u64, magnitude: f64, rotational: f64) -> Result<()> {
        let wakeup = DwellWakeup::new(self.user_id.clone(), fall_ms, magnitude, rotational);
        match self
            .services
            .scheduler
            .schedule_wakeup(wakeup, self.config.post_fall_dwell_ms)
            .await
        {
            Ok(id) => {
                debug!(id, fall_ms, "post-fall dwell wakeup scheduled");
                *self.services.pending_wakeup.lock() = Some(id);
                Ok(())
            }
            Err(e) => {
                // Without a wakeup there is nobody to resolve the dwell
                // later; fail safe and alert now.
                warn!(error = %e, "wakeup scheduling failed, confirming immediately");
                self.confirm(fall_ms, magnitude, rotational, fall_ms + self.config.post_fall_dwell_ms)
                    .await
            }
        }
    }

    async fn confirm(
        &mut self,
        fall_ms: u64,
        magnitude: f64,
        rotational: f64,
        end_ms: u64,
    ) -> Result<()> {
        let location = match self.services.location.current_position().await {
            Ok(fix) => {
                self.services.tracker.record(fix);
                Some(fix)
            }
            Err(e) => {
                debug!(error = %e, "no live fix at confirmation, using last known");
                self.services.tracker.last_point()
            }
        };

        let event = FallEvent::new(
            fall_ms,
            magnitude,
            rotational,
            location,
            self.context == Context::Background,
        );
        info!(
            event_id = %event.id,
            magnitude,
            has_location = location.is_some(),
            "fall confirmed, dispatching emergency alert"
        );
        self.emit(EngineEvent::FallConfirmed {
            event_id: event.id.clone(),
            timestamp_ms: fall_ms,
            location,
        });

        let outcome = self
            .services
            .dispatcher
            .dispatch(&event, &self.user_id, &self.contacts)
            .await;

        let recorded = if outcome.success {
            event.clone().with_alert_sent()
        } else {
            event.clone()
        };
        if let Err(e) = self
            .services
            .store
            .append_fall_event(self.context, &recorded)
            .await
        {
            warn!(error = %e, "failed to record the fall event");
        }

        self.emit(EngineEvent::AlertDispatched {
            event_id: event.id.clone(),
            timestamp_ms: end_ms,
            success: outcome.success,
            sent_count: outcome.sent_count,
        });

        let notification = if outcome.success {
            LocalNotification {
                title: "Emergency alert sent".to_string(),
                body: format!("{} contact(s) notified", outcome.sent_count),
                sound: true,
            }
        } else {
            LocalNotification {
                title: "Emergency alert failed".to_string(),
                body: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "delivery failed".to_string()),
                sound: true,
            }
        };
        if let Err(e) = self.services.notifications.schedule(notification).await {
            warn!(error = %e, "failed to surface the outcome notification");
        }

        self.reset(end_ms).await;
        Ok(())
    }

    async fn dismiss(&mut self, end_ms: u64, movement_m: f64, threshold_m: f64) -> Result<()> {
        info!(
            movement_m,
            threshold_m, "recovery movement during dwell, dismissing alert"
        );
        self.emit(EngineEvent::DwellDismissed {
            timestamp_ms: end_ms,
            movement_m,
            threshold_m,
        });

        let notification = LocalNotification {
            title: "Fall alert dismissed".to_string(),
            body: "Recovery movement detected".to_string(),
            sound: false,
        };
        if let Err(e) = self.services.notifications.schedule(notification).await {
            warn!(error = %e, "failed to surface the dismissal notification");
        }

        self.reset(end_ms).await;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.services.store.save_state(self.context, &self.state).await {
            warn!(error = %e, "failed to persist detector state");
        }
    }

    fn emit(&self, event: EngineEvent) {
        debug!(
            event = event.event_type(),
            timestamp_ms = event.timestamp_ms(),
            "engine event"
        );
        let _ = self.services.events.send(event);
    }
}

/// Resolves when the stop flag flips. A dropped sender means the session is
/// being torn down and counts as a stop.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
