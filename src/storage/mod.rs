//! Persistence layer: durable key → JSON blob storage.
//!
//! All writes are whole-blob replacements; there are no partial-update
//! transactions. Concurrency between the foreground and background contexts
//! is resolved by the coordinator's single-owner alerting rule, not here.
//! Readers tolerate missing keys by falling back to defaults.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::domain::{DetectorState, EmergencyContact, FallEvent, LocationPoint, SensorSample};
use crate::FdeError;

pub use memory::MemoryKeyValueStore;

/// Execution context a state blob belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// High-rate foreground loop.
    Foreground,
    /// Low-rate background loop.
    Background,
}

impl Context {
    fn key_suffix(&self) -> &'static str {
        match self {
            Context::Foreground => "fg",
            Context::Background => "bg",
        }
    }
}

/// Durable key → blob store provided by the host (`kv.*` contract).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a blob.
    async fn get(&self, key: &str) -> Result<Option<String>, FdeError>;
    /// Replace a blob.
    async fn set(&self, key: &str, blob: &str) -> Result<(), FdeError>;
    /// Remove a key.
    async fn remove(&self, key: &str) -> Result<(), FdeError>;
    /// List keys under a prefix.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, FdeError>;
}

/// Key for the config blob.
pub const KEY_CONFIG: &str = "fde/config";
/// Key prefix for per-context detector state.
pub const KEY_STATE_PREFIX: &str = "fde/state/";
/// Key for the background sensor-history ring.
pub const KEY_SENSORS_BG: &str = "fde/sensors/bg";
/// Key for the persisted location ring.
pub const KEY_LOCATIONS: &str = "fde/locations";
/// Key prefix for per-context fall-event rings.
pub const KEY_EVENTS_PREFIX: &str = "fde/events/";
/// Key for the current user id used by background wakeups.
pub const KEY_USER: &str = "fde/user";
/// Key for the emergency contact list used by background wakeups.
pub const KEY_CONTACTS: &str = "fde/contacts";

/// Retention cap for the background sensor ring.
pub const SENSOR_RING_CAP: usize = 50;
/// Retention cap for persisted locations.
pub const LOCATION_RING_CAP: usize = 50;
/// Persisted locations older than this are discarded on load.
pub const LOCATION_MAX_AGE_MS: u64 = 3_600_000;
/// Retention cap for the background fall-event ring.
pub const EVENT_RING_CAP_BG: usize = 10;
/// Retention cap for the foreground fall-event ring.
pub const EVENT_RING_CAP_FG: usize = 20;

/// Typed view over the host key-value store with the engine's namespaces.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KeyValueStore>,
}

impl StateStore {
    /// Wrap a host store.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FdeError> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(blob) => match serde_json::from_str(&blob) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // A corrupt blob degrades to defaults rather than wedging
                    // monitoring.
                    warn!(key, error = %e, "discarding unreadable persisted blob");
                    Ok(None)
                }
            },
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), FdeError> {
        let blob = serde_json::to_string(value)
            .map_err(|e| FdeError::Storage(format!("serialize {key}: {e}")))?;
        self.kv.set(key, &blob).await
    }

    /// Load detector state for a context, defaulting when absent.
    pub async fn load_state(&self, context: Context) -> Result<DetectorState, FdeError> {
        let key = format!("{KEY_STATE_PREFIX}{}", context.key_suffix());
        Ok(self.read_json(&key).await?.unwrap_or_default())
    }

    /// Persist detector state for a context.
    pub async fn save_state(
        &self,
        context: Context,
        state: &DetectorState,
    ) -> Result<(), FdeError> {
        let key = format!("{KEY_STATE_PREFIX}{}", context.key_suffix());
        self.write_json(&key, state).await
    }

    /// Remove a context's detector state.
    pub async fn clear_state(&self, context: Context) -> Result<(), FdeError> {
        let key = format!("{KEY_STATE_PREFIX}{}", context.key_suffix());
        self.kv.remove(&key).await
    }

    /// Append a sample to the background sensor ring, enforcing the cap.
    pub async fn append_sensor_sample(&self, sample: &SensorSample) -> Result<(), FdeError> {
        let mut ring: Vec<SensorSample> =
            self.read_json(KEY_SENSORS_BG).await?.unwrap_or_default();
        ring.push(*sample);
        if ring.len() > SENSOR_RING_CAP {
            let excess = ring.len() - SENSOR_RING_CAP;
            ring.drain(0..excess);
        }
        self.write_json(KEY_SENSORS_BG, &ring).await
    }

    /// Load the background sensor ring, oldest first.
    pub async fn load_sensor_history(&self) -> Result<Vec<SensorSample>, FdeError> {
        Ok(self.read_json(KEY_SENSORS_BG).await?.unwrap_or_default())
    }

    /// Load the persisted location ring, pruning entries older than one hour
    /// relative to `now_ms`.
    pub async fn load_locations(&self, now_ms: u64) -> Result<Vec<LocationPoint>, FdeError> {
        let ring: Vec<LocationPoint> = self.read_json(KEY_LOCATIONS).await?.unwrap_or_default();
        Ok(ring
            .into_iter()
            .filter(|p| now_ms.saturating_sub(p.timestamp_ms) <= LOCATION_MAX_AGE_MS)
            .collect())
    }

    /// Replace the persisted location ring, keeping the newest entries.
    pub async fn save_locations(&self, points: &[LocationPoint]) -> Result<(), FdeError> {
        let start = points.len().saturating_sub(LOCATION_RING_CAP);
        self.write_json(KEY_LOCATIONS, &points[start..]).await
    }

    /// Append a fall event to a context's ring, enforcing that ring's cap.
    pub async fn append_fall_event(
        &self,
        context: Context,
        event: &FallEvent,
    ) -> Result<(), FdeError> {
        let key = format!("{KEY_EVENTS_PREFIX}{}", context.key_suffix());
        let cap = match context {
            Context::Foreground => EVENT_RING_CAP_FG,
            Context::Background => EVENT_RING_CAP_BG,
        };
        let mut ring: Vec<FallEvent> = self.read_json(&key).await?.unwrap_or_default();
        ring.push(event.clone());
        if ring.len() > cap {
            let excess = ring.len() - cap;
            ring.drain(0..excess);
        }
        self.write_json(&key, &ring).await
    }

    /// Load a context's recorded fall events, oldest first.
    pub async fn load_fall_events(&self, context: Context) -> Result<Vec<FallEvent>, FdeError> {
        let key = format!("{KEY_EVENTS_PREFIX}{}", context.key_suffix());
        Ok(self.read_json(&key).await?.unwrap_or_default())
    }

    /// Persist the user id for background wakeups.
    pub async fn save_user(&self, user_id: &str) -> Result<(), FdeError> {
        self.kv.set(KEY_USER, user_id).await
    }

    /// Load the persisted user id.
    pub async fn load_user(&self) -> Result<Option<String>, FdeError> {
        self.kv.get(KEY_USER).await
    }

    /// Persist the contact list so deferred wakeups can dispatch after a
    /// process restart.
    pub async fn save_contacts(&self, contacts: &[EmergencyContact]) -> Result<(), FdeError> {
        self.write_json(KEY_CONTACTS, &contacts).await
    }

    /// Load the persisted contact list.
    pub async fn load_contacts(&self) -> Result<Vec<EmergencyContact>, FdeError> {
        Ok(self.read_json(KEY_CONTACTS).await?.unwrap_or_default())
    }

    /// Load the persisted config blob, if present.
    pub async fn load_config<T: DeserializeOwned>(&self) -> Result<Option<T>, FdeError> {
        self.read_json(KEY_CONFIG).await
    }

    /// Atomically replace the config blob.
    pub async fn save_config<T: Serialize>(&self, config: &T) -> Result<(), FdeError> {
        self.write_json(KEY_CONFIG, config).await
    }

    /// Clear background-specific keys on stop.
    pub async fn clear_background_keys(&self) -> Result<(), FdeError> {
        self.kv.remove(KEY_SENSORS_BG).await?;
        self.kv
            .remove(&format!("{KEY_STATE_PREFIX}bg"))
            .await?;
        self.kv.remove(KEY_USER).await?;
        self.kv.remove(KEY_CONTACTS).await
    }
}
