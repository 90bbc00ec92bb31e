use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SendError;
use crate::store::{keys, Kv, KvSerde};

/// Device id reported when the environment cannot supply one.
pub const UNKNOWN_DEVICE: &str = "unknown_device";

/// Heartbeat payload; built fresh for every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    /// Opaque, stable device identifier.
    pub device_id: String,
}

impl PingMessage {
    /// Build a message; an empty id becomes [`UNKNOWN_DEVICE`].
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Self { device_id: UNKNOWN_DEVICE.to_string() };
        }
        Self { device_id }
    }
}

/// Result of a single send.
pub type SendResult = Result<(), SendError>;

/// Transport that delivers a [`PingMessage`] to the server.
///
/// Request timeouts belong to the implementation; a timed-out call should
/// resolve to [`SendError::Recoverable`].
#[async_trait]
pub trait Sender: Send + Sync {
    /// Deliver one message.
    async fn send(&self, message: &PingMessage) -> SendResult;
}

/// Source of the device identifier.
pub trait DeviceIdProvider: Send + Sync {
    /// Current device id, possibly [`UNKNOWN_DEVICE`].
    fn device_id(&self) -> String;
}

/// Provider returning a configured id.
#[derive(Debug, Clone)]
pub struct FixedDeviceId(pub String);

impl DeviceIdProvider for FixedDeviceId {
    fn device_id(&self) -> String {
        self.0.clone()
    }
}

/// Provider that generates an id once and keeps it in KV.
#[derive(Clone)]
pub struct KvDeviceId<K: Kv> {
    kv: K,
}

impl<K: Kv> KvDeviceId<K> {
    /// Wrap a KV store.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    fn load_or_create(&self) -> anyhow::Result<String> {
        if let Some(id) = self.kv.get_t::<String>(&keys::device_id())? {
            return Ok(id);
        }
        let id = ulid::Ulid::new().to_string().to_lowercase();
        self.kv.put_t(&keys::device_id(), &id)?;
        Ok(id)
    }
}

impl<K: Kv> DeviceIdProvider for KvDeviceId<K> {
    fn device_id(&self) -> String {
        match self.load_or_create() {
            Ok(id) => id,
            Err(e) => {
                warn!("device id unavailable, using {UNKNOWN_DEVICE}: {e:#}");
                UNKNOWN_DEVICE.to_string()
            }
        }
    }
}
