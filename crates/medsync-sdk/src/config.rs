//! Client configuration.
//!
//! Every section deserializes with defaults, so a partial JSON document is a
//! valid configuration.

use crate::error::{Result, SyncError};
use crate::remote::RemoteSettings;
use crate::sync::SyncConfig;
use medsync_cache::CacheConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection Coordinator timings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound on waiting for the remote auth subsystem during init.
    pub auth_wait_ms: u64,
    /// Period of the background connectivity monitor.
    pub monitor_interval_ms: u64,
    /// The monitor only probes when the last probe is older than this.
    pub probe_staleness_ms: u64,
    pub probe_timeout_ms: u64,
    /// Upper bound on building a remote client.
    pub connect_timeout_ms: u64,
    /// Cheap collection read by the connectivity probe.
    pub probe_collection: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auth_wait_ms: 2_000,
            monitor_interval_ms: 60_000,
            probe_staleness_ms: 60_000,
            probe_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            probe_collection: "health".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn auth_wait(&self) -> Duration {
        Duration::from_millis(self.auth_wait_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn probe_staleness(&self) -> Duration {
        Duration::from_millis(self.probe_staleness_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Resolution Escalator bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalatorConfig {
    /// Attempts per failure episode before the terminal notification.
    pub max_attempts: u32,
    /// Timeout for one strategy application plus re-probe.
    pub attempt_timeout_ms: u64,
    /// Identical errors within this window are dropped.
    pub dedup_window_ms: u64,
    /// How often a queued caller checks whether the in-flight resolution ended.
    pub queue_poll_ms: u64,
    /// How long a queued caller waits overall.
    pub queue_timeout_ms: u64,
}

impl Default for EscalatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 15_000,
            dedup_window_ms: 3_000,
            queue_poll_ms: 500,
            queue_timeout_ms: 10_000,
        }
    }
}

impl EscalatorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Configuration for the MedSync client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub remote: RemoteSettings,
    pub coordinator: CoordinatorConfig,
    pub escalator: EscalatorConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

impl ClientConfig {
    /// Parse a (possibly partial) JSON configuration.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.remote.app_name = name.into();
        self
    }

    pub fn remote(mut self, settings: RemoteSettings) -> Self {
        self.config.remote = settings;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.cache.namespace = namespace.into();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.escalator.max_attempts = attempts;
        self
    }

    pub fn monitor_interval(mut self, ms: u64) -> Self {
        self.config.coordinator.monitor_interval_ms = ms;
        self
    }

    pub fn probe_timeout(mut self, ms: u64) -> Self {
        self.config.coordinator.probe_timeout_ms = ms;
        self
    }

    pub fn attempt_timeout(mut self, ms: u64) -> Self {
        self.config.escalator.attempt_timeout_ms = ms;
        self
    }

    pub fn dedup_window(mut self, ms: u64) -> Self {
        self.config.escalator.dedup_window_ms = ms;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TransportMode;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.coordinator.auth_wait(), Duration::from_secs(2));
        assert_eq!(config.coordinator.monitor_interval(), Duration::from_secs(60));
        assert_eq!(config.escalator.attempt_timeout(), Duration::from_secs(15));
        assert_eq!(config.escalator.dedup_window(), Duration::from_secs(3));
        assert_eq!(config.escalator.queue_poll(), Duration::from_millis(500));
        assert_eq!(config.escalator.queue_timeout(), Duration::from_secs(10));
        assert_eq!(config.escalator.max_attempts, 3);
        assert_eq!(config.cache.min_retained_attachments, 5);
    }

    #[test]
    fn test_partial_json() {
        let config = ClientConfig::from_json(
            r#"{
                "remote": { "transport": "long_polling", "emulator_ports": [9000] },
                "escalator": { "max_attempts": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.remote.transport, TransportMode::LongPolling);
        assert_eq!(config.remote.emulator_ports, vec![9000]);
        assert_eq!(config.remote.app_name, "medsync");
        assert_eq!(config.escalator.max_attempts, 5);
        assert_eq!(config.escalator.dedup_window_ms, 3_000);
    }

    #[test]
    fn test_bad_json_is_serialization_error() {
        assert!(matches!(
            ClientConfig::from_json("{ nope"),
            Err(SyncError::Serialization(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = ClientConfigBuilder::new()
            .app_name("clinic")
            .namespace("clinic")
            .max_attempts(5)
            .attempt_timeout(1_000)
            .build();

        assert_eq!(config.remote.app_name, "clinic");
        assert_eq!(config.cache.namespace, "clinic");
        assert_eq!(config.escalator.max_attempts, 5);
        assert_eq!(config.escalator.attempt_timeout_ms, 1_000);
    }
}
