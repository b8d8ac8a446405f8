//! Broker session settings
//!
//! Host, port and keep-alive address the broker. The remaining fields tune the
//! supervisor's reconnect backoff and the publisher's pacing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker session settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Defaults to `climaduino-<hostname>` when unset
    pub client_id: Option<String>,
    /// Fixed wait between reconnect attempts after an unexpected drop
    pub reconnect_backoff_secs: u64,
    /// Minimum gap between two publishes derived from one snapshot
    pub publish_spacing_ms: u64,
    /// Capacity of the client's outgoing request queue
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".into(),
            port: 1883,
            keep_alive_secs: 60,
            client_id: None,
            reconnect_backoff_secs: 30,
            publish_spacing_ms: 100,
            request_capacity: 64,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn publish_spacing(&self) -> Duration {
        Duration::from_millis(self.publish_spacing_ms)
    }
}
