use chrono::{DateTime, Local};
use std::fmt;
use tracing::{error, info, warn};

use super::topics::DeviceTopics;
use crate::bridge::{BridgeCommand, CommandSink};

/// A setting received from the broker, bound for the local bridge
#[derive(Clone, Debug, PartialEq)]
pub struct SettingChange {
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl SettingChange {
    /// `None` when the topic is not a setting of this device
    pub fn from_message(topics: &DeviceTopics, topic: &str, payload: &[u8]) -> Option<Self> {
        let key = topics.setting_key(topic)?;
        Some(Self {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            received_at: Local::now(),
        })
    }

    pub fn to_command(&self) -> BridgeCommand {
        BridgeCommand::Put {
            key: self.key.clone(),
            value: self.payload.clone(),
        }
    }
}

impl fmt::Display for SettingChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} setting: {}, {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload
        )
    }
}

/// Turns inbound setting messages into `put` commands on the local bridge.
/// Forwarding is fire-and-forget: failures are logged and never retried.
pub struct SettingsForwarder<S> {
    topics: DeviceTopics,
    sink: S,
}

impl<S: CommandSink> SettingsForwarder<S> {
    pub fn new(topics: DeviceTopics, sink: S) -> Self {
        Self { topics, sink }
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    /// Returns whether a command reached the bridge
    pub async fn forward(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(change) = SettingChange::from_message(&self.topics, topic, payload) else {
            warn!("Ignoring message on unexpected topic {}", topic);
            return false;
        };

        info!("{}", change);
        match self.sink.send(&change.to_command()).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to forward setting {} to bridge: {}", change.key, e);
                false
            }
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
