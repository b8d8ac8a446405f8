//! Delta publishing
//!
//! Each changed reading goes out as its own message: topic is the reading key,
//! payload its value with booleans coerced to `1`/`0`. Publishes from one
//! snapshot are issued one at a time and followed by a fixed pause. The broker
//! client drops messages when they are queued back to back, so the pause is a
//! delivery requirement and must stay even when it looks idle.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::MqttError;
use crate::readings::Reading;

/// Outgoing half of a broker session
#[async_trait]
pub trait MqttPublish: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), MqttError>;
}

/// Requests are only enqueued here; the supervisor's event loop puts them on
/// the wire. A full request queue fails the publish instead of blocking the
/// pass while the broker is unreachable.
#[async_trait]
impl MqttPublish for AsyncClient {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), MqttError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(MqttError::from)
    }
}

/// Outcome of one publish pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
}

pub struct ReadingsPublisher<P> {
    client: P,
    spacing: Duration,
}

impl<P: MqttPublish> ReadingsPublisher<P> {
    pub fn new(client: P, spacing: Duration) -> Self {
        Self { client, spacing }
    }

    /// Publishes every change in order, pausing `spacing` after each one.
    /// A failed publish is logged and skipped; the pass continues.
    pub async fn publish_changes(&self, changes: &[Reading]) -> PublishReport {
        let mut report = PublishReport::default();

        for reading in changes {
            info!("changed: {}", reading);
            match self
                .client
                .publish(&reading.key, reading.value.to_payload())
                .await
            {
                Ok(()) => report.published += 1,
                Err(e) => {
                    warn!("Failed to publish {}: {}", reading.key, e);
                    report.failed += 1;
                }
            }
            tokio::time::sleep(self.spacing).await;
        }

        debug!(
            "Publish pass finished: {} published, {} failed",
            report.published, report.failed
        );
        report
    }

    pub fn client(&self) -> &P {
        &self.client
    }
}
