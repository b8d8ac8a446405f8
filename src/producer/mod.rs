//! Readings forwarder
//!
//! One-shot collector run next to the bridge: asks the local bridge for every
//! key it holds, keeps the `readings/` and `status/` entries, namespaces them
//! under the device prefix and hands the result to the receiver socket as a
//! single snapshot.

use serde_json::{Map, Value};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeClient, BridgeError};
use crate::config::BridgeConfig;
use crate::mqtt::topics::DeviceTopics;
use crate::readings::{ReadingSnapshot, ReadingValue};

const FORWARDED_PATHS: [&str; 2] = ["readings/", "status/"];

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Unable to deliver snapshot to {path}: {source}")]
    Deliver {
        path: String,
        source: std::io::Error,
    },

    #[error("Unable to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Keeps reading and status keys, prefixed with the device namespace
pub fn select_readings(topics: &DeviceTopics, values: Map<String, Value>) -> ReadingSnapshot {
    let mut snapshot = ReadingSnapshot::default();
    for (key, value) in values {
        if !FORWARDED_PATHS.iter().any(|path| key.contains(path)) {
            continue;
        }
        match ReadingValue::from_json(&key, value) {
            Ok(value) => snapshot.insert(topics.namespaced(&key), value),
            Err(e) => warn!("Skipping {}", e),
        }
    }
    snapshot
}

/// Writes one snapshot to the receiver socket and closes the connection
pub async fn deliver_snapshot(path: &Path, snapshot: &ReadingSnapshot) -> Result<(), ProducerError> {
    let payload = serde_json::to_vec(&snapshot.to_json())?;
    let deliver_error = |source| ProducerError::Deliver {
        path: path.to_string_lossy().into_owned(),
        source,
    };

    let mut stream = UnixStream::connect(path).await.map_err(deliver_error)?;
    stream.write_all(&payload).await.map_err(deliver_error)?;
    stream.shutdown().await.map_err(deliver_error)?;

    debug!("Delivered {} bytes to {}", payload.len(), path.to_string_lossy());
    Ok(())
}

/// Returns how many readings were forwarded, or `None` if the bridge did not
/// answer in time.
pub async fn forward_readings(
    config: &BridgeConfig,
    topics: &DeviceTopics,
) -> Result<Option<usize>, ProducerError> {
    let client = BridgeClient::new(config.bridge.clone());
    let response = client.get_all().await;
    client.close().await;

    let Some(response) = response? else {
        warn!("Bridge at {} sent no readings", config.bridge.address);
        return Ok(None);
    };

    let snapshot = select_readings(topics, response.value);
    deliver_snapshot(&config.receiver.socket_path, &snapshot).await?;
    info!(
        "Forwarded {} readings to {}",
        snapshot.len(),
        config.receiver.socket_path.to_string_lossy()
    );
    Ok(Some(snapshot.len()))
}
