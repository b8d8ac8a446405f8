//! Local readings receiver
//!
//! Listens on a filesystem-path stream socket. The producer opens one
//! connection per snapshot and writes a single JSON object. Each connection
//! is read on its own task until that object is complete or the peer closes,
//! whichever comes first, and the parsed snapshot is queued for the pipeline.
//! A producer that stays silent past the read timeout is disconnected.
//! Malformed, oversized or late payloads are logged and dropped without
//! affecting the listener.
//!
//! Binding happens once at startup. A socket file left by a previous run is
//! removed first; further failures are retried with a fixed delay, and when
//! the retries run out startup fails. Once bound there is no supervision: if
//! accepting fails the receiver stops and reports the error.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::readings::ReadingSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Unable to listen for readings on {path} after {attempts} attempts: {source}")]
    BindExhausted {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("Accepting readings connection failed: {0}")]
    Accept(std::io::Error),

    #[error("Reading snapshot from producer failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("Snapshot exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("No complete snapshot within {0:?}")]
    Timeout(Duration),
}

pub struct ReadingsReceiver {
    listener: UnixListener,
    config: ReceiverConfig,
}

impl ReadingsReceiver {
    /// Removes any stale socket file, then binds with bounded retries
    pub async fn bind(config: ReceiverConfig) -> Result<Self, ReceiverError> {
        let path = config.socket_path.clone();
        remove_stale_socket(&path);

        let attempts = config.bind_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    info!(
                        "Listening for readings on socket {}",
                        path.to_string_lossy()
                    );
                    return Ok(Self { listener, config });
                }
                Err(source) if attempt >= attempts => {
                    error!(
                        "Giving up on socket {} after {} attempts",
                        path.to_string_lossy(),
                        attempt
                    );
                    return Err(ReceiverError::BindExhausted {
                        path,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "Error starting readings server (attempt {}/{}). Will retry in {:?}: {}",
                        attempt,
                        attempts,
                        config.bind_retry_delay(),
                        e
                    );
                    tokio::time::sleep(config.bind_retry_delay()).await;
                }
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accepts connections until accepting fails
    pub async fn serve(self, snapshots: mpsc::Sender<ReadingSnapshot>) -> Result<(), ReceiverError> {
        let limit = self.config.max_snapshot_bytes;
        let read_timeout = self.config.read_timeout();
        loop {
            let (stream, _) = self.listener.accept().await.map_err(ReceiverError::Accept)?;
            debug!("Accepted readings connection");
            let snapshots = snapshots.clone();
            tokio::spawn(async move {
                handle_connection(stream, snapshots, limit, read_timeout).await;
            });
        }
    }

    /// Runs the accept loop as a background task. The task does not keep the
    /// process alive; it ends with the runtime.
    pub fn spawn(
        self,
        snapshots: mpsc::Sender<ReadingSnapshot>,
    ) -> JoinHandle<Result<(), ReceiverError>> {
        tokio::spawn(self.serve(snapshots))
    }
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed stale socket {}", path.to_string_lossy()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Unable to remove stale socket {}: {}",
            path.to_string_lossy(),
            e
        ),
    }
}

async fn handle_connection(
    stream: UnixStream,
    snapshots: mpsc::Sender<ReadingSnapshot>,
    limit: usize,
    read_timeout: Duration,
) {
    let payload = match tokio::time::timeout(read_timeout, read_message(stream, limit)).await {
        Ok(payload) => payload,
        Err(_) => Err(ReceiverError::Timeout(read_timeout)),
    };
    let payload = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Dropping readings connection: {}", e);
            return;
        }
    };

    let snapshot = match ReadingSnapshot::parse(&payload) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(
                "Invalid data received: {} ({})",
                e,
                String::from_utf8_lossy(&payload)
            );
            return;
        }
    };

    if snapshot.is_empty() {
        debug!("Ignoring empty snapshot");
        return;
    }

    if snapshots.send(snapshot).await.is_err() {
        error!("Readings pipeline is gone, snapshot dropped");
    }
}

/// Reads until the buffer holds one whole JSON value or the peer closes
async fn read_message(mut stream: UnixStream, limit: usize) -> Result<Vec<u8>, ReceiverError> {
    let mut payload = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        payload.extend_from_slice(&chunk[..n]);
        if payload.len() > limit {
            return Err(ReceiverError::TooLarge { limit });
        }
        if message_complete(&payload) {
            break;
        }
    }
    Ok(payload)
}

/// `true` once `buf` starts with a full JSON value, or with bytes that can
/// never become one
fn message_complete(buf: &[u8]) -> bool {
    match serde_json::Deserializer::from_slice(buf)
        .into_iter::<serde_json::Value>()
        .next()
    {
        Some(Ok(_)) => true,
        Some(Err(e)) => !e.is_eof(),
        None => false,
    }
}
