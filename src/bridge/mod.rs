//! Local bridge link
//!
//! Loopback TCP connection to the microcontroller-facing bridge process.
//! Requests and responses are bare JSON objects written back to back on the
//! stream, with no delimiter between them:
//!
//! ```text
//! → {"command":"put","key":"fanSpeed","value":"42"}
//! → {"command":"get"}
//! ← {"value":{"readings/temp":"21","settings/fanSpeed":"42"}}
//! ```
//!
//! One connection is kept open. After a write failure it is dropped and the
//! next command opens a fresh one; the failed command itself is not re-sent.
//! Sending is bounded by the response timeout, so a bridge that accepts but
//! stops reading fails the command instead of blocking the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeLinkConfig;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Unable to connect to bridge at {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Bridge link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge sent invalid JSON: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error("Bridge did not accept the command within {0:?}")]
    Timeout(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum BridgeCommand {
    /// Ask for every key/value pair the bridge currently holds
    Get,
    /// Store one key/value pair
    Put { key: String, value: String },
}

/// Response to a `get`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct BridgeResponse {
    #[serde(default)]
    pub value: Map<String, Value>,
}

/// Anything that accepts bridge commands
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send(&self, command: &BridgeCommand) -> Result<(), BridgeError>;
}

pub struct BridgeClient {
    config: BridgeLinkConfig,
    stream: Mutex<Option<TcpStream>>,
}

impl BridgeClient {
    pub fn new(config: BridgeLinkConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    async fn connect(&self) -> Result<TcpStream, BridgeError> {
        let stream = TcpStream::connect(&self.config.address)
            .await
            .map_err(|source| BridgeError::Connect {
                address: self.config.address.clone(),
                source,
            })?;
        info!("Connected to bridge at {}", self.config.address);
        Ok(stream)
    }

    /// Writes one command, opening a connection first if there is none.
    /// Hands the stream back on success; on failure it is dropped.
    async fn write_command(
        &self,
        stream: Option<TcpStream>,
        command: &BridgeCommand,
    ) -> Result<TcpStream, BridgeError> {
        let bytes = serde_json::to_vec(command)?;
        let mut stream = match stream {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let written = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Dropping bridge connection after write failure: {}", e);
            return Err(BridgeError::Io(e));
        }

        debug!("Sent bridge command {:?}", command);
        Ok(stream)
    }

    /// Sends a command and waits for the bridge's reply.
    ///
    /// The stream is polled every `response_poll_ms` until a complete JSON
    /// object arrives or `response_timeout_secs` pass. A timeout yields
    /// `Ok(None)` and drops the connection so a late reply cannot be mistaken
    /// for the answer to a later request.
    pub async fn request(&self, command: &BridgeCommand) -> Result<Option<Value>, BridgeError> {
        let mut slot = self.stream.lock().await;
        let mut stream = self.write_command(slot.take(), command).await?;

        let deadline = Instant::now() + self.config.response_timeout();
        let poll = self.config.response_poll().max(Duration::from_millis(1));
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        while Instant::now() < deadline {
            match tokio::time::timeout(poll, stream.read(&mut chunk)).await {
                Err(_) => continue,
                Ok(Err(e)) => return Err(BridgeError::Io(e)),
                Ok(Ok(0)) => {
                    warn!("Bridge closed the connection before replying");
                    return Ok(None);
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(value) = first_json_value(&buf)? {
                        *slot = Some(stream);
                        return Ok(Some(value));
                    }
                }
            }
        }

        warn!(
            "No reply from bridge within {:?}",
            self.config.response_timeout()
        );
        Ok(None)
    }

    /// Fetches every key/value pair the bridge holds
    pub async fn get_all(&self) -> Result<Option<BridgeResponse>, BridgeError> {
        match self.request(&BridgeCommand::Get).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[async_trait]
impl CommandSink for BridgeClient {
    async fn send(&self, command: &BridgeCommand) -> Result<(), BridgeError> {
        let mut slot = self.stream.lock().await;
        let limit = self.config.response_timeout();
        let stream = tokio::time::timeout(limit, self.write_command(slot.take(), command))
            .await
            .map_err(|_| {
                warn!("Dropping bridge connection, write stalled for {:?}", limit);
                BridgeError::Timeout(limit)
            })??;
        *slot = Some(stream);
        Ok(())
    }
}

/// First complete JSON value in `buf`, or `None` if more bytes are needed
fn first_json_value(buf: &[u8]) -> Result<Option<Value>, BridgeError> {
    match serde_json::Deserializer::from_slice(buf)
        .into_iter::<Value>()
        .next()
    {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(BridgeError::InvalidResponse(e)),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: StdMutex<Vec<BridgeCommand>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn commands(&self) -> Vec<BridgeCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send(&self, command: &BridgeCommand) -> Result<(), BridgeError> {
            if self.fail {
                return Err(BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "bridge down",
                )));
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl<T: CommandSink> CommandSink for std::sync::Arc<T> {
        async fn send(&self, command: &BridgeCommand) -> Result<(), BridgeError> {
            self.as_ref().send(command).await
        }
    }

    fn link_config(address: String) -> BridgeLinkConfig {
        BridgeLinkConfig {
            address,
            response_timeout_secs: 1,
            response_poll_ms: 10,
        }
    }

    #[test]
    fn commands_serialize_to_wire_format() {
        assert_eq!(
            serde_json::to_string(&BridgeCommand::Get).unwrap(),
            r#"{"command":"get"}"#
        );
        assert_eq!(
            serde_json::to_value(BridgeCommand::Put {
                key: "fanSpeed".into(),
                value: "42".into()
            })
            .unwrap(),
            serde_json::json!({"command": "put", "key": "fanSpeed", "value": "42"})
        );
    }

    #[test]
    fn partial_json_needs_more_bytes() {
        assert_eq!(first_json_value(br#"{"value": {"a"#).unwrap(), None);
        assert_eq!(
            first_json_value(br#"{"value": {}}{"value""#).unwrap(),
            Some(serde_json::json!({"value": {}}))
        );
        assert!(first_json_value(b"}{").is_err());
    }

    #[tokio::test]
    async fn put_reaches_the_bridge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BridgeClient::new(link_config(listener.local_addr().unwrap().to_string()));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        client
            .send(&BridgeCommand::Put {
                key: "fanSpeed".into(),
                value: "42".into(),
            })
            .await
            .unwrap();
        client.close().await;

        let received = server.await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&received).unwrap(),
            serde_json::json!({"command": "put", "key": "fanSpeed", "value": "42"})
        );
    }

    #[tokio::test]
    async fn unreachable_bridge_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = BridgeClient::new(link_config(address));
        let err = client.send(&BridgeCommand::Get).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));
    }

    #[tokio::test]
    async fn stalled_bridge_fails_the_put() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BridgeClient::new(link_config(listener.local_addr().unwrap().to_string()));

        // accepts, then never reads
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let started = Instant::now();
        let err = client
            .send(&BridgeCommand::Put {
                key: "blob".into(),
                value: "x".repeat(64 * 1024 * 1024),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(client.stream.lock().await.is_none());
        server.abort();
    }

    #[tokio::test]
    async fn get_all_reads_split_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BridgeClient::new(link_config(listener.local_addr().unwrap().to_string()));

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 64];
            let _ = socket.read(&mut chunk).await.unwrap();
            socket.write_all(br#"{"value": {"readings/te"#).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            socket.write_all(br#"mp": "21"}}"#).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let response = client.get_all().await.unwrap().unwrap();
        assert_eq!(
            response.value.get("readings/temp"),
            Some(&Value::String("21".into()))
        );
    }

    #[tokio::test]
    async fn silent_bridge_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BridgeClient::new(link_config(listener.local_addr().unwrap().to_string()));

        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        assert_eq!(client.get_all().await.unwrap(), None);
    }
}
