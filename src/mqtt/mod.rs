//! # MQTT Integration Module
//!
//! Everything that faces the broker. Readings flow up, settings flow down:
//!
//! ```text
//! pipeline ──► publisher ──► AsyncClient ─┐
//!                                         ├── broker
//! bridge ◄── settings ◄── mqtt_handler ◄──┘ (EventLoop)
//! ```
//!
//! ## Submodules
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker address, keep-alive, backoff and pacing
//! ├── topics.rs        - Device topic namespace `climaduino/<hostname>/`
//! ├── publisher.rs     - Paced publishing of changed readings
//! ├── settings.rs      - Inbound settings → bridge `put` commands
//! └── mqtt_handler.rs  - Connection state machine and reconnect policy
//! ```
//!
//! ## Connection Lifecycle
//!
//! The supervisor in [`mqtt_handler`] is the only task that drives the
//! session's event loop. It owns the reconnect policy and re-subscribes to the
//! settings wildcard on every CONNACK, because the broker does not keep
//! subscriptions across a reconnect. The publisher only enqueues requests on
//! the shared client handle and never touches connection state.

pub mod config;
pub mod mqtt_handler;
pub mod publisher;
pub mod settings;
pub mod topics;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("MQTT session error: {0}")]
    Session(String),
}
