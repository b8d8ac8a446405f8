//! Connection supervisor
//!
//! Drives the broker session's event loop for the lifetime of the process and
//! owns its reconnect policy:
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(unexpected drop)──► Reconnecting
//!                      ▲  │            ▲                              │  │
//!                      └──┘ backoff    └──────────(CONNACK)───────────┘  │
//!                                                                        ▼
//!                                              Disconnected ◄── shutdown requested
//! ```
//!
//! Every CONNACK re-subscribes to `climaduino/<hostname>/settings/#` before the
//! next event is polled, so no inbound setting is handled on a session that
//! has not been subscribed. A transport failure waits a fixed backoff and then
//! polls again, which makes the event loop reconnect. There is no retry limit.
//! Only a locally requested shutdown ends the loop.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::settings::SettingsForwarder;
use super::MqttError;
use crate::bridge::CommandSink;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub connects: usize,
    pub failed_attempts: usize,
    pub settings_received: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// What the supervisor cares about from one event-loop step
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Broker accepted the connection
    Connected,
    /// Inbound publish
    Message { topic: String, payload: Vec<u8> },
    /// Our own DISCONNECT went out
    LocalDisconnect,
    /// Pings, acks and outgoing traffic
    Other,
}

/// Incoming half of a broker session
#[async_trait]
pub trait SessionEvents: Send {
    /// Next event. An error means the transport failed; polling again
    /// attempts to reconnect.
    async fn next_event(&mut self) -> Result<SessionEvent, MqttError>;
}

/// Requests the supervisor issues on the session. Implementations must not
/// wait on the event loop, since the supervisor is the one polling it.
pub trait SessionControl: Send + Sync {
    fn subscribe(&self, filter: &str) -> Result<(), MqttError>;
    fn disconnect(&self) -> Result<(), MqttError>;
}

#[async_trait]
impl SessionEvents for EventLoop {
    async fn next_event(&mut self) -> Result<SessionEvent, MqttError> {
        let event = self.poll().await?;
        Ok(match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                SessionEvent::Connected
            }
            Event::Incoming(Packet::Publish(publish)) => SessionEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Event::Outgoing(Outgoing::Disconnect) => SessionEvent::LocalDisconnect,
            other => {
                debug!("MQTT event: {:?}", other);
                SessionEvent::Other
            }
        })
    }
}

impl SessionControl for AsyncClient {
    fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.try_subscribe(filter, QoS::AtMostOnce)
            .map_err(MqttError::from)
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.try_disconnect().map_err(MqttError::from)
    }
}

/// Builds the client handle and event loop for the configured broker.
/// Nothing touches the network until the event loop is first polled.
pub fn create_session(config: &MqttConfig, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
    mqtt_options.set_keep_alive(config.keep_alive());
    info!(
        "MQTT session for {}:{} as '{}' (keep-alive {:?})",
        config.host,
        config.port,
        client_id,
        config.keep_alive()
    );
    AsyncClient::new(mqtt_options, config.request_capacity.max(1))
}

pub struct MqttSupervisor<E, C, S> {
    events: E,
    control: C,
    forwarder: SettingsForwarder<S>,
    backoff: Duration,
    shutdown: CancellationToken,
    status: MqttStatus,
    status_tx: watch::Sender<MqttStatus>,
    disconnect_requested: bool,
}

impl<E, C, S> MqttSupervisor<E, C, S>
where
    E: SessionEvents,
    C: SessionControl,
    S: CommandSink,
{
    pub fn new(
        events: E,
        control: C,
        forwarder: SettingsForwarder<S>,
        backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let status = MqttStatus::default();
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            events,
            control,
            forwarder,
            backoff,
            shutdown,
            status,
            status_tx,
            disconnect_requested: false,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MqttStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.status.connection_state
    }

    /// Runs until a graceful shutdown completes
    pub async fn run(mut self) -> Result<(), MqttError> {
        info!("Starting MQTT supervisor");
        self.set_state(ConnectionState::Connecting);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if !self.disconnect_requested => {
                    if self.begin_shutdown() {
                        return Ok(());
                    }
                    continue;
                }
                event = self.events.next_event() => event,
            };

            match event {
                Ok(SessionEvent::Connected) => self.on_connected(),
                Ok(SessionEvent::Message { topic, payload }) => {
                    self.status.settings_received += 1;
                    self.status.last_activity = Some(Local::now());
                    // bounded by the bridge link's response timeout
                    self.forwarder.forward(&topic, &payload).await;
                    self.publish_status();
                }
                Ok(SessionEvent::LocalDisconnect) => {
                    info!("Disconnected from MQTT broker");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Ok(SessionEvent::Other) => {}
                Err(e) => {
                    if self.disconnect_requested {
                        debug!("Session closed during shutdown: {}", e);
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(());
                    }
                    if !self.on_transport_error(e).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_connected(&mut self) {
        match self.status.connection_state {
            ConnectionState::Reconnecting => info!("Reconnected"),
            _ => info!("Connected to MQTT broker"),
        }
        self.status.connects += 1;
        self.status.last_activity = Some(Local::now());
        self.set_state(ConnectionState::Connected);

        let filter = self.forwarder.topics().settings_filter();
        match self.control.subscribe(&filter) {
            Ok(()) => info!("Subscribed to {}", filter),
            Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
        }
    }

    /// A dropped session is retried at once; failed attempts wait out the
    /// backoff. Returns `false` if shutdown was requested meanwhile.
    async fn on_transport_error(&mut self, e: MqttError) -> bool {
        match self.status.connection_state {
            ConnectionState::Connected => {
                warn!("Connection to MQTT broker unexpectedly lost: {}", e);
                self.set_state(ConnectionState::Reconnecting);
                return true;
            }
            ConnectionState::Connecting => {
                self.status.failed_attempts += 1;
                warn!(
                    "Connecting to MQTT broker failed: {}. Will try again in {:?}",
                    e, self.backoff
                );
            }
            _ => {
                self.status.failed_attempts += 1;
                warn!(
                    "Reconnection failed: {}. Will try again in {:?}",
                    e, self.backoff
                );
            }
        }
        self.publish_status();

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested while waiting to reconnect");
                self.set_state(ConnectionState::Disconnected);
                false
            }
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }

    /// Returns `true` when there is no live session left to close
    fn begin_shutdown(&mut self) -> bool {
        self.disconnect_requested = true;
        if self.status.connection_state != ConnectionState::Connected {
            info!("Shutdown requested before a session was established");
            self.set_state(ConnectionState::Disconnected);
            return true;
        }

        info!("Disconnecting from MQTT broker");
        match self.control.disconnect() {
            Ok(()) => false,
            Err(e) => {
                warn!("Unable to send DISCONNECT: {}", e);
                self.set_state(ConnectionState::Disconnected);
                true
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.connection_state != state {
            debug!(
                "MQTT state {:?} -> {:?}",
                self.status.connection_state, state
            );
            self.status.connection_state = state;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeCommand, BridgeError};
    use crate::mqtt::topics::DeviceTopics;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Ordered record of everything the supervisor did to the outside world
    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
        disconnected: AtomicBool,
        wake: Notify,
    }

    impl Journal {
        fn push(&self, entry: String) {
            self.entries.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    struct ScriptedEvents {
        script: VecDeque<Result<SessionEvent, MqttError>>,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl SessionEvents for ScriptedEvents {
        async fn next_event(&mut self) -> Result<SessionEvent, MqttError> {
            if let Some(step) = self.script.pop_front() {
                return step;
            }
            loop {
                if self.journal.disconnected.load(Ordering::SeqCst) {
                    return Ok(SessionEvent::LocalDisconnect);
                }
                self.journal.wake.notified().await;
            }
        }
    }

    struct JournalControl {
        journal: Arc<Journal>,
        fail_subscribe: bool,
    }

    impl SessionControl for JournalControl {
        fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
            if self.fail_subscribe {
                return Err(MqttError::Session("subscribe queue full".into()));
            }
            self.journal.push(format!("subscribe {}", filter));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), MqttError> {
            self.journal.push("disconnect".into());
            self.journal.disconnected.store(true, Ordering::SeqCst);
            self.journal.wake.notify_one();
            Ok(())
        }
    }

    struct JournalSink(Arc<Journal>);

    #[async_trait]
    impl CommandSink for JournalSink {
        async fn send(&self, command: &BridgeCommand) -> Result<(), BridgeError> {
            if let BridgeCommand::Put { key, value } = command {
                self.0.push(format!("put {}={}", key, value));
            }
            Ok(())
        }
    }

    fn message(topic: &str, payload: &str) -> Result<SessionEvent, MqttError> {
        Ok(SessionEvent::Message {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        })
    }

    fn dropped() -> Result<SessionEvent, MqttError> {
        Err(MqttError::Session("connection reset".into()))
    }

    fn supervisor(
        script: Vec<Result<SessionEvent, MqttError>>,
        backoff: Duration,
        fail_subscribe: bool,
    ) -> (
        MqttSupervisor<ScriptedEvents, JournalControl, JournalSink>,
        Arc<Journal>,
        CancellationToken,
    ) {
        let journal = Arc::new(Journal::default());
        let token = CancellationToken::new();
        let supervisor = MqttSupervisor::new(
            ScriptedEvents {
                script: script.into(),
                journal: journal.clone(),
            },
            JournalControl {
                journal: journal.clone(),
                fail_subscribe,
            },
            SettingsForwarder::new(DeviceTopics::new("host1"), JournalSink(journal.clone())),
            backoff,
            token.clone(),
        );
        (supervisor, journal, token)
    }

    #[tokio::test]
    async fn resubscribes_after_unexpected_drop() {
        let (supervisor, journal, token) = supervisor(
            vec![
                Ok(SessionEvent::Connected),
                message("climaduino/host1/settings/fanSpeed", "42"),
                dropped(),
                dropped(),
                Ok(SessionEvent::Connected),
                message("climaduino/host1/settings/mode", "cool"),
            ],
            Duration::from_millis(5),
            false,
        );
        let mut status = supervisor.subscribe_status();
        let handle = tokio::spawn(supervisor.run());

        status
            .wait_for(|s| s.settings_received == 2)
            .await
            .unwrap();
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.failed_attempts, 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                "subscribe climaduino/host1/settings/#",
                "put fanSpeed=42",
                "subscribe climaduino/host1/settings/#",
                "put mode=cool",
                "disconnect",
            ]
        );
        assert_eq!(
            status.borrow().connection_state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn initial_connect_failure_is_retried() {
        let (supervisor, journal, token) = supervisor(
            vec![dropped(), Ok(SessionEvent::Connected)],
            Duration::from_millis(5),
            false,
        );
        let mut status = supervisor.subscribe_status();
        let handle = tokio::spawn(supervisor.run());

        status
            .wait_for(|s| s.connection_state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(status.borrow().failed_attempts, 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            journal.entries(),
            vec!["subscribe climaduino/host1/settings/#", "disconnect"]
        );
    }

    #[tokio::test]
    async fn first_reconnect_skips_backoff() {
        let (supervisor, journal, token) = supervisor(
            vec![
                Ok(SessionEvent::Connected),
                dropped(),
                Ok(SessionEvent::Connected),
            ],
            Duration::from_secs(3600),
            false,
        );
        let mut status = supervisor.subscribe_status();
        let handle = tokio::spawn(supervisor.run());

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.connects == 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.borrow().failed_attempts, 0);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            journal.entries(),
            vec![
                "subscribe climaduino/host1/settings/#",
                "subscribe climaduino/host1/settings/#",
                "disconnect",
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let (supervisor, journal, token) = supervisor(
            vec![Ok(SessionEvent::Connected), dropped(), dropped()],
            Duration::from_secs(3600),
            false,
        );
        let mut status = supervisor.subscribe_status();
        let handle = tokio::spawn(supervisor.run());

        // the second failure is a failed reconnect, which waits out the backoff
        status
            .wait_for(|s| s.failed_attempts == 1)
            .await
            .unwrap();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            status.borrow().connection_state,
            ConnectionState::Disconnected
        );
        // no live session, so no DISCONNECT is sent
        assert_eq!(
            journal.entries(),
            vec!["subscribe climaduino/host1/settings/#"]
        );
    }

    #[tokio::test]
    async fn graceful_disconnect_does_not_reconnect() {
        let (supervisor, journal, _token) = supervisor(
            vec![Ok(SessionEvent::Connected), Ok(SessionEvent::LocalDisconnect)],
            Duration::from_millis(5),
            false,
        );

        tokio::time::timeout(Duration::from_secs(1), supervisor.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            journal.entries(),
            vec!["subscribe climaduino/host1/settings/#"]
        );
    }

    #[tokio::test]
    async fn subscribe_failure_keeps_session_alive() {
        let (supervisor, journal, token) = supervisor(
            vec![
                Ok(SessionEvent::Connected),
                message("climaduino/host1/settings/fanSpeed", "1"),
            ],
            Duration::from_millis(5),
            true,
        );
        let mut status = supervisor.subscribe_status();
        let handle = tokio::spawn(supervisor.run());

        status
            .wait_for(|s| s.settings_received == 1)
            .await
            .unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(journal.entries(), vec!["put fanSpeed=1", "disconnect"]);
    }
}
