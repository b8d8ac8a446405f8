use climaduino_bridge::bridge::BridgeClient;
use climaduino_bridge::config::BridgeConfig;
use climaduino_bridge::mqtt::mqtt_handler::{create_session, MqttSupervisor};
use climaduino_bridge::mqtt::publisher::ReadingsPublisher;
use climaduino_bridge::mqtt::settings::SettingsForwarder;
use climaduino_bridge::mqtt::topics::DeviceTopics;
use climaduino_bridge::pipeline::ReadingsPipeline;
use climaduino_bridge::receiver::ReadingsReceiver;
use climaduino_bridge::setup;
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const SNAPSHOT_QUEUE: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load()?;
    let device_name = config.device_name();
    let topics = DeviceTopics::new(&device_name);
    info!("Device topic prefix is {}", topics);

    // Without the local socket there is no way to receive readings
    let receiver = ReadingsReceiver::bind(config.receiver.clone())
        .await
        .map_err(|e| eyre!("Unable to listen for readings: {}", e))?;

    let (client, eventloop) = create_session(&config.mqtt, &config.client_id(&device_name));

    let pipeline = ReadingsPipeline::new(ReadingsPublisher::new(
        client.clone(),
        config.mqtt.publish_spacing(),
    ));
    let (snapshot_tx, _pipeline_handle) = pipeline.spawn(SNAPSHOT_QUEUE);
    let receiver_handle = receiver.spawn(snapshot_tx);

    let forwarder = SettingsForwarder::new(topics, BridgeClient::new(config.bridge.clone()));
    let shutdown = CancellationToken::new();
    let supervisor = MqttSupervisor::new(
        eventloop,
        client,
        forwarder,
        config.mqtt.reconnect_backoff(),
        shutdown.clone(),
    );

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    tokio::select! {
        result = supervisor.run() => {
            result?;
            info!("MQTT session closed, exiting");
        }
        result = receiver_handle => {
            return match result {
                Ok(Ok(())) => Err(eyre!("Readings receiver stopped")),
                Ok(Err(e)) => Err(eyre!("Readings receiver failed: {}", e)),
                Err(e) => Err(eyre!("Readings receiver task aborted: {}", e)),
            };
        }
    }

    Ok(())
}
