use climaduino_bridge::config::BridgeConfig;
use climaduino_bridge::mqtt::topics::DeviceTopics;
use climaduino_bridge::producer::forward_readings;
use climaduino_bridge::setup;
use color_eyre::Result;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load()?;
    let topics = DeviceTopics::new(&config.device_name());

    match forward_readings(&config, &topics).await? {
        Some(count) => info!("Sent {} readings", count),
        None => warn!("Nothing to send"),
    }
    Ok(())
}
