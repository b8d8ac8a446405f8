//! MQTT bridge for a Climaduino node
//!
//! Readings go up, settings come down:
//!
//! ```text
//! producer ─[unix socket]─► receiver ─► pipeline (diff) ─► publisher ─► broker
//! broker ─► mqtt_handler ─► settings ─[tcp json]─► local bridge
//! ```

pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod pipeline;
pub mod producer;
pub mod readings;
pub mod receiver;

use color_eyre::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Installs error reporting and logging. Call once at the top of `main`.
pub fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
