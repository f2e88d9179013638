use std::path::PathBuf;

use anyhow::{Context, Result};
use ble_session_bridge_lib::config::{AppConfig, CONFIG_FILE_NAME};
use ble_session_bridge_lib::core::bluetooth::BluestRadio;
use ble_session_bridge_lib::host;
use ble_session_bridge_lib::logging::HostLogger;
use ble_session_bridge_lib::state::AppState;
use log::info;
use tokio::io::{self, BufReader};
use tokio::sync::mpsc;

const CONFIG_PATH_ENV: &str = "BLE_BRIDGE_CONFIG";

/// First CLI argument, then `BLE_BRIDGE_CONFIG`, then the working directory.
fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load_config(&config_path()).await?;

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    if HostLogger::init(config.level_filter(), Some(log_tx)).is_err() {
        // Only fall back to env_logger when the host logger could not be installed
        let _ = env_logger::builder()
            .filter_level(config.level_filter())
            .try_init();
    }

    let (radio, radio_events) = BluestRadio::new(&config.connection)
        .await
        .context("Failed to initialize the bluetooth radio")?;
    let state = AppState::new(radio, radio_events, config);

    info!("Serving host requests on stdin/stdout.");
    host::serve(&state, BufReader::new(io::stdin()), io::stdout(), Some(log_rx)).await
}
