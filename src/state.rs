//! Application state management
//! This module defines and manages the global application state.

use std::sync::Arc;

use log::info;
use serde_json::Value;

use crate::commands::{dispatch, Command, CommandError};
use crate::config::AppConfig;
use crate::core::bluetooth::{BluetoothManager, RadioEventReceiver, RadioStack};
use crate::core::events::{EventChannel, EventEmitter};

/// Global application state
pub struct AppState<R: RadioStack> {
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<BluetoothManager<R>>,
    pub config: AppConfig,
}

impl<R: RadioStack> AppState<R> {
    /// Creates a new AppState instance around a radio backend
    pub fn new(
        radio: Arc<R>,
        radio_events: RadioEventReceiver<R::Device>,
        config: AppConfig,
    ) -> Self {
        info!("Initializing BluetoothManager...");
        let manager = BluetoothManager::start(radio, radio_events, EventEmitter::new(), &config);
        Self {
            bluetooth_manager: Arc::new(manager),
            config,
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Value, CommandError> {
        dispatch(&self.bluetooth_manager, command, &self.config.connection).await
    }

    /// Releases every session and detaches all listeners.
    pub async fn shutdown(&self) {
        self.bluetooth_manager.shutdown().await;
        let emitter = self.bluetooth_manager.emitter();
        emitter.cancel(EventChannel::ScanResult);
        emitter.cancel(EventChannel::Connector);
    }
}
