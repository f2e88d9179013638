use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::radio::{Advertisement, RadioStack};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::types::ScanMode;
use crate::core::events::{EventEmitter, ScanResults};

#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    active: bool,
    filter: Option<Uuid>,
}

pub struct BluetoothScanner<R: RadioStack> {
    radio: Arc<R>,
    devices: DeviceRegistry<R::Device>,
    emitter: EventEmitter,
    scan_mode: ScanMode,
    state: Mutex<ScanState>,
    // Serializes start/stop so a restart cannot interleave with another call.
    op_lock: tokio::sync::Mutex<()>,
}

impl<R: RadioStack> BluetoothScanner<R> {
    pub fn new(
        radio: Arc<R>,
        devices: DeviceRegistry<R::Device>,
        emitter: EventEmitter,
        scan_mode: ScanMode,
    ) -> Self {
        Self {
            radio,
            devices,
            emitter,
            scan_mode,
            state: Mutex::new(ScanState::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Starts scanning, restarting a running scan with the new filter.
    pub async fn start_scan(&self, filter: Option<Uuid>) -> Result<(), BleError> {
        let _op = self.op_lock.lock().await;

        if !self.radio.is_available().await {
            error!("Cannot start scan: bluetooth radio is unavailable");
            return Err(BleError::RadioUnavailable);
        }

        let was_active = self.state.lock().active;
        if was_active {
            info!("Scan already running, restarting with filter {:?}", filter);
            self.mark_idle();
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Failed to stop previous scan: {}", e);
            }
        }

        *self.state.lock() = ScanState {
            active: true,
            filter,
        };
        if let Err(e) = self.radio.start_scan(filter, self.scan_mode).await {
            error!("Failed to start scan: {}", e);
            self.mark_idle();
            return Err(e);
        }

        info!(
            "Device scan started (mode {:?}, filter {:?})",
            self.scan_mode, filter
        );
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        let _op = self.op_lock.lock().await;

        let was_active = self.state.lock().active;
        if !was_active {
            debug!("No scan running, nothing to stop");
            return Ok(());
        }

        info!("Stopping Bluetooth scan.");
        self.mark_idle();
        self.radio.stop_scan().await
    }

    /// Lazy, unterminated sequence of discovered peripherals.
    pub fn results(&self) -> ScanResults {
        self.emitter.listen_scan_results()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().active
    }

    pub fn filter(&self) -> Option<Uuid> {
        self.state.lock().filter
    }

    pub fn mark_idle(&self) {
        *self.state.lock() = ScanState::default();
    }

    /// Emits an advertisement received while scanning, honoring the service filter.
    pub fn handle_advertisement(&self, advertisement: Advertisement<R::Device>) {
        let state = *self.state.lock();
        if !state.active {
            trace!(
                "Dropping advertisement from {} received while idle",
                advertisement.device_id
            );
            return;
        }
        if let Some(filter) = state.filter {
            if !advertisement.advertises(filter) {
                trace!(
                    "Advertisement from {} does not list {}, skipping",
                    advertisement.device_id, filter
                );
                return;
            }
        }

        debug!(
            "Found device - ID: {}, Name: {:?}, RSSI: {}",
            advertisement.device_id, advertisement.name, advertisement.rssi
        );
        self.devices
            .insert(advertisement.device_id.clone(), advertisement.device.clone());
        self.emitter.emit_scan_result(advertisement.to_peripheral());
    }

    pub fn handle_scan_failure(&self, code: i32) {
        error!("Scan failed with code {}", code);
        self.mark_idle();
    }
}
