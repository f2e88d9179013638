//! Radio backend built on `bluest`
//! `bluest` exposes a request/response API, so every request is run on its own
//! task and its outcome is reported back as a radio callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, AdvertisingDevice, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::connection_config::ConnectionConfig;
use crate::core::bluetooth::constants::{
    GATT_ERROR, GATT_FAILURE, SCAN_FAILED_INTERNAL_ERROR, UUID_CLIENT_CHARACTERISTIC_CONFIG,
};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::radio::{
    Advertisement, GattEvent, RadioEvent, RadioEventReceiver, RadioEventSender, RadioStack,
};
use crate::core::bluetooth::types::{
    AdapterState, DeviceId, GattCharacteristic, GattService, GattStatus, LinkState, ScanMode,
    WriteMode,
};

type CharacteristicKey = (Uuid, Uuid);

/// Platform state of one opened link
struct Link {
    device: Device,
    cancel_token: CancellationToken,
    characteristics: HashMap<CharacteristicKey, Characteristic>,
    notifications: HashMap<CharacteristicKey, CancellationToken>,
}

impl Link {
    fn new(device: Device, cancel_token: CancellationToken) -> Self {
        Self {
            device,
            cancel_token,
            characteristics: HashMap::new(),
            notifications: HashMap::new(),
        }
    }

    fn release(self) {
        self.cancel_token.cancel();
        for token in self.notifications.into_values() {
            token.cancel();
        }
    }
}

type Links = Arc<Mutex<HashMap<DeviceId, Link>>>;

pub struct BluestRadio {
    adapter: Adapter,
    events: RadioEventSender<Device>,
    config: ConnectionConfig,
    links: Links,
    scan_token: Mutex<Option<CancellationToken>>,
}

fn device_id_of(device: &Device) -> DeviceId {
    DeviceId::new(device.id().to_string())
}

fn send_gatt(events: &RadioEventSender<Device>, device_id: DeviceId, event: GattEvent) {
    if events.send(RadioEvent::Gatt { device_id, event }).is_err() {
        debug!("Radio callback dropped, nobody is listening");
    }
}

impl BluestRadio {
    /// Opens the default adapter and starts watching its power state.
    pub async fn new(config: &ConnectionConfig) -> Result<(Arc<Self>, RadioEventReceiver<Device>)> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        match adapter.is_available().await {
            Ok(true) => info!("Bluetooth adapter is available."),
            Ok(false) => warn!("Bluetooth adapter is powered off."),
            Err(e) => warn!("Could not query Bluetooth adapter state: {}", e),
        }

        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::watch_adapter(adapter.clone(), events.clone()));

        let radio = Arc::new(Self {
            adapter,
            events,
            config: config.clone(),
            links: Arc::new(Mutex::new(HashMap::new())),
            scan_token: Mutex::new(None),
        });
        Ok((radio, rx))
    }

    async fn watch_adapter(adapter: Adapter, events: RadioEventSender<Device>) {
        let mut adapter_events = match adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to adapter events: {}", e);
                return;
            }
        };
        while let Some(event) = adapter_events.next().await {
            let state = match event {
                Ok(AdapterEvent::Available) => AdapterState::PoweredOn,
                Ok(_) => AdapterState::PoweredOff,
                Err(e) => {
                    warn!("Error in adapter event stream: {}", e);
                    continue;
                }
            };
            if events.send(RadioEvent::AdapterStateChanged(state)).is_err() {
                break;
            }
        }
        info!("Adapter event stream ended");
    }

    async fn internal_scan_task(
        adapter: Adapter,
        filter: Option<Uuid>,
        events: RadioEventSender<Device>,
        cancel_token: CancellationToken,
        started: oneshot::Sender<Result<(), BleError>>,
    ) {
        let services: Vec<Uuid> = filter.into_iter().collect();
        let mut scan_stream = match adapter.scan(&services).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start bluetooth scan: {}", e);
                let _ = started.send(Err(BleError::rejected("startScan", e)));
                return;
            }
        };
        let _ = started.send(Ok(()));

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let advertisement = Self::advertisement(discovered);
                            if events.send(RadioEvent::Advertisement(advertisement)).is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("Bluetooth scan stream has ended.");
                            let _ = events.send(RadioEvent::ScanFailed {
                                code: SCAN_FAILED_INTERNAL_ERROR,
                            });
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    fn advertisement(discovered: AdvertisingDevice) -> Advertisement<Device> {
        let device_id = device_id_of(&discovered.device);
        let name = discovered
            .adv_data
            .local_name
            .or_else(|| discovered.device.name().ok());
        let manufacturer_data = discovered
            .adv_data
            .manufacturer_data
            .map(|data| BTreeMap::from([(data.company_id, data.data)]))
            .unwrap_or_default();

        Advertisement {
            device: discovered.device,
            device_id,
            name,
            manufacturer_data,
            services: discovered.adv_data.services,
            rssi: discovered.rssi.unwrap_or_default(),
        }
    }

    /// Connects, retrying up to `max_attempts` times.
    async fn connect_with_retry(
        adapter: &Adapter,
        device: &Device,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<(), bluest::Error> {
        let mut retry_count = 0;
        loop {
            if device.is_connected().await {
                return Ok(());
            }
            match adapter.connect_device(device).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    retry_count += 1;
                    warn!("Connection attempt {} failed: {}", retry_count, e);
                    if retry_count >= max_attempts {
                        return Err(e);
                    }
                    info!("Retrying connection in {:?}...", retry_delay);
                    sleep(retry_delay).await;
                }
            }
        }
    }

    /// Brings the link up and reports when it goes away. `bluest` has no
    /// disconnect callback, so liveness is polled.
    async fn run_link(
        adapter: Adapter,
        device: Device,
        events: RadioEventSender<Device>,
        max_attempts: u32,
        config: ConnectionConfig,
        cancel_token: CancellationToken,
    ) {
        let device_id = device_id_of(&device);
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => return,
            result = Self::connect_with_retry(
                &adapter,
                &device,
                max_attempts,
                config.connect_retry_delay(),
            ) => result,
        };
        if let Err(e) = connected {
            warn!("Failed to connect to {}: {}", device_id, e);
            send_gatt(
                &events,
                device_id,
                GattEvent::ConnectionStateChanged {
                    status: GattStatus::Failure(GATT_ERROR),
                    state: LinkState::Disconnected,
                },
            );
            return;
        }

        info!("Link to {} established", device_id);
        send_gatt(
            &events,
            device_id.clone(),
            GattEvent::ConnectionStateChanged {
                status: GattStatus::Success,
                state: LinkState::Connected,
            },
        );

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = sleep(config.link_poll_interval()) => {
                    if !device.is_connected().await {
                        info!("Link to {} lost", device_id);
                        send_gatt(
                            &events,
                            device_id,
                            GattEvent::ConnectionStateChanged {
                                status: GattStatus::Success,
                                state: LinkState::Disconnected,
                            },
                        );
                        break;
                    }
                }
            }
        }
    }

    async fn collect_topology(
        device: &Device,
    ) -> Result<(Vec<GattService>, HashMap<CharacteristicKey, Characteristic>), bluest::Error> {
        let mut services = Vec::new();
        let mut handles = HashMap::new();

        for service in device.discover_services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.discover_characteristics().await? {
                let mut descriptors: Vec<Uuid> = match characteristic.discover_descriptors().await {
                    Ok(descriptors) => descriptors.iter().map(|d| d.uuid()).collect(),
                    Err(e) => {
                        debug!("No descriptors for {}: {}", characteristic.uuid(), e);
                        Vec::new()
                    }
                };
                // Some platforms hide the client configuration descriptor.
                let properties = characteristic.properties().await?;
                if (properties.notify || properties.indicate)
                    && !descriptors.contains(&UUID_CLIENT_CHARACTERISTIC_CONFIG)
                {
                    descriptors.push(UUID_CLIENT_CHARACTERISTIC_CONFIG);
                }
                characteristics.push(GattCharacteristic::new(characteristic.uuid(), descriptors));
                handles.insert((service.uuid(), characteristic.uuid()), characteristic);
            }
            services.push(GattService::new(service.uuid(), characteristics));
        }
        Ok((services, handles))
    }

    async fn process_notifications(
        characteristic: Characteristic,
        device_id: DeviceId,
        service: Uuid,
        events: RadioEventSender<Device>,
        cancel_token: CancellationToken,
    ) {
        let uuid = characteristic.uuid();
        let mut notification_stream = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to {} on {}: {}", uuid, device_id, e);
                return;
            }
        };
        info!("Listening for notifications of {} on {}", uuid, device_id);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                result = notification_stream.next() => {
                    match result {
                        Some(Ok(value)) => send_gatt(
                            &events,
                            device_id.clone(),
                            GattEvent::CharacteristicChanged {
                                service,
                                characteristic: uuid,
                                value,
                            },
                        ),
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        info!("Notification stream of {} on {} ended", uuid, device_id);
    }

    fn device(&self, device_id: &DeviceId) -> Result<Device, BleError> {
        self.links
            .lock()
            .get(device_id)
            .map(|link| link.device.clone())
            .ok_or_else(|| BleError::UnknownDevice(device_id.clone()))
    }

    fn characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, BleError> {
        self.links
            .lock()
            .get(device_id)
            .and_then(|link| link.characteristics.get(&(service, characteristic)).cloned())
            .ok_or_else(|| BleError::CharacteristicUnavailable {
                device_id: device_id.clone(),
                service,
                characteristic,
            })
    }
}

#[async_trait]
impl RadioStack for BluestRadio {
    type Device = Device;

    async fn is_available(&self) -> bool {
        self.adapter.is_available().await.unwrap_or(false)
    }

    async fn start_scan(&self, filter: Option<Uuid>, mode: ScanMode) -> Result<(), BleError> {
        debug!("Scan mode {:?} is chosen by the platform", mode);
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.scan_token.lock().replace(cancel_token.clone()) {
            previous.cancel();
        }
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            filter,
            self.events.clone(),
            cancel_token,
            started_tx,
        ));
        // The scan stream borrows the adapter, so the task reports whether it started.
        match started_rx.await {
            Ok(result) => result,
            Err(_) => Err(BleError::rejected("startScan", "scan task ended before starting")),
        }
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(token) = self.scan_token.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn remote_device(&self, device_id: &DeviceId) -> Result<Device, BleError> {
        // bluest cannot build a handle from a string, so only already connected
        // devices can be reached without scanning first.
        let connected = self.adapter.connected_devices().await?;
        connected
            .into_iter()
            .find(|device| device_id_of(device) == *device_id)
            .ok_or_else(|| BleError::UnknownDevice(device_id.clone()))
    }

    async fn open(&self, device: &Device, auto_connect: bool) -> Result<(), BleError> {
        let device_id = device_id_of(device);
        let cancel_token = CancellationToken::new();
        let previous = self
            .links
            .lock()
            .insert(device_id.clone(), Link::new(device.clone(), cancel_token.clone()));
        if let Some(previous) = previous {
            previous.release();
        }

        let max_attempts = if auto_connect {
            self.config.max_connect_retries.max(1)
        } else {
            1
        };
        info!("Opening link to {} ({} attempts)", device_id, max_attempts);
        tokio::spawn(Self::run_link(
            self.adapter.clone(),
            device.clone(),
            self.events.clone(),
            max_attempts,
            self.config.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn disconnect(&self, device_id: &DeviceId) -> Result<(), BleError> {
        let link = self
            .links
            .lock()
            .get(device_id)
            .map(|link| (link.device.clone(), link.cancel_token.clone()));
        let Some((device, cancel_token)) = link else {
            return Ok(());
        };
        cancel_token.cancel();
        if device.is_connected().await {
            info!("Disconnecting from device {}", device_id);
            self.adapter.disconnect_device(&device).await?;
        }
        Ok(())
    }

    async fn close(&self, device_id: &DeviceId) -> Result<(), BleError> {
        let link = self.links.lock().remove(device_id);
        if let Some(link) = link {
            link.release();
        }
        Ok(())
    }

    async fn discover_services(&self, device_id: &DeviceId) -> Result<(), BleError> {
        let device = self.device(device_id)?;
        let links = self.links.clone();
        let events = self.events.clone();
        let device_id = device_id.clone();

        tokio::spawn(async move {
            let event = match Self::collect_topology(&device).await {
                Ok((services, handles)) => {
                    if let Some(link) = links.lock().get_mut(&device_id) {
                        link.characteristics = handles;
                    }
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::Success,
                        services,
                    }
                }
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", device_id, e);
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::Failure(GATT_FAILURE),
                        services: Vec::new(),
                    }
                }
            };
            send_gatt(&events, device_id, event);
        });
        Ok(())
    }

    async fn request_mtu(&self, _device_id: &DeviceId, _mtu: u16) -> Result<(), BleError> {
        Err(BleError::rejected(
            "requestMtu",
            "MTU negotiation is managed by the platform",
        ))
    }

    async fn read_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let handle = self.characteristic(device_id, service, characteristic)?;
        let events = self.events.clone();
        let device_id = device_id.clone();

        tokio::spawn(async move {
            let event = match handle.read().await {
                Ok(value) => GattEvent::CharacteristicRead {
                    status: GattStatus::Success,
                    service,
                    characteristic,
                    value,
                },
                Err(e) => {
                    warn!("Read of {} failed: {}", characteristic, e);
                    GattEvent::CharacteristicRead {
                        status: GattStatus::Failure(GATT_FAILURE),
                        service,
                        characteristic,
                        value: Vec::new(),
                    }
                }
            };
            send_gatt(&events, device_id, event);
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let handle = self.characteristic(device_id, service, characteristic)?;
        let events = self.events.clone();
        let device_id = device_id.clone();
        let value = value.to_vec();

        tokio::spawn(async move {
            let result = match mode {
                WriteMode::WithResponse => handle.write(&value).await,
                WriteMode::WithoutResponse => handle.write_without_response(&value).await,
            };
            let status = match result {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Write to {} failed: {}", characteristic, e);
                    GattStatus::Failure(GATT_FAILURE)
                }
            };
            send_gatt(
                &events,
                device_id,
                GattEvent::CharacteristicWrite {
                    status,
                    service,
                    characteristic,
                },
            );
        });
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), BleError> {
        let key = (service, characteristic);
        if !enable {
            let token = self
                .links
                .lock()
                .get_mut(device_id)
                .and_then(|link| link.notifications.remove(&key));
            if let Some(token) = token {
                token.cancel();
            }
            return Ok(());
        }

        let handle = self.characteristic(device_id, service, characteristic)?;
        let cancel_token = CancellationToken::new();
        {
            let mut links = self.links.lock();
            let Some(link) = links.get_mut(device_id) else {
                return Err(BleError::UnknownDevice(device_id.clone()));
            };
            if link.notifications.contains_key(&key) {
                debug!("Already listening to {} on {}", characteristic, device_id);
                return Ok(());
            }
            link.notifications.insert(key, cancel_token.clone());
        }

        tokio::spawn(Self::process_notifications(
            handle,
            device_id.clone(),
            service,
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn write_descriptor(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        if descriptor == UUID_CLIENT_CHARACTERISTIC_CONFIG {
            // bluest writes the client configuration itself when a notify stream opens or closes.
            debug!(
                "Client configuration of {} on {} follows the notify stream",
                characteristic, device_id
            );
            return Ok(());
        }

        let handle = self.characteristic(device_id, service, characteristic)?;
        let descriptors = handle.discover_descriptors().await?;
        let target = descriptors
            .into_iter()
            .find(|d| d.uuid() == descriptor)
            .ok_or_else(|| {
                let reason = format!("descriptor {} not found", descriptor);
                BleError::rejected("writeDescriptor", reason)
            })?;
        target.write(value).await?;
        Ok(())
    }
}
