//! Platform radio seam
//! Every platform request is acknowledged immediately and its result arrives
//! later as a [`RadioEvent`] on the channel handed out by the backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{
    AdapterState, DeviceId, DiscoveredPeripheral, GattService, GattStatus, LinkState, ScanMode,
    WriteMode,
};

pub type RadioEventSender<D> = mpsc::UnboundedSender<RadioEvent<D>>;
pub type RadioEventReceiver<D> = mpsc::UnboundedReceiver<RadioEvent<D>>;

/// One advertisement as delivered by the radio
#[derive(Debug, Clone)]
pub struct Advertisement<D> {
    pub device: D,
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service UUIDs listed in the advertisement
    pub services: Vec<Uuid>,
    pub rssi: i16,
}

impl<D> Advertisement<D> {
    pub fn advertises(&self, service: Uuid) -> bool {
        self.services.contains(&service)
    }

    pub fn to_peripheral(&self) -> DiscoveredPeripheral {
        DiscoveredPeripheral::new(
            self.device_id.clone(),
            self.name.clone(),
            self.manufacturer_data.clone(),
            self.rssi,
        )
    }
}

/// Callbacks of the radio stack
#[derive(Debug, Clone)]
pub enum RadioEvent<D> {
    AdapterStateChanged(AdapterState),
    Advertisement(Advertisement<D>),
    ScanFailed { code: i32 },
    Gatt { device_id: DeviceId, event: GattEvent },
}

/// Callbacks scoped to one remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<GattService>,
    },
    MtuChanged {
        status: GattStatus,
        mtu: u16,
    },
    CharacteristicRead {
        status: GattStatus,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        status: GattStatus,
        service: Uuid,
        characteristic: Uuid,
    },
    CharacteristicChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// The platform radio stack, seen from the central role
#[async_trait]
pub trait RadioStack: Send + Sync + 'static {
    /// Platform handle of a remote device
    type Device: Clone + Send + Sync + 'static;

    /// Whether the adapter is present and powered on
    async fn is_available(&self) -> bool;

    async fn start_scan(&self, filter: Option<Uuid>, mode: ScanMode) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Builds a device handle from its identifier alone (e.g. a remembered address)
    async fn remote_device(&self, device_id: &DeviceId) -> Result<Self::Device, BleError>;

    /// Opens an LE connection; the outcome arrives as `ConnectionStateChanged`
    async fn open(&self, device: &Self::Device, auto_connect: bool) -> Result<(), BleError>;

    async fn disconnect(&self, device_id: &DeviceId) -> Result<(), BleError>;

    /// Releases every platform resource held for the device
    async fn close(&self, device_id: &DeviceId) -> Result<(), BleError>;

    async fn discover_services(&self, device_id: &DeviceId) -> Result<(), BleError>;

    async fn request_mtu(&self, device_id: &DeviceId, mtu: u16) -> Result<(), BleError>;

    async fn read_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError>;

    async fn write_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;

    /// Turns local delivery of value changes on or off
    async fn set_characteristic_notification(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), BleError>;

    async fn write_descriptor(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;
}
