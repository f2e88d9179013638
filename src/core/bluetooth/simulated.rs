//! In-memory radio
//! Records every platform request and lets the caller play the radio stack's
//! part by injecting callbacks. Used for host-side development and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::radio::{
    Advertisement, GattEvent, RadioEvent, RadioEventReceiver, RadioEventSender, RadioStack,
};
use crate::core::bluetooth::types::{
    AdapterState, DeviceId, GattService, GattStatus, LinkState, ScanMode, WriteMode,
};

/// Device handle of the simulated radio
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimulatedDevice {
    pub id: DeviceId,
}

/// Platform operations the simulated radio can be told to reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioOperation {
    StartScan,
    StopScan,
    RemoteDevice,
    Open,
    Disconnect,
    Close,
    DiscoverServices,
    RequestMtu,
    Read,
    Write,
    SetNotification,
    WriteDescriptor,
}

impl RadioOperation {
    fn name(self) -> &'static str {
        match self {
            Self::StartScan => "startScan",
            Self::StopScan => "stopScan",
            Self::RemoteDevice => "remoteDevice",
            Self::Open => "connectGatt",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
            Self::DiscoverServices => "discoverServices",
            Self::RequestMtu => "requestMtu",
            Self::Read => "readCharacteristic",
            Self::Write => "writeCharacteristic",
            Self::SetNotification => "setCharacteristicNotification",
            Self::WriteDescriptor => "writeDescriptor",
        }
    }
}

/// A platform request received by the simulated radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan {
        filter: Option<Uuid>,
        mode: ScanMode,
    },
    StopScan,
    RemoteDevice(DeviceId),
    Open {
        device_id: DeviceId,
        auto_connect: bool,
    },
    Disconnect(DeviceId),
    Close(DeviceId),
    DiscoverServices(DeviceId),
    RequestMtu {
        device_id: DeviceId,
        mtu: u16,
    },
    Read {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    },
    SetNotification {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
}

pub struct SimulatedRadio {
    events: RadioEventSender<SimulatedDevice>,
    available: AtomicBool,
    calls: Mutex<Vec<RadioCall>>,
    rejected: Mutex<HashSet<RadioOperation>>,
    delays: Mutex<HashMap<RadioOperation, Duration>>,
}

impl SimulatedRadio {
    /// Creates a powered-on radio and the receiver of its callbacks.
    pub fn new() -> (Arc<Self>, RadioEventReceiver<SimulatedDevice>) {
        let (events, rx) = mpsc::unbounded_channel();
        let radio = Arc::new(Self {
            events,
            available: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
        });
        (radio, rx)
    }

    /// Makes every later request of this kind fail synchronously.
    pub fn reject(&self, operation: RadioOperation) {
        self.rejected.lock().insert(operation);
    }

    pub fn accept(&self, operation: RadioOperation) {
        self.rejected.lock().remove(&operation);
    }

    /// Makes every later request of this kind take `duration` before it lands.
    pub fn delay(&self, operation: RadioOperation, duration: Duration) {
        self.delays.lock().insert(operation, duration);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<RadioCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn count_calls(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Delivers a raw callback.
    pub fn inject(&self, event: RadioEvent<SimulatedDevice>) {
        if self.events.send(event).is_err() {
            debug!("Simulated radio has no event consumer");
        }
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.available
            .store(state == AdapterState::PoweredOn, Ordering::SeqCst);
        self.inject(RadioEvent::AdapterStateChanged(state));
    }

    pub fn advertise(
        &self,
        device_id: &DeviceId,
        name: Option<&str>,
        services: Vec<Uuid>,
        manufacturer_data: BTreeMap<u16, Vec<u8>>,
        rssi: i16,
    ) {
        self.inject(RadioEvent::Advertisement(Advertisement {
            device: SimulatedDevice {
                id: device_id.clone(),
            },
            device_id: device_id.clone(),
            name: name.map(str::to_string),
            manufacturer_data,
            services,
            rssi,
        }));
    }

    pub fn gatt(&self, device_id: &DeviceId, event: GattEvent) {
        self.inject(RadioEvent::Gatt {
            device_id: device_id.clone(),
            event,
        });
    }

    pub fn link_up(&self, device_id: &DeviceId) {
        self.connection_changed(device_id, GattStatus::Success, LinkState::Connected);
    }

    pub fn link_lost(&self, device_id: &DeviceId, status: GattStatus) {
        self.connection_changed(device_id, status, LinkState::Disconnected);
    }

    pub fn connection_changed(&self, device_id: &DeviceId, status: GattStatus, state: LinkState) {
        self.gatt(device_id, GattEvent::ConnectionStateChanged { status, state });
    }

    pub fn services_discovered(
        &self,
        device_id: &DeviceId,
        status: GattStatus,
        services: Vec<GattService>,
    ) {
        self.gatt(device_id, GattEvent::ServicesDiscovered { status, services });
    }

    pub fn mtu_changed(&self, device_id: &DeviceId, status: GattStatus, mtu: u16) {
        self.gatt(device_id, GattEvent::MtuChanged { status, mtu });
    }

    pub fn value_changed(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) {
        self.gatt(
            device_id,
            GattEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
            },
        );
    }

    async fn pause(&self, operation: RadioOperation) {
        let delay = self.delays.lock().get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, operation: RadioOperation, call: RadioCall) -> Result<(), BleError> {
        debug!("Simulated radio received {:?}", call);
        self.calls.lock().push(call);
        if self.rejected.lock().contains(&operation) {
            return Err(BleError::rejected(operation.name(), "rejected by simulated radio"));
        }
        Ok(())
    }
}

#[async_trait]
impl RadioStack for SimulatedRadio {
    type Device = SimulatedDevice;

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, filter: Option<Uuid>, mode: ScanMode) -> Result<(), BleError> {
        if !self.is_available().await {
            return Err(BleError::RadioUnavailable);
        }
        self.record(RadioOperation::StartScan, RadioCall::StartScan { filter, mode })
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.record(RadioOperation::StopScan, RadioCall::StopScan)
    }

    async fn remote_device(&self, device_id: &DeviceId) -> Result<SimulatedDevice, BleError> {
        self.pause(RadioOperation::RemoteDevice).await;
        self.record(
            RadioOperation::RemoteDevice,
            RadioCall::RemoteDevice(device_id.clone()),
        )?;
        Ok(SimulatedDevice {
            id: device_id.clone(),
        })
    }

    async fn open(&self, device: &SimulatedDevice, auto_connect: bool) -> Result<(), BleError> {
        self.pause(RadioOperation::Open).await;
        self.record(
            RadioOperation::Open,
            RadioCall::Open {
                device_id: device.id.clone(),
                auto_connect,
            },
        )
    }

    async fn disconnect(&self, device_id: &DeviceId) -> Result<(), BleError> {
        self.record(RadioOperation::Disconnect, RadioCall::Disconnect(device_id.clone()))
    }

    async fn close(&self, device_id: &DeviceId) -> Result<(), BleError> {
        self.record(RadioOperation::Close, RadioCall::Close(device_id.clone()))
    }

    async fn discover_services(&self, device_id: &DeviceId) -> Result<(), BleError> {
        self.record(
            RadioOperation::DiscoverServices,
            RadioCall::DiscoverServices(device_id.clone()),
        )
    }

    async fn request_mtu(&self, device_id: &DeviceId, mtu: u16) -> Result<(), BleError> {
        self.record(
            RadioOperation::RequestMtu,
            RadioCall::RequestMtu {
                device_id: device_id.clone(),
                mtu,
            },
        )
    }

    async fn read_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        self.record(
            RadioOperation::Read,
            RadioCall::Read {
                device_id: device_id.clone(),
                service,
                characteristic,
            },
        )
    }

    async fn write_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        self.record(
            RadioOperation::Write,
            RadioCall::Write {
                device_id: device_id.clone(),
                service,
                characteristic,
                value: value.to_vec(),
                mode,
            },
        )
    }

    async fn set_characteristic_notification(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), BleError> {
        self.record(
            RadioOperation::SetNotification,
            RadioCall::SetNotification {
                device_id: device_id.clone(),
                service,
                characteristic,
                enable,
            },
        )
    }

    async fn write_descriptor(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.record(
            RadioOperation::WriteDescriptor,
            RadioCall::WriteDescriptor {
                device_id: device_id.clone(),
                service,
                characteristic,
                descriptor,
                value: value.to_vec(),
            },
        )
    }
}
