//! Event delivery to the host
//! All events pass through a single delivery task that hands them to the
//! listener currently attached to their channel. Events nobody listens to
//! are dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use log::trace;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::{DeviceId, DiscoveredPeripheral, ServiceDescriptor};

/// Named channels a host can listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    ScanResult,
    Connector,
}

impl EventChannel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scanResult" => Some(Self::ScanResult),
            "connector" => Some(Self::Connector),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ScanResult => "scanResult",
            Self::Connector => "connector",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionLabel {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicValue {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub characteristic: Uuid,
    pub success: bool,
}

/// Session events sent on the connector channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BleMessage {
    ConnectionState {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "ConnectionState")]
        state: ConnectionLabel,
    },
    ServiceDiscovered {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "ServiceState")]
        state: ServiceState,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    MtuConfig {
        #[serde(rename = "mtuConfig")]
        mtu: u16,
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    CharacteristicValue {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "serviceId")]
        service: Uuid,
        #[serde(rename = "characteristicValue")]
        payload: CharacteristicValue,
    },
    CharacteristicWrite {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "serviceId")]
        service: Uuid,
        #[serde(rename = "onCharacteristicWrite")]
        payload: WriteResult,
    },
}

impl BleMessage {
    pub fn connected(device_id: DeviceId) -> Self {
        Self::ConnectionState {
            device_id,
            state: ConnectionLabel::Connected,
        }
    }

    pub fn disconnected(device_id: DeviceId) -> Self {
        Self::ConnectionState {
            device_id,
            state: ConnectionLabel::Disconnected,
        }
    }

    pub fn service_discovered(device_id: DeviceId, service: ServiceDescriptor) -> Self {
        Self::ServiceDiscovered {
            device_id,
            state: ServiceState::Discovered,
            service: service.service,
            characteristics: service.characteristics,
        }
    }

    pub fn mtu_config(device_id: DeviceId, mtu: u16) -> Self {
        Self::MtuConfig { mtu, device_id }
    }

    pub fn characteristic_value(
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Self {
        Self::CharacteristicValue {
            device_id,
            service,
            payload: CharacteristicValue {
                characteristic,
                value,
            },
        }
    }

    pub fn write_result(
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        success: bool,
    ) -> Self {
        Self::CharacteristicWrite {
            device_id,
            service,
            payload: WriteResult {
                characteristic,
                success,
            },
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::ConnectionState { device_id, .. }
            | Self::ServiceDiscovered { device_id, .. }
            | Self::MtuConfig { device_id, .. }
            | Self::CharacteristicValue { device_id, .. }
            | Self::CharacteristicWrite { device_id, .. } => device_id,
        }
    }
}

/// Receiving end of a channel listener
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

pub type ScanResults = EventStream<DiscoveredPeripheral>;
pub type Messages = EventStream<BleMessage>;

impl<T> EventStream<T> {
    /// Waits for the next event. `None` once the listener was replaced or cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

enum Outbound {
    ScanResult(DiscoveredPeripheral),
    Message(BleMessage),
}

#[derive(Default)]
struct Listeners {
    scan_results: Option<mpsc::UnboundedSender<DiscoveredPeripheral>>,
    messages: Option<mpsc::UnboundedSender<BleMessage>>,
}

impl Listeners {
    fn deliver(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::ScanResult(peripheral) => {
                forward(&mut self.scan_results, peripheral, "scanResult")
            }
            Outbound::Message(message) => forward(&mut self.messages, message, "connector"),
        }
    }
}

fn forward<T>(listener: &mut Option<mpsc::UnboundedSender<T>>, event: T, channel: &str) {
    match listener {
        Some(tx) => {
            if tx.send(event).is_err() {
                trace!("Listener on {} went away, detaching it", channel);
                *listener = None;
            }
        }
        None => trace!("No listener on {}, dropping event", channel),
    }
}

/// Marshals events produced anywhere in the core onto one delivery task
#[derive(Clone)]
pub struct EventEmitter {
    queue: mpsc::UnboundedSender<Outbound>,
    listeners: Arc<Mutex<Listeners>>,
}

impl EventEmitter {
    /// Spawns the delivery task; must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let listeners = Arc::new(Mutex::new(Listeners::default()));

        let listeners_for_task = listeners.clone();
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                listeners_for_task.lock().deliver(outbound);
            }
            trace!("Event delivery task finished");
        });

        Self { queue, listeners }
    }

    pub fn emit_message(&self, message: BleMessage) {
        let _ = self.queue.send(Outbound::Message(message));
    }

    pub fn emit_scan_result(&self, peripheral: DiscoveredPeripheral) {
        let _ = self.queue.send(Outbound::ScanResult(peripheral));
    }

    /// Attaches a listener to the scan result channel, replacing any earlier one.
    pub fn listen_scan_results(&self) -> ScanResults {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().scan_results = Some(tx);
        EventStream { rx }
    }

    /// Attaches a listener to the connector channel, replacing any earlier one.
    pub fn listen_messages(&self) -> Messages {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().messages = Some(tx);
        EventStream { rx }
    }

    pub fn cancel(&self, channel: EventChannel) {
        let mut listeners = self.listeners.lock();
        match channel {
            EventChannel::ScanResult => listeners.scan_results = None,
            EventChannel::Connector => listeners.messages = None,
        }
    }

    pub fn is_listening(&self, channel: EventChannel) -> bool {
        let listeners = self.listeners.lock();
        match channel {
            EventChannel::ScanResult => listeners.scan_results.is_some(),
            EventChannel::Connector => listeners.messages.is_some(),
        }
    }
}
