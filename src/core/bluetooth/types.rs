//! Defines shared data structures for the Bluetooth module.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::core::bluetooth::constants::{BLUETOOTH_BASE_UUID, GATT_SUCCESS};

/// Stable platform identifier of a remote device (MAC address or platform UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps an identifier reported by a radio backend.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validates an identifier received from the host. Blank identifiers are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses a 16-bit, 32-bit or full 128-bit UUID string.
///
/// Short forms such as `180D` or `0x180d` are expanded against the Bluetooth base UUID.
pub fn parse_uuid(input: &str) -> Result<Uuid, uuid::Error> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let short = match trimmed.len() {
        4 => u16::from_str_radix(trimmed, 16).ok().map(u32::from),
        8 => u32::from_str_radix(trimmed, 16).ok(),
        _ => None,
    };
    match short {
        Some(value) => Ok(uuid_from_short(value)),
        None => Uuid::parse_str(trimmed),
    }
}

/// Expands a 16/32-bit assigned number into a full UUID.
pub fn uuid_from_short(value: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | (u128::from(value) << 96))
}

/// Lifecycle of a connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Sessions in these states still accept commands and callbacks.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Link signal carried by a connection callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Power state of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    TurningOn,
    TurningOff,
    PoweredOff,
}

impl AdapterState {
    pub fn is_powering_down(self) -> bool {
        matches!(self, Self::TurningOff | Self::PoweredOff)
    }
}

/// Completion status of a radio operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(u16),
}

impl GattStatus {
    /// Maps a raw platform status code.
    pub fn from_code(code: u16) -> Self {
        if code == GATT_SUCCESS {
            Self::Success
        } else {
            Self::Failure(code)
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Radio scan duty cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Write type of a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    /// `"withResponse"` selects acknowledged writes, anything else does not.
    pub fn from_label(label: &str) -> Self {
        if label == "withResponse" {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }
}

/// A characteristic discovered on a remote device, with its descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, descriptors: Vec<Uuid>) -> Self {
        Self { uuid, descriptors }
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// A service discovered on a remote device, characteristics in platform order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Public view of a discovered service: its UUID and ordered characteristic UUIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl From<&GattService> for ServiceDescriptor {
    fn from(service: &GattService) -> Self {
        Self {
            service: service.uuid,
            characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
        }
    }
}

/// Represents one received advertisement, as reported to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeripheral {
    /// Advertised name, reported as an empty string when absent
    #[serde(serialize_with = "serialize_name")]
    pub name: Option<String>,
    pub device_id: DeviceId,
    /// First manufacturer entry: little-endian company id followed by its payload
    pub manufacturer_data_head: Vec<u8>,
    #[serde(rename = "allManufacturerDataHead")]
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Signal strength in dBm
    pub rssi: i16,
}

impl DiscoveredPeripheral {
    pub fn new(
        device_id: DeviceId,
        name: Option<String>,
        manufacturer_data: BTreeMap<u16, Vec<u8>>,
        rssi: i16,
    ) -> Self {
        let manufacturer_data_head = manufacturer_data_head(&manufacturer_data);
        Self {
            name,
            device_id,
            manufacturer_data_head,
            manufacturer_data,
            rssi,
        }
    }
}

fn manufacturer_data_head(data: &BTreeMap<u16, Vec<u8>>) -> Vec<u8> {
    match data.iter().next() {
        Some((company_id, payload)) => {
            let mut head = company_id.to_le_bytes().to_vec();
            head.extend_from_slice(payload);
            head
        }
        None => Vec::new(),
    }
}

fn serialize_name<S: Serializer>(name: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(name.as_deref().unwrap_or(""))
}
