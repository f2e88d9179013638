//! Bluetooth functionality for the session bridge
//! This module handles all bluetooth operations including scanning,
//! connection sessions and GATT requests against remote peripherals.

#[cfg(feature = "bluest")]
mod bluest_radio;
mod connection;
mod constants;
mod error;
mod manager;
mod notification;
mod radio;
mod registry;
mod scanner;
pub mod simulated;
mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_radio::BluestRadio;
pub use connection::{ConnectionSession, SessionOutcome, TeardownCause};
pub use constants::*; // Re-export all constants
pub use error::BleError;
pub use manager::BluetoothManager;
pub use notification::{apply_notify_mode, NotifyMode};
pub use radio::{
    Advertisement, GattEvent, RadioEvent, RadioEventReceiver, RadioEventSender, RadioStack,
};
pub use registry::DeviceRegistry;
pub use scanner::BluetoothScanner;
pub use types::{
    parse_uuid, uuid_from_short, AdapterState, ConnectionState, DeviceId, DiscoveredPeripheral,
    GattCharacteristic, GattService, GattStatus, LinkState, ScanMode, ServiceDescriptor, WriteMode,
};
