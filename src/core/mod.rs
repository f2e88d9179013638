//! Core functionality for the session bridge
//! This module contains the bluetooth core and the event channels it reports on.

pub mod bluetooth;
pub mod events;

// Re-export commonly used types
pub use bluetooth::{BleError, BluetoothManager, DeviceId};
pub use events::{BleMessage, EventChannel, EventEmitter};
