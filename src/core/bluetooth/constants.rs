//! Constants used throughout the bluetooth core
//! This module contains the well-known UUIDs, descriptor values and
//! protocol limits shared by the scanner, the sessions and the backends.

use uuid::Uuid;

/// The Bluetooth base UUID that short (16/32-bit) UUIDs are expanded into
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Descriptor values written to the client configuration descriptor
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Smallest ATT MTU every LE link supports
pub const MIN_ATT_MTU: u16 = 23;

/// Largest ATT MTU a peer may negotiate
pub const MAX_ATT_MTU: u16 = 517;

/// Generic status codes reported by the radio stack
pub const GATT_SUCCESS: u16 = 0x0000;
pub const GATT_ERROR: u16 = 0x0085;
pub const GATT_FAILURE: u16 = 0x0101;

/// Maximum number of connection retries for auto-connect links
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Interval between link liveness checks in milliseconds
pub const LINK_POLL_INTERVAL_MS: u64 = 1000;

/// Scan failure code reported when the platform scan could not be started
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;
