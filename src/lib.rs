//! BLE session bridge library
//! Central-role GATT sessions driven by a host over a line-delimited JSON bridge.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod host;
pub mod logging;
pub mod state;
pub mod utils;
