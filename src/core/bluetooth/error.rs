//! Error taxonomy of the bluetooth core.

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::types::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// The command names an identifier without an active session
    #[error("Unknown deviceId: {0}")]
    UnknownDevice(DeviceId),

    /// The service/characteristic pair is not present on the device
    #[error("Characteristic unavailable: {characteristic} in service {service} on {device_id}")]
    CharacteristicUnavailable {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },

    /// The platform declined the request synchronously
    #[error("{operation} rejected by the radio stack: {reason}")]
    OperationRejectedByStack {
        operation: &'static str,
        reason: String,
    },

    /// The adapter is missing or powered off
    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,
}

impl BleError {
    pub fn rejected(operation: &'static str, reason: impl ToString) -> Self {
        Self::OperationRejectedByStack {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable name reported to the host
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownDevice(_) => "UnknownDevice",
            Self::CharacteristicUnavailable { .. } => "CharacteristicUnavailable",
            Self::OperationRejectedByStack { .. } => "OperationRejectedByStack",
            Self::RadioUnavailable => "RadioUnavailable",
        }
    }
}

#[cfg(feature = "bluest")]
impl From<bluest::Error> for BleError {
    fn from(e: bluest::Error) -> Self {
        Self::rejected("bluest", e)
    }
}
