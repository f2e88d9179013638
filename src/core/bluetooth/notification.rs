//! Notification subscriptions
//! A subscription is switched by toggling local delivery on the radio and
//! writing the client configuration descriptor of the characteristic.

use log::{debug, info};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
    UUID_CLIENT_CHARACTERISTIC_CONFIG,
};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::radio::RadioStack;
use crate::core::bluetooth::types::DeviceId;

/// Value-change delivery mode of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    #[default]
    Off,
    Notification,
    Indication,
}

impl NotifyMode {
    /// Unknown labels switch delivery off.
    pub fn from_label(label: &str) -> Self {
        match label {
            "notification" => Self::Notification,
            "indication" => Self::Indication,
            _ => Self::Off,
        }
    }

    pub fn descriptor_value(self) -> [u8; 2] {
        match self {
            Self::Notification => ENABLE_NOTIFICATION_VALUE,
            Self::Indication => ENABLE_INDICATION_VALUE,
            Self::Off => DISABLE_NOTIFICATION_VALUE,
        }
    }

    pub fn delivers(self) -> bool {
        self != Self::Off
    }
}

/// Applies `mode` to one characteristic. The descriptor is only written once
/// local delivery has been accepted.
pub async fn apply_notify_mode<R: RadioStack>(
    radio: &R,
    device_id: &DeviceId,
    service: Uuid,
    characteristic: Uuid,
    mode: NotifyMode,
) -> Result<(), BleError> {
    debug!(
        "Switching {} on {}/{} to {:?}",
        device_id, service, characteristic, mode
    );
    radio
        .set_characteristic_notification(device_id, service, characteristic, mode.delivers())
        .await?;
    radio
        .write_descriptor(
            device_id,
            service,
            characteristic,
            UUID_CLIENT_CHARACTERISTIC_CONFIG,
            &mode.descriptor_value(),
        )
        .await?;
    info!("Characteristic {} on {} set to {:?}", characteristic, device_id, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_map_to_modes() {
        assert_eq!(NotifyMode::from_label("notification"), NotifyMode::Notification);
        assert_eq!(NotifyMode::from_label("indication"), NotifyMode::Indication);
        assert_eq!(NotifyMode::from_label("off"), NotifyMode::Off);
        assert_eq!(NotifyMode::from_label("Notification"), NotifyMode::Off);
    }

    #[test]
    fn descriptor_values_follow_mode() {
        assert_eq!(NotifyMode::Notification.descriptor_value(), [0x01, 0x00]);
        assert_eq!(NotifyMode::Indication.descriptor_value(), [0x02, 0x00]);
        assert_eq!(NotifyMode::Off.descriptor_value(), [0x00, 0x00]);
        assert!(!NotifyMode::Off.delivers());
        assert!(NotifyMode::Indication.delivers());
    }
}
