//! Cache of platform device handles, keyed by identifier

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::radio::RadioStack;
use crate::core::bluetooth::types::DeviceId;

/// Devices seen through discovery or a previous connect
pub struct DeviceRegistry<D> {
    devices: Arc<Mutex<HashMap<DeviceId, D>>>,
}

impl<D> Clone for DeviceRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            devices: self.devices.clone(),
        }
    }
}

impl<D> Default for DeviceRegistry<D> {
    fn default() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<D: Clone> DeviceRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device_id: DeviceId, device: D) {
        self.devices.lock().insert(device_id, device);
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<D> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.lock().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut devices = self.devices.lock();
        debug!("Clearing {} cached device handles", devices.len());
        devices.clear();
    }

    /// Returns the cached handle, or asks the radio to build one from the identifier.
    pub async fn resolve<R>(&self, radio: &R, device_id: &DeviceId) -> Result<D, BleError>
    where
        R: RadioStack<Device = D>,
    {
        if let Some(device) = self.get(device_id) {
            return Ok(device);
        }
        debug!("Device {} not cached, building handle from its identifier", device_id);
        let device = radio.remote_device(device_id).await?;
        self.insert(device_id.clone(), device.clone());
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::simulated::{
        RadioCall, RadioOperation, SimulatedDevice, SimulatedRadio,
    };

    #[tokio::test]
    async fn resolve_builds_a_handle_once() {
        let (radio, _events) = SimulatedRadio::new();
        let registry: DeviceRegistry<SimulatedDevice> = DeviceRegistry::new();
        let id = DeviceId::new("AA:BB:CC:DD:EE:01");

        let first = registry.resolve(radio.as_ref(), &id).await.unwrap();
        let second = registry.resolve(radio.as_ref(), &id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            radio.count_calls(|call| matches!(call, RadioCall::RemoteDevice(_))),
            1
        );
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn discovered_handles_are_reused() {
        let (radio, _events) = SimulatedRadio::new();
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("scanned");
        registry.insert(id.clone(), SimulatedDevice { id: id.clone() });

        registry.resolve(radio.as_ref(), &id).await.unwrap();
        assert!(radio.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_lookup_is_not_cached() {
        let (radio, _events) = SimulatedRadio::new();
        radio.reject(RadioOperation::RemoteDevice);
        let registry: DeviceRegistry<SimulatedDevice> = DeviceRegistry::new();
        let id = DeviceId::new("missing");

        let err = registry.resolve(radio.as_ref(), &id).await.unwrap_err();
        assert_eq!(err.code(), "OperationRejectedByStack");
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_one_cache() {
        let registry = DeviceRegistry::new();
        let clone = registry.clone();
        clone.insert(DeviceId::new("A"), 1u8);
        assert_eq!(registry.get(&DeviceId::new("A")), Some(1));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(clone.is_empty());
    }
}
