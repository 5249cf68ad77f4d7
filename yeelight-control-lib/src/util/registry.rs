use std::collections::HashMap;

use log::debug;

use crate::error::{ControlError, Result};
use crate::util::discovery::{Device, DeviceKey};

/// Ordered, deduplicated collection of devices from one discovery run.
///
/// Devices are keyed by [`Device::key`]: the protocol id when present,
/// otherwise the address. A device inserted again keeps its original position
/// and takes the newer record.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<DeviceKey, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a device, replacing an earlier record with the same key.
    /// Returns true if the device was not known before.
    pub fn insert(&mut self, device: Device) -> bool {
        let key = device.key();
        match self.index.get(&key) {
            Some(&position) => {
                debug!("Updating known device {:?}", key);
                self.devices[position] = device;
                false
            }
            None => {
                self.index.insert(key, self.devices.len());
                self.devices.push(device);
                true
            }
        }
    }

    pub fn merge<I: IntoIterator<Item = Device>>(&mut self, devices: I) {
        for device in devices {
            self.insert(device);
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.devices
    }

    /// Picks the single device of this registry.
    ///
    /// Never chooses among several candidates: more than one device is
    /// reported back as [`ControlError::AmbiguousSelection`] with the full list.
    pub fn select(self) -> Result<Device> {
        let mut devices = self.devices;
        match devices.len() {
            0 => Err(ControlError::NoDevicesFound),
            1 => Ok(devices.remove(0)),
            _ => Err(ControlError::AmbiguousSelection(devices)),
        }
    }
}

impl FromIterator<Device> for DeviceRegistry {
    fn from_iter<T: IntoIterator<Item = Device>>(iter: T) -> Self {
        let mut registry = DeviceRegistry::new();
        registry.merge(iter);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONTROL_PORT;
    use crate::util::discovery::DeviceSource;
    use std::net::IpAddr;

    fn multicast(id: &str, ip: &str, power: &str) -> Device {
        let mut device = Device::new(ip.parse().unwrap(), CONTROL_PORT, DeviceSource::Multicast);
        device.id = Some(id.to_string());
        device.power = Some(power.to_string());
        device
    }

    fn scanned(ip: &str) -> Device {
        Device::new(ip.parse().unwrap(), CONTROL_PORT, DeviceSource::Scan)
    }

    #[test]
    fn test_same_id_keeps_position_and_takes_latest() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.insert(multicast("0x1", "10.0.0.2", "off")));
        assert!(registry.insert(multicast("0x2", "10.0.0.3", "on")));
        assert!(!registry.insert(multicast("0x1", "10.0.0.2", "on")));

        let devices = registry.into_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id.as_deref(), Some("0x1"));
        assert_eq!(devices[0].power.as_deref(), Some("on"));
    }

    #[test]
    fn test_devices_without_id_dedup_by_address() {
        let registry: DeviceRegistry = vec![scanned("10.0.0.2"), scanned("10.0.0.2"), scanned("10.0.0.3")]
            .into_iter()
            .collect();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_empty_id_falls_back_to_address() {
        let mut device = scanned("10.0.0.9");
        device.id = Some(String::new());
        assert_eq!(
            device.key(),
            DeviceKey::Address("10.0.0.9".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_select() {
        assert!(matches!(
            DeviceRegistry::new().select(),
            Err(ControlError::NoDevicesFound)
        ));

        let single: DeviceRegistry = vec![scanned("10.0.0.2")].into_iter().collect();
        assert_eq!(
            single.select().unwrap().address,
            "10.0.0.2".parse::<IpAddr>().unwrap()
        );

        let several: DeviceRegistry = vec![scanned("10.0.0.2"), scanned("10.0.0.3")]
            .into_iter()
            .collect();
        match several.select() {
            Err(ControlError::AmbiguousSelection(devices)) => assert_eq!(devices.len(), 2),
            other => panic!("unexpected selection: {:?}", other),
        }
    }
}
