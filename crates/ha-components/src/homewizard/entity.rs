use std::sync::Arc;

use ha_helpers::CoordinatorEntity;
use ha_registries::{DeviceConnection, DeviceIdentifier, DeviceInfo, CONNECTION_NETWORK_MAC};

use super::coordinator::{DeviceResponse, HomeWizardCoordinator};
use super::DOMAIN;

pub const MANUFACTURER: &str = "HomeWizard";

/// Shared part of every entity of a HomeWizard device
pub struct HomeWizardEntity {
    pub base: CoordinatorEntity<DeviceResponse>,
    pub entry_unique_id: String,
}

impl HomeWizardEntity {
    pub fn new(coordinator: Arc<HomeWizardCoordinator>, entry_unique_id: &str) -> Self {
        Self {
            base: CoordinatorEntity::new(coordinator),
            entry_unique_id: entry_unique_id.to_string(),
        }
    }

    pub fn data(&self) -> Option<Arc<DeviceResponse>> {
        self.base.data()
    }

    pub fn unique_id(&self, key: &str) -> String {
        format!("{}_{}", self.entry_unique_id, key)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        let response = self.data()?;
        let device = &response.device;
        Some(DeviceInfo {
            identifiers: vec![DeviceIdentifier::new(DOMAIN, &device.serial)],
            // The serial is the MAC address of the device
            connections: vec![DeviceConnection::new(CONNECTION_NETWORK_MAC, &device.serial)],
            name: Some(device.product_name.clone()),
            manufacturer: Some(MANUFACTURER.to_string()),
            model: Some(device.product_type.clone()),
            sw_version: Some(device.firmware_version.clone()),
            hw_version: None,
            serial_number: Some(device.serial.clone()),
        })
    }
}
