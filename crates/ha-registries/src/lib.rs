//! Persistent registries
//!
//! The entity registry pins entity ids to `(domain, platform, unique_id)` and
//! the device registry groups entities by device. Both live as versioned JSON
//! files in `<config>/.storage/`.

pub mod device_registry;
pub mod entity_registry;
pub mod storage;

pub use device_registry::{
    format_mac, DeviceConnection, DeviceEntry, DeviceIdentifier, DeviceInfo, DeviceRegistry,
    CONNECTION_NETWORK_MAC,
};
pub use entity_registry::{
    DisabledBy, EntityCategory, EntityEntry, EntityOptions, EntityRegistry, EntityRegistryError,
};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult, Store};

use std::path::Path;
use tracing::debug;

/// Entity and device registries of one config directory
pub struct Registries {
    /// `core.entity_registry`
    pub entities: EntityRegistry,
    /// `core.device_registry`
    pub devices: DeviceRegistry,
}

impl Registries {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let storage = Storage::new(config_dir);
        Self {
            entities: EntityRegistry::new(storage.clone()),
            devices: DeviceRegistry::new(storage),
        }
    }

    /// Load both registries; missing files leave them empty
    pub async fn load_all(&self) -> StorageResult<()> {
        self.entities.load().await?;
        self.devices.load().await?;
        Ok(())
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        self.entities.save().await?;
        self.devices.save().await?;
        debug!("Saved registries");
        Ok(())
    }

    /// Forget everything a removed config entry registered
    pub fn remove_config_entry(&self, config_entry_id: &str) {
        let entities = self.entities.clear_config_entry(config_entry_id);
        let devices = self.devices.remove_config_entry(config_entry_id);
        debug!(
            config_entry_id,
            entities = entities.len(),
            devices = devices.len(),
            "Cleared registries for config entry"
        );
    }
}
