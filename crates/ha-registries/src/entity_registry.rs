//! Entity Registry
//!
//! Gives every entity that has a unique id a stable entity id. An entry is
//! identified by `(domain, platform, unique_id)`, so a sensor of an
//! integration keeps the entity id it got the first time it was seen, even
//! across restarts and renames of the device.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult, Store};

#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    /// No entry for this entity id
    #[error("Entity not found: {0}")]
    NotFound(String),
}

pub const STORAGE_KEY: &str = "core.entity_registry";

/// Who disabled an entity; disabled entities are not added to the state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Device,
    /// Disabled by default, e.g. a rarely useful diagnostic sensor
    Integration,
    User,
}

/// Entities that are not primary controls or readings of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    /// Changes a device setting
    Config,
    /// Reports device health, such as signal strength
    Diagnostic,
}

/// Key of the unique index: `(domain, platform, unique_id)`
type UniqueKey = (String, String, String);

/// A registered entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    pub id: String,
    pub entity_id: String,
    pub unique_id: String,
    /// Integration that provides the entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name reported by the integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default)]
    pub has_entity_name: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<EntityCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    /// Domain part of the entity id
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    fn unique_key(&self) -> UniqueKey {
        (
            self.domain().to_string(),
            self.platform.clone(),
            self.unique_id.clone(),
        )
    }
}

/// What an integration reports about an entity when registering it
#[derive(Debug, Clone, Default)]
pub struct EntityOptions {
    pub config_entry_id: Option<String>,
    pub device_id: Option<String>,
    pub original_name: Option<String>,
    pub has_entity_name: bool,
    pub entity_category: Option<EntityCategory>,
    pub original_device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    /// Applied to new entries only
    pub disabled_by: Option<DisabledBy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = 1;
}

/// Entity ids pinned to `(domain, platform, unique_id)`, persisted to `.storage`
pub struct EntityRegistry {
    store: Store<EntityRegistryData>,

    /// entity_id -> entry, in registration order
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// (domain, platform, unique_id) -> entity_id
    by_unique_id: DashMap<UniqueKey, String>,

    /// config_entry_id -> entity_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl EntityRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            store: Store::new(storage),
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.store.load().await? {
            info!(count = data.entities.len(), "Loading entity registry");
            for entry in data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = EntityRegistryData {
            entities: self.iter().iter().map(|e| (**e).clone()).collect(),
        };
        self.store.save(&data).await?;
        debug!(count = data.entities.len(), "Saved entity registry");
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();
        self.by_unique_id.insert(entry.unique_key(), entity_id.clone());
        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }
        self.by_entity_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id, entry);
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        self.by_unique_id.remove(&entry.unique_key());
        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.entity_id);
            }
        }
        self.by_entity_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(&entry.entity_id);
    }

    /// Entry for an entity id
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    /// Entity id registered for `(domain, platform, unique_id)`
    pub fn get_entity_id(&self, domain: &str, platform: &str, unique_id: &str) -> Option<String> {
        self.by_unique_id
            .get(&(domain.to_string(), platform.to_string(), unique_id.to_string()))
            .map(|id| id.clone())
    }

    pub fn entries_for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Register an entity, or refresh the entry it already has
    ///
    /// An existing entry keeps its entity id; only the integration-reported
    /// fields are updated. A new entry gets `<domain>.<suggested_object_id>`,
    /// suffixed when that id is taken by the registry or by `reserved`.
    pub fn get_or_create(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
        suggested_object_id: &str,
        options: EntityOptions,
        reserved: &[String],
    ) -> Arc<EntityEntry> {
        if let Some(entity_id) = self.get_entity_id(domain, platform, unique_id) {
            let refreshed = self.update(&entity_id, |entry| {
                entry.config_entry_id = options.config_entry_id.clone();
                entry.device_id = options.device_id.clone();
                entry.original_name = options.original_name.clone();
                entry.has_entity_name = options.has_entity_name;
                entry.entity_category = options.entity_category;
                entry.original_device_class = options.original_device_class.clone();
                entry.unit_of_measurement = options.unit_of_measurement.clone();
            });
            if let Ok(entry) = refreshed {
                debug!(entity_id = %entry.entity_id, "Found existing entity");
                return entry;
            }
        }

        let entity_id = self.generate_entity_id(domain, suggested_object_id, reserved);
        let now = Utc::now();
        let entry = Arc::new(EntityEntry {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.clone(),
            unique_id: unique_id.to_string(),
            platform: platform.to_string(),
            device_id: options.device_id,
            config_entry_id: options.config_entry_id,
            name: None,
            original_name: options.original_name,
            has_entity_name: options.has_entity_name,
            entity_category: options.entity_category,
            original_device_class: options.original_device_class,
            unit_of_measurement: options.unit_of_measurement,
            disabled_by: options.disabled_by,
            created_at: now,
            modified_at: now,
        });
        self.index_entry(Arc::clone(&entry));

        info!(entity_id = %entity_id, platform, "Registered new entity");
        entry
    }

    /// Apply `f` to a copy of the entry and store the result
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let current = self
            .get(entity_id)
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.to_string()))?;

        let mut entry = (*current).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        self.unindex_entry(&current);
        let updated = Arc::new(entry);
        self.index_entry(Arc::clone(&updated));
        Ok(updated)
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let entry = self.get(entity_id)?;
        self.unindex_entry(&entry);
        info!(entity_id, "Removed entity");
        Some(entry)
    }

    /// Remove every entity that belongs to a config entry
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        let removed: Vec<_> = self
            .entries_for_config_entry(config_entry_id)
            .into_iter()
            .filter_map(|entry| self.remove(&entry.entity_id))
            .collect();
        self.by_config_entry_id.remove(config_entry_id);
        removed
    }

    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entity_id)
    }

    /// First free entity id for a domain and object id
    ///
    /// Tries `<domain>.<object_id>`, then `_2`, `_3` and so on.
    pub fn generate_entity_id(
        &self,
        domain: &str,
        suggested_object_id: &str,
        reserved: &[String],
    ) -> String {
        let preferred = format!("{}.{}", domain, suggested_object_id);
        let is_free = |candidate: &str| {
            !self.is_registered(candidate) && !reserved.iter().any(|r| r == candidate)
        };

        if is_free(&preferred) {
            return preferred;
        }
        (2..)
            .map(|n| format!("{}_{}", preferred, n))
            .find(|candidate| is_free(candidate))
            .unwrap_or(preferred)
    }

    pub fn len(&self) -> usize {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in registration order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(config_entry_id: &str) -> EntityOptions {
        EntityOptions {
            config_entry_id: Some(config_entry_id.to_string()),
            original_name: Some("Active power".to_string()),
            has_entity_name: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Storage::new(temp_dir.path()));

        let first = registry.get_or_create(
            "sensor",
            "homewizard",
            "HWE-P1_abc_active_power_w",
            "p1_meter_active_power",
            options("entry1"),
            &[],
        );
        assert_eq!(first.entity_id, "sensor.p1_meter_active_power");

        let again = registry.get_or_create(
            "sensor",
            "homewizard",
            "HWE-P1_abc_active_power_w",
            "something_else",
            options("entry1"),
            &[],
        );
        assert_eq!(again.entity_id, first.entity_id);
        assert_eq!(again.id, first.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_ids_get_suffixes() {
        let temp_dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Storage::new(temp_dir.path()));

        let a = registry.get_or_create("sensor", "ecobee", "a", "temperature", options("e"), &[]);
        let b = registry.get_or_create("sensor", "ecobee", "b", "temperature", options("e"), &[]);
        let c = registry.get_or_create(
            "sensor",
            "ecobee",
            "c",
            "temperature",
            options("e"),
            &["sensor.temperature_3".to_string()],
        );

        assert_eq!(a.entity_id, "sensor.temperature");
        assert_eq!(b.entity_id, "sensor.temperature_2");
        assert_eq!(c.entity_id, "sensor.temperature_4");
    }

    #[test]
    fn test_same_unique_id_on_other_platform_is_separate() {
        let temp_dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Storage::new(temp_dir.path()));

        registry.get_or_create("sensor", "ecobee", "uid", "x", options("e"), &[]);
        registry.get_or_create("sensor", "homewizard", "uid", "x", options("e"), &[]);
        registry.get_or_create("switch", "homewizard", "uid", "x", options("e"), &[]);
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get_entity_id("sensor", "homewizard", "uid").as_deref(),
            Some("sensor.x_2")
        );
    }

    #[test]
    fn test_clear_config_entry() {
        let temp_dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Storage::new(temp_dir.path()));

        registry.get_or_create("sensor", "ecobee", "a", "a", options("one"), &[]);
        registry.get_or_create("sensor", "ecobee", "b", "b", options("one"), &[]);
        registry.get_or_create("sensor", "ecobee", "c", "c", options("two"), &[]);

        assert_eq!(registry.entries_for_config_entry("one").len(), 2);
        assert_eq!(registry.clear_config_entry("one").len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_entity_id("sensor", "ecobee", "a").is_none());
    }

    #[test]
    fn test_update_keeps_indexes() {
        let temp_dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Storage::new(temp_dir.path()));
        registry.get_or_create("sensor", "ecobee", "a", "a", options("one"), &[]);

        let updated = registry
            .update("sensor.a", |e| e.disabled_by = Some(DisabledBy::User))
            .unwrap();
        assert!(updated.is_disabled());
        assert_eq!(registry.entries_for_config_entry("one").len(), 1);
        assert!(registry.update("sensor.missing", |_| {}).is_err());
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Storage::new(temp_dir.path()));
        registry.get_or_create("sensor", "ecobee", "a", "hallway", options("one"), &[]);
        registry.save().await.unwrap();

        let reloaded = EntityRegistry::new(Storage::new(temp_dir.path()));
        reloaded.load().await.unwrap();
        assert_eq!(
            reloaded.get_entity_id("sensor", "ecobee", "a").as_deref(),
            Some("sensor.hallway")
        );
        assert_eq!(reloaded.entries_for_config_entry("one").len(), 1);
    }
}
