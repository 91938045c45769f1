//! Device Registry
//!
//! Groups entities under the physical or cloud device they belong to. A
//! device is found again by any of its identifiers or connections, so two
//! config entries reporting the same hardware share one device.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult, Store};

pub const STORAGE_KEY: &str = "core.device_registry";
/// Connection type for MAC addresses
pub const CONNECTION_NETWORK_MAC: &str = "mac";

/// `(domain, id)` pair identifying a device within an integration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// `(type, id)` pair such as a MAC address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    /// Connection with MAC addresses normalised to `aa:bb:cc:dd:ee:ff`
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        let conn_type = conn_type.into();
        let id = id.into();
        let id = if conn_type == CONNECTION_NETWORK_MAC {
            format_mac(&id)
        } else {
            id
        };
        Self(conn_type, id)
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// Lowercase colon separated form of a MAC address
///
/// Accepts colon, dash or dot separated forms and bare hex. Anything else is
/// returned unchanged.
pub fn format_mac(mac: &str) -> String {
    let count = |sep: char| mac.chars().filter(|c| *c == sep).count();

    let hex: String = match mac.len() {
        17 if count(':') == 5 => return mac.to_lowercase(),
        17 if count('-') == 5 => mac.replace('-', ""),
        14 if count('.') == 2 => mac.replace('.', ""),
        12 if mac.chars().all(|c| c.is_ascii_hexdigit()) => mac.to_string(),
        _ => return mac.to_string(),
    };

    let hex = hex.to_lowercase();
    hex.as_bytes()
        .chunks(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .collect::<Vec<_>>()
        .join(":")
}

/// Device description reported by an integration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub identifiers: Vec<DeviceIdentifier>,
    pub connections: Vec<DeviceConnection>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,
    #[serde(default)]
    pub connections: Vec<DeviceConnection>,
    #[serde(default)]
    pub config_entries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_by_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    /// Name set by the user, otherwise the reported name
    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    /// Merge a fresh report into this entry, returning whether anything changed
    fn merge(&mut self, config_entry_id: &str, info: &DeviceInfo) -> bool {
        let mut changed = false;

        if !self.config_entries.iter().any(|id| id == config_entry_id) {
            self.config_entries.push(config_entry_id.to_string());
            changed = true;
        }
        for identifier in &info.identifiers {
            if !self.identifiers.contains(identifier) {
                self.identifiers.push(identifier.clone());
                changed = true;
            }
        }
        for connection in &info.connections {
            if !self.connections.contains(connection) {
                self.connections.push(connection.clone());
                changed = true;
            }
        }

        let fields = [
            (&mut self.name, &info.name),
            (&mut self.manufacturer, &info.manufacturer),
            (&mut self.model, &info.model),
            (&mut self.sw_version, &info.sw_version),
            (&mut self.hw_version, &info.hw_version),
            (&mut self.serial_number, &info.serial_number),
        ];
        for (current, reported) in fields {
            if reported.is_some() && current != reported {
                current.clone_from(reported);
                changed = true;
            }
        }

        changed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = 1;
}

/// Devices keyed by id and by each identifier and connection
pub struct DeviceRegistry {
    store: Store<DeviceRegistryData>,
    by_id: DashMap<String, Arc<DeviceEntry>>,
    /// identifier or connection key -> device_id
    by_key: DashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            store: Store::new(storage),
            by_id: DashMap::new(),
            by_key: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.store.load().await? {
            info!(count = data.devices.len(), "Loading device registry");
            for device in data.devices {
                self.index_entry(Arc::new(device));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> = self.iter().iter().map(|d| (**d).clone()).collect();
        devices.sort_by_key(|d| d.created_at);
        self.store.save(&DeviceRegistryData { devices }).await
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        for key in Self::keys(&entry) {
            self.by_key.insert(key, entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn keys(entry: &DeviceEntry) -> impl Iterator<Item = String> + '_ {
        let identifiers = entry.identifiers.iter().map(|i| format!("id:{}", i.key()));
        let connections = entry.connections.iter().map(|c| format!("conn:{}", c.key()));
        identifiers.chain(connections)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|d| Arc::clone(&d))
    }

    /// Device matching any identifier or connection of `info`
    pub fn find(&self, info: &DeviceInfo) -> Option<Arc<DeviceEntry>> {
        let identifiers = info.identifiers.iter().map(|i| format!("id:{}", i.key()));
        let connections = info.connections.iter().map(|c| format!("conn:{}", c.key()));
        identifiers
            .chain(connections)
            .find_map(|key| self.by_key.get(&key).map(|id| id.clone()))
            .and_then(|id| self.get(&id))
    }

    pub fn devices_for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_id
            .iter()
            .filter(|d| d.config_entries.iter().any(|id| id == config_entry_id))
            .map(|d| Arc::clone(d.value()))
            .collect()
    }

    /// Find the device described by `info` or register a new one
    ///
    /// A found device gains the config entry and any new identifiers or
    /// connections, and takes over reported name, model and versions.
    pub fn get_or_create(&self, config_entry_id: &str, info: &DeviceInfo) -> Arc<DeviceEntry> {
        if let Some(existing) = self.find(info) {
            let mut entry = (*existing).clone();
            if !entry.merge(config_entry_id, info) {
                return existing;
            }
            entry.modified_at = Utc::now();
            debug!(device_id = %entry.id, "Updated device");
            let entry = Arc::new(entry);
            self.index_entry(Arc::clone(&entry));
            return entry;
        }

        let now = Utc::now();
        let mut entry = DeviceEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            connections: Vec::new(),
            config_entries: Vec::new(),
            name: None,
            name_by_user: None,
            manufacturer: None,
            model: None,
            sw_version: None,
            hw_version: None,
            serial_number: None,
            created_at: now,
            modified_at: now,
        };
        entry.merge(config_entry_id, info);

        info!(device_id = %entry.id, name = ?entry.name, "Registered new device");
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        entry
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let (_, entry) = self.by_id.remove(device_id)?;
        for key in Self::keys(&entry) {
            self.by_key.remove(&key);
        }
        info!(device_id, "Removed device");
        Some(entry)
    }

    /// Detach a config entry from its devices, removing devices left without one
    ///
    /// Returns the ids of the removed devices.
    pub fn remove_config_entry(&self, config_entry_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for device in self.devices_for_config_entry(config_entry_id) {
            if device.config_entries.len() <= 1 {
                if self.remove(&device.id).is_some() {
                    removed.push(device.id.clone());
                }
                continue;
            }
            let mut entry = (*device).clone();
            entry.config_entries.retain(|id| id != config_entry_id);
            entry.modified_at = Utc::now();
            self.index_entry(Arc::new(entry));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> Vec<Arc<DeviceEntry>> {
        self.by_id.iter().map(|d| Arc::clone(d.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p1_meter() -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![DeviceIdentifier::new("homewizard", "3c39e7aabbcc")],
            connections: vec![DeviceConnection::new(CONNECTION_NETWORK_MAC, "3C39E7AABBCC")],
            name: Some("P1 meter".to_string()),
            manufacturer: Some("HomeWizard".to_string()),
            model: Some("HWE-P1".to_string()),
            sw_version: Some("4.19".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac("AA:BB:CC:DD:EE:FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("aabb.ccdd.eeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AABBCCDDEEFF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("not-a-mac"), "not-a-mac");
    }

    #[test]
    fn test_get_or_create_merges() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(Storage::new(temp_dir.path()));

        let first = registry.get_or_create("entry1", &p1_meter());
        assert_eq!(first.connections[0].1, "3c:39:e7:aa:bb:cc");

        let mut upgraded = p1_meter();
        upgraded.identifiers.clear();
        upgraded.sw_version = Some("5.0".to_string());
        let second = registry.get_or_create("entry2", &upgraded);

        assert_eq!(second.id, first.id);
        assert_eq!(second.sw_version.as_deref(), Some("5.0"));
        assert_eq!(second.config_entries, vec!["entry1", "entry2"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unchanged_report_returns_same_entry() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(Storage::new(temp_dir.path()));

        let first = registry.get_or_create("entry1", &p1_meter());
        let again = registry.get_or_create("entry1", &p1_meter());
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_remove_config_entry_drops_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(Storage::new(temp_dir.path()));

        let shared = registry.get_or_create("entry1", &p1_meter());
        registry.get_or_create("entry2", &p1_meter());
        let own = registry.get_or_create(
            "entry1",
            &DeviceInfo {
                identifiers: vec![DeviceIdentifier::new("ecobee", "511863")],
                name: Some("Hallway".to_string()),
                ..Default::default()
            },
        );

        let removed = registry.remove_config_entry("entry1");
        assert_eq!(removed, vec![own.id.clone()]);
        assert_eq!(registry.get(&shared.id).unwrap().config_entries, vec!["entry2"]);
        assert!(registry.find(&p1_meter()).is_some());
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(Storage::new(temp_dir.path()));
        let device = registry.get_or_create("entry1", &p1_meter());
        registry.save().await.unwrap();

        let reloaded = DeviceRegistry::new(Storage::new(temp_dir.path()));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.find(&p1_meter()).unwrap().id, device.id);
        assert_eq!(reloaded.get(&device.id).unwrap().display_name(), "P1 meter");
    }
}
