//! Glue between an integration and the config entry lifecycle
//!
//! An [`Integration`] states what it needs to set up an entry and which
//! platforms it provides. [`IntegrationHandler`] plugs it into
//! [`ConfigEntries`]: it runs the integration's entry setup, creates one
//! [`EntityPlatform`] per platform, and tears all of it down on unload.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ha_config_entries::{ConfigEntries, ConfigEntry, EntryHandler, FlowFactory, SetupError};
use ha_core::Platform;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::entity_platform::{EntityPlatform, PlatformError};
use crate::hass::Hass;

/// Per-entry objects an integration keeps while the entry is loaded,
/// usually its API client and coordinator
#[derive(Default)]
pub struct RuntimeData {
    data: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl RuntimeData {
    pub fn insert<T: Any + Send + Sync>(&self, entry_id: &str, value: Arc<T>) {
        self.data.insert(entry_id.to_string(), value);
    }

    /// `None` when nothing or something of another type is stored
    pub fn get<T: Any + Send + Sync>(&self, entry_id: &str) -> Option<Arc<T>> {
        let value = self.data.get(entry_id).map(|v| v.value().clone())?;
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, entry_id: &str) -> bool {
        self.data.remove(entry_id).is_some()
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.data.contains_key(entry_id)
    }
}

/// Everything an integration sees while setting up or unloading an entry
pub struct EntrySetup<'a> {
    pub hass: &'a Hass,
    pub entries: &'a Arc<ConfigEntries>,
    pub entry: &'a ConfigEntry,
    pub runtime: &'a RuntimeData,
}

impl EntrySetup<'_> {
    pub fn entry_id(&self) -> &str {
        &self.entry.entry_id
    }

    /// Runtime data stored for this entry by `setup_entry`
    pub fn runtime_data<T: Any + Send + Sync>(&self) -> Result<Arc<T>, SetupError> {
        self.runtime.get(&self.entry.entry_id).ok_or_else(|| {
            SetupError::Failed(format!(
                "no runtime data for {} entry {}",
                self.entry.domain, self.entry.entry_id
            ))
        })
    }
}

#[async_trait]
pub trait Integration: Send + Sync {
    fn domain(&self) -> &'static str;

    /// Platforms set up for every entry, after `setup_entry`
    fn platforms(&self) -> &'static [Platform] {
        &[]
    }

    fn config_flow(&self) -> Option<FlowFactory> {
        None
    }

    fn entry_version(&self) -> u32 {
        1
    }

    /// Domain-wide setup, once at startup; the place to register services
    async fn setup(&self, _hass: &Hass) -> Result<(), SetupError> {
        Ok(())
    }

    /// Connect to the device or service and store what the platforms need
    /// in the runtime data
    async fn setup_entry(&self, _setup: &EntrySetup<'_>) -> Result<(), SetupError> {
        Ok(())
    }

    /// Add the entities of one platform for a loaded entry
    async fn setup_platform_entry(
        &self,
        _setup: &EntrySetup<'_>,
        _entities: &EntityPlatform,
    ) -> Result<(), SetupError> {
        Ok(())
    }

    /// Runs before the platforms are unloaded; `Ok(false)` keeps them
    async fn unload_entry(&self, _setup: &EntrySetup<'_>) -> Result<bool, SetupError> {
        Ok(true)
    }

    async fn remove_entry(&self, _hass: &Hass, _entry: &ConfigEntry) {}

    /// Set up a platform configured in YAML, e.g. `sensor: - platform: statistics`
    async fn setup_platform(
        &self,
        _hass: &Hass,
        _config: &Value,
        entities: &EntityPlatform,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::InvalidConfig(format!(
            "{} has no {} platform",
            self.domain(),
            entities.domain()
        )))
    }
}

pub struct IntegrationHandler {
    hass: Hass,
    integration: Arc<dyn Integration>,
    runtime: RuntimeData,
    platforms: DashMap<String, Vec<Arc<EntityPlatform>>>,
}

impl IntegrationHandler {
    pub fn new(hass: Hass, integration: Arc<dyn Integration>) -> Self {
        Self {
            hass,
            integration,
            runtime: RuntimeData::default(),
            platforms: DashMap::new(),
        }
    }

    /// Run the domain setup and register entry handler and config flow
    pub async fn register(
        hass: &Hass,
        entries: &Arc<ConfigEntries>,
        integration: Arc<dyn Integration>,
    ) -> Result<Arc<Self>, SetupError> {
        let domain = integration.domain();
        integration.setup(hass).await?;

        let handler = Arc::new(Self::new(hass.clone(), integration.clone()));
        entries.register_handler(domain, handler.clone());
        if let Some(factory) = integration.config_flow() {
            entries.register_flow(domain, factory);
        }
        info!(domain, "Registered integration");
        Ok(handler)
    }

    pub fn domain(&self) -> &'static str {
        self.integration.domain()
    }

    pub fn integration(&self) -> &Arc<dyn Integration> {
        &self.integration
    }

    pub fn runtime(&self) -> &RuntimeData {
        &self.runtime
    }

    /// Entity platforms currently loaded for an entry
    pub fn entry_platforms(&self, entry_id: &str) -> Vec<Arc<EntityPlatform>> {
        self.platforms
            .get(entry_id)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    fn setup_context<'a>(
        &'a self,
        entries: &'a Arc<ConfigEntries>,
        entry: &'a ConfigEntry,
    ) -> EntrySetup<'a> {
        EntrySetup {
            hass: &self.hass,
            entries,
            entry,
            runtime: &self.runtime,
        }
    }

    /// Create an entity platform per platform and let the integration fill it
    pub async fn forward_entry_setups(
        &self,
        setup: &EntrySetup<'_>,
        platforms: &[Platform],
    ) -> Result<(), SetupError> {
        for &platform in platforms {
            let entities = Arc::new(EntityPlatform::new(
                self.hass.clone(),
                platform,
                self.domain(),
                Some(setup.entry.entry_id.clone()),
            ));
            // Track before filling so a failure still unloads what was added
            self.platforms
                .entry(setup.entry.entry_id.clone())
                .or_default()
                .push(entities.clone());
            self.integration
                .setup_platform_entry(setup, &entities)
                .await?;
            debug!(domain = self.domain(), %platform, "Set up platform");
        }
        Ok(())
    }

    /// Remove the entities of every platform of an entry
    pub async fn unload_platforms(&self, entry_id: &str) {
        let Some((_, platforms)) = self.platforms.remove(entry_id) else {
            return;
        };
        for platform in platforms {
            platform.remove_all().await;
        }
    }

    /// Set up a platform listed in the YAML configuration
    pub async fn setup_yaml_platform(
        &self,
        platform: Platform,
        config: &Value,
    ) -> Result<Arc<EntityPlatform>, PlatformError> {
        let entities = Arc::new(EntityPlatform::new(
            self.hass.clone(),
            platform,
            self.domain(),
            None,
        ));
        self.integration
            .setup_platform(&self.hass, config, &entities)
            .await?;
        info!(domain = self.domain(), %platform, "Set up YAML platform");
        Ok(entities)
    }
}

#[async_trait]
impl EntryHandler for IntegrationHandler {
    fn version(&self) -> u32 {
        self.integration.entry_version()
    }

    async fn setup_entry(
        &self,
        entries: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<(), SetupError> {
        let setup = self.setup_context(entries, entry);
        self.integration.setup_entry(&setup).await?;

        if let Err(err) = self
            .forward_entry_setups(&setup, self.integration.platforms())
            .await
        {
            warn!(domain = self.domain(), entry_id = %entry.entry_id, %err, "Platform setup failed");
            self.unload_platforms(&entry.entry_id).await;
            self.runtime.remove(&entry.entry_id);
            return Err(err);
        }
        Ok(())
    }

    async fn unload_entry(
        &self,
        entries: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<bool, SetupError> {
        let setup = self.setup_context(entries, entry);
        if !self.integration.unload_entry(&setup).await? {
            return Ok(false);
        }
        self.unload_platforms(&entry.entry_id).await;
        self.runtime.remove(&entry.entry_id);
        Ok(true)
    }

    async fn remove_entry(&self, entry: &ConfigEntry) {
        self.hass.registries.remove_config_entry(&entry.entry_id);
        if let Err(err) = self.hass.registries.save_all().await {
            warn!(entry_id = %entry.entry_id, %err, "Could not save registries");
        }
        self.integration.remove_entry(&self.hass, entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, PlatformEntity, SensorEntity, StateValue};
    use ha_config_entries::ConfigEntryState;
    use ha_registries::Storage;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Reading(f64);

    impl Entity for Reading {
        fn unique_id(&self) -> Option<String> {
            Some("reading".into())
        }

        fn name(&self) -> Option<String> {
            Some("Reading".into())
        }
    }

    impl SensorEntity for Reading {
        fn native_value(&self) -> Option<StateValue> {
            Some(self.0.into())
        }
    }

    /// Stores the entry's `value` as runtime data and exposes it as a sensor
    #[derive(Default)]
    struct Demo {
        unloaded: AtomicBool,
        removed: AtomicBool,
    }

    #[async_trait]
    impl Integration for Demo {
        fn domain(&self) -> &'static str {
            "demo"
        }

        fn platforms(&self) -> &'static [Platform] {
            &[Platform::Sensor]
        }

        async fn setup_entry(&self, setup: &EntrySetup<'_>) -> Result<(), SetupError> {
            let value = setup
                .entry
                .data
                .get("value")
                .and_then(Value::as_f64)
                .ok_or_else(|| SetupError::NotReady("no value yet".into()))?;
            setup.runtime.insert(setup.entry_id(), Arc::new(value));
            Ok(())
        }

        async fn setup_platform_entry(
            &self,
            setup: &EntrySetup<'_>,
            entities: &EntityPlatform,
        ) -> Result<(), SetupError> {
            let value = setup.runtime_data::<f64>()?;
            entities
                .add_entities(vec![PlatformEntity::sensor(Reading(*value))])
                .await
                .map_err(|e| SetupError::Failed(e.to_string()))?;
            Ok(())
        }

        async fn unload_entry(&self, _setup: &EntrySetup<'_>) -> Result<bool, SetupError> {
            self.unloaded.store(true, Ordering::SeqCst);
            Ok(true)
        }

        async fn remove_entry(&self, _hass: &Hass, _entry: &ConfigEntry) {
            self.removed.store(true, Ordering::SeqCst);
        }
    }

    async fn setup(dir: &TempDir) -> (Hass, Arc<ConfigEntries>, Arc<Demo>, Arc<IntegrationHandler>) {
        let hass = Hass::new(dir.path());
        let entries = Arc::new(ConfigEntries::new(Storage::new(dir.path())));
        let demo = Arc::new(Demo::default());
        let handler = IntegrationHandler::register(&hass, &entries, demo.clone())
            .await
            .unwrap();
        (hass, entries, demo, handler)
    }

    #[test]
    fn test_runtime_data_is_typed() {
        let runtime = RuntimeData::default();
        runtime.insert("e1", Arc::new(42_u32));
        assert_eq!(runtime.get::<u32>("e1").as_deref(), Some(&42));
        assert!(runtime.get::<String>("e1").is_none());
        assert!(runtime.remove("e1"));
        assert!(!runtime.contains("e1"));
    }

    #[tokio::test]
    async fn test_setup_and_unload_entry() {
        let dir = TempDir::new().unwrap();
        let (hass, entries, demo, handler) = setup(&dir).await;
        assert!(entries.has_handler("demo"));

        let entry = ConfigEntry::new("demo", "Demo").with_data([("value".to_string(), json!(3.5))].into());
        let entry_id = entry.entry_id.clone();
        entries.add(entry).await.unwrap();

        assert!(entries.setup(&entry_id).await.unwrap());
        assert_eq!(hass.states.get_state("sensor.reading").as_deref(), Some("3.5"));
        assert_eq!(handler.entry_platforms(&entry_id).len(), 1);
        let registered = hass.registries.entities.get("sensor.reading").unwrap();
        assert_eq!(registered.config_entry_id.as_deref(), Some(entry_id.as_str()));

        assert!(entries.unload(&entry_id).await.unwrap());
        assert!(demo.unloaded.load(Ordering::SeqCst));
        assert!(hass.states.get("sensor.reading").is_none());
        assert!(!handler.runtime().contains(&entry_id));

        entries.remove(&entry_id).await.unwrap();
        assert!(demo.removed.load(Ordering::SeqCst));
        assert!(hass.registries.entities.get("sensor.reading").is_none());
    }

    #[tokio::test]
    async fn test_not_ready_entry_keeps_nothing() {
        let dir = TempDir::new().unwrap();
        let (hass, entries, _demo, handler) = setup(&dir).await;

        let entry = ConfigEntry::new("demo", "Demo");
        let entry_id = entry.entry_id.clone();
        entries.add(entry).await.unwrap();

        assert!(!entries.setup(&entry_id).await.unwrap());
        assert_eq!(entries.state(&entry_id), Some(ConfigEntryState::SetupRetry));
        assert!(handler.entry_platforms(&entry_id).is_empty());
        assert_eq!(hass.states.entity_count(), 0);
        entries.remove(&entry_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_yaml_platform_unsupported_by_default() {
        let dir = TempDir::new().unwrap();
        let (_hass, _entries, _demo, handler) = setup(&dir).await;
        let result = handler
            .setup_yaml_platform(Platform::Sensor, &json!({"platform": "demo"}))
            .await;
        assert!(matches!(result, Err(PlatformError::InvalidConfig(_))));
    }
}
