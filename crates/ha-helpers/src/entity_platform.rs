//! Adds an integration's entities to the running system
//!
//! One [`EntityPlatform`] exists per (integration, platform, config entry).
//! It registers devices and entities, picks entity ids, writes states and
//! polls the entities that ask for it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ha_core::{
    slugify, Context, EntityId, EntityIdError, Platform, ServiceCall, State, StateError,
    STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use ha_registries::{DisabledBy, EntityOptions};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::entity::{friendly_name, Attributes, EntityHandle, PlatformEntity, StateValue};
use crate::hass::Hass;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    InvalidEntityId(#[from] EntityIdError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{platform} entity given to the {expected} platform")]
    WrongPlatform { platform: Platform, expected: Platform },

    #[error("invalid platform config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Setup(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An entity that has been added and owns an entity id
pub struct LiveEntity {
    entity: PlatformEntity,
    entity_id: EntityId,
    platform_name: String,
    config_entry_id: Option<String>,
    unique_id: Option<String>,
    friendly_name: Option<String>,
    last_pressed: Mutex<Option<DateTime<Utc>>>,
    hass: Hass,
}

impl LiveEntity {
    pub fn entity(&self) -> &PlatformEntity {
        &self.entity
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Integration that provides the entity
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn config_entry_id(&self) -> Option<&str> {
        self.config_entry_id.as_deref()
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    pub(crate) fn mark_pressed(&self) {
        *lock(&self.last_pressed) = Some(Utc::now());
    }

    /// State string and attributes as they would be written now
    pub fn calculate_state(&self) -> (String, Attributes) {
        let mut attrs = self.entity.capability_attributes();
        let state = if !self.entity.available() {
            STATE_UNAVAILABLE.to_string()
        } else {
            attrs.extend(self.entity.state_attributes());
            attrs.extend(self.entity.extra_state_attributes());
            let value = match &self.entity {
                PlatformEntity::Button(_) => (*lock(&self.last_pressed)).map(StateValue::from),
                entity => entity.state(),
            };
            value
                .map(|v| v.to_string())
                .unwrap_or_else(|| STATE_UNKNOWN.to_string())
        };
        attrs.extend(self.entity.static_attributes(self.friendly_name()));
        (state, attrs)
    }

    pub fn write_state(&self) -> Result<State, StateError> {
        let (state, attrs) = self.calculate_state();
        self.hass
            .states
            .set(self.entity_id.clone(), state, attrs, Context::new())
    }
}

/// Every live entity by entity id, across platforms
#[derive(Default)]
pub struct EntityIndex {
    entities: DashMap<String, Arc<LiveEntity>>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<LiveEntity>> {
        self.entities.get(entity_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn domain_entities(&self, platform: Platform) -> Vec<Arc<LiveEntity>> {
        let mut entities: Vec<_> = self
            .entities
            .iter()
            .filter(|e| e.entity.platform() == platform)
            .map(|e| e.value().clone())
            .collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        entities
    }

    /// Entities of `platform` a service call targets; `entity_id: all`
    /// selects all of them
    pub fn targets(&self, call: &ServiceCall, platform: Platform) -> Vec<Arc<LiveEntity>> {
        if call.targets_all() {
            return self.domain_entities(platform);
        }
        call.entity_ids()
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|e| e.entity.platform() == platform)
            .collect()
    }

    fn insert(&self, entity: Arc<LiveEntity>) {
        self.entities.insert(entity.entity_id.to_string(), entity);
    }

    fn remove(&self, entity_id: &str) -> Option<Arc<LiveEntity>> {
        self.entities.remove(entity_id).map(|(_, e)| e)
    }
}

pub struct EntityPlatform {
    hass: Hass,
    domain: Platform,
    platform_name: String,
    config_entry_id: Option<String>,
    scan_interval: Duration,
    entity_ids: Mutex<Vec<String>>,
    polled: Mutex<Vec<Arc<LiveEntity>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl EntityPlatform {
    pub fn new(
        hass: Hass,
        domain: Platform,
        platform_name: impl Into<String>,
        config_entry_id: Option<String>,
    ) -> Self {
        Self {
            hass,
            domain,
            platform_name: platform_name.into(),
            config_entry_id,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            entity_ids: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
            poll_task: Mutex::new(None),
        }
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn domain(&self) -> Platform {
        self.domain
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn config_entry_id(&self) -> Option<&str> {
        self.config_entry_id.as_deref()
    }

    pub fn hass(&self) -> &Hass {
        &self.hass
    }

    pub fn entity_ids(&self) -> Vec<String> {
        lock(&self.entity_ids).clone()
    }

    /// Register, name and write the first state of each entity
    ///
    /// Entities disabled in the entity registry are skipped. Returns the
    /// entity ids that were added.
    #[instrument(skip(self, entities), fields(platform = %self.platform_name, domain = %self.domain))]
    pub async fn add_entities(
        &self,
        entities: Vec<PlatformEntity>,
    ) -> Result<Vec<EntityId>, PlatformError> {
        let mut added = Vec::with_capacity(entities.len());
        let mut polled = Vec::new();

        for entity in entities {
            if entity.platform() != self.domain {
                return Err(PlatformError::WrongPlatform {
                    platform: entity.platform(),
                    expected: self.domain,
                });
            }
            let Some(live) = self.register(entity)? else {
                continue;
            };

            self.hass.entities.insert(live.clone());
            lock(&self.entity_ids).push(live.entity_id.to_string());

            let handle = EntityHandle::new(live.entity_id.clone(), Arc::downgrade(&live));
            live.entity.added_to_hass(handle).await;
            live.write_state()?;

            if live.entity.should_poll() {
                polled.push(live.clone());
            }
            added.push(live.entity_id.clone());
        }

        if !polled.is_empty() {
            lock(&self.polled).extend(polled);
            self.start_polling();
        }
        debug!(count = added.len(), "Added entities");
        Ok(added)
    }

    fn register(&self, entity: PlatformEntity) -> Result<Option<Arc<LiveEntity>>, PlatformError> {
        let registries = &self.hass.registries;
        let domain = self.domain.as_str();

        let device = match (&self.config_entry_id, entity.device_info()) {
            (Some(entry_id), Some(info)) => Some(registries.devices.get_or_create(entry_id, &info)),
            _ => None,
        };
        let device_name = device
            .as_ref()
            .map(|d| d.display_name().to_string())
            .filter(|n| !n.is_empty());

        let entity_name = entity.name();
        let mut name = friendly_name(
            entity_name.as_deref(),
            entity.has_entity_name(),
            device_name.as_deref(),
        );
        let suggested_object_id = slugify(name.as_deref().unwrap_or(&self.platform_name));
        let reserved = self.reserved_entity_ids();

        let entity_id = match entity.unique_id() {
            Some(unique_id) => {
                let entry = registries.entities.get_or_create(
                    domain,
                    &self.platform_name,
                    &unique_id,
                    &suggested_object_id,
                    EntityOptions {
                        config_entry_id: self.config_entry_id.clone(),
                        device_id: device.as_ref().map(|d| d.id.clone()),
                        original_name: entity_name.clone(),
                        has_entity_name: entity.has_entity_name(),
                        entity_category: entity.entity_category(),
                        original_device_class: entity.device_class(),
                        unit_of_measurement: entity.unit_of_measurement(),
                        disabled_by: (!entity.entity_registry_enabled_default())
                            .then_some(DisabledBy::Integration),
                    },
                    &reserved,
                );
                if entry.is_disabled() {
                    debug!(entity_id = %entry.entity_id, "Not adding disabled entity");
                    return Ok(None);
                }
                if let Some(user_name) = &entry.name {
                    name = Some(user_name.clone());
                }
                entry.entity_id.clone()
            }
            None => registries
                .entities
                .generate_entity_id(domain, &suggested_object_id, &reserved),
        };

        let entity_id: EntityId = entity_id.parse()?;

        Ok(Some(Arc::new(LiveEntity {
            unique_id: entity.unique_id(),
            entity,
            entity_id,
            platform_name: self.platform_name.clone(),
            config_entry_id: self.config_entry_id.clone(),
            friendly_name: name,
            last_pressed: Mutex::new(None),
            hass: self.hass.clone(),
        })))
    }

    /// Ids already in use by a state or a live entity of this domain
    fn reserved_entity_ids(&self) -> Vec<String> {
        let mut reserved: HashSet<String> =
            self.hass.states.entity_ids(self.domain.as_str()).into_iter().collect();
        reserved.extend(
            self.hass
                .entities
                .domain_entities(self.domain)
                .iter()
                .map(|e| e.entity_id.to_string()),
        );
        reserved.into_iter().collect()
    }

    fn start_polling(&self) {
        let entities = lock(&self.polled).clone();
        let scan_interval = self.scan_interval;
        let platform_name = self.platform_name.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!(platform = %platform_name, count = entities.len(), "Polling entities");
                for live in &entities {
                    live.entity.update().await;
                    let _ = EntityHandle::new(live.entity_id.clone(), Arc::downgrade(live))
                        .write_state();
                }
            }
        });

        if let Some(previous) = lock(&self.poll_task).replace(task) {
            previous.abort();
        }
    }

    /// Remove every entity of this platform and their states
    pub async fn remove_all(&self) {
        if let Some(task) = lock(&self.poll_task).take() {
            task.abort();
        }
        lock(&self.polled).clear();

        let entity_ids = std::mem::take(&mut *lock(&self.entity_ids));
        for entity_id in &entity_ids {
            if let Some(live) = self.hass.entities.remove(entity_id) {
                live.entity.will_remove().await;
                self.hass.states.remove(&live.entity_id, Context::new());
            }
        }
        info!(
            platform = %self.platform_name,
            domain = %self.domain,
            count = entity_ids.len(),
            "Removed entities"
        );
    }
}

impl Drop for EntityPlatform {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.poll_task).take() {
            task.abort();
        }
    }
}
