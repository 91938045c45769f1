use std::path::{Path, PathBuf};
use std::sync::Arc;

use ha_event_bus::EventBus;
use ha_registries::{Registries, Storage};
use ha_service_registry::ServiceRegistry;
use ha_state_store::StateStore;

use crate::entity_platform::EntityIndex;

/// Handle to the running system that integrations work against
///
/// Cheap to clone; every clone shares the same bus, states and registries.
#[derive(Clone)]
pub struct Hass {
    pub bus: Arc<EventBus>,
    pub states: Arc<StateStore>,
    pub services: Arc<ServiceRegistry>,
    pub registries: Arc<Registries>,
    pub entities: Arc<EntityIndex>,
    /// Shared HTTP client for vendor APIs
    pub http: reqwest::Client,
    config_dir: PathBuf,
}

impl Hass {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let bus = Arc::new(EventBus::new());
        Self {
            states: Arc::new(StateStore::new(bus.clone())),
            services: Arc::new(ServiceRegistry::with_bus(bus.clone())),
            registries: Arc::new(Registries::new(&config_dir)),
            entities: Arc::new(EntityIndex::new()),
            http: reqwest::Client::new(),
            bus,
            config_dir,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn storage(&self) -> Storage {
        Storage::new(&self.config_dir)
    }
}
