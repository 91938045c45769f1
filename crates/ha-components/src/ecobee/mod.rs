//! ecobee thermostats through the ecobee cloud API
//!
//! The config flow authorises the app with a PIN and stores the tokens in
//! the entry. Every thermostat of the account becomes a climate entity, and
//! the thermostat and its remote sensors report temperature and humidity.
//! Renewed tokens are written back to the entry; when they are revoked a
//! reauth flow asks for a new PIN.

pub mod api;
pub mod climate;
pub mod config_flow;
pub mod coordinator;
pub mod entity;
pub mod sensor;

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use ha_config_entries::{ConfigEntryUpdate, ConfigFlow, FlowFactory, SetupError};
use ha_core::{Platform, SupportsResponse};
use ha_helpers::{
    entity_service_schema, register_entity_service, EntityPlatform, EntrySetup, Hass,
    Integration, LiveEntity, RuntimeData,
};
use ha_service_registry::ServiceError;
use serde_json::json;
use tracing::{debug, info, warn};

pub use api::{EcobeeClient, EcobeeError, Thermostat, Tokens, API_BASE_URL};
pub use config_flow::{EcobeeFlow, CONF_ACCESS_TOKEN, CONF_API_KEY, CONF_REFRESH_TOKEN};
pub use coordinator::{EcobeeCoordinator, EcobeeRuntime};

pub const DOMAIN: &str = "ecobee";

pub const SERVICE_RESUME_PROGRAM: &str = "resume_program";
pub const SERVICE_GET_RUNTIME: &str = "get_runtime";
const ATTR_RESUME_ALL: &str = "resume_all";

const PLATFORMS: &[Platform] = &[Platform::Climate, Platform::Sensor];

pub struct Ecobee {
    http: reqwest::Client,
    base_url: String,
    /// Loaded entries, for the services
    loaded: Arc<RuntimeData>,
}

impl Ecobee {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, API_BASE_URL)
    }

    pub fn with_base_url(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            loaded: Arc::new(RuntimeData::default()),
        }
    }
}

/// Runtime and thermostat id behind an ecobee climate entity
fn resolve(
    loaded: &RuntimeData,
    live: &LiveEntity,
) -> Option<(Arc<EcobeeRuntime>, String)> {
    if live.platform_name() != DOMAIN {
        return None;
    }
    let runtime = loaded.get::<EcobeeRuntime>(live.config_entry_id()?)?;
    Some((runtime, live.unique_id()?.to_string()))
}

fn register_services(hass: &Hass, loaded: &Arc<RuntimeData>) -> Result<(), ServiceError> {
    let runtimes = loaded.clone();
    register_entity_service(
        hass,
        DOMAIN,
        SERVICE_RESUME_PROGRAM,
        Platform::Climate,
        Some(entity_service_schema(
            json!({ "resume_all": { "type": "boolean" } }),
            &[],
        )),
        SupportsResponse::None,
        move |live, call| {
            let target = resolve(&runtimes, &live);
            async move {
                let Some((runtime, identifier)) = target else {
                    return Ok(None);
                };
                let resume_all = call.get::<bool>(ATTR_RESUME_ALL).unwrap_or(false);
                runtime
                    .client
                    .resume_program(&identifier, resume_all)
                    .await
                    .map_err(|e| ServiceError::CallFailed(e.to_string()))?;
                debug!(%identifier, resume_all, "Resumed ecobee program");
                runtime.coordinator.request_refresh().await;
                Ok(None)
            }
        },
    )?;

    let runtimes = loaded.clone();
    register_entity_service(
        hass,
        DOMAIN,
        SERVICE_GET_RUNTIME,
        Platform::Climate,
        Some(entity_service_schema(json!({}), &[])),
        SupportsResponse::Only,
        move |live, _call| {
            let target = resolve(&runtimes, &live);
            async move {
                let Some((runtime, identifier)) = target else {
                    return Ok(None);
                };
                let thermostat = runtime.thermostat(&identifier).ok_or_else(|| {
                    ServiceError::CallFailed(format!("no data for thermostat {identifier}"))
                })?;
                let response = serde_json::to_value(&thermostat.runtime)
                    .map_err(|e| ServiceError::CallFailed(e.to_string()))?;
                Ok(Some(response))
            }
        },
    )
}

#[async_trait]
impl Integration for Ecobee {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn platforms(&self) -> &'static [Platform] {
        PLATFORMS
    }

    fn config_flow(&self) -> Option<FlowFactory> {
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        Some(Arc::new(move || {
            Box::new(EcobeeFlow::new(http.clone(), &base_url)) as Box<dyn ConfigFlow>
        }))
    }

    async fn setup(&self, hass: &Hass) -> Result<(), SetupError> {
        register_services(hass, &self.loaded).map_err(|e| SetupError::Failed(e.to_string()))
    }

    async fn setup_entry(&self, setup: &EntrySetup<'_>) -> Result<(), SetupError> {
        let entry = setup.entry;
        let api_key = entry
            .data_str(CONF_API_KEY)
            .ok_or_else(|| SetupError::Failed(format!("entry has no {CONF_API_KEY}")))?
            .to_string();
        let (Some(access_token), Some(refresh_token)) = (
            entry.data_str(CONF_ACCESS_TOKEN),
            entry.data_str(CONF_REFRESH_TOKEN),
        ) else {
            return Err(SetupError::AuthFailed("entry has no tokens".into()));
        };
        let tokens = Tokens {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
        };

        // Keep renewed tokens so a restart does not need the old ones
        let entries = Arc::downgrade(setup.entries);
        let entry_id = setup.entry_id().to_string();
        let key = api_key.clone();
        let persist = Arc::new(move |tokens: Tokens| {
            let entries = entries.clone();
            let entry_id = entry_id.clone();
            let data = config_flow::entry_data(&key, &tokens);
            async move {
                let Some(entries) = entries.upgrade() else {
                    return;
                };
                if let Err(err) = entries
                    .update(&entry_id, ConfigEntryUpdate::new().data(data))
                    .await
                {
                    warn!(entry_id = %entry_id, %err, "Could not store renewed ecobee tokens");
                }
            }
            .boxed()
        });

        let client = EcobeeClient::new(setup.hass.http.clone(), &self.base_url, &api_key, tokens)
            .with_refresh_hook(persist);
        let coordinator =
            coordinator::build(client.clone(), Arc::downgrade(setup.entries), setup.entry_id());
        coordinator.first_refresh().await?;

        let count = coordinator.data().map_or(0, |thermostats| thermostats.len());
        info!(thermostats = count, "Connected to ecobee");

        let runtime = Arc::new(EcobeeRuntime {
            client,
            coordinator,
        });
        setup.runtime.insert(setup.entry_id(), runtime.clone());
        self.loaded.insert(setup.entry_id(), runtime);
        Ok(())
    }

    async fn setup_platform_entry(
        &self,
        setup: &EntrySetup<'_>,
        entities: &EntityPlatform,
    ) -> Result<(), SetupError> {
        let runtime = setup.runtime_data::<EcobeeRuntime>()?;
        let new_entities = match entities.domain() {
            Platform::Climate => climate::entities(&runtime.coordinator, &runtime.client),
            Platform::Sensor => sensor::entities(&runtime.coordinator),
            _ => Vec::new(),
        };
        debug!(platform = %entities.domain(), count = new_entities.len(), "Adding ecobee entities");
        entities
            .add_entities(new_entities)
            .await
            .map_err(|e| SetupError::Failed(e.to_string()))?;
        Ok(())
    }

    async fn unload_entry(&self, setup: &EntrySetup<'_>) -> Result<bool, SetupError> {
        if let Ok(runtime) = setup.runtime_data::<EcobeeRuntime>() {
            runtime.coordinator.shutdown();
        }
        self.loaded.remove(setup.entry_id());
        Ok(true)
    }
}
