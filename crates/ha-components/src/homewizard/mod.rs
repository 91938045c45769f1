//! HomeWizard Energy devices over their local HTTP API
//!
//! P1 meters, energy sockets and water meters are added through the config
//! flow with their IP address. Each entry polls its device every five
//! seconds and exposes the readings as sensors; energy sockets also get a
//! power switch and a switch lock.

pub mod api;
pub mod button;
pub mod config_flow;
pub mod coordinator;
pub mod entity;
pub mod sensor;
pub mod switch;

use std::sync::Arc;

use async_trait::async_trait;
use ha_config_entries::{ConfigFlow, FlowFactory, SetupError};
use ha_core::Platform;
use ha_helpers::{EntityPlatform, EntrySetup, Integration};
use tracing::{debug, info};

pub use api::{Device, HomeWizardClient, HomeWizardError, Measurement, SocketState};
pub use config_flow::{HomeWizardFlow, CONF_IP_ADDRESS};
pub use coordinator::{DeviceResponse, HomeWizardCoordinator, HomeWizardRuntime};

pub const DOMAIN: &str = "homewizard";

const PLATFORMS: &[Platform] = &[Platform::Button, Platform::Sensor, Platform::Switch];

pub struct HomeWizard {
    http: reqwest::Client,
}

impl HomeWizard {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Integration for HomeWizard {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn platforms(&self) -> &'static [Platform] {
        PLATFORMS
    }

    fn config_flow(&self) -> Option<FlowFactory> {
        let http = self.http.clone();
        Some(Arc::new(move || {
            Box::new(HomeWizardFlow::new(http.clone())) as Box<dyn ConfigFlow>
        }))
    }

    async fn setup_entry(&self, setup: &EntrySetup<'_>) -> Result<(), SetupError> {
        let ip_address = setup
            .entry
            .data_str(CONF_IP_ADDRESS)
            .ok_or_else(|| SetupError::Failed(format!("entry has no {CONF_IP_ADDRESS}")))?;

        let client = HomeWizardClient::new(setup.hass.http.clone(), ip_address);
        let coordinator =
            coordinator::build(client.clone(), Arc::downgrade(setup.entries), setup.entry_id());
        coordinator.first_refresh().await?;

        if let Some(response) = coordinator.data() {
            info!(
                product = %response.device.product_name,
                firmware = %response.device.firmware_version,
                ip_address,
                "Connected to HomeWizard device"
            );
        }
        setup.runtime.insert(
            setup.entry_id(),
            Arc::new(HomeWizardRuntime {
                client,
                coordinator,
            }),
        );
        Ok(())
    }

    async fn setup_platform_entry(
        &self,
        setup: &EntrySetup<'_>,
        entities: &EntityPlatform,
    ) -> Result<(), SetupError> {
        let runtime = setup.runtime_data::<HomeWizardRuntime>()?;
        let unique_id = setup
            .entry
            .unique_id
            .clone()
            .unwrap_or_else(|| setup.entry_id().to_string());

        let new_entities = match entities.domain() {
            Platform::Sensor => sensor::entities(&runtime.coordinator, &unique_id),
            Platform::Switch => switch::entities(&runtime.coordinator, &runtime.client, &unique_id),
            Platform::Button => button::entities(&runtime.coordinator, &runtime.client, &unique_id),
            _ => Vec::new(),
        };
        debug!(platform = %entities.domain(), count = new_entities.len(), "Adding HomeWizard entities");
        entities
            .add_entities(new_entities)
            .await
            .map_err(|e| SetupError::Failed(e.to_string()))?;
        Ok(())
    }

    async fn unload_entry(&self, setup: &EntrySetup<'_>) -> Result<bool, SetupError> {
        if let Ok(runtime) = setup.runtime_data::<HomeWizardRuntime>() {
            runtime.coordinator.shutdown();
        }
        Ok(true)
    }
}
