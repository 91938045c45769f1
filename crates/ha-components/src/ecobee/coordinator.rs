use std::sync::{Arc, Weak};
use std::time::Duration;

use ha_config_entries::ConfigEntries;
use ha_helpers::{DataUpdateCoordinator, UpdateFailed};
use tracing::warn;

use super::api::{EcobeeClient, Thermostat};

/// ecobee asks integrations not to poll more often than every three minutes
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(180);

pub type EcobeeCoordinator = DataUpdateCoordinator<Vec<Thermostat>>;

pub struct EcobeeRuntime {
    pub client: EcobeeClient,
    pub coordinator: Arc<EcobeeCoordinator>,
}

impl EcobeeRuntime {
    pub fn thermostat(&self, identifier: &str) -> Option<Thermostat> {
        self.coordinator
            .data()?
            .iter()
            .find(|t| t.identifier == identifier)
            .cloned()
    }
}

async fn fetch(client: &EcobeeClient) -> Result<Vec<Thermostat>, UpdateFailed> {
    client.thermostats().await.map_err(|err| {
        if err.is_auth() {
            UpdateFailed::auth(err.to_string())
        } else {
            UpdateFailed::new(format!("Error communicating with ecobee: {err}"))
        }
    })
}

/// Poll all thermostats of the account; when the tokens cannot be renewed
/// the user is asked to authorise the app again
pub fn build(
    client: EcobeeClient,
    entries: Weak<ConfigEntries>,
    entry_id: &str,
) -> Arc<EcobeeCoordinator> {
    let entry_id = entry_id.to_string();
    DataUpdateCoordinator::builder("ecobee", move || {
        let client = client.clone();
        async move { fetch(&client).await }
    })
    .update_interval(UPDATE_INTERVAL)
    .on_auth_failed(move |err| {
        warn!(entry_id = %entry_id, %err, "ecobee rejected the stored tokens");
        if let Some(entries) = entries.upgrade() {
            entries.spawn_reauth(&entry_id);
        }
    })
    .build()
}
