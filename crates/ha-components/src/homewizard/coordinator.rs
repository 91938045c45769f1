use std::sync::{Arc, Weak};
use std::time::Duration;

use ha_config_entries::ConfigEntries;
use ha_helpers::{DataUpdateCoordinator, UpdateFailed};
use tracing::warn;

use super::api::{Device, HomeWizardClient, HomeWizardError, Measurement, SocketState};

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Everything one poll of a device returns
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub device: Device,
    pub data: Measurement,
    /// Only energy sockets have a switchable state
    pub state: Option<SocketState>,
}

pub type HomeWizardCoordinator = DataUpdateCoordinator<DeviceResponse>;

/// What a loaded entry keeps in its runtime data
pub struct HomeWizardRuntime {
    pub client: HomeWizardClient,
    pub coordinator: Arc<HomeWizardCoordinator>,
}

async fn fetch(client: &HomeWizardClient) -> Result<DeviceResponse, UpdateFailed> {
    let to_failed = |err: HomeWizardError| match err {
        HomeWizardError::Disabled => {
            UpdateFailed::auth("API disabled, API must be enabled in the app")
        }
        other => UpdateFailed::new(format!("Device did not respond as expected: {other}")),
    };

    let device = client.device().await.map_err(to_failed)?;
    let data = client.data().await.map_err(to_failed)?;
    let state = if device.is_energy_socket() {
        Some(client.state().await.map_err(to_failed)?)
    } else {
        None
    };
    Ok(DeviceResponse {
        device,
        data,
        state,
    })
}

/// Poll the device every five seconds; a disabled API asks the user to
/// re-enable it through a reauth flow
pub fn build(
    client: HomeWizardClient,
    entries: Weak<ConfigEntries>,
    entry_id: &str,
) -> Arc<HomeWizardCoordinator> {
    let entry_id = entry_id.to_string();
    DataUpdateCoordinator::builder("homewizard", move || {
        let client = client.clone();
        async move { fetch(&client).await }
    })
    .update_interval(UPDATE_INTERVAL)
    .on_auth_failed(move |err| {
        warn!(entry_id = %entry_id, %err, "HomeWizard API was disabled");
        if let Some(entries) = entries.upgrade() {
            entries.spawn_reauth(&entry_id);
        }
    })
    .build()
}
