//! Bring the system up from a config directory and take it down again

use std::sync::Arc;

use anyhow::{Context as _, Result};
use ha_components::builtin_integrations;
use ha_config::HomeConfig;
use ha_config_entries::ConfigEntries;
use ha_core::events::{HOMEASSISTANT_START, HOMEASSISTANT_STOP};
use ha_core::{Context, Event, Platform};
use ha_helpers::{register_platform_services, Hass, Integration, IntegrationHandler};
use serde::Serialize;
use tracing::{error, info, warn};

pub struct Server {
    pub hass: Hass,
    pub entries: Arc<ConfigEntries>,
    handlers: Vec<Arc<IntegrationHandler>>,
}

impl Server {
    /// Load the registries and stored config entries without setting
    /// anything up
    pub async fn load(config: &HomeConfig) -> Result<Self> {
        let hass = Hass::new(&config.config_dir);
        hass.registries
            .load_all()
            .await
            .context("loading registries")?;

        let entries = Arc::new(ConfigEntries::new(hass.storage()));
        entries.load().await.context("loading config entries")?;
        info!(entries = entries.len(), "Loaded config entries");

        Ok(Self {
            hass,
            entries,
            handlers: Vec::new(),
        })
    }

    /// Load, then register the platform services and every built-in
    /// integration
    pub async fn start(config: &HomeConfig) -> Result<Self> {
        let mut server = Self::load(config).await?;
        register_platform_services(&server.hass).context("registering platform services")?;

        for integration in builtin_integrations(server.hass.http.clone()) {
            let domain = integration.domain();
            let handler = IntegrationHandler::register(&server.hass, &server.entries, integration)
                .await
                .with_context(|| format!("setting up integration {domain}"))?;
            server.handlers.push(handler);
        }
        Ok(server)
    }

    fn handler(&self, domain: &str) -> Option<&Arc<IntegrationHandler>> {
        self.handlers.iter().find(|h| h.domain() == domain)
    }

    /// Set up every `<platform>: - platform: <integration>` item
    ///
    /// A broken item is logged and skipped.
    pub async fn setup_yaml_platforms(&self, config: &HomeConfig) {
        for platform in Platform::ALL {
            for item in config.platform_configs(platform.as_str()) {
                let item = match serde_json::to_value(&item) {
                    Ok(item) => item,
                    Err(err) => {
                        error!(%platform, %err, "Invalid platform configuration");
                        continue;
                    }
                };
                let Some(integration) = item.get("platform").and_then(|p| p.as_str()) else {
                    error!(%platform, "Platform configuration without a platform key");
                    continue;
                };
                let Some(handler) = self.handler(integration) else {
                    warn!(%platform, integration, "Unknown integration");
                    continue;
                };
                if let Err(err) = handler.setup_yaml_platform(platform, &item).await {
                    error!(%platform, integration, %err, "Platform setup failed");
                }
            }
        }
    }

    pub async fn setup_entries(&self) -> usize {
        self.entries.setup_all().await
    }

    /// Announce that setup is complete
    pub fn started(&self) {
        self.fire_lifecycle(HOMEASSISTANT_START);
    }

    fn fire_lifecycle(&self, event_type: &str) {
        let event = Event::new(event_type, serde_json::json!({}), Context::new());
        self.hass.bus.fire(event);
    }

    /// Unload every entry and persist entries and registries
    pub async fn stop(&self) -> Result<()> {
        self.fire_lifecycle(HOMEASSISTANT_STOP);
        self.entries.unload_all().await;
        self.entries.save().await.context("saving config entries")?;
        self.hass
            .registries
            .save_all()
            .await
            .context("saving registries")?;
        info!("Stopped");
        Ok(())
    }

    pub fn print_entries(&self) {
        let entries = self.entries.entries();
        if entries.is_empty() {
            println!("No config entries");
            return;
        }
        println!("{:<28} {:<12} {:<24} {:<8} STATE", "ENTRY ID", "DOMAIN", "TITLE", "SOURCE");
        for entry in entries {
            println!(
                "{:<28} {:<12} {:<24} {:<8} {}",
                entry.entry_id,
                entry.domain,
                entry.title,
                label(&entry.source),
                label(&entry.state)
            );
        }
    }
}

/// Serialized name of a unit enum variant
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_sets_up_yaml_platforms() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("configuration.yaml"),
            r#"
sensor:
  - platform: statistics
    name: Outside mean
    entity_id: sensor.outside
    state_characteristic: mean
  - platform: nonexistent
  - name: no platform key
"#,
        )
        .unwrap();
        let config = HomeConfig::load(dir.path()).unwrap();

        let server = Server::start(&config).await.unwrap();
        let mut started = server.hass.bus.subscribe(HOMEASSISTANT_START);
        let mut stopping = server.hass.bus.subscribe(HOMEASSISTANT_STOP);
        server.setup_yaml_platforms(&config).await;
        assert_eq!(server.setup_entries().await, 0);
        server.started();
        assert!(started.try_recv().is_ok());

        assert!(server.hass.states.get("sensor.outside_mean").is_some());
        assert!(server.hass.services.has_service("ecobee", "get_runtime"));

        server.stop().await.unwrap();
        assert!(stopping.try_recv().is_ok());
        assert!(dir.path().join(".storage").exists());
    }
}
