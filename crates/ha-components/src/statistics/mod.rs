//! Statistics over the recent states of another entity
//!
//! Configured in YAML only:
//!
//! ```yaml
//! sensor:
//!   - platform: statistics
//!     name: Outside temperature mean
//!     entity_id: sensor.outside_temperature
//!     state_characteristic: mean
//!     max_age:
//!       hours: 1
//! ```

pub mod buffer;
pub mod characteristics;
pub mod config;
pub mod sensor;

use async_trait::async_trait;
use ha_core::Platform;
use ha_helpers::{EntityPlatform, Hass, Integration, PlatformEntity, PlatformError};
use serde_json::Value;
use tracing::info;

pub use buffer::{BufferSnapshot, BufferedState, InsertPosition, StateBuffer};
pub use characteristics::{Characteristic, Computed};
pub use config::StatisticsConfig;
pub use sensor::StatisticsSensor;

pub const DOMAIN: &str = "statistics";

pub struct Statistics;

#[async_trait]
impl Integration for Statistics {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    async fn setup_platform(
        &self,
        hass: &Hass,
        config: &Value,
        entities: &EntityPlatform,
    ) -> Result<(), PlatformError> {
        if entities.domain() != Platform::Sensor {
            return Err(PlatformError::InvalidConfig(format!(
                "{DOMAIN} only provides sensors, not {}",
                entities.domain()
            )));
        }
        let config = StatisticsConfig::from_value(config)?;
        info!(
            source = %config.entity_id,
            characteristic = %config.state_characteristic,
            "Setting up statistics sensor"
        );
        let sensor = StatisticsSensor::new(hass.clone(), config);
        entities
            .add_entities(vec![PlatformEntity::sensor(sensor)])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_config_entries::ConfigEntries;
    use ha_helpers::IntegrationHandler;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_yaml_platform_with_unique_id() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let entries = Arc::new(ConfigEntries::new(hass.storage()));
        let handler = IntegrationHandler::register(&hass, &entries, Arc::new(Statistics))
            .await
            .unwrap();

        let platform = handler
            .setup_yaml_platform(
                Platform::Sensor,
                &json!({
                    "platform": "statistics",
                    "name": "test",
                    "unique_id": "statistics_test",
                    "entity_id": "sensor.outside",
                    "state_characteristic": "mean",
                }),
            )
            .await
            .unwrap();

        assert_eq!(platform.entity_ids(), vec!["sensor.test".to_string()]);
        assert_eq!(
            hass.registries
                .entities
                .get_entity_id("sensor", DOMAIN, "statistics_test")
                .as_deref(),
            Some("sensor.test")
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let entries = Arc::new(ConfigEntries::new(hass.storage()));
        let handler = IntegrationHandler::register(&hass, &entries, Arc::new(Statistics))
            .await
            .unwrap();

        let err = handler
            .setup_yaml_platform(
                Platform::Sensor,
                &json!({"entity_id": "sensor.outside", "state_characteristic": "count_on"}),
            )
            .await
            .err()
            .expect("count_on needs a binary source");
        assert!(matches!(err, PlatformError::InvalidConfig(_)));

        let err = handler
            .setup_yaml_platform(
                Platform::Switch,
                &json!({"entity_id": "sensor.outside", "state_characteristic": "mean"}),
            )
            .await
            .err()
            .expect("statistics has no switch platform");
        assert!(matches!(err, PlatformError::InvalidConfig(_)));
    }
}
