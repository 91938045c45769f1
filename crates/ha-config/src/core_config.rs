//! The `homeassistant:` section

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Units used for display and for thermostat setpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    Metric,
    /// Also accepted as `us_customary`
    #[serde(alias = "us_customary")]
    Imperial,
}

impl UnitSystem {
    /// `°C` or `°F`
    pub fn temperature_unit(&self) -> &'static str {
        match self {
            UnitSystem::Metric => ha_core::units::TEMP_CELSIUS,
            UnitSystem::Imperial => ha_core::units::TEMP_FAHRENHEIT,
        }
    }
}

/// Location and naming of the installation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Decimal degrees
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    /// Meters above sea level
    #[serde(default)]
    pub elevation: i32,
    #[serde(default)]
    pub unit_system: UnitSystem,
    /// IANA name such as `Europe/Amsterdam`
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0,
            unit_system: UnitSystem::default(),
            time_zone: default_time_zone(),
        }
    }
}

impl CoreConfig {
    /// Parse the section, treating a missing or empty one as defaults
    pub fn from_section(section: Option<&serde_yaml::Value>) -> ConfigResult<Self> {
        match section {
            None | Some(serde_yaml::Value::Null) => Ok(Self::default()),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "homeassistant".to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::from_section(None).unwrap();
        assert_eq!(config.name, "Home");
        assert_eq!(config.time_zone, "UTC");
        assert_eq!(config.unit_system, UnitSystem::Metric);
    }

    #[test]
    fn test_parse_section() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            "name: Cabin\nlatitude: 51.5\nunit_system: us_customary\ntime_zone: Europe/Amsterdam\n",
        )
        .unwrap();
        let config = CoreConfig::from_section(Some(&yaml)).unwrap();
        assert_eq!(config.name, "Cabin");
        assert_eq!(config.latitude, 51.5);
        assert_eq!(config.unit_system.temperature_unit(), "°F");
        assert_eq!(config.time_zone, "Europe/Amsterdam");
    }

    #[test]
    fn test_invalid_section() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("latitude: north\n").unwrap();
        assert!(CoreConfig::from_section(Some(&yaml)).is_err());
    }
}
