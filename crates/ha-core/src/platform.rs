//! Entity platforms an integration can populate

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name that does not match any [`Platform`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown platform '{0}'")]
pub struct UnknownPlatform(pub String);

/// Category of entity, which is also the entity id domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Numeric or textual measurement
    Sensor,
    /// On/off measurement such as a door contact
    BinarySensor,
    /// Something that can be turned on and off
    Switch,
    /// Thermostat with HVAC modes and setpoints
    Climate,
    /// Stateless action, state is the last press time
    Button,
}

impl Platform {
    /// Every platform, in setup order
    pub const ALL: [Platform; 5] = [
        Platform::Sensor,
        Platform::BinarySensor,
        Platform::Switch,
        Platform::Climate,
        Platform::Button,
    ];

    /// Name used in entity ids and `configuration.yaml`
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sensor => "sensor",
            Platform::BinarySensor => "binary_sensor",
            Platform::Switch => "switch",
            Platform::Climate => "climate",
            Platform::Button => "button",
        }
    }

    /// Platforms whose entities only report state
    pub fn is_read_only(&self) -> bool {
        matches!(self, Platform::Sensor | Platform::BinarySensor)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("light".parse::<Platform>().is_err());
    }

    #[test]
    fn test_read_only() {
        assert!(Platform::Sensor.is_read_only());
        assert!(!Platform::Climate.is_read_only());
    }
}
