//! YAML options of a statistics sensor

use std::time::Duration;

use ha_core::EntityId;
use ha_helpers::PlatformError;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::characteristics::Characteristic;

pub const DEFAULT_NAME: &str = "Statistical characteristic";
pub const DEFAULT_SAMPLING_SIZE: usize = 20;
pub const DEFAULT_PERCENTILE: u8 = 50;
pub const DEFAULT_PRECISION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Source entity, a `sensor` or `binary_sensor`
    pub entity_id: EntityId,
    pub state_characteristic: Characteristic,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub sampling_size: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_max_age")]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub keep_last_sample: bool,
    #[serde(default = "default_percentile")]
    pub percentile: u8,
    #[serde(default = "default_precision")]
    pub precision: u32,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_percentile() -> u8 {
    DEFAULT_PERCENTILE
}

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

impl StatisticsConfig {
    /// Parse and validate one `sensor: - platform: statistics` item
    pub fn from_value(value: &Value) -> Result<Self, PlatformError> {
        let mut config: Self = serde_json::from_value(value.clone())
            .map_err(|e| PlatformError::InvalidConfig(format!("statistics: {e}")))?;
        config.validate()?;
        if config.sampling_size.is_none() && config.max_age.is_none() {
            config.sampling_size = Some(DEFAULT_SAMPLING_SIZE);
        }
        Ok(config)
    }

    pub fn is_binary_source(&self) -> bool {
        self.entity_id.domain() == "binary_sensor"
    }

    fn validate(&self) -> Result<(), PlatformError> {
        let invalid = |msg: String| Err(PlatformError::InvalidConfig(msg));
        let characteristic = self.state_characteristic;

        match self.entity_id.domain() {
            "binary_sensor" if !characteristic.supports_binary() => {
                return invalid(format!(
                    "the characteristic '{characteristic}' is not supported for binary_sensor sources"
                ));
            }
            "sensor" if !characteristic.supports_numeric() => {
                return invalid(format!(
                    "the characteristic '{characteristic}' is only supported for binary_sensor sources"
                ));
            }
            "sensor" | "binary_sensor" => {}
            other => return invalid(format!("unsupported source domain '{other}'")),
        }
        if self.keep_last_sample && self.max_age.is_none() {
            return invalid("keep_last_sample requires max_age".to_string());
        }
        if !(1..=99).contains(&self.percentile) {
            return invalid(format!(
                "percentile must be between 1 and 99, got {}",
                self.percentile
            ));
        }
        if self.sampling_size == Some(0) {
            return invalid("sampling_size must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(f64),
    Text(String),
    Parts {
        #[serde(default)]
        days: f64,
        #[serde(default)]
        hours: f64,
        #[serde(default)]
        minutes: f64,
        #[serde(default)]
        seconds: f64,
        #[serde(default)]
        milliseconds: f64,
    },
}

/// Seconds, `HH:MM[:SS]` or a map of `days`/`hours`/`minutes`/`seconds`/`milliseconds`
fn deserialize_max_age<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let Some(raw) = Option::<RawDuration>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let seconds = match raw {
        RawDuration::Seconds(secs) => secs,
        RawDuration::Text(text) => parse_clock(&text)
            .ok_or_else(|| D::Error::custom(format!("invalid duration '{text}'")))?,
        RawDuration::Parts {
            days,
            hours,
            minutes,
            seconds,
            milliseconds,
        } => days * 86_400.0 + hours * 3_600.0 + minutes * 60.0 + seconds + milliseconds / 1_000.0,
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(D::Error::custom("max_age must be positive"));
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(D::Error::custom)
}

fn parse_clock(text: &str) -> Option<f64> {
    let parts: Vec<f64> = text
        .trim()
        .split(':')
        .map(|p| p.trim().parse::<f64>().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [hours, minutes] => Some(hours * 3_600.0 + minutes * 60.0),
        [hours, minutes, seconds] => Some(hours * 3_600.0 + minutes * 60.0 + seconds),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<StatisticsConfig, PlatformError> {
        StatisticsConfig::from_value(&value)
    }

    #[test]
    fn test_defaults() {
        let config = parse(json!({
            "platform": "statistics",
            "entity_id": "sensor.outside",
            "state_characteristic": "mean",
        }))
        .unwrap();
        assert_eq!(config.name, DEFAULT_NAME);
        assert_eq!(config.sampling_size, Some(20));
        assert_eq!(config.max_age, None);
        assert_eq!(config.percentile, 50);
        assert_eq!(config.precision, 2);
        assert!(!config.is_binary_source());
    }

    #[test]
    fn test_max_age_formats() {
        let age = |max_age: Value| {
            parse(json!({
                "entity_id": "sensor.outside",
                "state_characteristic": "mean",
                "max_age": max_age,
            }))
            .unwrap()
            .max_age
        };
        assert_eq!(age(json!(90)), Some(Duration::from_secs(90)));
        assert_eq!(age(json!("01:30:00")), Some(Duration::from_secs(5400)));
        assert_eq!(age(json!("00:05")), Some(Duration::from_secs(300)));
        assert_eq!(
            age(json!({"minutes": 4, "seconds": 30})),
            Some(Duration::from_secs(270))
        );
        assert_eq!(
            age(json!({"milliseconds": 250})),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_max_age_alone_has_no_sampling_size() {
        let config = parse(json!({
            "entity_id": "sensor.outside",
            "state_characteristic": "mean",
            "max_age": {"hours": 1},
        }))
        .unwrap();
        assert_eq!(config.sampling_size, None);
    }

    #[test]
    fn test_invalid_configs() {
        let base = |extra: Value| {
            let mut config = json!({
                "entity_id": "sensor.outside",
                "state_characteristic": "mean",
            });
            for (k, v) in extra.as_object().unwrap() {
                config[k] = v.clone();
            }
            parse(config)
        };
        assert!(base(json!({"state_characteristic": "no_such"})).is_err());
        assert!(base(json!({"state_characteristic": "count_on"})).is_err());
        assert!(base(json!({"entity_id": "binary_sensor.door", "state_characteristic": "median"})).is_err());
        assert!(base(json!({"entity_id": "light.kitchen"})).is_err());
        assert!(base(json!({"keep_last_sample": true})).is_err());
        assert!(base(json!({"percentile": 100})).is_err());
        assert!(base(json!({"max_age": "soon"})).is_err());
        assert!(base(json!({"max_age": -5})).is_err());
        assert!(matches!(
            base(json!({"max_age": 1e300})),
            Err(PlatformError::InvalidConfig(_))
        ));
        assert!(matches!(
            base(json!({"max_age": {"days": 1e300}})),
            Err(PlatformError::InvalidConfig(_))
        ));

        let binary = base(json!({"entity_id": "binary_sensor.door", "state_characteristic": "count_on"}))
            .unwrap();
        assert!(binary.is_binary_source());
    }
}
