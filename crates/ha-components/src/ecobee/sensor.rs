use std::sync::Arc;

use async_trait::async_trait;
use ha_helpers::{
    Entity, EntityDescription, EntityHandle, PlatformEntity, SensorEntity, StateClass, StateValue,
};
use ha_registries::{DeviceIdentifier, DeviceInfo};

use super::api::{RemoteSensor, Thermostat};
use super::coordinator::EcobeeCoordinator;
use super::entity::{thermostat_device, EcobeeEntity, MANUFACTURER};
use super::DOMAIN;

const SENSOR_TYPE_THERMOSTAT: &str = "thermostat";
const VALUE_UNKNOWN: &str = "unknown";

/// Reading of a remote sensor capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    Temperature,
    Humidity,
}

impl Reading {
    fn kind(self) -> &'static str {
        match self {
            Reading::Temperature => "temperature",
            Reading::Humidity => "humidity",
        }
    }

    fn description(self) -> EntityDescription {
        match self {
            Reading::Temperature => EntityDescription::new("temperature")
                .name("Temperature")
                .device_class("temperature")
                .unit("°F")
                .state_class(StateClass::Measurement)
                .precision(1),
            Reading::Humidity => EntityDescription::new("humidity")
                .name("Humidity")
                .device_class("humidity")
                .unit("%")
                .state_class(StateClass::Measurement),
        }
    }

    /// Temperatures come in tenths of a degree
    fn parse(self, raw: &str) -> Option<StateValue> {
        match self {
            Reading::Temperature => raw.parse::<f64>().ok().map(|v| StateValue::from(v / 10.0)),
            Reading::Humidity => raw.parse::<i64>().ok().map(StateValue::from),
        }
    }
}

fn raw_value(sensor: &RemoteSensor, reading: Reading) -> Option<&str> {
    sensor
        .capability
        .iter()
        .find(|c| c.kind == reading.kind())
        .map(|c| c.value.as_str())
        .filter(|value| *value != VALUE_UNKNOWN)
}

fn device_identifier(thermostat: &Thermostat, sensor: &RemoteSensor) -> String {
    if sensor.sensor_type == SENSOR_TYPE_THERMOSTAT {
        thermostat.identifier.clone()
    } else {
        sensor.code.clone().unwrap_or_else(|| sensor.id.clone())
    }
}

/// Temperature or humidity of a remote sensor, or of the sensor built into
/// the thermostat
pub struct EcobeeSensor {
    entity: EcobeeEntity,
    sensor_name: String,
    reading: Reading,
    description: EntityDescription,
}

impl EcobeeSensor {
    pub fn new(
        coordinator: Arc<EcobeeCoordinator>,
        thermostat: &Thermostat,
        sensor: &RemoteSensor,
        reading: Reading,
    ) -> Self {
        Self {
            entity: EcobeeEntity::new(coordinator, &thermostat.identifier),
            sensor_name: sensor.name.clone(),
            reading,
            description: reading.description(),
        }
    }

    fn with_sensor<R>(&self, f: impl FnOnce(&Thermostat, &RemoteSensor) -> R) -> Option<R> {
        self.entity
            .with_thermostat(|t| {
                t.remote_sensors
                    .iter()
                    .find(|s| s.name == self.sensor_name)
                    .map(|s| f(t, s))
            })
            .flatten()
    }
}

#[async_trait]
impl Entity for EcobeeSensor {
    fn entity_description(&self) -> Option<&EntityDescription> {
        Some(&self.description)
    }

    fn unique_id(&self) -> Option<String> {
        self.with_sensor(|t, s| format!("{}-{}", device_identifier(t, s), self.reading.kind()))
    }

    fn has_entity_name(&self) -> bool {
        true
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.with_sensor(|t, s| {
            if s.sensor_type == SENSOR_TYPE_THERMOSTAT {
                return thermostat_device(t);
            }
            DeviceInfo {
                identifiers: vec![DeviceIdentifier::new(DOMAIN, device_identifier(t, s))],
                name: Some(s.name.clone()),
                manufacturer: Some(MANUFACTURER.to_string()),
                model: Some("ecobee Room Sensor".to_string()),
                ..Default::default()
            }
        })
    }

    fn available(&self) -> bool {
        self.entity.available()
            && self
                .with_sensor(|_, s| raw_value(s, self.reading).is_some())
                .unwrap_or(false)
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        self.entity.base.attach(handle);
    }

    async fn will_remove(&self) {
        self.entity.base.detach();
    }
}

impl SensorEntity for EcobeeSensor {
    fn native_value(&self) -> Option<StateValue> {
        self.with_sensor(|_, s| raw_value(s, self.reading).and_then(|raw| self.reading.parse(raw)))
            .flatten()
    }
}

/// One sensor per reading a remote sensor reports
pub fn entities(coordinator: &Arc<EcobeeCoordinator>) -> Vec<PlatformEntity> {
    let Some(thermostats) = coordinator.data() else {
        return Vec::new();
    };
    let mut entities = Vec::new();
    for thermostat in thermostats.iter() {
        for sensor in &thermostat.remote_sensors {
            for reading in [Reading::Temperature, Reading::Humidity] {
                if raw_value(sensor, reading).is_none() {
                    continue;
                }
                entities.push(PlatformEntity::sensor(EcobeeSensor::new(
                    coordinator.clone(),
                    thermostat,
                    sensor,
                    reading,
                )));
            }
        }
    }
    entities
}
