//! Sensors of HomeWizard devices
//!
//! Every reading the device may report has a [`HomeWizardSensorDescription`].
//! A sensor is only created for readings the device reported on the first
//! poll, so a single phase meter gets no phase 2 and 3 sensors.

use std::sync::Arc;

use async_trait::async_trait;
use ha_helpers::{
    CoordinatorEntity, Entity, EntityDescription, EntityHandle, PlatformEntity, SensorEntity,
    StateClass, StateValue,
};
use ha_registries::{DeviceIdentifier, DeviceInfo, EntityCategory};

use super::api::{ExternalDevice, Measurement};
use super::coordinator::{DeviceResponse, HomeWizardCoordinator};
use super::entity::{HomeWizardEntity, MANUFACTURER};
use super::DOMAIN;

pub type ValueFn = fn(&Measurement) -> Option<StateValue>;
pub type PredicateFn = fn(&Measurement) -> bool;

pub struct HomeWizardSensorDescription {
    pub description: EntityDescription,
    pub value_fn: ValueFn,
    /// Whether the device supports the reading; defaults to "has a value"
    pub has_fn: Option<PredicateFn>,
    /// Whether a new entity starts enabled
    pub enabled_fn: Option<PredicateFn>,
}

impl HomeWizardSensorDescription {
    fn new(description: EntityDescription, value_fn: ValueFn) -> Self {
        Self {
            description,
            value_fn,
            has_fn: None,
            enabled_fn: None,
        }
    }

    fn has(mut self, has_fn: PredicateFn) -> Self {
        self.has_fn = Some(has_fn);
        self
    }

    fn enabled_when(mut self, enabled_fn: PredicateFn) -> Self {
        self.enabled_fn = Some(enabled_fn);
        self
    }

    pub fn key(&self) -> &str {
        &self.description.key
    }

    pub fn is_supported(&self, data: &Measurement) -> bool {
        match self.has_fn {
            Some(has_fn) => has_fn(data),
            None => (self.value_fn)(data).is_some(),
        }
    }

    pub fn enabled_by_default(&self, data: &Measurement) -> bool {
        self.description.entity_registry_enabled_default
            && self.enabled_fn.map_or(true, |enabled| enabled(data))
    }
}

fn float(value: Option<f64>) -> Option<StateValue> {
    value.map(StateValue::Float)
}

fn int(value: Option<i64>) -> Option<StateValue> {
    value.map(StateValue::Int)
}

fn percentage(value: Option<f64>) -> Option<StateValue> {
    value.map(|v| StateValue::Float((v * 100.0 * 100.0).round() / 100.0))
}

fn diagnostic(key: &str, name: &str) -> EntityDescription {
    EntityDescription::new(key)
        .name(name)
        .category(EntityCategory::Diagnostic)
}

fn energy(key: &str, name: &str) -> EntityDescription {
    EntityDescription::new(key)
        .name(name)
        .unit("kWh")
        .device_class("energy")
        .state_class(StateClass::TotalIncreasing)
}

fn measurement(key: &str, name: &str, device_class: &str, unit: &str) -> EntityDescription {
    EntityDescription::new(key)
        .name(name)
        .unit(unit)
        .device_class(device_class)
        .state_class(StateClass::Measurement)
}

fn power(key: &str, name: &str) -> EntityDescription {
    measurement(key, name, "power", "W").precision(0)
}

fn voltage(key: &str, name: &str) -> EntityDescription {
    measurement(key, name, "voltage", "V").disabled_by_default()
}

fn current(key: &str, name: &str) -> EntityDescription {
    measurement(key, name, "current", "A").disabled_by_default()
}

/// Every reading a HomeWizard device can report
pub fn sensor_descriptions() -> Vec<HomeWizardSensorDescription> {
    use HomeWizardSensorDescription as S;

    vec![
        S::new(diagnostic("smr_version", "DSMR version"), |d| int(d.smr_version)),
        S::new(diagnostic("meter_model", "Smart meter model"), |d| {
            d.meter_model.clone().map(StateValue::Text)
        }),
        S::new(diagnostic("unique_meter_id", "Smart meter identifier"), |d| {
            d.meter_id().map(StateValue::Text)
        }),
        S::new(diagnostic("wifi_ssid", "Wi-Fi SSID"), |d| {
            d.wifi_ssid.clone().map(StateValue::Text)
        }),
        S::new(
            EntityDescription::new("active_tariff")
                .name("Tariff")
                .device_class("enum"),
            |d| d.active_tariff.map(|t| StateValue::Text(t.to_string())),
        ),
        S::new(
            diagnostic("wifi_strength", "Wi-Fi strength")
                .unit("%")
                .state_class(StateClass::Measurement)
                .disabled_by_default(),
            |d| int(d.wifi_strength),
        ),
        S::new(energy("total_power_import_kwh", "Energy import"), |d| {
            float(d.total_power_import_kwh)
        }),
        // Tariff sensors only make sense when the meter has two or more tariffs
        S::new(energy("total_power_import_t1_kwh", "Energy import tariff 1"), |d| {
            float(d.total_power_import_t1_kwh)
        })
        .has(|d| d.total_power_import_t1_kwh.is_some() && d.total_power_import_t2_kwh.is_some()),
        S::new(energy("total_power_import_t2_kwh", "Energy import tariff 2"), |d| {
            float(d.total_power_import_t2_kwh)
        }),
        S::new(energy("total_power_import_t3_kwh", "Energy import tariff 3"), |d| {
            float(d.total_power_import_t3_kwh)
        }),
        S::new(energy("total_power_import_t4_kwh", "Energy import tariff 4"), |d| {
            float(d.total_power_import_t4_kwh)
        }),
        // Export sensors start disabled for meters that never exported
        S::new(energy("total_power_export_kwh", "Energy export"), |d| {
            float(d.total_power_export_kwh)
        })
        .enabled_when(|d| d.total_power_export_kwh != Some(0.0)),
        S::new(energy("total_power_export_t1_kwh", "Energy export tariff 1"), |d| {
            float(d.total_power_export_t1_kwh)
        })
        .has(|d| d.total_power_export_t1_kwh.is_some() && d.total_power_export_t2_kwh.is_some())
        .enabled_when(|d| d.total_power_export_t1_kwh != Some(0.0)),
        S::new(energy("total_power_export_t2_kwh", "Energy export tariff 2"), |d| {
            float(d.total_power_export_t2_kwh)
        })
        .enabled_when(|d| d.total_power_export_t2_kwh != Some(0.0)),
        S::new(energy("total_power_export_t3_kwh", "Energy export tariff 3"), |d| {
            float(d.total_power_export_t3_kwh)
        })
        .enabled_when(|d| d.total_power_export_t3_kwh != Some(0.0)),
        S::new(energy("total_power_export_t4_kwh", "Energy export tariff 4"), |d| {
            float(d.total_power_export_t4_kwh)
        })
        .enabled_when(|d| d.total_power_export_t4_kwh != Some(0.0)),
        S::new(power("active_power_w", "Power"), |d| float(d.active_power_w)),
        S::new(power("active_power_l1_w", "Power phase 1"), |d| {
            float(d.active_power_l1_w)
        }),
        S::new(power("active_power_l2_w", "Power phase 2"), |d| {
            float(d.active_power_l2_w)
        }),
        S::new(power("active_power_l3_w", "Power phase 3"), |d| {
            float(d.active_power_l3_w)
        }),
        S::new(voltage("active_voltage_v", "Voltage"), |d| float(d.active_voltage_v)),
        S::new(voltage("active_voltage_l1_v", "Voltage phase 1"), |d| {
            float(d.active_voltage_l1_v)
        }),
        S::new(voltage("active_voltage_l2_v", "Voltage phase 2"), |d| {
            float(d.active_voltage_l2_v)
        }),
        S::new(voltage("active_voltage_l3_v", "Voltage phase 3"), |d| {
            float(d.active_voltage_l3_v)
        }),
        S::new(current("active_current_a", "Current"), |d| float(d.active_current_a)),
        S::new(current("active_current_l1_a", "Current phase 1"), |d| {
            float(d.active_current_l1_a)
        }),
        S::new(current("active_current_l2_a", "Current phase 2"), |d| {
            float(d.active_current_l2_a)
        }),
        S::new(current("active_current_l3_a", "Current phase 3"), |d| {
            float(d.active_current_l3_a)
        }),
        S::new(
            measurement("active_frequency_hz", "Frequency", "frequency", "Hz")
                .disabled_by_default(),
            |d| float(d.active_frequency_hz),
        ),
        S::new(
            measurement("active_apparent_power_va", "Apparent power", "apparent_power", "VA")
                .disabled_by_default(),
            |d| float(d.active_apparent_power_va),
        ),
        S::new(
            measurement("active_reactive_power_var", "Reactive power", "reactive_power", "var")
                .disabled_by_default(),
            |d| float(d.active_reactive_power_var),
        ),
        S::new(
            measurement("active_power_factor", "Power factor", "power_factor", "%")
                .disabled_by_default(),
            |d| percentage(d.active_power_factor),
        ),
        S::new(diagnostic("voltage_sag_l1_count", "Voltage sags detected phase 1"), |d| {
            int(d.voltage_sag_l1_count)
        }),
        S::new(diagnostic("voltage_sag_l2_count", "Voltage sags detected phase 2"), |d| {
            int(d.voltage_sag_l2_count)
        }),
        S::new(diagnostic("voltage_sag_l3_count", "Voltage sags detected phase 3"), |d| {
            int(d.voltage_sag_l3_count)
        }),
        S::new(diagnostic("voltage_swell_l1_count", "Voltage swells detected phase 1"), |d| {
            int(d.voltage_swell_l1_count)
        }),
        S::new(diagnostic("voltage_swell_l2_count", "Voltage swells detected phase 2"), |d| {
            int(d.voltage_swell_l2_count)
        }),
        S::new(diagnostic("voltage_swell_l3_count", "Voltage swells detected phase 3"), |d| {
            int(d.voltage_swell_l3_count)
        }),
        S::new(diagnostic("any_power_fail_count", "Power failures detected"), |d| {
            int(d.any_power_fail_count)
        }),
        S::new(diagnostic("long_power_fail_count", "Long power failures detected"), |d| {
            int(d.long_power_fail_count)
        }),
        S::new(
            EntityDescription::new("active_power_average_w")
                .name("Average demand")
                .unit("W")
                .device_class("power"),
            |d| float(d.active_power_average_w),
        ),
        S::new(
            EntityDescription::new("monthly_power_peak_w")
                .name("Peak demand current month")
                .unit("W")
                .device_class("power"),
            |d| float(d.monthly_power_peak_w),
        ),
        S::new(
            EntityDescription::new("active_liter_lpm")
                .name("Water usage")
                .unit("l/min")
                .state_class(StateClass::Measurement),
            |d| float(d.active_liter_lpm),
        ),
        S::new(
            EntityDescription::new("total_liter_m3")
                .name("Total water usage")
                .unit("m³")
                .device_class("water")
                .state_class(StateClass::TotalIncreasing),
            |d| float(d.total_liter_m3),
        ),
    ]
}

pub struct HomeWizardSensor {
    entity: HomeWizardEntity,
    spec: HomeWizardSensorDescription,
    enabled_default: bool,
}

impl HomeWizardSensor {
    pub fn new(
        coordinator: Arc<HomeWizardCoordinator>,
        entry_unique_id: &str,
        spec: HomeWizardSensorDescription,
    ) -> Self {
        let enabled_default = coordinator
            .data()
            .map_or(true, |response| spec.enabled_by_default(&response.data));
        Self {
            entity: HomeWizardEntity::new(coordinator, entry_unique_id),
            spec,
            enabled_default,
        }
    }
}

#[async_trait]
impl Entity for HomeWizardSensor {
    fn entity_description(&self) -> Option<&EntityDescription> {
        Some(&self.spec.description)
    }

    fn unique_id(&self) -> Option<String> {
        Some(self.entity.unique_id(self.spec.key()))
    }

    fn has_entity_name(&self) -> bool {
        true
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.entity.device_info()
    }

    fn available(&self) -> bool {
        self.entity.base.available() && self.native_value().is_some()
    }

    fn entity_registry_enabled_default(&self) -> bool {
        self.enabled_default
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        self.entity.base.attach(handle);
    }

    async fn will_remove(&self) {
        self.entity.base.detach();
    }
}

impl SensorEntity for HomeWizardSensor {
    fn native_value(&self) -> Option<StateValue> {
        let response = self.entity.data()?;
        (self.spec.value_fn)(&response.data)
    }
}

/// Kind of meter connected to a P1 meter
struct ExternalKind {
    device_name: &'static str,
    device_class: &'static str,
    units: &'static [&'static str],
}

const VOLUME_UNITS: &[&str] = &["m³"];
const HEAT_UNITS: &[&str] = &["GJ", "kWh", "MWh"];

fn external_kind(meter_type: &str) -> Option<ExternalKind> {
    let (device_name, device_class, units) = match meter_type {
        "gas_meter" => ("Gas meter", "gas", VOLUME_UNITS),
        "heat_meter" => ("Heat meter", "energy", HEAT_UNITS),
        "warm_water_meter" => ("Warm water meter", "water", VOLUME_UNITS),
        "water_meter" => ("Water meter", "water", VOLUME_UNITS),
        "inlet_heat_meter" => ("Inlet heat meter", "energy", HEAT_UNITS),
        _ => return None,
    };
    Some(ExternalKind {
        device_name,
        device_class,
        units,
    })
}

/// Reading of a meter attached to a P1 meter, shown as its own device
pub struct HomeWizardExternalSensor {
    base: CoordinatorEntity<DeviceResponse>,
    key: String,
    kind: ExternalKind,
}

impl HomeWizardExternalSensor {
    fn meter(&self) -> Option<ExternalDevice> {
        let response = self.base.data()?;
        response
            .data
            .external
            .iter()
            .find(|device| device.key() == self.key)
            .cloned()
    }
}

#[async_trait]
impl Entity for HomeWizardExternalSensor {
    fn unique_id(&self) -> Option<String> {
        Some(format!("{DOMAIN}_{}", self.key))
    }

    fn has_entity_name(&self) -> bool {
        true
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        let response = self.base.data()?;
        Some(DeviceInfo {
            identifiers: vec![DeviceIdentifier::new(DOMAIN, &self.key)],
            name: Some(self.kind.device_name.to_string()),
            manufacturer: Some(MANUFACTURER.to_string()),
            model: Some(response.device.product_type.clone()),
            serial_number: self.meter().map(|m| m.unique_id),
            ..Default::default()
        })
    }

    fn available(&self) -> bool {
        self.base.available() && self.meter().is_some()
    }

    fn device_class(&self) -> Option<String> {
        let unit = self.native_unit_of_measurement()?;
        self.kind
            .units
            .contains(&unit.as_str())
            .then(|| self.kind.device_class.to_string())
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        self.base.attach(handle);
    }

    async fn will_remove(&self) {
        self.base.detach();
    }
}

impl SensorEntity for HomeWizardExternalSensor {
    fn native_value(&self) -> Option<StateValue> {
        self.meter()?.value.map(StateValue::Float)
    }

    fn native_unit_of_measurement(&self) -> Option<String> {
        let unit = self.meter()?.unit?;
        // The API reports cubic meters as "m3"
        Some(if unit == "m3" { "m³".to_string() } else { unit })
    }

    fn state_class(&self) -> Option<StateClass> {
        Some(StateClass::TotalIncreasing)
    }
}

/// Sensors for every reading and external meter the device reported
pub fn entities(
    coordinator: &Arc<HomeWizardCoordinator>,
    entry_unique_id: &str,
) -> Vec<PlatformEntity> {
    let Some(response) = coordinator.data() else {
        return Vec::new();
    };

    let mut entities: Vec<PlatformEntity> = sensor_descriptions()
        .into_iter()
        .filter(|spec| spec.is_supported(&response.data))
        .map(|spec| {
            PlatformEntity::sensor(HomeWizardSensor::new(
                coordinator.clone(),
                entry_unique_id,
                spec,
            ))
        })
        .collect();

    for meter in &response.data.external {
        if let Some(kind) = external_kind(&meter.meter_type) {
            entities.push(PlatformEntity::sensor(HomeWizardExternalSensor {
                base: CoordinatorEntity::new(coordinator.clone()),
                key: meter.key(),
                kind,
            }));
        }
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn measurement(value: serde_json::Value) -> Measurement {
        serde_json::from_value(value).unwrap()
    }

    fn spec(key: &str) -> HomeWizardSensorDescription {
        sensor_descriptions()
            .into_iter()
            .find(|s| s.key() == key)
            .unwrap()
    }

    #[test]
    fn test_keys_are_unique() {
        let mut keys: Vec<String> = sensor_descriptions()
            .iter()
            .map(|s| s.key().to_string())
            .collect();
        let count = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), count);
    }

    #[test]
    fn test_supported_readings() {
        let data = measurement(json!({
            "active_power_w": -123.0,
            "total_power_import_t1_kwh": 10.0,
            "total_power_export_kwh": 0.0,
        }));
        let supported: Vec<String> = sensor_descriptions()
            .iter()
            .filter(|s| s.is_supported(&data))
            .map(|s| s.key().to_string())
            .collect();
        // A single tariff meter gets no tariff sensor
        assert_eq!(supported, vec!["total_power_export_kwh", "active_power_w"]);

        let data = measurement(json!({
            "total_power_import_t1_kwh": 10.0,
            "total_power_import_t2_kwh": 20.0,
        }));
        assert!(spec("total_power_import_t1_kwh").is_supported(&data));
    }

    #[test]
    fn test_enabled_by_default() {
        let never_exported = measurement(json!({"total_power_export_kwh": 0.0}));
        let exported = measurement(json!({"total_power_export_kwh": 1.5}));
        assert!(!spec("total_power_export_kwh").enabled_by_default(&never_exported));
        assert!(spec("total_power_export_kwh").enabled_by_default(&exported));
        assert!(!spec("active_voltage_v").enabled_by_default(&exported));
        assert!(spec("active_power_w").enabled_by_default(&exported));
    }

    #[test]
    fn test_values() {
        let data = measurement(json!({
            "active_tariff": 2,
            "active_power_factor": 0.999,
            "unique_id": "00112233445566778899AABBCCDDEEFF",
        }));
        assert_eq!(
            (spec("active_tariff").value_fn)(&data),
            Some(StateValue::Text("2".into()))
        );
        assert_eq!(
            (spec("active_power_factor").value_fn)(&data),
            Some(StateValue::Float(99.9))
        );
        // Not valid UTF-8 once decoded, so the raw id is kept
        assert!((spec("unique_meter_id").value_fn)(&data).is_some());
    }

    #[test]
    fn test_external_kinds() {
        assert_eq!(external_kind("gas_meter").unwrap().device_name, "Gas meter");
        assert_eq!(external_kind("heat_meter").unwrap().device_class, "energy");
        assert!(external_kind("solar_panel").is_none());
    }
}
