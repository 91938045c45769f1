use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use ha_helpers::{
    Attributes, ClimateEntity, Entity, EntityError, EntityHandle, HvacAction, HvacMode,
    PlatformEntity, TemperatureRequest,
};
use ha_registries::DeviceInfo;
use serde_json::json;
use tracing::{debug, warn};

use super::api::{EcobeeClient, EcobeeError, Function, HoldType, Settings, Thermostat};
use super::coordinator::EcobeeCoordinator;
use super::entity::{thermostat_device, EcobeeEntity};

pub const PRESET_AWAY_INDEFINITELY: &str = "away_indefinitely";
pub const PRESET_TEMPERATURE: &str = "temp";
pub const PRESET_VACATION: &str = "vacation";

const FAN_AUTO: &str = "auto";
const FAN_ON: &str = "on";

const DEFAULT_MIN_TEMP: f64 = 45.0;
const DEFAULT_MAX_TEMP: f64 = 95.0;

/// Comfort setting names ecobee and we spell differently
const PRESET_NAMES: &[(&str, &str)] = &[("Away", "away"), ("Home", "home"), ("Sleep", "sleep")];

fn to_preset(ecobee_name: &str) -> String {
    PRESET_NAMES
        .iter()
        .find(|(ecobee, _)| *ecobee == ecobee_name)
        .map_or(ecobee_name, |(_, preset)| *preset)
        .to_string()
}

fn from_preset(preset: &str) -> &str {
    PRESET_NAMES
        .iter()
        .find(|(_, name)| *name == preset)
        .map_or(preset, |(ecobee, _)| *ecobee)
}

fn tenths(value: i64) -> f64 {
    value as f64 / 10.0
}

fn to_tenths(value: f64) -> i64 {
    (value * 10.0).round() as i64
}

pub fn hvac_mode(settings: &Settings) -> Option<HvacMode> {
    match settings.hvac_mode.as_str() {
        "heat" | "auxHeatOnly" => Some(HvacMode::Heat),
        "cool" => Some(HvacMode::Cool),
        "auto" => Some(HvacMode::HeatCool),
        "off" => Some(HvacMode::Off),
        _ => None,
    }
}

/// ecobee name of a mode; aux heat is only ever set from the thermostat
pub fn ecobee_hvac_mode(mode: HvacMode) -> Option<&'static str> {
    match mode {
        HvacMode::Heat => Some("heat"),
        HvacMode::Cool => Some("cool"),
        HvacMode::HeatCool => Some("auto"),
        HvacMode::Off => Some("off"),
        _ => None,
    }
}

/// Modes the installed equipment can run in
pub fn supported_hvac_modes(settings: &Settings) -> Vec<HvacMode> {
    let mut modes = Vec::new();
    let heats = settings.heat_stages > 0 || settings.has_heat_pump;
    let cools = settings.cool_stages > 0;
    if heats && cools {
        modes.push(HvacMode::HeatCool);
    }
    if heats {
        modes.push(HvacMode::Heat);
    }
    if cools {
        modes.push(HvacMode::Cool);
    }
    modes.push(HvacMode::Off);
    modes
}

fn equipment_action(equipment: &str) -> Option<HvacAction> {
    match equipment {
        "heatPump" | "heatPump2" | "heatPump3" | "auxHeat1" | "auxHeat2" | "auxHeat3" => {
            Some(HvacAction::Heating)
        }
        "compCool1" | "compCool2" => Some(HvacAction::Cooling),
        "fan" | "ventilator" | "economizer" => Some(HvacAction::Fan),
        "dehumidifier" => Some(HvacAction::Drying),
        _ => None,
    }
}

/// Heating and cooling win over drying, drying over the fan
pub fn hvac_action(equipment_status: &str) -> HvacAction {
    let actions: Vec<HvacAction> = equipment_status
        .split(',')
        .filter_map(|equipment| equipment_action(equipment.trim()))
        .collect();
    [
        HvacAction::Heating,
        HvacAction::Cooling,
        HvacAction::Drying,
        HvacAction::Fan,
    ]
    .into_iter()
    .find(|action| actions.contains(action))
    .unwrap_or(HvacAction::Idle)
}

fn comfort_name<'a>(thermostat: &'a Thermostat, climate_ref: &str) -> Option<&'a str> {
    thermostat
        .program
        .climates
        .iter()
        .find(|c| c.climate_ref == climate_ref)
        .map(|c| c.name.as_str())
}

/// A hold ending more than a year after it started never ends
fn is_indefinite_hold(start_date: &str, end_date: &str) -> bool {
    let parse = |date: &str| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok();
    match (parse(start_date), parse(end_date)) {
        (Some(start), Some(end)) => end.year() - start.year() > 1,
        _ => false,
    }
}

/// The running event decides the preset, otherwise the scheduled climate
pub fn preset_mode(thermostat: &Thermostat) -> Option<String> {
    for event in thermostat.events.iter().filter(|e| e.running) {
        if event.event_type == "hold" {
            if event.hold_climate_ref == "away"
                && is_indefinite_hold(&event.start_date, &event.end_date)
            {
                return Some(PRESET_AWAY_INDEFINITELY.to_string());
            }
            return Some(
                comfort_name(thermostat, &event.hold_climate_ref)
                    .map(to_preset)
                    .unwrap_or_else(|| PRESET_TEMPERATURE.to_string()),
            );
        }
        if let Some(mode) = event.event_type.strip_prefix("auto") {
            return Some(mode.to_lowercase());
        }
        if event.event_type == "vacation" {
            return Some(PRESET_VACATION.to_string());
        }
    }
    comfort_name(thermostat, &thermostat.program.current_climate_ref).map(to_preset)
}

pub fn preset_modes(thermostat: &Thermostat) -> Vec<String> {
    thermostat
        .program
        .climates
        .iter()
        .map(|c| to_preset(&c.name))
        .chain(std::iter::once(PRESET_AWAY_INDEFINITELY.to_string()))
        .collect()
}

/// Hold type matching what the user set up on the thermostat
pub fn hold_preference(settings: &Settings) -> HoldType {
    match settings.hold_action.as_str() {
        "useEndTime2hour" | "useEndTime4hour" => HoldType::HoldHours,
        "indefinite" => HoldType::Indefinite,
        _ => HoldType::NextTransition,
    }
}

pub fn hold_hours(settings: &Settings) -> Option<u32> {
    match settings.hold_action.as_str() {
        "useEndTime2hour" => Some(2),
        "useEndTime4hour" => Some(4),
        _ => None,
    }
}

fn api_error(err: EcobeeError) -> EntityError {
    EntityError::Failed(err.to_string())
}

pub struct EcobeeThermostat {
    entity: EcobeeEntity,
    client: EcobeeClient,
    hvac_modes: Vec<HvacMode>,
}

impl EcobeeThermostat {
    pub fn new(
        coordinator: Arc<EcobeeCoordinator>,
        client: EcobeeClient,
        thermostat: &Thermostat,
    ) -> Self {
        Self {
            entity: EcobeeEntity::new(coordinator, &thermostat.identifier),
            client,
            hvac_modes: supported_hvac_modes(&thermostat.settings),
        }
    }

    fn thermostat(&self) -> Result<Thermostat, EntityError> {
        self.entity
            .with_thermostat(Thermostat::clone)
            .ok_or_else(|| EntityError::Failed(format!("no data for thermostat {}", self.entity.identifier)))
    }

    async fn send(&self, functions: Vec<Function>) -> Result<(), EntityError> {
        self.client
            .update_thermostat(&self.entity.identifier, functions, None)
            .await
            .map_err(api_error)?;
        self.entity.base.request_refresh().await;
        Ok(())
    }

    fn hold(thermostat: &Thermostat, heat: f64, cool: f64) -> Function {
        debug!(heat, cool, identifier = %thermostat.identifier, "Setting ecobee hold");
        Function::hold_temperature(
            to_tenths(heat),
            to_tenths(cool),
            hold_preference(&thermostat.settings),
            hold_hours(&thermostat.settings),
        )
    }

    /// Hold a single temperature; outside heat and cool mode the setpoints
    /// keep the minimum gap around it
    fn single_hold(thermostat: &Thermostat, temperature: f64) -> Function {
        match hvac_mode(&thermostat.settings) {
            Some(HvacMode::Heat | HvacMode::Cool) => Self::hold(thermostat, temperature, temperature),
            _ => {
                let delta = tenths(thermostat.settings.heat_cool_min_delta);
                Self::hold(thermostat, temperature - delta, temperature + delta)
            }
        }
    }
}

#[async_trait]
impl Entity for EcobeeThermostat {
    fn unique_id(&self) -> Option<String> {
        Some(self.entity.identifier.clone())
    }

    fn has_entity_name(&self) -> bool {
        true
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.entity.with_thermostat(thermostat_device)
    }

    fn available(&self) -> bool {
        self.entity.available()
    }

    fn extra_state_attributes(&self) -> Attributes {
        self.entity
            .with_thermostat(|t| {
                let fan = if t.equipment_status.contains("fan") { "on" } else { "off" };
                Attributes::from_iter([
                    ("fan".to_string(), json!(fan)),
                    (
                        "climate_mode".to_string(),
                        json!(comfort_name(t, &t.program.current_climate_ref)),
                    ),
                    ("equipment_running".to_string(), json!(t.equipment_status)),
                    ("fan_min_on_time".to_string(), json!(t.settings.fan_min_on_time)),
                ])
            })
            .unwrap_or_default()
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        self.entity.base.attach(handle);
    }

    async fn will_remove(&self) {
        self.entity.base.detach();
    }
}

#[async_trait]
impl ClimateEntity for EcobeeThermostat {
    fn temperature_unit(&self) -> String {
        "°F".to_string()
    }

    fn hvac_mode(&self) -> Option<HvacMode> {
        self.entity.with_thermostat(|t| hvac_mode(&t.settings)).flatten()
    }

    fn hvac_modes(&self) -> Vec<HvacMode> {
        self.hvac_modes.clone()
    }

    fn hvac_action(&self) -> Option<HvacAction> {
        self.entity.with_thermostat(|t| hvac_action(&t.equipment_status))
    }

    fn current_temperature(&self) -> Option<f64> {
        self.entity.with_thermostat(|t| tenths(t.runtime.actual_temperature))
    }

    fn current_humidity(&self) -> Option<f64> {
        self.entity
            .with_thermostat(|t| t.runtime.actual_humidity.map(|h| h as f64))
            .flatten()
    }

    fn target_temperature(&self) -> Option<f64> {
        self.entity
            .with_thermostat(|t| match hvac_mode(&t.settings) {
                Some(HvacMode::Heat) => Some(tenths(t.runtime.desired_heat)),
                Some(HvacMode::Cool) => Some(tenths(t.runtime.desired_cool)),
                _ => None,
            })
            .flatten()
    }

    fn target_temperature_low(&self) -> Option<f64> {
        self.entity
            .with_thermostat(|t| {
                (hvac_mode(&t.settings) == Some(HvacMode::HeatCool))
                    .then(|| tenths(t.runtime.desired_heat))
            })
            .flatten()
    }

    fn target_temperature_high(&self) -> Option<f64> {
        self.entity
            .with_thermostat(|t| {
                (hvac_mode(&t.settings) == Some(HvacMode::HeatCool))
                    .then(|| tenths(t.runtime.desired_cool))
            })
            .flatten()
    }

    fn target_temperature_step(&self) -> Option<f64> {
        Some(0.5)
    }

    fn min_temp(&self) -> f64 {
        self.entity
            .with_thermostat(|t| t.settings.heat_range_low)
            .filter(|low| *low > 0)
            .map_or(DEFAULT_MIN_TEMP, tenths)
    }

    fn max_temp(&self) -> f64 {
        self.entity
            .with_thermostat(|t| t.settings.cool_range_high)
            .filter(|high| *high > 0)
            .map_or(DEFAULT_MAX_TEMP, tenths)
    }

    fn fan_mode(&self) -> Option<String> {
        self.entity
            .with_thermostat(|t| t.runtime.desired_fan_mode.clone())
            .filter(|mode| !mode.is_empty())
    }

    fn fan_modes(&self) -> Vec<String> {
        vec![FAN_AUTO.to_string(), FAN_ON.to_string()]
    }

    fn preset_mode(&self) -> Option<String> {
        self.entity.with_thermostat(preset_mode).flatten()
    }

    fn preset_modes(&self) -> Vec<String> {
        self.entity.with_thermostat(preset_modes).unwrap_or_default()
    }

    async fn set_temperature(&self, request: TemperatureRequest) -> Result<(), EntityError> {
        let thermostat = self.thermostat()?;
        let ranged = request.target_temp_low.is_some() || request.target_temp_high.is_some();

        let function = if hvac_mode(&thermostat.settings) == Some(HvacMode::HeatCool) && ranged {
            let heat = request
                .target_temp_low
                .unwrap_or_else(|| tenths(thermostat.runtime.desired_heat));
            let cool = request
                .target_temp_high
                .unwrap_or_else(|| tenths(thermostat.runtime.desired_cool));
            Self::hold(&thermostat, heat, cool)
        } else if let Some(temperature) = request.temperature {
            Self::single_hold(&thermostat, temperature)
        } else {
            return Err(EntityError::InvalidValue(
                "temperature is required outside heat_cool mode".into(),
            ));
        };
        self.send(vec![function]).await
    }

    async fn set_hvac_mode(&self, mode: HvacMode) -> Result<(), EntityError> {
        let ecobee_mode = ecobee_hvac_mode(mode).ok_or_else(|| {
            EntityError::InvalidValue(format!("ecobee has no {} mode", mode.as_str()))
        })?;
        self.client
            .set_hvac_mode(&self.entity.identifier, ecobee_mode)
            .await
            .map_err(api_error)?;
        self.entity.base.request_refresh().await;
        Ok(())
    }

    async fn set_preset_mode(&self, preset: &str) -> Result<(), EntityError> {
        let thermostat = self.thermostat()?;
        let current = preset_mode(&thermostat);
        if current.as_deref() == Some(preset) {
            return Ok(());
        }

        let mut functions = Vec::new();
        if current.as_deref() == Some(PRESET_VACATION) {
            let vacation = thermostat
                .events
                .iter()
                .find(|e| e.running && e.event_type == "vacation");
            if let Some(vacation) = vacation {
                functions.push(Function::delete_vacation(&vacation.name));
            }
        }

        let settings = &thermostat.settings;
        let hold = if preset == PRESET_AWAY_INDEFINITELY {
            Function::hold_climate("away", HoldType::Indefinite, hold_hours(settings))
        } else {
            let name = from_preset(preset);
            let Some(climate) = thermostat.program.climates.iter().find(|c| c.name == name) else {
                warn!(preset, "Received unknown preset mode");
                return Err(EntityError::InvalidValue(format!("unknown preset {preset}")));
            };
            Function::hold_climate(
                &climate.climate_ref,
                hold_preference(settings),
                hold_hours(settings),
            )
        };
        functions.push(hold);
        self.send(functions).await
    }

    async fn set_fan_mode(&self, fan_mode: &str) -> Result<(), EntityError> {
        let fan_mode = fan_mode.to_lowercase();
        if fan_mode != FAN_ON && fan_mode != FAN_AUTO {
            return Err(EntityError::InvalidValue(format!(
                "invalid fan mode {fan_mode}, valid modes are 'on' and 'auto'"
            )));
        }
        let thermostat = self.thermostat()?;
        let settings = &thermostat.settings;
        self.send(vec![Function::hold_fan(
            &fan_mode,
            hold_preference(settings),
            hold_hours(settings),
        )])
        .await
    }
}

pub fn entities(coordinator: &Arc<EcobeeCoordinator>, client: &EcobeeClient) -> Vec<PlatformEntity> {
    let Some(thermostats) = coordinator.data() else {
        return Vec::new();
    };
    thermostats
        .iter()
        .map(|thermostat| {
            PlatformEntity::climate(EcobeeThermostat::new(
                coordinator.clone(),
                client.clone(),
                thermostat,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecobee::api::{Climate, Event, Program};

    fn thermostat() -> Thermostat {
        Thermostat {
            identifier: "511863391017".into(),
            name: "Hallway".into(),
            program: Program {
                climates: vec![
                    Climate {
                        climate_ref: "home".into(),
                        name: "Home".into(),
                    },
                    Climate {
                        climate_ref: "away".into(),
                        name: "Away".into(),
                    },
                    Climate {
                        climate_ref: "smart1".into(),
                        name: "Workout".into(),
                    },
                ],
                current_climate_ref: "home".into(),
            },
            ..Default::default()
        }
    }

    fn hold(climate_ref: &str, start: &str, end: &str) -> Event {
        Event {
            event_type: "hold".into(),
            running: true,
            hold_climate_ref: climate_ref.into(),
            start_date: start.into(),
            end_date: end.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hvac_action_priority() {
        assert_eq!(hvac_action(""), HvacAction::Idle);
        assert_eq!(hvac_action("fan"), HvacAction::Fan);
        assert_eq!(hvac_action("fan,compCool1"), HvacAction::Cooling);
        assert_eq!(hvac_action("dehumidifier,fan"), HvacAction::Drying);
        assert_eq!(hvac_action("auxHeat1,fan,compCool1"), HvacAction::Heating);
        assert_eq!(hvac_action("humidifier"), HvacAction::Idle);
    }

    #[test]
    fn test_supported_modes_follow_equipment() {
        let heat_only = Settings {
            heat_stages: 1,
            ..Default::default()
        };
        assert_eq!(supported_hvac_modes(&heat_only), vec![HvacMode::Heat, HvacMode::Off]);

        let both = Settings {
            has_heat_pump: true,
            cool_stages: 2,
            ..Default::default()
        };
        assert_eq!(
            supported_hvac_modes(&both),
            vec![HvacMode::HeatCool, HvacMode::Heat, HvacMode::Cool, HvacMode::Off]
        );
    }

    #[test]
    fn test_aux_heat_reads_as_heat() {
        let settings = Settings {
            hvac_mode: "auxHeatOnly".into(),
            ..Default::default()
        };
        assert_eq!(hvac_mode(&settings), Some(HvacMode::Heat));
        assert_eq!(ecobee_hvac_mode(HvacMode::HeatCool), Some("auto"));
        assert_eq!(ecobee_hvac_mode(HvacMode::Dry), None);
    }

    #[test]
    fn test_preset_from_schedule_and_events() {
        let mut t = thermostat();
        assert_eq!(preset_mode(&t).as_deref(), Some("home"));
        assert_eq!(
            preset_modes(&t),
            vec!["home", "away", "Workout", PRESET_AWAY_INDEFINITELY]
        );

        t.events = vec![hold("smart1", "2024-01-01", "2024-01-01")];
        assert_eq!(preset_mode(&t).as_deref(), Some("Workout"));

        t.events = vec![hold("away", "2024-01-01", "2035-01-01")];
        assert_eq!(preset_mode(&t).as_deref(), Some(PRESET_AWAY_INDEFINITELY));

        t.events = vec![hold("", "2024-01-01", "2024-01-01")];
        assert_eq!(preset_mode(&t).as_deref(), Some(PRESET_TEMPERATURE));

        t.events = vec![Event {
            event_type: "vacation".into(),
            name: "Skiing".into(),
            running: true,
            ..Default::default()
        }];
        assert_eq!(preset_mode(&t).as_deref(), Some(PRESET_VACATION));

        // Events that are not running are ignored
        t.events[0].running = false;
        assert_eq!(preset_mode(&t).as_deref(), Some("home"));
    }

    #[test]
    fn test_hold_preference() {
        let settings = |action: &str| Settings {
            hold_action: action.into(),
            ..Default::default()
        };
        assert_eq!(hold_preference(&settings("useEndTime2hour")), HoldType::HoldHours);
        assert_eq!(hold_hours(&settings("useEndTime4hour")), Some(4));
        assert_eq!(hold_preference(&settings("indefinite")), HoldType::Indefinite);
        assert_eq!(hold_preference(&settings("askMe")), HoldType::NextTransition);
        assert_eq!(hold_hours(&settings("nextPeriod")), None);
    }
}
