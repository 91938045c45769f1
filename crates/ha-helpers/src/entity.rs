//! Entity model integrations implement
//!
//! [`Entity`] carries what every entity has. Each platform adds a trait on
//! top that says how the state is derived (`SensorEntity::native_value`,
//! `SwitchEntity::is_on`, ...) and which actions it accepts. The platform
//! wraps entities in [`PlatformEntity`] and turns them into a state string
//! and attributes when writing to the state store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ha_core::{
    EntityId, Platform, State, StateError, ATTR_DEVICE_CLASS, ATTR_FRIENDLY_NAME, ATTR_ICON,
    ATTR_STATE_CLASS, ATTR_TEMPERATURE, ATTR_UNIT_OF_MEASUREMENT, STATE_OFF, STATE_ON,
};
use ha_registries::{DeviceInfo, EntityCategory};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::entity_platform::LiveEntity;

pub type Attributes = HashMap<String, Value>;

/// Failure of an entity action such as `turn_on`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EntityError {
    #[error("{0}")]
    Failed(String),

    #[error("{0} is not supported")]
    NotSupported(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Native value of an entity before it becomes a state string
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Text(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl StateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Int(v) => Some(*v as f64),
            StateValue::Float(v) => Some(*v),
            StateValue::Text(s) => s.parse().ok(),
            StateValue::Timestamp(_) => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Text(s) => f.write_str(s),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Float(v) => f.write_str(&format_float(*v)),
            StateValue::Timestamp(ts) => {
                f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
        }
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for StateValue {
    fn from(v: DateTime<Utc>) -> Self {
        StateValue::Timestamp(v)
    }
}

/// Float as a state string; whole numbers keep one decimal (`21.0`)
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

impl StateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateClass::Measurement => "measurement",
            StateClass::Total => "total",
            StateClass::TotalIncreasing => "total_increasing",
        }
    }
}

/// Static properties of an entity kind, shared by every instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDescription {
    pub key: String,
    pub translation_key: Option<String>,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub state_class: Option<StateClass>,
    pub entity_category: Option<EntityCategory>,
    pub suggested_display_precision: Option<u32>,
    pub entity_registry_enabled_default: bool,
}

impl EntityDescription {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entity_registry_enabled_default: true,
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn translation_key(mut self, key: impl Into<String>) -> Self {
        self.translation_key = Some(key.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn state_class(mut self, state_class: StateClass) -> Self {
        self.state_class = Some(state_class);
        self
    }

    pub fn category(mut self, category: EntityCategory) -> Self {
        self.entity_category = Some(category);
        self
    }

    pub fn precision(mut self, digits: u32) -> Self {
        self.suggested_display_precision = Some(digits);
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.entity_registry_enabled_default = false;
        self
    }
}

/// What every entity reports, whatever its platform
#[async_trait]
pub trait Entity: Send + Sync {
    fn entity_description(&self) -> Option<&EntityDescription> {
        None
    }

    /// Needed to register the entity; without it the entity id is not
    /// stable across restarts
    fn unique_id(&self) -> Option<String> {
        None
    }

    fn name(&self) -> Option<String> {
        self.entity_description().and_then(|d| d.name.clone())
    }

    /// When set, `name` is relative to the device name
    fn has_entity_name(&self) -> bool {
        false
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }

    fn available(&self) -> bool {
        true
    }

    fn extra_state_attributes(&self) -> Attributes {
        Attributes::new()
    }

    fn entity_category(&self) -> Option<EntityCategory> {
        self.entity_description().and_then(|d| d.entity_category)
    }

    fn icon(&self) -> Option<String> {
        self.entity_description().and_then(|d| d.icon.clone())
    }

    fn device_class(&self) -> Option<String> {
        self.entity_description()
            .and_then(|d| d.device_class.clone())
    }

    fn entity_registry_enabled_default(&self) -> bool {
        self.entity_description()
            .map(|d| d.entity_registry_enabled_default)
            .unwrap_or(true)
    }

    /// Whether the platform calls [`Entity::update`] on its scan interval
    fn should_poll(&self) -> bool {
        false
    }

    async fn update(&self) {}

    /// Called once the entity has an entity id and its first state
    async fn added_to_hass(&self, _handle: EntityHandle) {}

    async fn will_remove(&self) {}
}

pub trait SensorEntity: Entity {
    fn native_value(&self) -> Option<StateValue>;

    fn native_unit_of_measurement(&self) -> Option<String> {
        self.entity_description()
            .and_then(|d| d.unit_of_measurement.clone())
    }

    fn state_class(&self) -> Option<StateClass> {
        self.entity_description().and_then(|d| d.state_class)
    }

    fn suggested_display_precision(&self) -> Option<u32> {
        self.entity_description()
            .and_then(|d| d.suggested_display_precision)
    }
}

pub trait BinarySensorEntity: Entity {
    fn is_on(&self) -> Option<bool>;
}

#[async_trait]
pub trait SwitchEntity: Entity {
    fn is_on(&self) -> Option<bool>;

    async fn turn_on(&self) -> Result<(), EntityError>;

    async fn turn_off(&self) -> Result<(), EntityError>;

    async fn toggle(&self) -> Result<(), EntityError> {
        if self.is_on() == Some(true) {
            self.turn_off().await
        } else {
            self.turn_on().await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
    HeatCool,
    Auto,
    Dry,
    FanOnly,
}

impl HvacMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::Off => "off",
            HvacMode::Heat => "heat",
            HvacMode::Cool => "cool",
            HvacMode::HeatCool => "heat_cool",
            HvacMode::Auto => "auto",
            HvacMode::Dry => "dry",
            HvacMode::FanOnly => "fan_only",
        }
    }
}

/// What the device is doing right now, as opposed to the mode it is set to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
    Cooling,
    Drying,
    Fan,
}

/// Arguments of `climate.set_temperature`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TemperatureRequest {
    pub temperature: Option<f64>,
    pub target_temp_low: Option<f64>,
    pub target_temp_high: Option<f64>,
    pub hvac_mode: Option<HvacMode>,
}

#[async_trait]
pub trait ClimateEntity: Entity {
    fn temperature_unit(&self) -> String;

    fn hvac_mode(&self) -> Option<HvacMode>;

    fn hvac_modes(&self) -> Vec<HvacMode>;

    fn hvac_action(&self) -> Option<HvacAction> {
        None
    }

    fn current_temperature(&self) -> Option<f64> {
        None
    }

    fn current_humidity(&self) -> Option<f64> {
        None
    }

    fn target_temperature(&self) -> Option<f64> {
        None
    }

    fn target_temperature_low(&self) -> Option<f64> {
        None
    }

    fn target_temperature_high(&self) -> Option<f64> {
        None
    }

    fn target_temperature_step(&self) -> Option<f64> {
        None
    }

    fn min_temp(&self) -> f64 {
        7.0
    }

    fn max_temp(&self) -> f64 {
        35.0
    }

    fn fan_mode(&self) -> Option<String> {
        None
    }

    fn fan_modes(&self) -> Vec<String> {
        Vec::new()
    }

    fn preset_mode(&self) -> Option<String> {
        None
    }

    fn preset_modes(&self) -> Vec<String> {
        Vec::new()
    }

    async fn set_temperature(&self, _request: TemperatureRequest) -> Result<(), EntityError> {
        Err(EntityError::NotSupported("set_temperature".into()))
    }

    async fn set_hvac_mode(&self, _mode: HvacMode) -> Result<(), EntityError> {
        Err(EntityError::NotSupported("set_hvac_mode".into()))
    }

    async fn set_preset_mode(&self, _preset: &str) -> Result<(), EntityError> {
        Err(EntityError::NotSupported("set_preset_mode".into()))
    }

    async fn set_fan_mode(&self, _fan_mode: &str) -> Result<(), EntityError> {
        Err(EntityError::NotSupported("set_fan_mode".into()))
    }
}

#[async_trait]
pub trait ButtonEntity: Entity {
    async fn press(&self) -> Result<(), EntityError>;
}

/// An entity together with the platform it belongs to
#[derive(Clone)]
pub enum PlatformEntity {
    Sensor(Arc<dyn SensorEntity>),
    BinarySensor(Arc<dyn BinarySensorEntity>),
    Switch(Arc<dyn SwitchEntity>),
    Climate(Arc<dyn ClimateEntity>),
    Button(Arc<dyn ButtonEntity>),
}

/// Call a base [`Entity`] method whatever the platform
macro_rules! dispatch {
    ($self:expr, $entity:ident => $call:expr) => {
        match $self {
            PlatformEntity::Sensor($entity) => $call,
            PlatformEntity::BinarySensor($entity) => $call,
            PlatformEntity::Switch($entity) => $call,
            PlatformEntity::Climate($entity) => $call,
            PlatformEntity::Button($entity) => $call,
        }
    };
}

impl PlatformEntity {
    pub fn sensor(entity: impl SensorEntity + 'static) -> Self {
        PlatformEntity::Sensor(Arc::new(entity))
    }

    pub fn binary_sensor(entity: impl BinarySensorEntity + 'static) -> Self {
        PlatformEntity::BinarySensor(Arc::new(entity))
    }

    pub fn switch(entity: impl SwitchEntity + 'static) -> Self {
        PlatformEntity::Switch(Arc::new(entity))
    }

    pub fn climate(entity: impl ClimateEntity + 'static) -> Self {
        PlatformEntity::Climate(Arc::new(entity))
    }

    pub fn button(entity: impl ButtonEntity + 'static) -> Self {
        PlatformEntity::Button(Arc::new(entity))
    }

    pub fn platform(&self) -> Platform {
        match self {
            PlatformEntity::Sensor(_) => Platform::Sensor,
            PlatformEntity::BinarySensor(_) => Platform::BinarySensor,
            PlatformEntity::Switch(_) => Platform::Switch,
            PlatformEntity::Climate(_) => Platform::Climate,
            PlatformEntity::Button(_) => Platform::Button,
        }
    }

    pub fn unique_id(&self) -> Option<String> {
        dispatch!(self, e => e.unique_id())
    }

    pub fn name(&self) -> Option<String> {
        dispatch!(self, e => e.name())
    }

    pub fn has_entity_name(&self) -> bool {
        dispatch!(self, e => e.has_entity_name())
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        dispatch!(self, e => e.device_info())
    }

    pub fn available(&self) -> bool {
        dispatch!(self, e => e.available())
    }

    pub fn entity_category(&self) -> Option<EntityCategory> {
        dispatch!(self, e => e.entity_category())
    }

    pub fn entity_registry_enabled_default(&self) -> bool {
        dispatch!(self, e => e.entity_registry_enabled_default())
    }

    pub fn should_poll(&self) -> bool {
        dispatch!(self, e => e.should_poll())
    }

    pub fn device_class(&self) -> Option<String> {
        dispatch!(self, e => e.device_class())
    }

    pub fn unit_of_measurement(&self) -> Option<String> {
        match self {
            PlatformEntity::Sensor(e) => e.native_unit_of_measurement(),
            _ => None,
        }
    }

    pub async fn update(&self) {
        dispatch!(self, e => e.update().await)
    }

    pub async fn added_to_hass(&self, handle: EntityHandle) {
        dispatch!(self, e => e.added_to_hass(handle).await)
    }

    pub async fn will_remove(&self) {
        dispatch!(self, e => e.will_remove().await)
    }

    /// Current state; `None` is written as `unknown`
    ///
    /// Buttons have no state of their own, the platform tracks the last
    /// press instead.
    pub fn state(&self) -> Option<StateValue> {
        match self {
            PlatformEntity::Sensor(e) => e.native_value(),
            PlatformEntity::BinarySensor(e) => e.is_on().map(on_off),
            PlatformEntity::Switch(e) => e.is_on().map(on_off),
            PlatformEntity::Climate(e) => e.hvac_mode().map(|m| StateValue::from(m.as_str())),
            PlatformEntity::Button(_) => None,
        }
    }

    /// Attributes that describe what the entity can do; kept while unavailable
    pub fn capability_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        match self {
            PlatformEntity::Sensor(e) => {
                if let Some(state_class) = e.state_class() {
                    attrs.insert(ATTR_STATE_CLASS.into(), json!(state_class.as_str()));
                }
            }
            PlatformEntity::Climate(e) => {
                let modes: Vec<&str> = e.hvac_modes().iter().map(HvacMode::as_str).collect();
                attrs.insert("hvac_modes".into(), json!(modes));
                attrs.insert("min_temp".into(), json!(e.min_temp()));
                attrs.insert("max_temp".into(), json!(e.max_temp()));
                if let Some(step) = e.target_temperature_step() {
                    attrs.insert("target_temp_step".into(), json!(step));
                }
                let fan_modes = e.fan_modes();
                if !fan_modes.is_empty() {
                    attrs.insert("fan_modes".into(), json!(fan_modes));
                }
                let preset_modes = e.preset_modes();
                if !preset_modes.is_empty() {
                    attrs.insert("preset_modes".into(), json!(preset_modes));
                }
            }
            _ => {}
        }
        attrs
    }

    /// Platform attributes that only make sense while available
    pub fn state_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        if let PlatformEntity::Climate(e) = self {
            attrs.insert("current_temperature".into(), json!(e.current_temperature()));
            attrs.insert(ATTR_TEMPERATURE.into(), json!(e.target_temperature()));
            attrs.insert("target_temp_low".into(), json!(e.target_temperature_low()));
            attrs.insert("target_temp_high".into(), json!(e.target_temperature_high()));
            if let Some(humidity) = e.current_humidity() {
                attrs.insert("current_humidity".into(), json!(humidity));
            }
            if let Some(action) = e.hvac_action() {
                attrs.insert("hvac_action".into(), json!(action));
            }
            if let Some(fan_mode) = e.fan_mode() {
                attrs.insert("fan_mode".into(), json!(fan_mode));
            }
            if let Some(preset) = e.preset_mode() {
                attrs.insert("preset_mode".into(), json!(preset));
            }
        }
        attrs
    }

    pub fn extra_state_attributes(&self) -> Attributes {
        dispatch!(self, e => e.extra_state_attributes())
    }

    /// `friendly_name`, unit, device and icon
    pub(crate) fn static_attributes(&self, friendly_name: Option<&str>) -> Attributes {
        let mut attrs = Attributes::new();
        if let Some(unit) = self.unit_of_measurement() {
            attrs.insert(ATTR_UNIT_OF_MEASUREMENT.into(), json!(unit));
        }
        if let Some(device_class) = self.device_class() {
            attrs.insert(ATTR_DEVICE_CLASS.into(), json!(device_class));
        }
        if let Some(icon) = dispatch!(self, e => e.icon()) {
            attrs.insert(ATTR_ICON.into(), json!(icon));
        }
        if let Some(name) = friendly_name {
            attrs.insert(ATTR_FRIENDLY_NAME.into(), json!(name));
        }
        attrs
    }
}

fn on_off(is_on: bool) -> StateValue {
    StateValue::from(if is_on { STATE_ON } else { STATE_OFF })
}

/// Name shown to users
///
/// With `has_entity_name` the entity name is appended to the device name,
/// and an entity without a name of its own takes the device name.
pub fn friendly_name(
    entity_name: Option<&str>,
    has_entity_name: bool,
    device_name: Option<&str>,
) -> Option<String> {
    if !has_entity_name {
        return entity_name.map(String::from);
    }
    match (device_name, entity_name) {
        (Some(device), Some(name)) => Some(format!("{} {}", device, name)),
        (Some(device), None) => Some(device.to_string()),
        (None, name) => name.map(String::from),
    }
}

/// Given to an entity once it has been added, to push state writes
#[derive(Clone)]
pub struct EntityHandle {
    entity_id: EntityId,
    live: Weak<LiveEntity>,
}

impl EntityHandle {
    pub(crate) fn new(entity_id: EntityId, live: Weak<LiveEntity>) -> Self {
        Self { entity_id, live }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Recompute and store the state; a no-op once the entity was removed
    pub fn write_state(&self) -> Option<State> {
        let live = self.live.upgrade()?;
        match live.write_state() {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(entity_id = %self.entity_id, %err, "Could not write entity state");
                None
            }
        }
    }

    /// Recompute and store the state, reporting failures
    pub fn try_write_state(&self) -> Result<Option<State>, StateError> {
        match self.live.upgrade() {
            Some(live) => live.write_state().map(Some),
            None => Ok(None),
        }
    }
}
