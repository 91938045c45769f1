//! Entity services
//!
//! Platform services (`switch.turn_on`, `climate.set_temperature`, ...) are
//! registered once and dispatch to the targeted live entities. Integrations
//! add their own with [`register_entity_service`].

use std::future::Future;
use std::sync::Arc;

use ha_core::{Platform, ServiceCall, SupportsResponse};
use ha_service_registry::{ServiceDescription, ServiceError, ServiceResult};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::entity::{EntityError, HvacMode, PlatformEntity, TemperatureRequest};
use crate::entity_platform::LiveEntity;
use crate::hass::Hass;

impl From<EntityError> for ServiceError {
    fn from(err: EntityError) -> Self {
        match err {
            EntityError::InvalidValue(message) => ServiceError::InvalidData(message),
            other => ServiceError::CallFailed(other.to_string()),
        }
    }
}

fn entity_id_schema() -> Value {
    json!({
        "anyOf": [
            { "type": "string" },
            { "type": "array", "items": { "type": "string" } }
        ]
    })
}

/// Schema of an entity service: `entity_id` plus the given fields
pub fn entity_service_schema(properties: Value, required: &[&str]) -> Value {
    let mut props = properties.as_object().cloned().unwrap_or_default();
    props.insert("entity_id".into(), entity_id_schema());
    props.insert("device_id".into(), json!({}));
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

fn write_after_action(live: &LiveEntity) {
    if let Err(err) = live.write_state() {
        warn!(entity_id = %live.entity_id(), %err, "Could not write state after service call");
    }
}

/// Register a service of `domain` that runs `handler` once per targeted
/// entity of `platform`
///
/// With a response, the result maps each entity id to its handler's
/// response.
pub fn register_entity_service<F, Fut>(
    hass: &Hass,
    domain: &str,
    service: &str,
    platform: Platform,
    schema: Option<Value>,
    supports_response: SupportsResponse,
    handler: F,
) -> Result<(), ServiceError>
where
    F: Fn(Arc<LiveEntity>, ServiceCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServiceResult> + Send + 'static,
{
    let mut description = ServiceDescription::new(domain, service)
        .with_target(platform.as_str())
        .with_response(supports_response);
    description.schema = schema;

    let entities = hass.entities.clone();
    let handler = Arc::new(handler);
    hass.services
        .register_with_description(description, move |call: ServiceCall| {
            let entities = entities.clone();
            let handler = handler.clone();
            async move {
                let targets = entities.targets(&call, platform);
                debug!(service = %call.service_id(), targets = targets.len(), "Dispatching entity service");

                let mut responses = Map::new();
                for live in targets {
                    let entity_id = live.entity_id().to_string();
                    if let Some(response) = handler(live, call.clone()).await? {
                        responses.insert(entity_id, response);
                    }
                }
                if responses.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Value::Object(responses)))
                }
            }
        })
}

/// Register the services every platform offers
pub fn register_platform_services(hass: &Hass) -> Result<(), ServiceError> {
    let no_fields = || Some(entity_service_schema(json!({}), &[]));
    let hvac_modes: Vec<Value> = [
        HvacMode::Off,
        HvacMode::Heat,
        HvacMode::Cool,
        HvacMode::HeatCool,
        HvacMode::Auto,
        HvacMode::Dry,
        HvacMode::FanOnly,
    ]
    .iter()
    .map(|m| json!(m.as_str()))
    .collect();

    for service in ["turn_on", "turn_off", "toggle"] {
        register_entity_service(
            hass,
            Platform::Switch.as_str(),
            service,
            Platform::Switch,
            no_fields(),
            SupportsResponse::None,
            move |live, _call| async move {
                if let PlatformEntity::Switch(switch) = live.entity() {
                    match service {
                        "turn_on" => switch.turn_on().await?,
                        "turn_off" => switch.turn_off().await?,
                        _ => switch.toggle().await?,
                    }
                    write_after_action(&live);
                }
                Ok(None)
            },
        )?;
    }

    register_entity_service(
        hass,
        Platform::Climate.as_str(),
        "set_temperature",
        Platform::Climate,
        Some(entity_service_schema(
            json!({
                "temperature": { "type": "number" },
                "target_temp_low": { "type": "number" },
                "target_temp_high": { "type": "number" },
                "hvac_mode": { "enum": hvac_modes.clone() },
            }),
            &[],
        )),
        SupportsResponse::None,
        |live, call| async move {
            let request: TemperatureRequest =
                serde_json::from_value(Value::Object(call.data_without_target()))
                    .map_err(|e| ServiceError::InvalidData(e.to_string()))?;
            if request.temperature.is_none()
                && request.target_temp_low.is_none()
                && request.target_temp_high.is_none()
            {
                return Err(ServiceError::InvalidData(
                    "one of temperature, target_temp_low or target_temp_high is required".into(),
                ));
            }
            if let PlatformEntity::Climate(climate) = live.entity() {
                if let Some(mode) = request.hvac_mode {
                    climate.set_hvac_mode(mode).await?;
                }
                climate.set_temperature(request).await?;
                write_after_action(&live);
            }
            Ok(None)
        },
    )?;

    register_entity_service(
        hass,
        Platform::Climate.as_str(),
        "set_hvac_mode",
        Platform::Climate,
        Some(entity_service_schema(
            json!({ "hvac_mode": { "enum": hvac_modes } }),
            &["hvac_mode"],
        )),
        SupportsResponse::None,
        |live, call| async move {
            let mode: HvacMode = call
                .get("hvac_mode")
                .ok_or_else(|| ServiceError::InvalidData("hvac_mode is required".into()))?;
            if let PlatformEntity::Climate(climate) = live.entity() {
                if !climate.hvac_modes().contains(&mode) {
                    return Err(ServiceError::InvalidData(format!(
                        "{} does not support hvac mode {}",
                        live.entity_id(),
                        mode.as_str()
                    )));
                }
                climate.set_hvac_mode(mode).await?;
                write_after_action(&live);
            }
            Ok(None)
        },
    )?;

    register_entity_service(
        hass,
        Platform::Climate.as_str(),
        "set_preset_mode",
        Platform::Climate,
        Some(entity_service_schema(
            json!({ "preset_mode": { "type": "string" } }),
            &["preset_mode"],
        )),
        SupportsResponse::None,
        |live, call| async move {
            let preset: String = call
                .get("preset_mode")
                .ok_or_else(|| ServiceError::InvalidData("preset_mode is required".into()))?;
            if let PlatformEntity::Climate(climate) = live.entity() {
                if !climate.preset_modes().contains(&preset) {
                    return Err(ServiceError::InvalidData(format!(
                        "{} does not support preset {}",
                        live.entity_id(),
                        preset
                    )));
                }
                climate.set_preset_mode(&preset).await?;
                write_after_action(&live);
            }
            Ok(None)
        },
    )?;

    register_entity_service(
        hass,
        Platform::Climate.as_str(),
        "set_fan_mode",
        Platform::Climate,
        Some(entity_service_schema(
            json!({ "fan_mode": { "type": "string" } }),
            &["fan_mode"],
        )),
        SupportsResponse::None,
        |live, call| async move {
            let fan_mode: String = call
                .get("fan_mode")
                .ok_or_else(|| ServiceError::InvalidData("fan_mode is required".into()))?;
            if let PlatformEntity::Climate(climate) = live.entity() {
                climate.set_fan_mode(&fan_mode).await?;
                write_after_action(&live);
            }
            Ok(None)
        },
    )?;

    register_entity_service(
        hass,
        Platform::Button.as_str(),
        "press",
        Platform::Button,
        no_fields(),
        SupportsResponse::None,
        |live, _call| async move {
            if let PlatformEntity::Button(button) = live.entity() {
                button.press().await?;
                live.mark_pressed();
                write_after_action(&live);
            }
            Ok(None)
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ButtonEntity, ClimateEntity, Entity, SwitchEntity};
    use crate::entity_platform::EntityPlatform;
    use async_trait::async_trait;
    use ha_core::Context;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Plug {
        name: &'static str,
        on: AtomicBool,
    }

    impl Entity for Plug {
        fn name(&self) -> Option<String> {
            Some(self.name.into())
        }
    }

    #[async_trait]
    impl SwitchEntity for Plug {
        fn is_on(&self) -> Option<bool> {
            Some(self.on.load(Ordering::SeqCst))
        }

        async fn turn_on(&self) -> Result<(), EntityError> {
            self.on.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn turn_off(&self) -> Result<(), EntityError> {
            self.on.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Heater {
        mode: Mutex<HvacMode>,
        target: Mutex<Option<f64>>,
    }

    impl Entity for Heater {
        fn name(&self) -> Option<String> {
            Some("Heater".into())
        }
    }

    #[async_trait]
    impl ClimateEntity for Heater {
        fn temperature_unit(&self) -> String {
            "°C".into()
        }

        fn hvac_mode(&self) -> Option<HvacMode> {
            Some(*self.mode.lock().unwrap())
        }

        fn hvac_modes(&self) -> Vec<HvacMode> {
            vec![HvacMode::Off, HvacMode::Heat]
        }

        fn target_temperature(&self) -> Option<f64> {
            *self.target.lock().unwrap()
        }

        async fn set_temperature(&self, request: TemperatureRequest) -> Result<(), EntityError> {
            *self.target.lock().unwrap() = request.temperature;
            Ok(())
        }

        async fn set_hvac_mode(&self, mode: HvacMode) -> Result<(), EntityError> {
            *self.mode.lock().unwrap() = mode;
            Ok(())
        }
    }

    struct Bell(AtomicUsize);

    impl Entity for Bell {
        fn name(&self) -> Option<String> {
            Some("Bell".into())
        }
    }

    #[async_trait]
    impl ButtonEntity for Bell {
        async fn press(&self) -> Result<(), EntityError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup(dir: &TempDir) -> (Hass, Vec<EntityPlatform>) {
        let hass = Hass::new(dir.path());
        register_platform_services(&hass).unwrap();

        let switches = EntityPlatform::new(hass.clone(), Platform::Switch, "test", None);
        switches
            .add_entities(vec![
                PlatformEntity::switch(Plug { name: "Kettle", on: AtomicBool::new(false) }),
                PlatformEntity::switch(Plug { name: "Lamp", on: AtomicBool::new(true) }),
            ])
            .await
            .unwrap();

        let climates = EntityPlatform::new(hass.clone(), Platform::Climate, "test", None);
        climates
            .add_entities(vec![PlatformEntity::climate(Heater {
                mode: Mutex::new(HvacMode::Off),
                target: Mutex::new(None),
            })])
            .await
            .unwrap();
        (hass, vec![switches, climates])
    }

    #[tokio::test]
    async fn test_switch_services() {
        let dir = TempDir::new().unwrap();
        let (hass, _platforms) = setup(&dir).await;

        hass.services
            .call("switch", "turn_on", json!({"entity_id": "switch.kettle"}), Context::new(), false)
            .await
            .unwrap();
        assert_eq!(hass.states.get_state("switch.kettle").as_deref(), Some("on"));

        hass.services
            .call("switch", "toggle", json!({"entity_id": "all"}), Context::new(), false)
            .await
            .unwrap();
        assert_eq!(hass.states.get_state("switch.kettle").as_deref(), Some("off"));
        assert_eq!(hass.states.get_state("switch.lamp").as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn test_climate_services() {
        let dir = TempDir::new().unwrap();
        let (hass, _platforms) = setup(&dir).await;

        hass.services
            .call(
                "climate",
                "set_temperature",
                json!({"entity_id": "climate.heater", "temperature": 21.5, "hvac_mode": "heat"}),
                Context::new(),
                false,
            )
            .await
            .unwrap();
        let state = hass.states.get("climate.heater").unwrap();
        assert_eq!(state.state, "heat");
        assert_eq!(state.attributes["temperature"], json!(21.5));

        let err = hass
            .services
            .call(
                "climate",
                "set_hvac_mode",
                json!({"entity_id": "climate.heater", "hvac_mode": "cool"}),
                Context::new(),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidData(_)));

        let err = hass
            .services
            .call(
                "climate",
                "set_hvac_mode",
                json!({"entity_id": "climate.heater"}),
                Context::new(),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidData(_)));

        let err = hass
            .services
            .call(
                "climate",
                "set_preset_mode",
                json!({"entity_id": "climate.heater", "preset_mode": "away"}),
                Context::new(),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_button_press_records_timestamp() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        register_platform_services(&hass).unwrap();
        let bell = Arc::new(Bell(AtomicUsize::new(0)));
        let buttons = EntityPlatform::new(hass.clone(), Platform::Button, "test", None);
        buttons
            .add_entities(vec![PlatformEntity::Button(bell.clone())])
            .await
            .unwrap();

        hass.services
            .call("button", "press", json!({"entity_id": "button.bell"}), Context::new(), false)
            .await
            .unwrap();
        assert_eq!(bell.0.load(Ordering::SeqCst), 1);
        let state = hass.states.get_state("button.bell").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&state).is_ok());
    }

    #[tokio::test]
    async fn test_entity_service_responses_are_keyed_by_entity() {
        let dir = TempDir::new().unwrap();
        let (hass, _platforms) = setup(&dir).await;

        register_entity_service(
            &hass,
            "test",
            "describe",
            Platform::Switch,
            None,
            SupportsResponse::Only,
            |live, _call| async move { Ok(Some(json!({ "name": live.friendly_name() }))) },
        )
        .unwrap();

        let response = hass
            .services
            .call(
                "test",
                "describe",
                json!({"entity_id": ["switch.kettle", "switch.lamp", "climate.heater"]}),
                Context::new(),
                true,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            response,
            json!({
                "switch.kettle": { "name": "Kettle" },
                "switch.lamp": { "name": "Lamp" },
            })
        );
    }
}
