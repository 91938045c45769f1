use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use ha_core::{
    EntityId, State, ATTR_DEVICE_CLASS, ATTR_STATE_CLASS, ATTR_UNIT_OF_MEASUREMENT, STATE_OFF,
    STATE_ON, STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use ha_event_bus::ListenerHandle;
use ha_helpers::{
    track_state_updates, Attributes, Entity, EntityHandle, Hass, SensorEntity, StateClass,
    StateValue,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::buffer::{BufferSnapshot, BufferedState, StateBuffer};
use super::config::StatisticsConfig;

const ICON: &str = "mdi:calculator";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the source entity last told us about itself
#[derive(Default)]
struct SourceInfo {
    unit: Option<String>,
    device_class: Option<String>,
    state_class: Option<String>,
}

struct Status {
    value: Option<StateValue>,
    available: bool,
    attributes: Attributes,
}

struct Core {
    hass: Hass,
    config: StatisticsConfig,
    buffer: StateBuffer,
    source: Mutex<SourceInfo>,
    status: Mutex<Status>,
    handle: Mutex<Option<EntityHandle>>,
    listener: Mutex<Option<ListenerHandle>>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

/// Sensor computing one characteristic over the recent states of another
/// entity
pub struct StatisticsSensor {
    core: Arc<Core>,
}

impl StatisticsSensor {
    pub fn new(hass: Hass, config: StatisticsConfig) -> Self {
        let buffer = StateBuffer::new(config.sampling_size, config.max_age)
            .with_retain_anchor(config.keep_last_sample);
        Self {
            core: Arc::new(Core {
                hass,
                buffer,
                source: Mutex::new(SourceInfo::default()),
                status: Mutex::new(Status {
                    value: None,
                    available: true,
                    attributes: Attributes::new(),
                }),
                handle: Mutex::new(None),
                listener: Mutex::new(None),
                expiry: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StatisticsConfig {
        &self.core.config
    }

    /// Samples currently held, for diagnostics
    pub fn buffered(&self) -> BufferSnapshot {
        self.core.buffer.states(Utc::now())
    }
}

impl Core {
    fn source_id(&self) -> &EntityId {
        &self.config.entity_id
    }

    fn is_binary(&self) -> bool {
        self.config.is_binary_source()
    }

    /// Feed a new source state into the buffer; `None` when the source was removed
    fn handle_source_state(&self, state: Option<&State>) {
        let Some(state) = state else {
            self.buffer.record_invalid();
            return;
        };
        if state.state == STATE_UNAVAILABLE {
            lock(&self.status).available = false;
            return;
        }
        lock(&self.status).available = true;
        if state.state == STATE_UNKNOWN {
            self.buffer.record_invalid();
            return;
        }

        let Some(value) = self.parse_value(&state.state) else {
            warn!(
                entity_id = %self.source_id(),
                state = %state.state,
                "Statistics source state is not a number, ignoring"
            );
            self.buffer.record_invalid();
            return;
        };

        let mut source = lock(&self.source);
        let attr = |key: &str| state.attribute::<String>(key);
        source.unit = attr(ATTR_UNIT_OF_MEASUREMENT);
        source.device_class = attr(ATTR_DEVICE_CLASS);
        source.state_class = attr(ATTR_STATE_CLASS);
        drop(source);

        self.buffer
            .insert(BufferedState::new(state.last_reported, value));
    }

    fn parse_value(&self, state: &str) -> Option<f64> {
        if self.is_binary() {
            return match state {
                STATE_ON => Some(1.0),
                STATE_OFF => Some(0.0),
                _ => None,
            };
        }
        state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// Recompute value and attributes from what is left in the buffer
    fn recalculate(&self) {
        let snapshot = self.buffer.states(Utc::now());
        let value = self
            .config
            .state_characteristic
            .compute(&snapshot, self.is_binary(), self.config.percentile)
            .map(|computed| computed.into_state(self.config.precision));
        trace!(
            entity_id = %self.source_id(),
            samples = snapshot.len(),
            ?value,
            "Recalculated statistics"
        );

        let mut attributes = Attributes::new();
        attributes.insert("source_value_valid".into(), json!(snapshot.last_valid));
        if let Some(size) = self.config.sampling_size {
            let ratio = snapshot.len() as f64 / size as f64;
            attributes.insert("buffer_usage_ratio".into(), json!(round2(ratio)));
        }
        if let Some(max_age) = self.config.max_age {
            let coverage = match (snapshot.timestamps.first(), snapshot.timestamps.last()) {
                (Some(first), Some(last)) if snapshot.len() > 1 => {
                    let span = (*last - *first).num_milliseconds() as f64 / 1000.0;
                    round2(span / max_age.as_secs_f64())
                }
                _ => 0.0,
            };
            attributes.insert("age_coverage_ratio".into(), json!(coverage));
        }

        let mut status = lock(&self.status);
        status.value = value;
        status.attributes = attributes;
    }

    fn write_state(&self) {
        if let Some(handle) = lock(&self.handle).as_ref() {
            handle.write_state();
        }
    }

    fn update(self: &Arc<Self>, state: Option<&State>) {
        self.handle_source_state(state);
        self.recalculate();
        self.schedule_expiry();
        self.write_state();
    }

    /// Wake up when the oldest sample expires, even without source updates
    fn schedule_expiry(self: &Arc<Self>) {
        let mut expiry = lock(&self.expiry);
        if let Some(task) = expiry.take() {
            task.abort();
        }
        let Some(at) = self.buffer.next_expiry() else {
            return;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        debug!(entity_id = %self.source_id(), ?delay, "Next sample expires");

        let core = Arc::downgrade(self);
        *expiry = Some(tokio::spawn(async move {
            // A sample only counts as expired once it is older than max_age
            tokio::time::sleep(delay + std::time::Duration::from_millis(1)).await;
            if let Some(core) = core.upgrade() {
                core.recalculate();
                core.write_state();
                core.schedule_expiry();
            }
        }));
    }

    fn stop(&self) {
        lock(&self.listener).take();
        if let Some(task) = lock(&self.expiry).take() {
            task.abort();
        }
        *lock(&self.handle) = None;
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Run `f` on the core as long as the sensor still exists
fn with_core(core: &Weak<Core>, f: impl FnOnce(&Arc<Core>)) {
    if let Some(core) = core.upgrade() {
        f(&core);
    }
}

#[async_trait]
impl Entity for StatisticsSensor {
    fn unique_id(&self) -> Option<String> {
        self.core.config.unique_id.clone()
    }

    fn name(&self) -> Option<String> {
        Some(self.core.config.name.clone())
    }

    fn icon(&self) -> Option<String> {
        Some(ICON.to_string())
    }

    fn device_class(&self) -> Option<String> {
        let source = lock(&self.core.source);
        self.core.config.state_characteristic.device_class(
            source.device_class.as_deref(),
            source.state_class.as_deref(),
            self.core.is_binary(),
        )
    }

    fn available(&self) -> bool {
        lock(&self.core.status).available
    }

    fn extra_state_attributes(&self) -> Attributes {
        lock(&self.core.status).attributes.clone()
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        let core = &self.core;
        *lock(&core.handle) = Some(handle);

        // Repeated identical readings are samples too, so unchanged
        // writes count as well
        let weak = Arc::downgrade(core);
        let listener = track_state_updates(&core.hass, [core.source_id().to_string()], move |state| {
            with_core(&weak, |core| core.update(state.as_ref()));
        });
        *lock(&core.listener) = Some(listener);

        let current = core.hass.states.get(&core.source_id().to_string());
        core.handle_source_state(current.as_ref());
        core.recalculate();
        core.schedule_expiry();
    }

    async fn will_remove(&self) {
        self.core.stop();
    }
}

impl SensorEntity for StatisticsSensor {
    fn native_value(&self) -> Option<StateValue> {
        lock(&self.core.status).value.clone()
    }

    fn native_unit_of_measurement(&self) -> Option<String> {
        let source = lock(&self.core.source);
        self.core
            .config
            .state_characteristic
            .unit(source.unit.as_deref(), self.core.is_binary())
    }

    fn state_class(&self) -> Option<StateClass> {
        self.core
            .config
            .state_characteristic
            .is_measurement()
            .then_some(StateClass::Measurement)
    }

    fn suggested_display_precision(&self) -> Option<u32> {
        Some(self.core.config.precision)
    }
}

impl Drop for StatisticsSensor {
    fn drop(&mut self) {
        self.core.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::Context;
    use ha_core::Platform;
    use ha_helpers::{EntityPlatform, PlatformEntity};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(value: Value) -> StatisticsConfig {
        StatisticsConfig::from_value(&value).unwrap()
    }

    fn set(hass: &Hass, entity_id: &str, value: &str, unit: Option<&str>) {
        let mut attrs = HashMap::new();
        if let Some(unit) = unit {
            attrs.insert(ATTR_UNIT_OF_MEASUREMENT.to_string(), json!(unit));
        }
        hass.states
            .set(entity_id.parse().unwrap(), value, attrs, Context::new())
            .unwrap();
    }

    /// Poll until the entity reaches `expected` or a second has passed
    async fn wait_for_state(hass: &Hass, entity_id: &str, expected: &str) -> State {
        for _ in 0..100 {
            if let Some(state) = hass.states.get(entity_id) {
                if state.state == expected {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "{entity_id} never became {expected}, last {:?}",
            hass.states.get_state(entity_id)
        );
    }

    async fn add(hass: &Hass, config: StatisticsConfig) -> EntityPlatform {
        let platform = EntityPlatform::new(hass.clone(), Platform::Sensor, "statistics", None);
        let sensor = StatisticsSensor::new(hass.clone(), config);
        platform
            .add_entities(vec![PlatformEntity::sensor(sensor)])
            .await
            .unwrap();
        platform
    }

    #[tokio::test]
    async fn test_mean_over_sampling_size() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.temperature",
                "state_characteristic": "mean",
                "sampling_size": 4,
            })),
        )
        .await;
        assert_eq!(hass.states.get_state("sensor.test").as_deref(), Some("unknown"));
        tokio::task::yield_now().await;

        for value in ["17", "20", "15.2", "5", "3.8"] {
            set(&hass, "sensor.temperature", value, Some("°C"));
        }
        // Oldest sample evicted: mean of 20, 15.2, 5, 3.8
        let state = wait_for_state(&hass, "sensor.test", "11.0").await;
        assert_eq!(state.attribute::<String>("unit_of_measurement").as_deref(), Some("°C"));
        assert_eq!(state.attribute::<f64>("buffer_usage_ratio"), Some(1.0));
        assert_eq!(state.attribute::<bool>("source_value_valid"), Some(true));
        assert_eq!(state.attribute::<String>("state_class").as_deref(), Some("measurement"));
        assert_eq!(state.attribute::<String>("icon").as_deref(), Some(ICON));
    }

    #[tokio::test]
    async fn test_initial_source_state_is_used() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        set(&hass, "sensor.temperature", "21.5", Some("°C"));

        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.temperature",
                "state_characteristic": "count",
            })),
        )
        .await;
        let state = hass.states.get("sensor.test").unwrap();
        assert_eq!(state.state, "1");
        assert_eq!(state.attribute::<f64>("buffer_usage_ratio"), Some(0.05));
        assert!(state.attribute::<String>("unit_of_measurement").is_none());
    }

    #[tokio::test]
    async fn test_invalid_and_unavailable_source() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.temperature",
                "state_characteristic": "value_max",
            })),
        )
        .await;
        tokio::task::yield_now().await;

        set(&hass, "sensor.temperature", "12", None);
        wait_for_state(&hass, "sensor.test", "12.0").await;

        set(&hass, "sensor.temperature", "garbage", None);
        let state = loop {
            let state = hass.states.get("sensor.test").unwrap();
            if state.attribute::<bool>("source_value_valid") == Some(false) {
                break state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(state.state, "12.0");

        set(&hass, "sensor.temperature", STATE_UNAVAILABLE, None);
        let state = wait_for_state(&hass, "sensor.test", STATE_UNAVAILABLE).await;
        assert!(state.attribute::<bool>("source_value_valid").is_none());

        set(&hass, "sensor.temperature", "14", None);
        wait_for_state(&hass, "sensor.test", "14.0").await;
    }

    #[tokio::test]
    async fn test_binary_source_ratio() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "door open",
                "entity_id": "binary_sensor.door",
                "state_characteristic": "average_timeless",
                "precision": 0,
            })),
        )
        .await;
        tokio::task::yield_now().await;

        for value in ["on", "off", "on", "on"] {
            set(&hass, "binary_sensor.door", value, None);
        }
        let state = wait_for_state(&hass, "sensor.door_open", "75").await;
        assert_eq!(state.attribute::<String>("unit_of_measurement").as_deref(), Some("%"));
    }

    #[tokio::test]
    async fn test_samples_expire_without_updates() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.power",
                "state_characteristic": "count",
                "max_age": {"milliseconds": 200},
            })),
        )
        .await;
        tokio::task::yield_now().await;

        set(&hass, "sensor.power", "100", Some("W"));
        set(&hass, "sensor.power", "120", Some("W"));
        wait_for_state(&hass, "sensor.test", "2").await;

        // Nothing left once both samples are older than max_age
        let state = wait_for_state(&hass, "sensor.test", "0").await;
        assert_eq!(state.attribute::<f64>("age_coverage_ratio"), Some(0.0));
    }

    #[tokio::test]
    async fn test_keep_last_sample_past_max_age() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.power",
                "state_characteristic": "mean",
                "max_age": {"milliseconds": 200},
                "keep_last_sample": true,
            })),
        )
        .await;
        tokio::task::yield_now().await;

        set(&hass, "sensor.power", "100", None);
        set(&hass, "sensor.power", "120", None);
        wait_for_state(&hass, "sensor.test", "110.0").await;
        wait_for_state(&hass, "sensor.test", "120.0").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hass.states.get_state("sensor.test").as_deref(), Some("120.0"));
    }

    #[tokio::test]
    async fn test_empty_buffer_is_unknown_after_expiry() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.power",
                "state_characteristic": "mean",
                "max_age": {"milliseconds": 150},
            })),
        )
        .await;
        tokio::task::yield_now().await;

        set(&hass, "sensor.power", "42", None);
        wait_for_state(&hass, "sensor.test", "42.0").await;
        wait_for_state(&hass, "sensor.test", STATE_UNKNOWN).await;
    }

    #[tokio::test]
    async fn test_repeated_value_is_sampled() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let _platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.power",
                "state_characteristic": "count",
            })),
        )
        .await;
        tokio::task::yield_now().await;

        for _ in 0..3 {
            set(&hass, "sensor.power", "5", None);
        }
        wait_for_state(&hass, "sensor.test", "3").await;
    }

    #[tokio::test]
    async fn test_removed_sensor_stops_listening() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());
        let platform = add(
            &hass,
            config(json!({
                "name": "test",
                "entity_id": "sensor.power",
                "state_characteristic": "count",
            })),
        )
        .await;
        platform.remove_all().await;
        assert!(hass.states.get("sensor.test").is_none());

        set(&hass, "sensor.power", "5", None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hass.states.get("sensor.test").is_none());
    }
}
