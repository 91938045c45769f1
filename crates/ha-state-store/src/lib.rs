//! Current entity states, indexed by domain
//!
//! Writes go through [`StateStore::set`], which keeps the timestamps of
//! [`State`] honest and announces the write on the event bus: a
//! `state_changed` event when value or attributes moved, a `state_reported`
//! event when the same state was written again.

use dashmap::DashMap;
use ha_core::events::{StateChangedData, StateReportedData};
use ha_core::{Context, EntityId, State, StateError};
use ha_event_bus::EventBus;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

pub struct StateStore {
    states: DashMap<String, State>,
    domain_index: DashMap<String, Vec<String>>,
    event_bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    /// Write the state of an entity
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, Value>,
        context: Context,
    ) -> Result<State, StateError> {
        self.set_with(entity_id, state, attributes, false, context)
    }

    /// Write the state of an entity
    ///
    /// An identical write only bumps `last_reported` and fires
    /// `state_reported`, unless `force_update` is set, in which case it is
    /// treated as an update and fires `state_changed`.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set_with(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, Value>,
        force_update: bool,
        context: Context,
    ) -> Result<State, StateError> {
        let state = state.into();
        State::validate(&entity_id, &state)?;

        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        if let Some(existing) = &old_state {
            if !force_update && existing.same_as(&state, &attributes) {
                let mut reported = existing.clone();
                reported.last_reported = chrono::Utc::now();
                self.states.insert(key, reported.clone());

                trace!("State unchanged, reporting");
                self.event_bus.fire_typed(
                    StateReportedData {
                        entity_id,
                        new_state: reported.clone(),
                        old_last_reported: Some(existing.last_reported),
                    },
                    context,
                );
                return Ok(reported);
            }
        }

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(key.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .push(key);
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        Ok(new_state)
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    /// Remove an entity's state, firing `state_changed` with no new state
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let key = entity_id.to_string();
        let old_state = self.states.remove(&key).map(|(_, s)| s)?;

        trace!("Removing entity state");
        if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
            ids.retain(|id| id != &key);
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id: entity_id.clone(),
                old_state: Some(old_state.clone()),
                new_state: None,
            },
            context,
        );

        Some(old_state)
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::events::{STATE_CHANGED, STATE_REPORTED};
    use ha_core::MAX_STATE_LENGTH;
    use serde_json::json;

    fn store() -> (StateStore, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (StateStore::new(bus.clone()), bus)
    }

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_set_fires_state_changed() {
        let (store, bus) = store();
        let mut rx = bus.subscribe(STATE_CHANGED);

        store
            .set(id("sensor.power"), "12", HashMap::new(), Context::new())
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data["entity_id"], "sensor.power");
        assert!(event.data["old_state"].is_null());
        assert_eq!(event.data["new_state"]["state"], "12");
        assert!(store.is_state("sensor.power", "12"));
        assert_eq!(store.entity_ids("sensor"), vec!["sensor.power"]);
    }

    #[tokio::test]
    async fn test_identical_write_reports_instead_of_changing() {
        let (store, bus) = store();
        let first = store
            .set(id("sensor.power"), "12", HashMap::new(), Context::new())
            .unwrap();

        let mut changed = bus.subscribe(STATE_CHANGED);
        let mut reported = bus.subscribe(STATE_REPORTED);

        let again = store
            .set(id("sensor.power"), "12", HashMap::new(), Context::new())
            .unwrap();
        assert_eq!(again.last_updated, first.last_updated);
        assert!(again.last_reported >= first.last_reported);

        let event = reported.recv().await.unwrap();
        assert_eq!(event.data["new_state"]["state"], "12");
        assert!(changed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_update_fires_state_changed() {
        let (store, bus) = store();
        store
            .set(id("sensor.power"), "12", HashMap::new(), Context::new())
            .unwrap();
        let mut changed = bus.subscribe(STATE_CHANGED);

        store
            .set_with(id("sensor.power"), "12", HashMap::new(), true, Context::new())
            .unwrap();
        assert!(changed.recv().await.is_ok());
    }

    #[test]
    fn test_attribute_change_is_an_update() {
        let (store, _bus) = store();
        let first = store
            .set(id("sensor.power"), "12", HashMap::new(), Context::new())
            .unwrap();

        let mut attrs = HashMap::new();
        attrs.insert("unit_of_measurement".to_string(), json!("W"));
        let next = store
            .set(id("sensor.power"), "12", attrs, Context::new())
            .unwrap();

        assert_eq!(next.last_changed, first.last_changed);
        assert_eq!(next.attribute::<String>("unit_of_measurement").as_deref(), Some("W"));
    }

    #[test]
    fn test_too_long_state_is_rejected() {
        let (store, _bus) = store();
        let long = "x".repeat(MAX_STATE_LENGTH + 1);
        let result = store.set(id("sensor.power"), long, HashMap::new(), Context::new());
        assert!(matches!(result, Err(StateError::TooLong { .. })));
        assert!(store.get("sensor.power").is_none());
    }

    #[tokio::test]
    async fn test_remove_fires_event_and_updates_index() {
        let (store, bus) = store();
        store
            .set(id("switch.socket"), "on", HashMap::new(), Context::new())
            .unwrap();
        let mut rx = bus.subscribe(STATE_CHANGED);

        let removed = store.remove(&id("switch.socket"), Context::new());
        assert_eq!(removed.unwrap().state, "on");
        assert!(store.entity_ids("switch").is_empty());

        let event = rx.recv().await.unwrap();
        assert!(event.data["new_state"].is_null());
        assert!(store.remove(&id("switch.socket"), Context::new()).is_none());
    }
}
