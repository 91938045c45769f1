//! Entity state snapshots

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Context, EntityId, MAX_STATE_LENGTH, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// Rejected state write
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// Value longer than [`MAX_STATE_LENGTH`]
    #[error("state of {entity_id} is {len} characters, at most {MAX_STATE_LENGTH} are allowed")]
    TooLong { entity_id: String, len: usize },
}

/// The state of an entity at one point in time
///
/// `last_changed` only moves when the value changes, `last_updated` when the
/// value or the attributes change, and `last_reported` on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
    pub context: Context,
}

impl State {
    /// State with all three timestamps set to now
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            last_reported: now,
            context,
        }
    }

    /// Check that a state value fits the length limit
    pub fn validate(entity_id: &EntityId, value: &str) -> Result<(), StateError> {
        let len = value.chars().count();
        if len > MAX_STATE_LENGTH {
            return Err(StateError::TooLong {
                entity_id: entity_id.to_string(),
                len,
            });
        }
        Ok(())
    }

    /// Build the successor of this state
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let new_state = new_state.into();
        let value_changed = self.state != new_state;

        Self {
            entity_id: self.entity_id.clone(),
            last_changed: if value_changed { now } else { self.last_changed },
            state: new_state,
            attributes: new_attributes,
            last_updated: now,
            last_reported: now,
            context,
        }
    }

    /// True when value and attributes equal the given ones
    pub fn same_as(&self, state: &str, attributes: &HashMap<String, serde_json::Value>) -> bool {
        self.state == state && &self.attributes == attributes
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Typed attribute, `None` when missing or of another type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> EntityId {
        "sensor.power".parse().unwrap()
    }

    #[test]
    fn test_update_keeps_last_changed_for_same_value() {
        let state = State::new(entity(), "10", HashMap::new(), Context::new());
        let mut attrs = HashMap::new();
        attrs.insert("unit_of_measurement".to_string(), json!("W"));

        let next = state.with_update("10", attrs, Context::new());
        assert_eq!(next.last_changed, state.last_changed);
        assert!(next.last_updated >= state.last_updated);

        let changed = next.with_update("11", HashMap::new(), Context::new());
        assert!(changed.last_changed >= next.last_changed);
        assert_eq!(changed.state, "11");
    }

    #[test]
    fn test_validate_length() {
        assert!(State::validate(&entity(), "ok").is_ok());
        let long = "x".repeat(MAX_STATE_LENGTH + 1);
        assert!(matches!(
            State::validate(&entity(), &long),
            Err(StateError::TooLong { len, .. }) if len == MAX_STATE_LENGTH + 1
        ));
    }

    #[test]
    fn test_attribute_lookup() {
        let mut attrs = HashMap::new();
        attrs.insert("friendly_name".to_string(), json!("Grid power"));
        let state = State::new(entity(), "5", attrs, Context::new());

        assert_eq!(
            state.attribute::<String>("friendly_name").as_deref(),
            Some("Grid power")
        );
        assert_eq!(state.attribute::<f64>("friendly_name"), None);
        assert!(state.same_as("5", &state.attributes.clone()));
    }
}
