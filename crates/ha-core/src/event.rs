//! Events carried on the event bus

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::Context;

/// Payload types that know which event they belong to
pub trait EventData: Clone + Send + Sync + 'static {
    /// Event type this payload is fired under
    fn event_type() -> &'static str;
}

/// Name of an event, `*` matches everything
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub const MATCH_ALL: &'static str = "*";

    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_match_all(&self) -> bool {
        self.0 == Self::MATCH_ALL
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event with its payload, origin and firing time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,
    pub data: T,
    #[serde(default)]
    pub origin: EventOrigin,
    /// Set when the event is constructed, not when it is delivered
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

impl<T> Event<T> {
    /// Local event fired now
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
            context,
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Replace the payload, keeping type, origin, time and context
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        Event {
            event_type: self.event_type,
            data: f(self.data),
            origin: self.origin,
            time_fired: self.time_fired,
            context: self.context,
        }
    }
}

impl<T: EventData> Event<T> {
    /// Event whose type comes from the payload
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

impl Event<serde_json::Value> {
    /// Decode the JSON payload into a typed one
    pub fn decode<T: DeserializeOwned>(&self) -> Option<Event<T>> {
        let data = serde_json::from_value(self.data.clone()).ok()?;
        Some(self.clone().map(|_| data))
    }
}

/// Where an event was fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Fired inside this process
    #[default]
    Local,
    /// Received from another instance
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_decode_payload() {
        let event = Event::new("ping", json!({"n": 3}), Context::new());
        let typed = event.decode::<Ping>().unwrap();
        assert_eq!(typed.data, Ping { n: 3 });
        assert_eq!(typed.event_type.as_str(), "ping");

        let wrong = Event::new("ping", json!({"x": 1}), Context::new());
        assert!(wrong.decode::<Ping>().is_none());
    }

    #[test]
    fn test_match_all() {
        assert!(EventType::new("*").is_match_all());
        assert!(!EventType::from("state_changed").is_match_all());
    }
}
