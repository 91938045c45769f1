//! Core types shared by the host runtime and every integration
//!
//! Entity ids, states, events, contexts and service calls live here, together
//! with the small set of constants (state values, attribute names, units)
//! that integrations use when they describe their entities.

mod context;
mod entity_id;
mod event;
mod platform;
mod service_call;
mod state;

pub use context::Context;
pub use entity_id::{slugify, EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use platform::{Platform, UnknownPlatform};
pub use service_call::{ServiceCall, SupportsResponse};
pub use state::{State, StateError};

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State of a switch or binary sensor that is on
pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";
/// Entity is reachable but has no value yet
pub const STATE_UNKNOWN: &str = "unknown";
/// Entity cannot currently be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Attribute and service data keys
pub const ATTR_ENTITY_ID: &str = "entity_id";
pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";
pub const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
pub const ATTR_DEVICE_CLASS: &str = "device_class";
pub const ATTR_STATE_CLASS: &str = "state_class";
pub const ATTR_ICON: &str = "icon";
/// Target temperature in `climate.set_temperature`
pub const ATTR_TEMPERATURE: &str = "temperature";

/// Unit strings used by sensor descriptions
pub mod units {
    pub const PERCENTAGE: &str = "%";
    pub const POWER_WATT: &str = "W";
    pub const ENERGY_KILO_WATT_HOUR: &str = "kWh";
    pub const ELECTRIC_POTENTIAL_VOLT: &str = "V";
    pub const ELECTRIC_CURRENT_AMPERE: &str = "A";
    pub const FREQUENCY_HERTZ: &str = "Hz";
    /// Gas and water meters
    pub const VOLUME_CUBIC_METERS: &str = "m³";
    pub const VOLUME_LITERS: &str = "L";
    pub const TEMP_CELSIUS: &str = "°C";
    pub const TEMP_FAHRENHEIT: &str = "°F";
    pub const SIGNAL_STRENGTH_DBM: &str = "dBm";
    pub const TIME_SECONDS: &str = "s";
}

/// Standard event types and their payloads
pub mod events {
    use super::*;

    /// Fired when a state is created, changed or removed
    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired when a state is written without changing value or attributes
    pub const STATE_REPORTED: &str = "state_reported";

    /// Fired for every service call before the handler runs
    pub const CALL_SERVICE: &str = "call_service";

    /// Fired once every integration has been set up
    pub const HOMEASSISTANT_START: &str = "homeassistant_start";
    /// Fired before entries are unloaded on shutdown
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        /// `None` when the entity was just added
        pub old_state: Option<State>,
        /// `None` when the entity was removed
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for STATE_REPORTED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateReportedData {
        pub entity_id: EntityId,
        pub new_state: State,
        /// When the state was last reported before this write
        #[serde(skip_serializing_if = "Option::is_none")]
        pub old_last_reported: Option<chrono::DateTime<chrono::Utc>>,
    }

    impl EventData for StateReportedData {
        fn event_type() -> &'static str {
            STATE_REPORTED
        }
    }

    /// Data for CALL_SERVICE events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        pub service_data: serde_json::Value,
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }
}
