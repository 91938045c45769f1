//! Building blocks for integrations
//!
//! [`Hass`] bundles the runtime services. Integrations poll their device
//! through a [`DataUpdateCoordinator`], expose [`Entity`]s that an
//! [`EntityPlatform`] adds to the state store, and hook into the config
//! entry lifecycle by implementing [`Integration`].

pub mod coordinator_entity;
pub mod entity;
pub mod entity_platform;
pub mod event;
pub mod hass;
pub mod integration;
pub mod service;
pub mod update_coordinator;

pub use coordinator_entity::CoordinatorEntity;
pub use entity::{
    friendly_name, format_float, Attributes, BinarySensorEntity, ButtonEntity, ClimateEntity,
    Entity, EntityDescription, EntityError, EntityHandle, HvacAction, HvacMode, PlatformEntity,
    SensorEntity, StateClass, StateValue, SwitchEntity, TemperatureRequest,
};
pub use entity_platform::{
    EntityIndex, EntityPlatform, LiveEntity, PlatformError, DEFAULT_SCAN_INTERVAL,
};
pub use event::{track_state_change, track_state_updates};
pub use hass::Hass;
pub use integration::{EntrySetup, Integration, IntegrationHandler, RuntimeData};
pub use service::{entity_service_schema, register_entity_service, register_platform_services};
pub use update_coordinator::{
    CoordinatorBuilder, DataUpdateCoordinator, ListenerGuard, UpdateFailed,
    REQUEST_REFRESH_DEFAULT_COOLDOWN,
};
