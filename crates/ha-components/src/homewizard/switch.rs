use std::sync::Arc;

use async_trait::async_trait;
use ha_helpers::{
    Entity, EntityDescription, EntityError, EntityHandle, PlatformEntity, SwitchEntity,
};
use ha_registries::{DeviceInfo, EntityCategory};
use tracing::debug;

use super::api::{HomeWizardClient, HomeWizardError, SocketState, SocketStateUpdate};
use super::coordinator::{DeviceResponse, HomeWizardCoordinator};
use super::entity::HomeWizardEntity;

/// Which socket setting a switch controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketSwitch {
    /// Relay of the socket
    Power,
    /// Blocks switching the relay, from the button on the device too
    SwitchLock,
}

impl SocketSwitch {
    fn description(self) -> EntityDescription {
        match self {
            SocketSwitch::Power => EntityDescription::new("power_on").device_class("outlet"),
            SocketSwitch::SwitchLock => EntityDescription::new("switch_lock")
                .name("Switch lock")
                .category(EntityCategory::Config),
        }
    }

    fn is_on(self, state: &SocketState) -> bool {
        match self {
            SocketSwitch::Power => state.power_on,
            SocketSwitch::SwitchLock => state.switch_lock,
        }
    }

    fn update(self, on: bool) -> SocketStateUpdate {
        match self {
            SocketSwitch::Power => SocketStateUpdate {
                power_on: Some(on),
                ..Default::default()
            },
            SocketSwitch::SwitchLock => SocketStateUpdate {
                switch_lock: Some(on),
                ..Default::default()
            },
        }
    }
}

pub struct HomeWizardSwitch {
    entity: HomeWizardEntity,
    client: HomeWizardClient,
    kind: SocketSwitch,
    description: EntityDescription,
}

impl HomeWizardSwitch {
    pub fn new(
        coordinator: Arc<HomeWizardCoordinator>,
        client: HomeWizardClient,
        entry_unique_id: &str,
        kind: SocketSwitch,
    ) -> Self {
        Self {
            entity: HomeWizardEntity::new(coordinator, entry_unique_id),
            client,
            kind,
            description: kind.description(),
        }
    }

    fn state(&self) -> Option<SocketState> {
        self.entity.data()?.state
    }

    async fn set(&self, on: bool) -> Result<(), EntityError> {
        let state = self
            .client
            .set_state(&self.kind.update(on))
            .await
            .map_err(|err| match err {
                HomeWizardError::Disabled => EntityError::Failed(
                    "the local API of the device is disabled".to_string(),
                ),
                other => EntityError::Failed(other.to_string()),
            })?;
        debug!(kind = ?self.kind, on, "Socket state changed");

        // The device answers with its new state; no need to wait for a poll
        let coordinator = self.entity.base.coordinator();
        if let Some(current) = coordinator.data() {
            coordinator.set_updated_data(DeviceResponse {
                state: Some(state),
                ..(*current).clone()
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Entity for HomeWizardSwitch {
    fn entity_description(&self) -> Option<&EntityDescription> {
        Some(&self.description)
    }

    fn unique_id(&self) -> Option<String> {
        Some(self.entity.unique_id(&self.description.key))
    }

    fn has_entity_name(&self) -> bool {
        true
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.entity.device_info()
    }

    fn available(&self) -> bool {
        let Some(state) = self.state() else {
            return false;
        };
        // A locked relay cannot be switched
        self.entity.base.available() && !(self.kind == SocketSwitch::Power && state.switch_lock)
    }

    fn icon(&self) -> Option<String> {
        match self.kind {
            SocketSwitch::Power => None,
            SocketSwitch::SwitchLock => Some(
                if self.is_on() == Some(true) {
                    "mdi:lock"
                } else {
                    "mdi:lock-open"
                }
                .to_string(),
            ),
        }
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        self.entity.base.attach(handle);
    }

    async fn will_remove(&self) {
        self.entity.base.detach();
    }
}

#[async_trait]
impl SwitchEntity for HomeWizardSwitch {
    fn is_on(&self) -> Option<bool> {
        self.state().map(|state| self.kind.is_on(&state))
    }

    async fn turn_on(&self) -> Result<(), EntityError> {
        self.set(true).await
    }

    async fn turn_off(&self) -> Result<(), EntityError> {
        self.set(false).await
    }
}

/// Switches of an energy socket; other products have none
pub fn entities(
    coordinator: &Arc<HomeWizardCoordinator>,
    client: &HomeWizardClient,
    entry_unique_id: &str,
) -> Vec<PlatformEntity> {
    let has_state = coordinator
        .data()
        .is_some_and(|response| response.state.is_some());
    if !has_state {
        return Vec::new();
    }
    [SocketSwitch::Power, SocketSwitch::SwitchLock]
        .into_iter()
        .map(|kind| {
            PlatformEntity::switch(HomeWizardSwitch::new(
                coordinator.clone(),
                client.clone(),
                entry_unique_id,
                kind,
            ))
        })
        .collect()
}
