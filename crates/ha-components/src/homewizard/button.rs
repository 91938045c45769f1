use std::sync::Arc;

use async_trait::async_trait;
use ha_helpers::{
    ButtonEntity, Entity, EntityDescription, EntityError, EntityHandle, PlatformEntity,
};
use ha_registries::{DeviceInfo, EntityCategory};

use super::api::HomeWizardClient;
use super::coordinator::HomeWizardCoordinator;
use super::entity::HomeWizardEntity;

/// Makes the status light of the device blink
pub struct IdentifyButton {
    entity: HomeWizardEntity,
    client: HomeWizardClient,
    description: EntityDescription,
}

impl IdentifyButton {
    pub fn new(
        coordinator: Arc<HomeWizardCoordinator>,
        client: HomeWizardClient,
        entry_unique_id: &str,
    ) -> Self {
        Self {
            entity: HomeWizardEntity::new(coordinator, entry_unique_id),
            client,
            description: EntityDescription::new("identify")
                .device_class("identify")
                .category(EntityCategory::Config),
        }
    }
}

#[async_trait]
impl Entity for IdentifyButton {
    fn entity_description(&self) -> Option<&EntityDescription> {
        Some(&self.description)
    }

    fn unique_id(&self) -> Option<String> {
        Some(self.entity.unique_id(&self.description.key))
    }

    fn name(&self) -> Option<String> {
        Some("Identify".to_string())
    }

    fn has_entity_name(&self) -> bool {
        true
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.entity.device_info()
    }

    fn available(&self) -> bool {
        self.entity.base.available()
    }

    async fn added_to_hass(&self, handle: EntityHandle) {
        self.entity.base.attach(handle);
    }

    async fn will_remove(&self) {
        self.entity.base.detach();
    }
}

#[async_trait]
impl ButtonEntity for IdentifyButton {
    async fn press(&self) -> Result<(), EntityError> {
        self.client
            .identify()
            .await
            .map_err(|err| EntityError::Failed(err.to_string()))
    }
}

pub fn entities(
    coordinator: &Arc<HomeWizardCoordinator>,
    client: &HomeWizardClient,
    entry_unique_id: &str,
) -> Vec<PlatformEntity> {
    let supported = coordinator
        .data()
        .is_some_and(|response| response.device.supports_identify());
    if !supported {
        return Vec::new();
    }
    vec![PlatformEntity::button(IdentifyButton::new(
        coordinator.clone(),
        client.clone(),
        entry_unique_id,
    ))]
}
