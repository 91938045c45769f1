use std::sync::{Arc, Mutex, PoisonError};

use crate::entity::EntityHandle;
use crate::update_coordinator::{DataUpdateCoordinator, ListenerGuard};

/// Part of an entity that takes its data from a coordinator
///
/// Embed it in the entity, forward `available` to it and call
/// [`CoordinatorEntity::attach`] from `added_to_hass` and
/// [`CoordinatorEntity::detach`] from `will_remove`. The entity then writes
/// its state after every coordinator refresh.
pub struct CoordinatorEntity<T> {
    coordinator: Arc<DataUpdateCoordinator<T>>,
    listener: Mutex<Option<ListenerGuard>>,
}

impl<T> CoordinatorEntity<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    pub fn new(coordinator: Arc<DataUpdateCoordinator<T>>) -> Self {
        Self {
            coordinator,
            listener: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &Arc<DataUpdateCoordinator<T>> {
        &self.coordinator
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.coordinator.data()
    }

    pub fn available(&self) -> bool {
        self.coordinator.last_update_success()
    }

    pub fn attach(&self, handle: EntityHandle) {
        let guard = self.coordinator.add_listener(move || {
            handle.write_state();
        });
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);
    }

    pub fn detach(&self) {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// What `update` does for coordinator entities
    pub async fn request_refresh(&self) {
        self.coordinator.request_refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, PlatformEntity, SensorEntity, StateValue};
    use crate::entity_platform::EntityPlatform;
    use crate::hass::Hass;
    use crate::update_coordinator::UpdateFailed;
    use async_trait::async_trait;
    use ha_core::{Platform, STATE_UNAVAILABLE};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Level {
        base: CoordinatorEntity<u32>,
    }

    #[async_trait]
    impl Entity for Level {
        fn name(&self) -> Option<String> {
            Some("Level".into())
        }

        fn available(&self) -> bool {
            self.base.available()
        }

        async fn added_to_hass(&self, handle: EntityHandle) {
            self.base.attach(handle);
        }

        async fn will_remove(&self) {
            self.base.detach();
        }
    }

    impl SensorEntity for Level {
        fn native_value(&self) -> Option<StateValue> {
            self.base.data().map(|v| StateValue::Int(i64::from(*v)))
        }
    }

    #[tokio::test]
    async fn test_state_follows_coordinator() {
        let dir = TempDir::new().unwrap();
        let hass = Hass::new(dir.path());

        let reading = Arc::new(AtomicU32::new(10));
        let source = reading.clone();
        let coordinator = DataUpdateCoordinator::builder("level", move || {
            let value = source.load(Ordering::SeqCst);
            async move {
                if value == 0 {
                    Err(UpdateFailed::new("sensor offline"))
                } else {
                    Ok(value)
                }
            }
        })
        .build();
        coordinator.first_refresh().await.unwrap();

        let platform = EntityPlatform::new(hass.clone(), Platform::Sensor, "test", None);
        platform
            .add_entities(vec![PlatformEntity::sensor(Level {
                base: CoordinatorEntity::new(coordinator.clone()),
            })])
            .await
            .unwrap();
        assert_eq!(hass.states.get_state("sensor.level").as_deref(), Some("10"));
        assert_eq!(coordinator.listener_count(), 1);

        reading.store(12, Ordering::SeqCst);
        coordinator.refresh().await.unwrap();
        assert_eq!(hass.states.get_state("sensor.level").as_deref(), Some("12"));

        reading.store(0, Ordering::SeqCst);
        let _ = coordinator.refresh().await;
        assert_eq!(
            hass.states.get_state("sensor.level").as_deref(),
            Some(STATE_UNAVAILABLE)
        );

        platform.remove_all().await;
        assert_eq!(coordinator.listener_count(), 0);
    }
}
