//! Event bus for the host runtime
//!
//! Every state write, service call and lifecycle change is announced as an
//! event. Consumers either hold a broadcast receiver (`subscribe*`) or hand
//! the bus a callback that runs on its own task (`listen`).

use dashmap::DashMap;
use ha_core::{Context, Event, EventData, EventType};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Publish/subscribe hub keyed by event type
pub struct EventBus {
    channels: DashMap<EventType, broadcast::Sender<Event<Value>>>,
    match_all: broadcast::Sender<Event<Value>>,
    next_listener_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            match_all,
            next_listener_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Receiver for one event type, or for everything when given `*`
    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<Event<Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing");

        if event_type.is_match_all() {
            return self.match_all.subscribe();
        }

        self.channels
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event<Value>> {
        self.match_all.subscribe()
    }

    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver {
            rx: self.subscribe(T::event_type()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Run `callback` for every event of `event_type` until the handle is
    /// dropped or removed
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen<F>(&self, event_type: impl Into<EventType>, callback: F) -> ListenerHandle
    where
        F: Fn(Event<Value>) + Send + 'static,
    {
        let event_type = event_type.into();
        let id = self.next_listener_id();
        let mut rx = self.subscribe(event_type.clone());

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event_type = %event_type, skipped, "Listener fell behind, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        ListenerHandle { id, task }
    }

    /// Deliver an event to its type's subscribers and to `*` subscribers
    pub fn fire(&self, event: Event<Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.channels.get(&event.event_type) {
            // No receivers is not an error
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all.send(event);
    }

    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let event = Event::typed(data, context);
        match serde_json::to_value(&event.data) {
            Ok(json) => self.fire(event.map(|_| json)),
            Err(err) => warn!(event_type = T::event_type(), %err, "Dropping unserializable event"),
        }
    }

    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of event types with a channel
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A callback registered with [`EventBus::listen`]
///
/// Dropping the handle stops the callback.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn remove(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Receiver that yields only events whose payload decodes as `T`
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<Value>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    pub async fn recv(&mut self) -> Result<Event<T>, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Some(typed) = event.decode::<T>() {
                return Ok(typed);
            }
        }
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::events::StateChangedData;
    use ha_core::{EntityId, State};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_reaches_type_and_match_all_subscribers() {
        let bus = EventBus::new();
        let mut typed = bus.subscribe("ping");
        let mut all = bus.subscribe("*");
        let mut other = bus.subscribe("pong");

        bus.fire(Event::new("ping", json!({"n": 1}), Context::new()));

        assert_eq!(typed.recv().await.unwrap().data["n"], 1);
        assert_eq!(all.recv().await.unwrap().event_type.as_str(), "ping");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typed_subscription_decodes_payload() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        let entity_id: EntityId = "switch.socket".parse().unwrap();
        let state = State::new(entity_id.clone(), "on", HashMap::new(), Context::new());
        bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state: None,
                new_state: Some(state),
            },
            Context::new(),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data.entity_id.to_string(), "switch.socket");
        assert_eq!(received.data.new_state.unwrap().state, "on");
    }

    #[tokio::test]
    async fn test_listen_runs_callback_until_removed() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = bus.listen("tick", move |event| {
            sink.lock().unwrap().push(event.data["n"].as_u64().unwrap());
        });

        bus.fire(Event::new("tick", json!({"n": 1}), Context::new()));
        bus.fire(Event::new("tick", json!({"n": 2}), Context::new()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        handle.remove();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.fire(Event::new("tick", json!({"n": 3}), Context::new()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_listener_ids_are_unique() {
        let bus = EventBus::new();
        let a = bus.next_listener_id();
        let b = bus.next_listener_id();
        assert_ne!(a, b);
    }
}
