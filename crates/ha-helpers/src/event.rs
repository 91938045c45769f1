//! Callbacks on state changes of specific entities

use std::collections::HashSet;

use ha_core::events::{StateChangedData, StateReportedData, STATE_CHANGED, STATE_REPORTED};
use ha_core::{EventType, State};
use ha_event_bus::ListenerHandle;
use tracing::trace;

use crate::hass::Hass;

/// Run `callback` whenever one of `entity_ids` changes state
///
/// The callback runs on the listener task of the event bus. Dropping the
/// returned handle stops tracking.
pub fn track_state_change<I, S, F>(hass: &Hass, entity_ids: I, callback: F) -> ListenerHandle
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(StateChangedData) + Send + 'static,
{
    let tracked: HashSet<String> = entity_ids.into_iter().map(Into::into).collect();
    hass.bus.listen(STATE_CHANGED, move |event| {
        let Some(event) = event.decode::<StateChangedData>() else {
            return;
        };
        if tracked.contains(&event.data.entity_id.to_string()) {
            trace!(entity_id = %event.data.entity_id, "Tracked state changed");
            callback(event.data);
        }
    })
}

/// Run `callback` for every state write of one of `entity_ids`
///
/// Unlike [`track_state_change`] this also reports writes that left the
/// state unchanged. Both kinds arrive in the order they were fired. The
/// callback gets `None` when the entity was removed.
pub fn track_state_updates<I, S, F>(hass: &Hass, entity_ids: I, callback: F) -> ListenerHandle
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(Option<State>) + Send + 'static,
{
    let tracked: HashSet<String> = entity_ids.into_iter().map(Into::into).collect();
    hass.bus.listen(EventType::MATCH_ALL, move |event| {
        let (entity_id, state) = match event.event_type.as_str() {
            STATE_CHANGED => match event.decode::<StateChangedData>() {
                Some(event) => (event.data.entity_id, event.data.new_state),
                None => return,
            },
            STATE_REPORTED => match event.decode::<StateReportedData>() {
                Some(event) => (event.data.entity_id, Some(event.data.new_state)),
                None => return,
            },
            _ => return,
        };
        if tracked.contains(&entity_id.to_string()) {
            callback(state);
        }
    })
}
