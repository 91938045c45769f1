//! Config entry lifecycle
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress
//!                            ↘ SetupRetry → SetupInProgress
//!                            ↘ MigrationError
//!
//! Loaded | SetupError | SetupRetry → UnloadInProgress → NotLoaded
//!                                                     ↘ FailedUnload
//! ```
//!
//! `MigrationError` and `FailedUnload` are terminal until the entry is
//! removed.

use crate::entry::ConfigEntryState;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
}

impl ConfigEntryState {
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded | SetupError | SetupRetry | MigrationError)
                | (SetupError | SetupRetry, SetupInProgress | UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded | FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }
}

/// Delay before the next setup attempt of an entry that was not ready
///
/// `2^min(tries, 4) * 5` seconds plus 50-500 ms of jitter: 5 s, 10 s, 20 s,
/// 40 s, then 80 s for every further attempt.
pub fn calculate_retry_delay(tries: u32) -> Duration {
    let base = 2_u64.pow(tries.min(4)) * 5;
    let jitter_ms = rand::thread_rng().gen_range(50..=500);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}
