//! What an integration plugs into the entry manager

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::entry::{ConfigEntry, ConfigEntryUpdate};
use crate::manager::ConfigEntries;

/// Outcome of a failed setup attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    /// The device or service is temporarily unreachable; setup is retried
    #[error("{0}")]
    NotReady(String),

    /// Credentials were rejected; a reauth flow is started
    #[error("could not authenticate: {0}")]
    AuthFailed(String),

    /// Permanent failure; the entry stays in `SetupError`
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error)]
#[error("migration failed: {0}")]
pub struct MigrationError(pub String);

/// Lifecycle hooks for the entries of one domain
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Entry schema version this handler understands
    fn version(&self) -> u32 {
        1
    }

    async fn setup_entry(
        &self,
        entries: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<(), SetupError>;

    /// `Ok(false)` leaves the entry in `FailedUnload`
    async fn unload_entry(
        &self,
        entries: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<bool, SetupError>;

    /// Clean up after an entry was deleted
    async fn remove_entry(&self, _entry: &ConfigEntry) {}

    /// Bring an entry written by an older version up to [`Self::version`]
    async fn migrate_entry(&self, entry: &ConfigEntry) -> Result<ConfigEntryUpdate, MigrationError> {
        Err(MigrationError(format!(
            "no migration from version {} to {}",
            entry.version,
            self.version()
        )))
    }
}
