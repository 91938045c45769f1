//! Config entry manager
//!
//! Owns every config entry, persists them in `.storage/core.config_entries`
//! and drives setup, unload, reload and removal through the registered
//! [`EntryHandler`] of each domain.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use ha_registries::{Storable, Storage, Store};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryDisabledBy, ConfigEntryState, ConfigEntryUpdate};
use crate::flow::FlowFactory;
use crate::flow_manager::FlowSlot;
use crate::handler::{EntryHandler, SetupError};
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),

    #[error("Storage error: {0}")]
    Storage(#[from] ha_registries::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
}

/// Runs once when the entry is unloaded or its setup fails
pub type UnloadCallback = Box<dyn FnOnce() + Send + Sync>;

pub struct ConfigEntries {
    store: Store<ConfigEntriesData>,

    /// entry_id -> entry
    entries: DashMap<String, ConfigEntry>,
    /// domain -> entry_ids
    by_domain: DashMap<String, HashSet<String>>,
    /// (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    handlers: DashMap<String, Arc<dyn EntryHandler>>,

    /// Serializes setup and unload of one entry
    entry_locks: DashMap<String, Arc<Mutex<()>>>,
    retry_tasks: DashMap<String, JoinHandle<()>>,
    on_unload: DashMap<String, Vec<UnloadCallback>>,

    pub(crate) flow_factories: DashMap<String, FlowFactory>,
    pub(crate) flows: DashMap<String, FlowSlot>,
    /// flow_id -> (handler, unique_id)
    pub(crate) flow_unique_ids: DashMap<String, (String, String)>,
}

impl ConfigEntries {
    pub fn new(storage: Storage) -> Self {
        Self {
            store: Store::new(storage),
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            handlers: DashMap::new(),
            entry_locks: DashMap::new(),
            retry_tasks: DashMap::new(),
            on_unload: DashMap::new(),
            flow_factories: DashMap::new(),
            flows: DashMap::new(),
            flow_unique_ids: DashMap::new(),
        }
    }

    pub async fn load(&self) -> ConfigEntriesResult<()> {
        if let Some(data) = self.store.load().await? {
            info!("Loading {} config entries from storage", data.entries.len());
            for entry in data.entries {
                self.index_entry(entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> ConfigEntriesResult<()> {
        let mut entries: Vec<ConfigEntry> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.store.save(&ConfigEntriesData { entries }).await?;
        debug!("Saved {} config entries to storage", self.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: ConfigEntry) {
        let entry_id = entry.entry_id.clone();
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(unique_id) = &entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id.clone());
        }
        self.entries.insert(entry_id, entry);
    }

    fn deindex_entry(&self, entry_id: &str) -> Option<ConfigEntry> {
        let (_, entry) = self.entries.remove(entry_id)?;
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(entry_id);
        }
        self.by_domain.remove_if(&entry.domain, |_, ids| ids.is_empty());
        if let Some(unique_id) = &entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        Some(entry)
    }

    pub fn register_handler(&self, domain: impl Into<String>, handler: Arc<dyn EntryHandler>) {
        self.handlers.insert(domain.into(), handler);
    }

    pub fn has_handler(&self, domain: &str) -> bool {
        self.handlers.contains_key(domain)
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    /// Entries of a domain, oldest first
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let key = (domain.to_string(), unique_id.to_string());
        let entry_id = self.by_unique_id.get(&key)?.value().clone();
        self.get(&entry_id)
    }

    pub fn entries(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn state(&self, entry_id: &str) -> Option<ConfigEntryState> {
        self.entries.get(entry_id).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a new entry without setting it up
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(unique_id) = &entry.unique_id {
            if self
                .by_unique_id
                .contains_key(&(entry.domain.clone(), unique_id.clone()))
            {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        info!(
            entry_id = %entry.entry_id,
            domain = %entry.domain,
            title = %entry.title,
            "Adding config entry"
        );
        self.index_entry(entry.clone());
        self.save().await?;
        Ok(entry)
    }

    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

            if let Some(new_unique_id) = &update.unique_id {
                if *new_unique_id != entry.unique_id {
                    if let Some(uid) = new_unique_id {
                        let key = (entry.domain.clone(), uid.clone());
                        if self.by_unique_id.contains_key(&key) {
                            return Err(ConfigEntriesError::AlreadyExists {
                                domain: entry.domain.clone(),
                                unique_id: uid.clone(),
                            });
                        }
                        self.by_unique_id.insert(key, entry_id.to_string());
                    }
                    if let Some(old) = &entry.unique_id {
                        self.by_unique_id.remove(&(entry.domain.clone(), old.clone()));
                    }
                }
            }

            update.apply(&mut entry);
            entry.clone()
        };

        debug!(entry_id, "Updated config entry");
        self.save().await?;
        Ok(updated)
    }

    /// Register a callback to run when the entry unloads
    pub fn on_unload(&self, entry_id: &str, callback: UnloadCallback) {
        self.on_unload
            .entry(entry_id.to_string())
            .or_default()
            .push(callback);
    }

    fn run_on_unload(&self, entry_id: &str) {
        if let Some((_, mut callbacks)) = self.on_unload.remove(entry_id) {
            while let Some(callback) = callbacks.pop() {
                callback();
            }
        }
    }

    fn entry_lock(&self, entry_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.entry_locks.entry(entry_id.to_string()).or_default().value())
    }

    fn set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        Ok(())
    }

    /// Set up one entry
    ///
    /// Returns whether the entry ended up loaded. A failed attempt is not an
    /// error; the entry's state and reason describe what happened.
    pub async fn setup(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        self.setup_locked(entry_id).await
    }

    async fn setup_locked(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_disabled() {
            debug!(entry_id, domain = %entry.domain, "Not setting up disabled entry");
            return Ok(false);
        }
        if entry.state == ConfigEntryState::Loaded {
            return Ok(true);
        }

        self.cancel_retry(entry_id);
        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let handler = self.handlers.get(&entry.domain).map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            warn!(domain = %entry.domain, "No integration found for config entry");
            self.set_state(
                entry_id,
                ConfigEntryState::SetupError,
                Some("Integration not found".to_string()),
            )?;
            return Ok(false);
        };

        let entry = match self.migrate(entry, handler.as_ref()).await? {
            Some(entry) => entry,
            None => return Ok(false),
        };

        match handler.setup_entry(self, &entry).await {
            Ok(()) => {
                self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!(entry_id, domain = %entry.domain, title = %entry.title, "Config entry loaded");
                Ok(true)
            }
            Err(SetupError::NotReady(message)) => {
                let delay = calculate_retry_delay(entry.tries);
                if entry.tries == 0 {
                    warn!(
                        "Config entry '{}' for {} integration not ready yet: {}; retrying in background",
                        entry.title, entry.domain, message
                    );
                } else {
                    debug!(
                        "Config entry '{}' for {} integration still not ready: {}; retrying in {:?}",
                        entry.title, entry.domain, message, delay
                    );
                }
                if let Some(mut e) = self.entries.get_mut(entry_id) {
                    e.tries += 1;
                }
                self.set_state(entry_id, ConfigEntryState::SetupRetry, Some(message))?;
                self.run_on_unload(entry_id);
                self.schedule_retry(entry_id, delay);
                Ok(false)
            }
            Err(err @ SetupError::AuthFailed(_)) => {
                warn!(
                    "Config entry '{}' for {} integration could not authenticate: {}",
                    entry.title, entry.domain, err
                );
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(err.to_string()))?;
                self.run_on_unload(entry_id);
                self.spawn_reauth(entry_id);
                Ok(false)
            }
            Err(SetupError::Failed(message)) => {
                warn!(
                    "Error setting up entry {} for {}: {}",
                    entry.title, entry.domain, message
                );
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(message))?;
                self.run_on_unload(entry_id);
                Ok(false)
            }
        }
    }

    /// Bring the entry to the handler's version; `None` means it failed
    async fn migrate(
        &self,
        entry: ConfigEntry,
        handler: &dyn EntryHandler,
    ) -> ConfigEntriesResult<Option<ConfigEntry>> {
        let target = handler.version();
        if entry.version == target {
            return Ok(Some(entry));
        }

        let outcome = if entry.version > target {
            Err(format!(
                "entry version {} is newer than supported version {}",
                entry.version, target
            ))
        } else {
            handler
                .migrate_entry(&entry)
                .await
                .map_err(|e| e.to_string())
        };

        match outcome {
            Ok(update) => {
                info!(entry_id = %entry.entry_id, from = entry.version, to = target, "Migrated config entry");
                self.update(&entry.entry_id, update.version(target))
                    .await
                    .map(Some)
            }
            Err(reason) => {
                warn!(entry_id = %entry.entry_id, %reason, "Config entry migration failed");
                self.set_state(&entry.entry_id, ConfigEntryState::MigrationError, Some(reason))?;
                Ok(None)
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, entry_id: &str, delay: Duration) {
        let entries = Arc::downgrade(self);
        let id = entry_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            entries.retry_tasks.remove(&id);
            if let Err(err) = entries.setup(&id).await {
                warn!(entry_id = %id, "Retrying setup failed: {}", err);
            }
        });
        if let Some(previous) = self.retry_tasks.insert(entry_id.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, task)) = self.retry_tasks.remove(entry_id) {
            task.abort();
        }
    }

    /// Whether a setup retry is scheduled for the entry
    pub fn retry_pending(&self, entry_id: &str) -> bool {
        self.retry_tasks.contains_key(entry_id)
    }

    /// Start a reauth flow for the entry in the background
    pub fn spawn_reauth(self: &Arc<Self>, entry_id: &str) {
        let entries = Arc::clone(self);
        let id = entry_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = entries.start_reauth(&id).await {
                debug!(entry_id = %id, "Reauth flow not started: {}", err);
            }
        });
    }

    /// Unload one entry
    ///
    /// Returns `Ok(false)` when the integration failed to unload, leaving the
    /// entry in `FailedUnload`.
    pub async fn unload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        self.unload_locked(entry_id).await
    }

    async fn unload_locked(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.cancel_retry(entry_id);

        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(true),
            ConfigEntryState::Loaded => {}
            ConfigEntryState::SetupError | ConfigEntryState::SetupRetry => {
                self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;
                self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                return Ok(true);
            }
            state => return Err(ConfigEntriesError::CannotUnload(state)),
        }

        self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;
        let handler = self.handlers.get(&entry.domain).map(|h| Arc::clone(h.value()));
        let result = match handler {
            Some(handler) => handler.unload_entry(self, &entry).await,
            None => Ok(true),
        };

        match result {
            Ok(true) => {
                self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                self.run_on_unload(entry_id);
                info!(entry_id, domain = %entry.domain, "Config entry unloaded");
                Ok(true)
            }
            Ok(false) => {
                self.set_state(entry_id, ConfigEntryState::FailedUnload, None)?;
                warn!(entry_id, domain = %entry.domain, "Integration refused to unload");
                Ok(false)
            }
            Err(err) => {
                warn!(entry_id, domain = %entry.domain, "Error unloading entry: {}", err);
                self.set_state(entry_id, ConfigEntryState::FailedUnload, Some(err.to_string()))?;
                Ok(false)
            }
        }
    }

    /// Unload and set up again; the entry stays down if unloading fails
    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        if !self.unload_locked(entry_id).await? {
            return Ok(false);
        }
        self.setup_locked(entry_id).await
    }

    /// Unload and delete an entry
    pub async fn remove(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let lock = self.entry_lock(entry_id);
        let guard = lock.lock().await;

        let state = self
            .state(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if state.is_recoverable() {
            self.unload_locked(entry_id).await?;
        }
        self.cancel_retry(entry_id);
        self.run_on_unload(entry_id);

        let entry = self
            .deindex_entry(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        self.save().await?;

        let handler = self.handlers.get(&entry.domain).map(|h| Arc::clone(h.value()));
        if let Some(handler) = handler {
            handler.remove_entry(&entry).await;
        }
        self.abort_flows_for_entry(entry_id);

        drop(guard);
        self.entry_locks.remove(entry_id);
        info!(entry_id, domain = %entry.domain, "Removed config entry");
        Ok(entry)
    }

    /// Disable or enable an entry, unloading or setting it up to match
    pub async fn set_disabled_by(
        self: &Arc<Self>,
        entry_id: &str,
        disabled_by: Option<ConfigEntryDisabledBy>,
    ) -> ConfigEntriesResult<bool> {
        let current = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if current.disabled_by == disabled_by {
            return Ok(true);
        }

        if disabled_by.is_some() {
            let unloaded = self.unload(entry_id).await?;
            self.update(entry_id, ConfigEntryUpdate::new().disabled_by(disabled_by))
                .await?;
            Ok(unloaded)
        } else {
            self.update(entry_id, ConfigEntryUpdate::new().disabled_by(None))
                .await?;
            self.setup(entry_id).await
        }
    }

    /// Set up every stored entry concurrently; returns how many loaded
    pub async fn setup_all(self: &Arc<Self>) -> usize {
        let ids: Vec<String> = self.entries().into_iter().map(|e| e.entry_id).collect();
        let results = join_all(ids.iter().map(|id| self.setup(id))).await;

        let mut loaded = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(err) => warn!(entry_id = %id, "Setup failed: {}", err),
            }
        }
        info!("Set up {} of {} config entries", loaded, ids.len());
        loaded
    }

    /// Unload every entry, used on shutdown
    pub async fn unload_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.entries().into_iter().map(|e| e.entry_id).collect();
        for id in ids {
            if let Err(err) = self.unload(&id).await {
                debug!(entry_id = %id, "Not unloaded on shutdown: {}", err);
            }
        }
    }
}
