//! Config entry model
//!
//! A config entry is one configured instance of an integration: the data a
//! config flow collected, plus the runtime lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Data collected by a flow and stored in an entry
pub type EntryData = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    SetupError,
    /// Setup raised not-ready and a retry is scheduled
    SetupRetry,
    MigrationError,
    UnloadInProgress,
    FailedUnload,
}

impl ConfigEntryState {
    /// States an entry can be unloaded from
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::NotLoaded
                | ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
        )
    }
}

/// How an entry or flow came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    #[default]
    User,
    /// Created from YAML configuration
    Import,
    Discovery,
    /// Re-authentication of an existing entry
    Reauth,
    Ignore,
}

impl ConfigEntrySource {
    /// Step a flow with this source starts at
    pub fn step_id(&self) -> &'static str {
        match self {
            ConfigEntrySource::User => "user",
            ConfigEntrySource::Import => "import",
            ConfigEntrySource::Discovery => "discovery",
            ConfigEntrySource::Reauth => "reauth",
            ConfigEntrySource::Ignore => "ignore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// ULID
    pub entry_id: String,
    pub domain: String,
    pub title: String,

    #[serde(default)]
    pub data: EntryData,
    #[serde(default)]
    pub options: EntryData,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Used to reject a second entry for the same device or account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Why the entry is in a failed state
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Setup attempts since the last success
    #[serde(skip, default)]
    pub tries: u32,

    #[serde(default)]
    pub pref_disable_polling: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: EntryData::new(),
            options: EntryData::new(),
            version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
            pref_disable_polling: false,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: EntryData) -> Self {
        self.data = data;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// String value from the entry data
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Move to `new_state`, rejecting transitions the lifecycle does not allow
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;
        self.state = new_state;
        self.reason = reason;
        if new_state == ConfigEntryState::Loaded {
            self.tries = 0;
        }
        Ok(())
    }
}

/// Partial update of an entry; `None` fields stay as they are
#[derive(Debug, Default, Clone)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<EntryData>,
    pub options: Option<EntryData>,
    pub unique_id: Option<Option<String>>,
    pub version: Option<u32>,
    pub pref_disable_polling: Option<bool>,
    pub disabled_by: Option<Option<ConfigEntryDisabledBy>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: EntryData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: EntryData) -> Self {
        self.options = Some(options);
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn disabled_by(mut self, disabled_by: Option<ConfigEntryDisabledBy>) -> Self {
        self.disabled_by = Some(disabled_by);
        self
    }

    pub(crate) fn apply(self, entry: &mut ConfigEntry) {
        if let Some(title) = self.title {
            entry.title = title;
        }
        if let Some(data) = self.data {
            entry.data = data;
        }
        if let Some(options) = self.options {
            entry.options = options;
        }
        if let Some(unique_id) = self.unique_id {
            entry.unique_id = unique_id;
        }
        if let Some(version) = self.version {
            entry.version = version;
        }
        if let Some(pref) = self.pref_disable_polling {
            entry.pref_disable_polling = pref;
        }
        if let Some(disabled_by) = self.disabled_by {
            entry.disabled_by = disabled_by;
        }
        entry.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runtime_fields_are_not_persisted() {
        let mut entry = ConfigEntry::new("homewizard", "P1 meter")
            .with_unique_id("HWE-P1_3c39e7aabbcc")
            .with_source(ConfigEntrySource::Import);
        entry.data.insert("ip_address".to_string(), json!("192.168.1.20"));
        entry.state = ConfigEntryState::Loaded;
        entry.reason = Some("ignored".to_string());

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("state").is_none());
        assert!(json.get("reason").is_none());

        let parsed: ConfigEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.state, ConfigEntryState::NotLoaded);
        assert_eq!(parsed.source, ConfigEntrySource::Import);
        assert_eq!(parsed.data_str("ip_address"), Some("192.168.1.20"));
    }

    #[test]
    fn test_update_applies_only_given_fields() {
        let mut entry = ConfigEntry::new("ecobee", "ecobee");
        entry.data.insert("api_key".to_string(), json!("abc"));

        ConfigEntryUpdate::new().title("Upstairs").apply(&mut entry);
        assert_eq!(entry.title, "Upstairs");
        assert_eq!(entry.data_str("api_key"), Some("abc"));
    }

    #[test]
    fn test_source_step_ids() {
        assert_eq!(ConfigEntrySource::User.step_id(), "user");
        assert_eq!(ConfigEntrySource::Reauth.step_id(), "reauth");
    }

    #[test]
    fn test_loaded_resets_tries() {
        let mut entry = ConfigEntry::new("ecobee", "ecobee");
        entry.tries = 3;
        entry
            .try_set_state(ConfigEntryState::SetupInProgress, None)
            .unwrap();
        assert_eq!(entry.tries, 3);
        entry.try_set_state(ConfigEntryState::Loaded, None).unwrap();
        assert_eq!(entry.tries, 0);
        assert!(entry.try_set_state(ConfigEntryState::NotLoaded, None).is_err());
    }
}
