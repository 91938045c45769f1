//! `secrets.yaml` lookups for the `!secret` tag

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Values from `secrets.yaml`, all stored as strings
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    /// Load `<config_dir>/secrets.yaml`; a missing file means no secrets
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join("secrets.yaml");

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No secrets file");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::ReadFile { path, source }),
        };

        let raw: Option<HashMap<String, Value>> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;

        let values: HashMap<String, String> = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, scalar_to_string(value)))
            .collect();

        debug!(count = values.len(), "Loaded secrets");
        Ok(Self { values })
    }

    /// Secrets given in code, for tests and embedding
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a secret, failing with [`ConfigError::SecretNotFound`]
    pub fn get(&self, key: &str) -> ConfigResult<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::SecretNotFound {
                key: key.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
