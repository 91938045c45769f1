//! Typed view of `configuration.yaml`

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core_config::CoreConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

pub const CONFIG_FILE: &str = "configuration.yaml";

/// The `logger:` section
///
/// ```yaml
/// logger:
///   default: warning
///   logs:
///     homeassistant.components.ecobee: debug
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub logs: BTreeMap<String, String>,
}

impl LoggerConfig {
    /// Filter directives for `tracing_subscriber::EnvFilter`
    pub fn filter_directives(&self) -> String {
        let default = self.default.as_deref().map(level).unwrap_or("info");
        let mut directives = vec![default.to_string()];
        directives.extend(
            self.logs
                .iter()
                .map(|(target, lvl)| format!("{}={}", log_target(target), level(lvl))),
        );
        directives.join(",")
    }
}

/// Map a logger level name onto a tracing level
fn level(name: &str) -> &'static str {
    match name.to_ascii_lowercase().as_str() {
        "critical" | "fatal" | "error" => "error",
        "warning" | "warn" => "warn",
        "debug" => "debug",
        "notset" | "trace" => "trace",
        _ => "info",
    }
}

/// Map a dotted logger name onto a crate module path
fn log_target(name: &str) -> String {
    if let Some(component) = name.strip_prefix("homeassistant.components.") {
        return format!("ha_components::{}", component.replace('.', "::"));
    }
    name.replace('.', "::")
}

/// Parsed `configuration.yaml`
#[derive(Debug, Clone)]
pub struct HomeConfig {
    pub config_dir: PathBuf,
    pub core: CoreConfig,
    pub logger: LoggerConfig,
    /// Every top-level section except `homeassistant` and `logger`
    pub sections: BTreeMap<String, Value>,
}

impl HomeConfig {
    /// Load `<config_dir>/configuration.yaml`; a missing file gives defaults
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(CONFIG_FILE).exists() {
            return Self::from_value(config_dir, Value::Null);
        }
        let root = load_yaml(config_dir, CONFIG_FILE)?;
        Self::from_value(config_dir, root)
    }

    pub fn from_value(config_dir: impl Into<PathBuf>, root: Value) -> ConfigResult<Self> {
        let mapping = match root {
            Value::Null => serde_yaml::Mapping::new(),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: CONFIG_FILE.to_string(),
                    reason: "top level must be a mapping".to_string(),
                })
            }
        };

        let mut sections = BTreeMap::new();
        for (key, value) in mapping {
            let key = key.as_str().map(str::to_string).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: format!("{:?}", key),
                    reason: "section names must be strings".to_string(),
                }
            })?;
            sections.insert(key, value);
        }

        let core = CoreConfig::from_section(sections.get("homeassistant"))?;
        let logger = match sections.get("logger") {
            None | Some(Value::Null) => LoggerConfig::default(),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "logger".to_string(),
                    reason: e.to_string(),
                }
            })?,
        };
        sections.remove("homeassistant");
        sections.remove("logger");

        Ok(Self {
            config_dir: config_dir.into(),
            core,
            logger,
            sections,
        })
    }

    /// Entries of a platform-style section such as `sensor:`
    ///
    /// A single mapping counts as a one-element list.
    pub fn platform_configs(&self, domain: &str) -> Vec<Value> {
        match self.sections.get(domain) {
            Some(Value::Sequence(items)) => items.clone(),
            Some(value @ Value::Mapping(_)) => vec![value.clone()],
            _ => Vec::new(),
        }
    }

    /// Domains with a top-level section
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}
