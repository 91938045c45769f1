//! Configuration loading
//!
//! `configuration.yaml` is read with the custom tags
//!
//! - `!include path`
//! - `!include_dir_list`, `!include_dir_merge_list`, `!include_dir_named`,
//!   `!include_dir_merge_named` for directories of YAML files
//! - `!secret key`, looked up in `secrets.yaml`
//! - `!env_var NAME [default]`
//!
//! and then split into the typed core and logger sections plus the raw
//! sections integrations read themselves.

mod core_config;
mod error;
mod home_config;
mod loader;
mod secrets;

pub use core_config::{CoreConfig, UnitSystem};
pub use error::{ConfigError, ConfigResult};
pub use home_config::{HomeConfig, LoggerConfig, CONFIG_FILE};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::Secrets;

pub use serde_yaml::Value;
