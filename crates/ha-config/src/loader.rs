//! YAML loading with include, secret and environment tags

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// How the files of an included directory are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirMode {
    /// One list item per file
    List,
    /// Concatenate the lists found in the files
    MergeList,
    /// One key per file, named after the file stem
    Named,
    /// Union of the mappings found in the files
    MergeNamed,
}

impl DirMode {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "!include_dir_list" => Some(Self::List),
            "!include_dir_merge_list" => Some(Self::MergeList),
            "!include_dir_named" => Some(Self::Named),
            "!include_dir_merge_named" => Some(Self::MergeNamed),
            _ => None,
        }
    }
}

/// Resolves the custom tags of `configuration.yaml`
///
/// Relative include paths are resolved against the including file.
pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, innermost last
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Loader reading `secrets.yaml` from the config directory
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: Vec::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load a file, relative to the config directory unless absolute
    ///
    /// Fails with [`ConfigError::CircularInclude`] when the file is already
    /// being loaded further up the include chain.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = match path.as_ref() {
            p if p.is_absolute() => p.to_path_buf(),
            p => self.config_dir.join(p),
        };

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        debug!(path = %path.display(), "Loading YAML file");

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.push(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.pop();
        result
    }

    /// Parse YAML text; `source_path` anchors relative includes
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;
        self.resolve(value, source_path)
    }

    fn resolve(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, source_path),
            Value::Mapping(map) => {
                let mut out = Mapping::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(self.resolve(k, source_path)?, self.resolve(v, source_path)?);
                }
                Ok(Value::Mapping(out))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.resolve(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Resolving tag");

        if let Some(mode) = DirMode::from_tag(&tag) {
            let dir = self.relative_path(&tag, &tagged.value, source_path)?;
            return self.include_dir(mode, &dir);
        }

        match tag.as_str() {
            "!include" => {
                let path = self.relative_path(&tag, &tagged.value, source_path)?;
                self.load_file(path)
            }
            "!secret" => {
                let key = tag_argument(&tag, &tagged.value)?;
                Ok(Value::String(self.secrets.get(key)?.to_string()))
            }
            "!env_var" => {
                // `!env_var NAME default` falls back to the default
                let arg = tag_argument(&tag, &tagged.value)?;
                let (name, default) = match arg.split_once(char::is_whitespace) {
                    Some((name, default)) => (name, Some(default.trim())),
                    None => (arg, None),
                };
                match (std::env::var(name), default) {
                    (Ok(value), _) => Ok(Value::String(value)),
                    (Err(_), Some(default)) => Ok(Value::String(default.to_string())),
                    (Err(_), None) => Err(ConfigError::EnvVarNotFound {
                        var: name.to_string(),
                    }),
                }
            }
            _ => {
                // Unknown tags survive, with their content resolved
                let value = self.resolve(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    fn include_dir(&mut self, mode: DirMode, dir: &Path) -> ConfigResult<Value> {
        debug!(dir = %dir.display(), ?mode, "Including directory");
        let files = yaml_files(dir)?;

        match mode {
            DirMode::List => files
                .iter()
                .map(|f| self.load_file(f))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            DirMode::MergeList => {
                let mut out = Vec::new();
                for file in &files {
                    match self.load_file(file)? {
                        Value::Sequence(items) => out.extend(items),
                        Value::Null => {}
                        other => out.push(other),
                    }
                }
                Ok(Value::Sequence(out))
            }
            DirMode::Named => {
                let mut out = Mapping::new();
                for file in &files {
                    let name = file
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    out.insert(Value::String(name), self.load_file(file)?);
                }
                Ok(Value::Mapping(out))
            }
            DirMode::MergeNamed => {
                let mut out = Mapping::new();
                for file in &files {
                    if let Value::Mapping(map) = self.load_file(file)? {
                        out.extend(map);
                    }
                }
                Ok(Value::Mapping(out))
            }
        }
    }

    fn relative_path(&self, tag: &str, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let arg = tag_argument(tag, value)?;
        let base = source_path.parent().unwrap_or(&self.config_dir);
        Ok(match Path::new(arg) {
            p if p.is_absolute() => p.to_path_buf(),
            p => base.join(p),
        })
    }
}

fn tag_argument<'a>(tag: &str, value: &'a Value) -> ConfigResult<&'a str> {
    value.as_str().ok_or_else(|| ConfigError::InvalidValue {
        key: tag.to_string(),
        reason: "argument must be a string".to_string(),
    })
}

/// YAML files of a directory, sorted by name
fn yaml_files(dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ConfigError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let entries = fs::read_dir(dir).map_err(|source| ConfigError::ReadFile {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
        .collect();
    files.sort();
    Ok(files)
}

/// Load a YAML file with all tags resolved
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn get<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.get(key).unwrap()
    }

    #[test]
    fn test_include_is_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "sensors/grid.yaml", "platform: statistics\n");
        write_file(dir.path(), "sensors/all.yaml", "- !include grid.yaml\n");
        write_file(dir.path(), "configuration.yaml", "sensor: !include sensors/all.yaml\n");

        let value = load_yaml(dir.path(), "configuration.yaml").unwrap();
        let sensors = get(&value, "sensor").as_sequence().unwrap();
        assert_eq!(sensors[0]["platform"], Value::from("statistics"));
    }

    #[test]
    fn test_secret_and_env_var() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "ecobee_key: abc123\n");
        std::env::set_var("HA_CONFIG_TEST_HOST", "192.168.1.20");
        write_file(
            dir.path(),
            "configuration.yaml",
            "api_key: !secret ecobee_key\nhost: !env_var HA_CONFIG_TEST_HOST\nport: !env_var HA_CONFIG_TEST_UNSET 80\n",
        );

        let value = load_yaml(dir.path(), "configuration.yaml").unwrap();
        assert_eq!(get(&value, "api_key"), &Value::from("abc123"));
        assert_eq!(get(&value, "host"), &Value::from("192.168.1.20"));
        assert_eq!(get(&value, "port"), &Value::from("80"));
        std::env::remove_var("HA_CONFIG_TEST_HOST");
    }

    #[test]
    fn test_missing_env_var_without_default() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "configuration.yaml", "x: !env_var HA_CONFIG_TEST_NEVER_SET\n");
        assert!(matches!(
            load_yaml(dir.path(), "configuration.yaml"),
            Err(ConfigError::EnvVarNotFound { .. })
        ));
    }

    #[test]
    fn test_include_dir_modes() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "lists/a.yaml", "- 1\n- 2\n");
        write_file(dir.path(), "lists/b.yaml", "- 3\n");
        write_file(dir.path(), "named/kitchen.yaml", "power: 100\n");
        write_file(dir.path(), "named/hall.yml", "power: 50\n");
        write_file(dir.path(), "named/notes.txt", "ignored");
        write_file(
            dir.path(),
            "configuration.yaml",
            "list: !include_dir_list lists\nmerged: !include_dir_merge_list lists\nnamed: !include_dir_named named\nunion: !include_dir_merge_named named\n",
        );

        let value = load_yaml(dir.path(), "configuration.yaml").unwrap();
        assert_eq!(get(&value, "list").as_sequence().unwrap().len(), 2);
        assert_eq!(get(&value, "merged").as_sequence().unwrap().len(), 3);

        let named = get(&value, "named").as_mapping().unwrap();
        assert_eq!(named.len(), 2);
        assert!(named.contains_key("kitchen"));

        let union = get(&value, "union").as_mapping().unwrap();
        assert_eq!(union.len(), 1);
    }

    #[test]
    fn test_missing_include_dir() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "configuration.yaml", "x: !include_dir_list nowhere\n");
        assert!(matches!(
            load_yaml(dir.path(), "configuration.yaml"),
            Err(ConfigError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_circular_include_detection() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write_file(dir.path(), "b.yaml", "a: !include a.yaml\n");
        assert!(matches!(
            load_yaml(dir.path(), "a.yaml"),
            Err(ConfigError::CircularInclude { .. })
        ));
    }

    #[test]
    fn test_same_file_included_twice_is_not_circular() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "shared.yaml", "value: 1\n");
        write_file(
            dir.path(),
            "configuration.yaml",
            "one: !include shared.yaml\ntwo: !include shared.yaml\n",
        );
        assert!(load_yaml(dir.path(), "configuration.yaml").is_ok());
    }
}
