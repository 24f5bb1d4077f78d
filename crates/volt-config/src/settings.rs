//! Manager settings: install layout, broker coordinates and runtime knobs.
//!
//! Settings come from three places, in increasing precedence: built-in
//! defaults, the `settings` key of the config document, and command-line
//! overrides applied by the manager.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::BootError;

/// Installation namespace used for the directory layout below the prefix.
pub const NAMESPACE: &str = "voltgrid";

/// Broker coordinates and topic prefixes.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_host: String,
    pub broker_port: u16,
    /// When set, the broker is reached over a Unix domain socket instead of
    /// TCP.
    pub broker_socket_path: Option<PathBuf>,
    /// Prefix of all intra-runtime topics, without trailing slash.
    pub internal_prefix: String,
    /// Prefix of user-visible MQTT topics, without trailing slash. May be
    /// empty.
    pub external_prefix: String,
}

impl MqttSettings {
    pub fn endpoint(&self) -> String {
        match &self.broker_socket_path {
            Some(path) => path.display().to_string(),
            None => format!("{}:{}", self.broker_host, self.broker_port),
        }
    }
}

/// Raw `settings` section of the config document.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsDoc {
    mqtt_broker_host: Option<String>,
    mqtt_broker_port: Option<u16>,
    mqtt_broker_socket_path: Option<PathBuf>,
    mqtt_internal_prefix: Option<String>,
    mqtt_external_prefix: Option<String>,
    telemetry_enabled: Option<bool>,
    validate_schema: Option<bool>,
    run_as_user: Option<String>,
    remote_cmd_ack_timeout_ms: Option<u64>,
    remote_cmd_res_timeout_ms: Option<u64>,
    termination_grace_ms: Option<u64>,
    controller_binary: Option<PathBuf>,
}

/// Resolved manager settings, immutable after boot.
#[derive(Debug, Clone)]
pub struct Settings {
    pub prefix: PathBuf,
    pub config_file: PathBuf,
    /// Optional overlay merged over `active_modules` before validation.
    pub user_config_file: Option<PathBuf>,
    pub modules_dir: PathBuf,
    pub interfaces_dir: PathBuf,
    pub types_dir: PathBuf,
    pub errors_dir: PathBuf,
    /// On-disk schema overrides; the embedded schema set is used when absent.
    pub schemas_dir: Option<PathBuf>,
    pub configs_dir: PathBuf,
    /// NODE_PATH for JavaScript modules.
    pub node_modules_dir: PathBuf,
    /// PYTHONPATH for Python modules.
    pub python_modules_dir: PathBuf,
    pub mqtt: MqttSettings,
    pub telemetry_enabled: bool,
    pub validate_schema: bool,
    pub run_as_user: Option<String>,
    pub remote_cmd_ack_timeout: Duration,
    pub remote_cmd_res_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL per child.
    pub termination_grace: Duration,
    pub controller_binary: Option<PathBuf>,
}

fn trim_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

impl Settings {
    /// Resolves settings from an installation prefix and an optional config
    /// file argument (full path, or a bare name looked up in the configs
    /// directory).
    pub fn load(prefix: Option<PathBuf>, config: Option<String>) -> Result<Settings, BootError> {
        let prefix = prefix.unwrap_or_else(|| PathBuf::from("/usr"));
        if !prefix.is_dir() {
            return Err(BootError::BadPrefix(prefix));
        }
        let configs_dir = prefix.join("etc").join(NAMESPACE);

        let config_file = match config {
            Some(arg) => {
                let direct = PathBuf::from(&arg);
                if direct.is_file() {
                    direct
                } else if direct.extension().is_none() {
                    let named = configs_dir.join(format!("{arg}.yaml"));
                    if named.is_file() {
                        named
                    } else {
                        return Err(BootError::MissingConfig(direct));
                    }
                } else {
                    return Err(BootError::MissingConfig(direct));
                }
            }
            None => {
                let default = configs_dir.join("config.yaml");
                if default.is_file() {
                    default
                } else {
                    return Err(BootError::MissingConfig(default));
                }
            }
        };

        Self::from_layout(prefix, configs_dir, config_file)
    }

    /// Builds settings for a flat tree (`<root>/modules`, `<root>/interfaces`,
    /// ...) as used by development checkouts and the test fixtures.
    pub fn for_tree(root: &Path, config_file: &Path) -> Result<Settings, BootError> {
        if !root.is_dir() {
            return Err(BootError::BadPrefix(root.to_path_buf()));
        }
        if !config_file.is_file() {
            return Err(BootError::MissingConfig(config_file.to_path_buf()));
        }
        let mut settings = Self::read_doc_settings(root.to_path_buf(), config_file.to_path_buf())?;
        settings.configs_dir = root.to_path_buf();
        settings.modules_dir = root.join("modules");
        settings.interfaces_dir = root.join("interfaces");
        settings.types_dir = root.join("types");
        settings.errors_dir = root.join("errors");
        let schemas = root.join("schemas");
        settings.schemas_dir = schemas.is_dir().then_some(schemas);
        settings.node_modules_dir = root.join("node_modules");
        settings.python_modules_dir = root.join("python");
        Ok(settings)
    }

    fn from_layout(
        prefix: PathBuf,
        configs_dir: PathBuf,
        config_file: PathBuf,
    ) -> Result<Settings, BootError> {
        let share = prefix.join("share").join(NAMESPACE);
        let mut settings = Self::read_doc_settings(prefix.clone(), config_file)?;
        settings.configs_dir = configs_dir;
        settings.modules_dir = prefix.join("libexec").join(NAMESPACE).join("modules");
        settings.interfaces_dir = share.join("interfaces");
        settings.types_dir = share.join("types");
        settings.errors_dir = share.join("errors");
        let schemas = share.join("schemas");
        settings.schemas_dir = schemas.is_dir().then_some(schemas);
        settings.node_modules_dir = prefix.join("lib").join(NAMESPACE).join("node_modules");
        settings.python_modules_dir = prefix.join("lib").join(NAMESPACE).join("python");
        Ok(settings)
    }

    /// Reads the config document far enough to extract the `settings` section
    /// and apply it over the defaults. The full document is validated later by
    /// the resolver.
    fn read_doc_settings(prefix: PathBuf, config_file: PathBuf) -> Result<Settings, BootError> {
        let text = std::fs::read_to_string(&config_file).map_err(|source| BootError::Unreadable {
            path: config_file.clone(),
            source,
        })?;
        let doc: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(&text).map_err(|e| {
                BootError::Invalid(format!("{}: parse error: {e}", config_file.display()))
            })?
        };

        let doc_settings = match &doc {
            Value::Null => SettingsDoc::default(),
            Value::Object(map) => match map.get("settings") {
                None => SettingsDoc::default(),
                Some(section) => serde_json::from_value(section.clone()).map_err(|e| {
                    BootError::Invalid(format!("{}: invalid settings: {e}", config_file.display()))
                })?,
            },
            other => {
                return Err(BootError::Invalid(format!(
                    "{}: config document has type {}, expected object",
                    config_file.display(),
                    json_type_name(other)
                )))
            }
        };

        let user_config_file = config_file
            .parent()
            .zip(config_file.file_name())
            .map(|(dir, name)| dir.join("user-config").join(name))
            .filter(|p| p.is_file());

        Ok(Settings {
            prefix,
            config_file,
            user_config_file,
            modules_dir: PathBuf::new(),
            interfaces_dir: PathBuf::new(),
            types_dir: PathBuf::new(),
            errors_dir: PathBuf::new(),
            schemas_dir: None,
            configs_dir: PathBuf::new(),
            node_modules_dir: PathBuf::new(),
            python_modules_dir: PathBuf::new(),
            mqtt: MqttSettings {
                broker_host: doc_settings
                    .mqtt_broker_host
                    .unwrap_or_else(|| "localhost".into()),
                broker_port: doc_settings.mqtt_broker_port.unwrap_or(1883),
                broker_socket_path: doc_settings.mqtt_broker_socket_path,
                internal_prefix: trim_prefix(
                    &doc_settings.mqtt_internal_prefix.unwrap_or_else(|| "volt".into()),
                ),
                external_prefix: trim_prefix(
                    &doc_settings.mqtt_external_prefix.unwrap_or_default(),
                ),
            },
            telemetry_enabled: doc_settings.telemetry_enabled.unwrap_or(false),
            validate_schema: doc_settings.validate_schema.unwrap_or(true),
            run_as_user: doc_settings.run_as_user.filter(|u| !u.is_empty()),
            remote_cmd_ack_timeout: Duration::from_millis(
                doc_settings.remote_cmd_ack_timeout_ms.unwrap_or(5_000),
            ),
            remote_cmd_res_timeout: Duration::from_millis(
                doc_settings.remote_cmd_res_timeout_ms.unwrap_or(300_000),
            ),
            termination_grace: Duration::from_millis(
                doc_settings.termination_grace_ms.unwrap_or(5_000),
            ),
            controller_binary: doc_settings.controller_binary,
        })
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        std::fs::write(&config, contents).unwrap();
        for sub in ["modules", "interfaces", "types", "errors"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }
        (dir, config)
    }

    #[test]
    fn missing_prefix_is_a_boot_error() {
        let (_dir, config) = tree_with_config("");
        let err = Settings::for_tree(Path::new("/does/not/exist"), &config).unwrap_err();
        assert!(matches!(err, BootError::BadPrefix(_)));
    }

    #[test]
    fn missing_config_file_is_a_boot_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::for_tree(dir.path(), &dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, BootError::MissingConfig(_)));
    }

    #[test]
    fn empty_and_null_documents_use_defaults() {
        for contents in ["", "null\n", "{}\n"] {
            let (dir, config) = tree_with_config(contents);
            let settings = Settings::for_tree(dir.path(), &config).unwrap();
            assert_eq!(settings.mqtt.broker_host, "localhost");
            assert_eq!(settings.mqtt.broker_port, 1883);
            assert_eq!(settings.mqtt.internal_prefix, "volt");
            assert!(settings.validate_schema);
            drop(dir);
        }
    }

    #[test]
    fn top_level_string_document_is_rejected() {
        let (dir, config) = tree_with_config("\"just a string\"\n");
        let err = Settings::for_tree(dir.path(), &config).unwrap_err();
        assert!(matches!(err, BootError::Invalid(_)));
        assert!(err.to_string().contains("string"));
        drop(dir);
    }

    #[test]
    fn broken_yaml_is_rejected() {
        let (dir, config) = tree_with_config("settings: [unterminated\n");
        assert!(Settings::for_tree(dir.path(), &config).is_err());
        drop(dir);
    }

    #[test]
    fn settings_section_overrides_defaults() {
        let (dir, config) = tree_with_config(
            "settings:\n  mqtt_broker_port: 11883\n  mqtt_internal_prefix: grid/\n  validate_schema: false\n  run_as_user: charge\n",
        );
        let settings = Settings::for_tree(dir.path(), &config).unwrap();
        assert_eq!(settings.mqtt.broker_port, 11883);
        assert_eq!(settings.mqtt.internal_prefix, "grid");
        assert!(!settings.validate_schema);
        assert_eq!(settings.run_as_user.as_deref(), Some("charge"));
        drop(dir);
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let (dir, config) = tree_with_config("settings:\n  no_such_knob: 1\n");
        assert!(Settings::for_tree(dir.path(), &config).is_err());
        drop(dir);
    }
}
