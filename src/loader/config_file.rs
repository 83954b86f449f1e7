//! JSON and YAML configuration files

use std::path::Path;

use serde_json::{Map, Value};
use tracing::warn;

/// User configuration mapping.
pub type UserConfig = Map<String, Value>;

/// Supported data formats, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigFormat {
    Json,
    Yaml,
    Script,
}

impl ConfigFormat {
    pub(crate) fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "rhai" => Some(Self::Script),
            _ => None,
        }
    }
}

/// Keep a top-level object; anything else becomes an empty mapping.
pub(crate) fn into_object(value: Value, origin: &str) -> UserConfig {
    match value {
        Value::Object(map) => map,
        Value::Null => UserConfig::new(),
        other => {
            warn!(origin, kind = value_kind(&other), "config is not a mapping, ignoring");
            UserConfig::new()
        }
    }
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a JSON config file. Errors are logged and yield an empty mapping.
pub(crate) fn load_json(path: &Path) -> UserConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file");
            return UserConfig::new();
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => into_object(value, &path.display().to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error loading JSON config");
            UserConfig::new()
        }
    }
}

/// Parse a YAML config file. Errors are logged and yield an empty mapping.
#[cfg(feature = "yaml")]
pub(crate) fn load_yaml(path: &Path) -> UserConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file");
            return UserConfig::new();
        }
    };
    match serde_yaml::from_str::<Value>(&text) {
        Ok(value) => into_object(value, &path.display().to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error loading YAML config");
            UserConfig::new()
        }
    }
}

/// Without the `yaml` feature YAML configs are skipped.
#[cfg(not(feature = "yaml"))]
pub(crate) fn load_yaml(path: &Path) -> UserConfig {
    warn!(path = %path.display(), "YAML support not compiled in (enable the `yaml` feature), cannot load config");
    UserConfig::new()
}
