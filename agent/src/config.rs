//! Optional plugin configuration loaded from `$HOME/.prod/config.toml`.
//!
//! Absence of the file is not an error — every registration just sends an
//! empty config blob in that case. Only a fixed set of top-level keys are
//! forwarded to the edge; anything else in the file is ignored rather than
//! rejected, so an operator can keep unrelated scratch config alongside it.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const ALLOWED_KEYS: &[&str] = &["log_requests", "basic_auth", "headers"];

pub fn default_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(|home| Path::new(&home).join(".prod").join("config.toml"))
}

/// Loads and filters the plugin config blob from `path`, or an empty JSON
/// object if `path` doesn't exist.
pub fn load(path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Object(Map::new()));
    };
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Object(Map::new())),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let parsed: toml::Value = toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let as_json = toml_to_json(&parsed);

    let mut allowed = Map::new();
    if let Value::Object(map) = as_json {
        for key in ALLOWED_KEYS {
            if let Some(v) = map.get(*key) {
                allowed.insert(key.to_string(), v.clone());
            }
        }
    }
    Ok(Value::Object(allowed))
}

fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::Number((*i).into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            Value::Object(table.iter().map(|(k, v)| (k.clone(), toml_to_json(v))).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_object() {
        let config = load(Some(Path::new("/nonexistent/path/config.toml"))).unwrap();
        assert_eq!(config, Value::Object(Map::new()));
    }

    #[test]
    fn none_path_yields_empty_object() {
        let config = load(None).unwrap();
        assert_eq!(config, Value::Object(Map::new()));
    }

    #[test]
    fn only_allowed_keys_are_forwarded() {
        let dir = std::env::temp_dir().join(format!("prod-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "log_requests = true\nsecret_token = \"nope\"\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config["log_requests"], Value::Bool(true));
        assert!(config.get("secret_token").is_none());

        std::fs::remove_file(&path).ok();
    }
}
