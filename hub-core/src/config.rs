//! JSON settings file.
//!
//! A flat JSON object on disk. Reads of missing keys return defaults;
//! every save rewrites the whole file pretty-printed.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::HubError;
use crate::state::ServerSettings;

pub const DEFAULT_PORT: u16 = 10356;

/// Written back in place of an unset password so the key is easy to find.
pub const PASSWORD_PLACEHOLDER: &str = "[Password]";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    document: Map<String, Value>,
}

impl ConfigStore {
    /// Load `path`, starting from an empty document if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HubError> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Map::new(),
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map,
                other => {
                    return Err(HubError::Config(format!(
                        "{} must hold a JSON object, found {}",
                        path.display(),
                        type_name(&other)
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file missing, starting empty");
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// String value, or empty when missing or not a string.
    pub fn get_string(&self, key: &str) -> String {
        self.document
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn save_string(&mut self, key: &str, value: &str) -> Result<(), HubError> {
        self.save(key, Value::String(value.to_string()))
    }

    /// Boolean value, or `false` when missing or not a boolean.
    pub fn get_bool(&self, key: &str) -> bool {
        self.document
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn save_bool(&mut self, key: &str, value: bool) -> Result<(), HubError> {
        self.save(key, Value::Bool(value))
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.document.get(key).and_then(Value::as_object)
    }

    pub fn save_object(&mut self, key: &str, value: Map<String, Value>) -> Result<(), HubError> {
        self.save(key, Value::Object(value))
    }

    fn save(&mut self, key: &str, value: Value) -> Result<(), HubError> {
        self.document.insert(key.to_string(), value);
        self.flush()
    }

    fn flush(&self) -> Result<(), HubError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.document)?;
        fs::write(&self.path, text)?;
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Server values read from a [`ConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub settings: ServerSettings,
}

impl ServerConfig {
    /// Read `port` and `password`, filling in defaults the first time so
    /// the file documents both keys.
    pub fn load(store: &mut ConfigStore) -> Result<Self, HubError> {
        let mut port_text = store.get_string("port");
        if port_text.is_empty() {
            port_text = DEFAULT_PORT.to_string();
            store.save_string("port", &port_text)?;
        }
        let port = port_text
            .trim()
            .parse::<u16>()
            .map_err(|e| HubError::Config(format!("invalid port {port_text:?}: {e}")))?;

        let mut password = store.get_string("password");
        if password.is_empty() || password == PASSWORD_PLACEHOLDER {
            if password.is_empty() {
                store.save_string("password", PASSWORD_PLACEHOLDER)?;
            }
            password = String::new();
        }

        info!(
            port,
            password_required = !password.is_empty(),
            path = %store.path().display(),
            "loaded server config"
        );
        Ok(Self {
            port,
            settings: ServerSettings { password },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("nested").join("config.json")).unwrap()
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.get_string("anything"), "");
        assert!(!store.get_bool("flag"));
        assert!(store.get_object("obj").is_none());
    }

    #[test]
    fn saves_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save_string("name", "hub").unwrap();
        store.save_bool("enabled", true).unwrap();
        let mut obj = Map::new();
        obj.insert("k".into(), Value::from(3));
        store.save_object("extra", obj.clone()).unwrap();

        let reopened = ConfigStore::open(store.path()).unwrap();
        assert_eq!(reopened.get_string("name"), "hub");
        assert!(reopened.get_bool("enabled"));
        assert_eq!(reopened.get_object("extra"), Some(&obj));

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains('\n'), "expected pretty-printed JSON");
    }

    #[test]
    fn wrong_type_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save_bool("port", true).unwrap();
        assert_eq!(store.get_string("port"), "");
    }

    #[test]
    fn non_object_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(ConfigStore::open(&path), Err(HubError::Config(_))));
    }

    #[test]
    fn server_config_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let config = ServerConfig::load(&mut store).unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.settings.requires_password());

        let reopened = ConfigStore::open(store.path()).unwrap();
        assert_eq!(reopened.get_string("port"), "10356");
        assert_eq!(reopened.get_string("password"), PASSWORD_PLACEHOLDER);
    }

    #[test]
    fn server_config_reads_password_and_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save_string("port", "2020").unwrap();
        store.save_string("password", "hunter2").unwrap();

        let config = ServerConfig::load(&mut store).unwrap();
        assert_eq!(config.port, 2020);
        assert_eq!(config.settings.password, "hunter2");
    }

    #[test]
    fn server_config_rejects_bad_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save_string("port", "seventy").unwrap();
        assert!(matches!(
            ServerConfig::load(&mut store),
            Err(HubError::Config(_))
        ));
    }
}
