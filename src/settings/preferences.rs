use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key/value preference storage provided by the host application.
///
/// Setters never fail from the caller's point of view; implementations log
/// write problems themselves.
pub trait PreferenceStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str);
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn set_bool(&self, key: &str, value: bool);
}

#[derive(Debug, Clone, PartialEq)]
enum PrefValue {
    Str(String),
    Bool(bool),
}

/// In-process preferences, lost when dropped
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, PrefValue>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, PrefValue>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.values().get(key) {
            Some(PrefValue::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn set_string(&self, key: &str, value: &str) {
        self.values()
            .insert(key.to_string(), PrefValue::Str(value.to_string()));
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values().get(key) {
            Some(PrefValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.values().insert(key.to_string(), PrefValue::Bool(value));
    }
}

/// Preferences kept in a JSON object on disk, rewritten on every set
pub struct JsonFilePreferences {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFilePreferences {
    /// Load `path` if it exists, otherwise start empty. The file is created on
    /// the first set.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Map::new()
            } else {
                match serde_json::from_str::<Value>(&raw)? {
                    Value::Object(map) => map,
                    _ => anyhow::bail!("{} does not contain a JSON object", path.display()),
                }
            }
        } else {
            Map::new()
        };
        tracing::debug!(
            "Loaded {} preference(s) from {}",
            values.len(),
            path.display()
        );
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        if let Err(e) = write_document(&self.path, &values) {
            tracing::warn!(
                "Failed to save preferences to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

fn write_document(path: &Path, values: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl PreferenceStore for JsonFilePreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    fn set_string(&self, key: &str, value: &str) {
        self.set(key, Value::String(value.to_string()));
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }
}
