//! Per-capability configuration sets.
//!
//! A capability's configuration is its manifest-declared items with operator
//! overrides from the `capabilities.<id>` section of the config file laid
//! over them. Override keys the manifest does not declare are appended.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde_json::Value;

use super::{ConfigError, DispatcherConfig};
use crate::plugins::manifest::{CapabilityManifest, ConfigItem};

pub trait ConfigurationStore: Send + Sync {
    fn load(&self, manifest: &CapabilityManifest) -> Result<Vec<ConfigItem>, ConfigError>;
}

/// Manifest defaults merged with operator overrides held in memory.
#[derive(Debug, Default)]
pub struct LayeredConfigStore {
    overrides: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl LayeredConfigStore {
    pub fn new(overrides: HashMap<String, BTreeMap<String, Value>>) -> Self {
        Self {
            overrides: RwLock::new(overrides),
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.capabilities.clone())
    }

    pub fn set_override(&self, capability_id: &str, key: &str, value: Value) {
        self.overrides
            .write()
            .entry(capability_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// Scalars become their plain text; `null` clears the value.
fn override_text(capability_id: &str, key: &str, value: &Value) -> Result<Option<String>, ConfigError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Bool(_) | Value::Number(_) => Ok(Some(value.to_string())),
        Value::Array(_) | Value::Object(_) => Err(ConfigError::Invalid {
            path: format!(".capabilities.{capability_id}.{key}"),
            message: "capability configuration values must be scalars".to_string(),
        }),
    }
}

impl ConfigurationStore for LayeredConfigStore {
    fn load(&self, manifest: &CapabilityManifest) -> Result<Vec<ConfigItem>, ConfigError> {
        let mut items = manifest.configuration.clone();
        let overrides = self.overrides.read();
        let Some(values) = overrides.get(&manifest.id) else {
            return Ok(items);
        };

        for (key, value) in values {
            let text = override_text(&manifest.id, key, value)?;
            match items.iter_mut().find(|item| &item.key == key) {
                Some(item) => item.value = text,
                None => items.push(ConfigItem {
                    key: key.clone(),
                    value: text,
                    ..ConfigItem::default()
                }),
            }
        }
        Ok(items)
    }
}

/// Required items that resolve to no value.
pub fn missing_required(items: &[ConfigItem]) -> Vec<&str> {
    items
        .iter()
        .filter(|item| item.required && item.effective_value().is_none())
        .map(|item| item.key.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> CapabilityManifest {
        CapabilityManifest::from_json(
            r#"{
                "id": "plugin-weather",
                "verb": "WEATHER",
                "language": "javascript",
                "entryPoint": {"main": "index.js"},
                "configuration": [
                    {"key": "units", "defaultValue": "metric"},
                    {"key": "apiKey", "required": true, "sensitive": true}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_manifest_defaults_without_overrides() {
        let store = LayeredConfigStore::default();
        let items = store.load(&manifest()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].effective_value(), Some("metric"));
        assert_eq!(missing_required(&items), vec!["apiKey"]);
    }

    #[test]
    fn test_overrides_apply_and_extend() {
        let store = LayeredConfigStore::default();
        store.set_override("plugin-weather", "apiKey", json!("k-123"));
        store.set_override("plugin-weather", "retries", json!(3));
        store.set_override("plugin-weather", "units", Value::Null);
        store.set_override("other", "units", json!("imperial"));

        let items = store.load(&manifest()).unwrap();
        let get = |k: &str| items.iter().find(|i| i.key == k).unwrap();
        assert_eq!(get("apiKey").effective_value(), Some("k-123"));
        assert!(get("apiKey").sensitive);
        assert_eq!(get("retries").effective_value(), Some("3"));
        // null clears the explicit value; the manifest default still applies
        assert_eq!(get("units").effective_value(), Some("metric"));
        assert!(missing_required(&items).is_empty());
    }

    #[test]
    fn test_structured_override_is_rejected() {
        let store = LayeredConfigStore::default();
        store.set_override("plugin-weather", "units", json!({"a": 1}));
        assert!(matches!(
            store.load(&manifest()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_from_config_section() {
        let mut config = DispatcherConfig::default();
        config
            .capabilities
            .entry("plugin-weather".into())
            .or_default()
            .insert("apiKey".into(), json!("from-file"));
        let items = LayeredConfigStore::from_config(&config)
            .load(&manifest())
            .unwrap();
        assert_eq!(items[1].value.as_deref(), Some("from-file"));
    }
}
