//! Configuration model
//!
//! Per device type the persisted shape is
//! `{framework: <active protocol>, frameworks: {<protocol>: {deviceName, host, updateRate, ...}}}`.
//! Each protocol has a typed settings struct; the facade's default
//! configuration nests every adapter's defaults under its protocol name and
//! loaded configuration is deep-merged over it so missing keys keep defaults.

use crate::error::{BridgeError, BridgeResult};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persisted configuration of one device type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub frameworks: BTreeMap<String, JsonValue>,
}

impl DeviceConfig {
    /// Deep-merge `self` over `defaults`.
    ///
    /// An empty `framework` keeps the default selection.
    pub fn merged_over(&self, defaults: &DeviceConfig) -> DeviceConfig {
        let mut merged = defaults.clone();
        if !self.framework.is_empty() {
            merged.framework = self.framework.clone();
        }
        for (name, overlay) in &self.frameworks {
            match merged.frameworks.get_mut(name) {
                Some(base) => merge_json(base, overlay),
                None => {
                    merged.frameworks.insert(name.clone(), overlay.clone());
                }
            }
        }
        merged
    }
}

/// Whole-observatory configuration keyed by device type
pub type ObservatoryConfig = BTreeMap<String, DeviceConfig>;

/// Recursively merge `overlay` into `base`. Objects merge key by key,
/// anything else is replaced.
pub fn merge_json(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base), JsonValue::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Typed settings from `defaults` with `overlay` merged over them
pub fn settings_from<T>(defaults: &T, overlay: &JsonValue) -> BridgeResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut base = serde_json::to_value(defaults)?;
    merge_json(&mut base, overlay);
    Ok(serde_json::from_value(base)?)
}

/// Event-protocol (INDI) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndiSettings {
    pub device_name: String,
    pub device_list: Vec<String>,
    pub host: String,
    pub port: u16,
    pub load_config: bool,
    pub messages: bool,
    pub update_rate: u64,
}

impl Default for IndiSettings {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            device_list: Vec::new(),
            host: "localhost".to_string(),
            port: observatory_indi::INDI_DEFAULT_PORT,
            load_config: false,
            messages: false,
            update_rate: 1000,
        }
    }
}

impl IndiSettings {
    pub fn with_update_rate(update_rate: u64) -> Self {
        Self {
            update_rate,
            ..Self::default()
        }
    }
}

/// REST-protocol (Alpaca) settings. `device_name` is `label:devicetype:number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlpacaSettings {
    pub device_name: String,
    pub device_list: Vec<String>,
    pub host: String,
    pub port: u16,
    pub api_version: u32,
    pub protocol: String,
    pub protocol_list: Vec<String>,
    pub user: String,
    pub password: String,
    pub update_rate: u64,
}

impl Default for AlpacaSettings {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            device_list: Vec::new(),
            host: "localhost".to_string(),
            port: observatory_alpaca::ALPACA_DEFAULT_PORT,
            api_version: observatory_alpaca::ALPACA_API_VERSION,
            protocol: "http".to_string(),
            protocol_list: vec!["http".to_string(), "https".to_string()],
            user: String::new(),
            password: String::new(),
            update_rate: DEFAULT_DRIVER_UPDATE_RATE,
        }
    }
}

impl AlpacaSettings {
    pub fn endpoint(&self) -> observatory_alpaca::AlpacaEndpoint {
        observatory_alpaca::AlpacaEndpoint {
            protocol: if self.protocol.is_empty() {
                "http".to_string()
            } else {
                self.protocol.clone()
            },
            host: self.host.clone(),
            port: self.port,
            api_version: self.api_version,
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

/// COM-protocol (ASCOM) settings. `device_name` is the driver ProgID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AscomSettings {
    pub device_name: String,
    pub device_list: Vec<String>,
    pub update_rate: u64,
}

impl Default for AscomSettings {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            device_list: Vec::new(),
            update_rate: DEFAULT_DRIVER_UPDATE_RATE,
        }
    }
}

/// Poll interval of the synchronous protocols in milliseconds
pub const DEFAULT_DRIVER_UPDATE_RATE: u64 = 3000;

/// Load/save semantics of the configuration persistence collaborator
pub trait ConfigStore: Send + Sync {
    fn load(&self, device_type: &str) -> Option<DeviceConfig>;
    fn save(&self, device_type: &str, config: &DeviceConfig) -> BridgeResult<()>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: Mutex<ObservatoryConfig>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ObservatoryConfig) -> Self {
        Self {
            entries: Mutex::new(config),
        }
    }

    pub fn snapshot(&self) -> ObservatoryConfig {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, device_type: &str) -> Option<DeviceConfig> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_type)
            .cloned()
    }

    fn save(&self, device_type: &str, config: &DeviceConfig) -> BridgeResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device_type.to_string(), config.clone());
        Ok(())
    }
}

/// Single JSON file holding every device type, replaced atomically on save
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    entries: Mutex<ObservatoryConfig>,
}

impl JsonConfigStore {
    /// Open `path`, reading it when it exists
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("reading configuration {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("parsing configuration {}", path.display()))?
        } else {
            ObservatoryConfig::new()
        };
        tracing::info!("Configuration store at {}", path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, config: &ObservatoryConfig) -> BridgeResult<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self, device_type: &str) -> Option<DeviceConfig> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_type)
            .cloned()
    }

    fn save(&self, device_type: &str, config: &DeviceConfig) -> BridgeResult<()> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(device_type.to_string(), config.clone());
        self.write_file(&entries).map_err(|e| {
            tracing::warn!("Saving configuration to {} failed: {}", self.path.display(), e);
            BridgeError::Config(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_missing_defaults() {
        let mut base = json!({"indi": {"host": "localhost", "port": 7624, "messages": false}});
        merge_json(&mut base, &json!({"indi": {"host": "astro.local"}}));
        assert_eq!(base, json!({"indi": {"host": "astro.local", "port": 7624, "messages": false}}));
    }

    #[test]
    fn test_settings_from_overlay() {
        let settings: IndiSettings = settings_from(
            &IndiSettings::with_update_rate(1000),
            &json!({"deviceName": "CCD Simulator", "loadConfig": true}),
        )
        .unwrap();
        assert_eq!(settings.device_name, "CCD Simulator");
        assert!(settings.load_config);
        assert_eq!(settings.port, 7624);
        assert_eq!(settings.update_rate, 1000);
    }

    #[test]
    fn test_defaults_serialise_camel_case() {
        let value = serde_json::to_value(AlpacaSettings::default()).unwrap();
        assert_eq!(value["port"], 11111);
        assert_eq!(value["apiVersion"], 1);
        assert_eq!(value["protocolList"], json!(["http", "https"]));
        assert_eq!(value["updateRate"], 3000);
    }

    #[test]
    fn test_device_config_merge() {
        let mut defaults = DeviceConfig {
            framework: "indi".to_string(),
            ..Default::default()
        };
        defaults.frameworks.insert("indi".into(), json!({"host": "localhost", "port": 7624}));
        defaults.frameworks.insert("alpaca".into(), json!({"port": 11111}));

        let mut loaded = DeviceConfig::default();
        loaded.frameworks.insert("indi".into(), json!({"host": "pi.local"}));

        let merged = loaded.merged_over(&defaults);
        assert_eq!(merged.framework, "indi");
        assert_eq!(merged.frameworks["indi"], json!({"host": "pi.local", "port": 7624}));
        assert_eq!(merged.frameworks["alpaca"], json!({"port": 11111}));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observatory.json");

        let store = JsonConfigStore::open(&path).unwrap();
        assert!(store.load("dome").is_none());

        let config = DeviceConfig {
            framework: "alpaca".to_string(),
            frameworks: BTreeMap::from([("alpaca".to_string(), json!({"port": 11112}))]),
        };
        store.save("dome", &config).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = JsonConfigStore::open(&path).unwrap();
        assert_eq!(reopened.load("dome"), Some(config));
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let err = JsonConfigStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("parsing configuration"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryConfigStore::new();
        store.save("camera", &DeviceConfig::default()).unwrap();
        assert!(store.load("camera").is_some());
        assert_eq!(store.snapshot().len(), 1);
    }
}
