//! Alpaca REST transport
//!
//! Member names map onto lower-case endpoints. Property writes send the value
//! as a form field named after the property; methods whose name starts with
//! `Get` are queries, every other method is a PUT.

use crate::adapter::{AdapterSettings, DeviceType, Framework};
use crate::config::{settings_from, AlpacaSettings};
use crate::driver_link::{DriverTransport, DriverValue};
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use observatory_alpaca::{
    discover_devices_of_type, AlpacaClient, AlpacaDeviceAddress, AlpacaDeviceType,
};
use serde_json::Value as JsonValue;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

pub fn alpaca_device_type(device_type: DeviceType) -> AlpacaDeviceType {
    match device_type {
        DeviceType::Camera => AlpacaDeviceType::Camera,
        DeviceType::Cover => AlpacaDeviceType::CoverCalibrator,
        DeviceType::Dome => AlpacaDeviceType::Dome,
        DeviceType::FilterWheel => AlpacaDeviceType::FilterWheel,
        DeviceType::Focuser => AlpacaDeviceType::Focuser,
        DeviceType::Telescope => AlpacaDeviceType::Telescope,
        DeviceType::Weather => AlpacaDeviceType::ObservingConditions,
        DeviceType::Power => AlpacaDeviceType::Switch,
    }
}

/// Convert an envelope `Value` to a driver value.
///
/// Two-dimensional arrays arrive indexed `[x][y]`; they are flattened row-major.
pub fn json_to_driver(value: JsonValue) -> DriverValue {
    match value {
        JsonValue::Null => DriverValue::Empty,
        JsonValue::Bool(b) => DriverValue::Bool(b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => DriverValue::Int(i),
            None => DriverValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => DriverValue::Text(s),
        JsonValue::Array(items) => array_to_driver(items),
        JsonValue::Object(_) => DriverValue::Text(value.to_string()),
    }
}

fn array_to_driver(items: Vec<JsonValue>) -> DriverValue {
    if items.iter().all(JsonValue::is_string) {
        return DriverValue::TextArray(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        );
    }
    if items.iter().all(JsonValue::is_array) {
        let width = items.len();
        let height = items
            .first()
            .and_then(JsonValue::as_array)
            .map_or(0, Vec::len);
        let mut data = vec![0i32; width * height];
        for (x, column) in items.iter().enumerate() {
            if let Some(column) = column.as_array() {
                for (y, v) in column.iter().take(height).enumerate() {
                    data[y * width + x] = v.as_i64().unwrap_or(0) as i32;
                }
            }
        }
        return DriverValue::IntArray { data, width, height };
    }
    let data: Vec<i32> = items
        .iter()
        .map(|v| v.as_i64().unwrap_or(0) as i32)
        .collect();
    let width = data.len();
    DriverValue::IntArray {
        data,
        width,
        height: 1,
    }
}

fn form_value(value: &DriverValue) -> String {
    match value {
        DriverValue::Empty => String::new(),
        DriverValue::Bool(b) => b.to_string(),
        DriverValue::Int(i) => i.to_string(),
        DriverValue::Float(f) => f.to_string(),
        DriverValue::Text(s) => s.clone(),
        DriverValue::IntArray { data, .. } => data
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(","),
        DriverValue::TextArray(items) => items.join(","),
    }
}

/// Alpaca access to one device
pub struct AlpacaTransport {
    device_type: AlpacaDeviceType,
    defaults: AlpacaSettings,
    settings: RwLock<AlpacaSettings>,
    client: tokio::sync::RwLock<Option<Arc<AlpacaClient>>>,
}

impl AlpacaTransport {
    pub fn new(device_type: DeviceType) -> Self {
        let defaults = AlpacaSettings::default();
        Self {
            device_type: alpaca_device_type(device_type),
            settings: RwLock::new(defaults.clone()),
            defaults,
            client: tokio::sync::RwLock::new(None),
        }
    }

    pub fn settings(&self) -> AlpacaSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn client(&self) -> BridgeResult<Arc<AlpacaClient>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| BridgeError::NotConnected(self.settings().device_name))
    }
}

#[async_trait]
impl DriverTransport for AlpacaTransport {
    fn framework(&self) -> Framework {
        Framework::Alpaca
    }

    fn default_config(&self) -> JsonValue {
        serde_json::to_value(&self.defaults).unwrap_or_default()
    }

    fn apply_config(&self, config: &JsonValue) -> BridgeResult<AdapterSettings> {
        let settings: AlpacaSettings = settings_from(&self.defaults, config)?;
        let generic = AdapterSettings {
            device_name: settings.device_name.clone(),
            update_rate: settings.update_rate,
            load_config: false,
        };
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
        Ok(generic)
    }

    fn current_config(&self) -> JsonValue {
        serde_json::to_value(self.settings()).unwrap_or_default()
    }

    async fn open(&self) -> BridgeResult<()> {
        let settings = self.settings();
        let address = AlpacaDeviceAddress::parse(&settings.device_name).ok_or_else(|| {
            BridgeError::Config(format!(
                "'{}' is not of the form label:devicetype:number",
                settings.device_name
            ))
        })?;
        if address.device_type != self.device_type {
            tracing::warn!(
                "Alpaca device {} is a {}, expected {}",
                settings.device_name,
                address.device_type,
                self.device_type
            );
        }
        let client = AlpacaClient::new(settings.endpoint(), self.device_type, address.number)?;
        tracing::debug!("Alpaca client bound to {}", client.build_url(""));
        *self.client.write().await = Some(Arc::new(client));
        Ok(())
    }

    async fn close(&self) {
        self.client.write().await.take();
    }

    async fn get(&self, property: &str) -> BridgeResult<DriverValue> {
        let client = self.client().await?;
        Ok(json_to_driver(client.get_value(property, &[]).await?))
    }

    async fn get_long(&self, property: &str) -> BridgeResult<DriverValue> {
        let client = self.client().await?;
        Ok(json_to_driver(client.get_value_long(property).await?))
    }

    async fn put(&self, property: &str, value: DriverValue) -> BridgeResult<()> {
        let client = self.client().await?;
        client
            .put_value(property, &[(property, form_value(&value))])
            .await?;
        Ok(())
    }

    async fn call(&self, method: &str, args: &[(&str, DriverValue)]) -> BridgeResult<DriverValue> {
        let client = self.client().await?;
        let params: Vec<(&str, String)> = args
            .iter()
            .map(|(name, value)| (*name, form_value(value)))
            .collect();
        let value = if method.starts_with("Get") {
            client.get_value(method, &params).await?
        } else {
            client.put_value(method, &params).await?
        };
        Ok(json_to_driver(value))
    }

    async fn discover(&self) -> Vec<String> {
        let endpoint = self.settings().endpoint();
        match discover_devices_of_type(&endpoint, self.device_type, DISCOVERY_TIMEOUT).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Alpaca discovery on {} failed: {}", endpoint.base_url(), e);
                Vec::new()
            }
        }
    }
}
