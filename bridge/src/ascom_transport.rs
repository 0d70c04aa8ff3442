//! COM (ASCOM) transport
//!
//! The driver ProgID is the device name. Every call is marshalled to the
//! driver's apartment-threaded worker; method arguments are passed in order.

use crate::adapter::{AdapterSettings, DeviceType, Framework};
use crate::config::{settings_from, AscomSettings};
use crate::driver_link::{DriverTransport, DriverValue};
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use observatory_ascom::{AscomDeviceType, ComValue, ComWorker};
use serde_json::Value as JsonValue;
use std::sync::{Arc, RwLock};

pub fn ascom_device_type(device_type: DeviceType) -> AscomDeviceType {
    match device_type {
        DeviceType::Camera => AscomDeviceType::Camera,
        DeviceType::Cover => AscomDeviceType::CoverCalibrator,
        DeviceType::Dome => AscomDeviceType::Dome,
        DeviceType::FilterWheel => AscomDeviceType::FilterWheel,
        DeviceType::Focuser => AscomDeviceType::Focuser,
        DeviceType::Telescope => AscomDeviceType::Telescope,
        DeviceType::Weather => AscomDeviceType::ObservingConditions,
        DeviceType::Power => AscomDeviceType::Switch,
    }
}

fn from_com(value: ComValue) -> DriverValue {
    match value {
        ComValue::Empty => DriverValue::Empty,
        ComValue::Bool(b) => DriverValue::Bool(b),
        ComValue::Int(i) => DriverValue::Int(i64::from(i)),
        ComValue::Double(d) => DriverValue::Float(d),
        ComValue::Str(s) => DriverValue::Text(s),
        // first dimension varies fastest, which is row-major for x = dim1
        ComValue::IntArray { data, dim1, dim2 } => DriverValue::IntArray {
            data,
            width: dim1,
            height: dim2,
        },
        ComValue::StrArray(items) => DriverValue::TextArray(items),
    }
}

fn to_com(value: DriverValue) -> BridgeResult<ComValue> {
    Ok(match value {
        DriverValue::Empty => ComValue::Empty,
        DriverValue::Bool(b) => ComValue::Bool(b),
        DriverValue::Int(i) => ComValue::Int(
            i32::try_from(i)
                .map_err(|_| BridgeError::InvalidParameter(format!("{} exceeds 32 bits", i)))?,
        ),
        DriverValue::Float(f) => ComValue::Double(f),
        DriverValue::Text(s) => ComValue::Str(s),
        DriverValue::TextArray(items) => ComValue::StrArray(items),
        DriverValue::IntArray { .. } => {
            return Err(BridgeError::InvalidParameter(
                "arrays cannot be written to a driver".to_string(),
            ))
        }
    })
}

pub struct AscomTransport {
    device_type: AscomDeviceType,
    defaults: AscomSettings,
    settings: RwLock<AscomSettings>,
    worker: tokio::sync::RwLock<Option<Arc<ComWorker>>>,
}

impl AscomTransport {
    pub fn new(device_type: DeviceType) -> Self {
        let defaults = AscomSettings::default();
        Self {
            device_type: ascom_device_type(device_type),
            settings: RwLock::new(defaults.clone()),
            defaults,
            worker: tokio::sync::RwLock::new(None),
        }
    }

    pub fn settings(&self) -> AscomSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn worker(&self) -> BridgeResult<Arc<ComWorker>> {
        self.worker
            .read()
            .await
            .clone()
            .ok_or_else(|| BridgeError::NotConnected(self.settings().device_name))
    }
}

#[async_trait]
impl DriverTransport for AscomTransport {
    fn framework(&self) -> Framework {
        Framework::Ascom
    }

    fn default_config(&self) -> JsonValue {
        serde_json::to_value(&self.defaults).unwrap_or_default()
    }

    fn apply_config(&self, config: &JsonValue) -> BridgeResult<AdapterSettings> {
        let settings: AscomSettings = settings_from(&self.defaults, config)?;
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
        let prog_id = self.settings().device_name;
        if prog_id.is_empty() {
            return Err(BridgeError::Config("no driver selected".to_string()));
        }
        let worker = ComWorker::spawn(&prog_id).await?;
        tracing::info!("COM driver {} created", worker.prog_id());
        *self.worker.write().await = Some(Arc::new(worker));
        Ok(())
    }

    async fn close(&self) {
        let worker = self.worker.write().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }

    async fn get(&self, property: &str) -> BridgeResult<DriverValue> {
        let worker = self.worker().await?;
        Ok(from_com(worker.get(property).await?))
    }

    async fn put(&self, property: &str, value: DriverValue) -> BridgeResult<()> {
        let worker = self.worker().await?;
        worker.put(property, to_com(value)?).await?;
        Ok(())
    }

    async fn call(&self, method: &str, args: &[(&str, DriverValue)]) -> BridgeResult<DriverValue> {
        let worker = self.worker().await?;
        let args = args
            .iter()
            .map(|(_, value)| to_com(value.clone()))
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(from_com(worker.call(method, args).await?))
    }

    async fn discover(&self) -> Vec<String> {
        let device_type = self.device_type;
        match tokio::task::spawn_blocking(move || observatory_ascom::discover_devices(device_type))
            .await
        {
            Ok(devices) => devices.into_iter().map(|d| d.prog_id).collect(),
            Err(e) => {
                tracing::warn!("ASCOM registry scan failed: {}", e);
                Vec::new()
            }
        }
    }
}
