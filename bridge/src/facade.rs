//! Device facades
//!
//! A facade owns the data dictionary and signal bus of one logical device and
//! a registry of protocol adapters keyed by framework name. Every call goes to
//! the adapter of the selected framework; an unknown framework turns every
//! call into a `false`/empty result.

use crate::adapter::{AdapterCore, AdapterSettings, DeviceType, Framework, ProtocolAdapter};
use crate::alpaca_transport::AlpacaTransport;
use crate::config::{DeviceConfig, DEFAULT_DRIVER_UPDATE_RATE};
use crate::dictionary::DataDictionary;
use crate::driver_link::{DriverHooks, DriverLink, DriverTransport};
use crate::event::SignalBus;
use crate::indi_link::{IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use observatory_indi::IndiClient;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Shared pieces every adapter of one device is built from
pub struct DeviceParts {
    pub device_type: DeviceType,
    pub data: DataDictionary,
    pub signals: Arc<SignalBus>,
    pub scheduler: PollingScheduler,
}

impl DeviceParts {
    pub fn new(device_type: DeviceType, scheduler: PollingScheduler) -> Self {
        Self {
            device_type,
            data: DataDictionary::new(),
            signals: Arc::new(SignalBus::new(device_type.as_str())),
            scheduler,
        }
    }

    pub fn core(&self, framework: Framework, update_rate: u64) -> Arc<AdapterCore> {
        AdapterCore::new(
            self.device_type,
            framework,
            self.data.clone(),
            Arc::clone(&self.signals),
            self.scheduler.clone(),
            AdapterSettings {
                device_name: String::new(),
                update_rate,
                load_config: false,
            },
        )
    }

    pub fn indi<H: IndiHooks>(&self, transport: Arc<dyn IndiTransport>, hooks: H) -> IndiLink<H> {
        IndiLink::new(self.core(Framework::Indi, H::UPDATE_RATE), transport, hooks)
    }

    pub fn driver<H: DriverHooks>(&self, transport: Arc<dyn DriverTransport>, hooks: H) -> DriverLink<H> {
        let core = self.core(transport.framework(), DEFAULT_DRIVER_UPDATE_RATE);
        DriverLink::new(core, transport, hooks)
    }

    /// The INDI client used outside tests
    pub fn indi_transport() -> Arc<dyn IndiTransport> {
        Arc::new(IndiClient::new())
    }

    /// Synchronous-protocol transports available on this host.
    /// COM drivers only exist on Windows.
    pub fn driver_transports(device_type: DeviceType) -> Vec<Arc<dyn DriverTransport>> {
        #[allow(unused_mut)]
        let mut transports: Vec<Arc<dyn DriverTransport>> =
            vec![Arc::new(AlpacaTransport::new(device_type))];
        #[cfg(windows)]
        transports.push(Arc::new(crate::ascom_transport::AscomTransport::new(device_type)));
        transports
    }

    pub fn into_facade<A>(self, adapters: Vec<Arc<A>>) -> DeviceFacade<A>
    where
        A: ProtocolAdapter + ?Sized,
    {
        DeviceFacade::new(self.device_type, self.data, self.signals, adapters)
    }
}

/// Protocol-agnostic entry point of one device type
pub struct DeviceFacade<A: ?Sized> {
    device_type: DeviceType,
    data: DataDictionary,
    signals: Arc<SignalBus>,
    adapters: BTreeMap<String, Arc<A>>,
    framework: RwLock<String>,
}

impl<A: ProtocolAdapter + ?Sized> DeviceFacade<A> {
    /// The first adapter becomes the initial framework
    pub fn new(
        device_type: DeviceType,
        data: DataDictionary,
        signals: Arc<SignalBus>,
        adapters: Vec<Arc<A>>,
    ) -> Self {
        let framework = adapters
            .first()
            .map(|a| a.framework().as_str().to_string())
            .unwrap_or_default();
        let adapters = adapters
            .into_iter()
            .map(|a| (a.framework().as_str().to_string(), a))
            .collect();
        Self {
            device_type,
            data,
            signals,
            adapters,
            framework: RwLock::new(framework),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn data(&self) -> &DataDictionary {
        &self.data
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn framework(&self) -> String {
        self.framework
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Select a framework. Unknown names are kept; every call then fails.
    pub fn set_framework(&self, framework: &str) {
        let framework = framework.to_lowercase();
        if !self.adapters.contains_key(&framework) {
            tracing::warn!("[{}] framework '{}' is not available on this host", self.device_type, framework);
        }
        *self
            .framework
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = framework;
    }

    /// Registered framework names
    pub fn frameworks(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn adapter(&self, framework: &str) -> Option<&Arc<A>> {
        self.adapters.get(framework)
    }

    /// Adapter of the selected framework
    pub fn active(&self) -> Option<Arc<A>> {
        self.adapters.get(&self.framework()).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.active()
            .map_or(false, |a| a.core().is_device_connected())
    }

    /// Every adapter's defaults nested under its framework name
    pub fn default_config(&self) -> DeviceConfig {
        DeviceConfig {
            framework: self.framework(),
            frameworks: self
                .adapters
                .iter()
                .map(|(name, a)| (name.clone(), a.default_config()))
                .collect(),
        }
    }

    /// Select the configured framework and hand each adapter its sub-configuration
    pub fn apply_config(&self, config: &DeviceConfig) -> bool {
        let merged = config.merged_over(&self.default_config());
        let mut ok = true;
        for (name, adapter) in &self.adapters {
            if let Some(sub) = merged.frameworks.get(name) {
                ok &= adapter.apply_config(sub);
            }
        }
        self.set_framework(&merged.framework);
        ok
    }

    pub fn current_config(&self) -> DeviceConfig {
        DeviceConfig {
            framework: self.framework(),
            frameworks: self
                .adapters
                .iter()
                .map(|(name, a)| (name.clone(), a.current_config()))
                .collect(),
        }
    }

    pub async fn start_communication(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.start_communication().await,
            None => {
                tracing::warn!("[{}] no adapter for framework '{}'", self.device_type, self.framework());
                false
            }
        }
    }

    pub async fn stop_communication(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.stop_communication().await,
            None => false,
        }
    }

    pub async fn discover_devices(&self) -> Vec<String> {
        match self.active() {
            Some(adapter) => adapter.discover_devices().await,
            None => Vec::new(),
        }
    }
}

/// Implements `Deref` to the facade for a device wrapper struct
macro_rules! device_facade {
    ($device:ident, $adapter:ident) => {
        impl std::ops::Deref for $device {
            type Target = crate::facade::DeviceFacade<dyn $adapter>;

            fn deref(&self) -> &Self::Target {
                &self.facade
            }
        }
    };
}

pub(crate) use device_facade;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SignalKind;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::SimulatedDriver;
    use serde_json::json;

    struct Plain;
    impl DriverHooks for Plain {}

    fn facade() -> DeviceFacade<dyn ProtocolAdapter> {
        let parts = DeviceParts::new(DeviceType::Weather, PollingScheduler::current(SchedulerConfig::default()));
        let link: Arc<dyn ProtocolAdapter> = Arc::new(parts.driver(SimulatedDriver::new(), Plain));
        parts.into_facade(vec![link])
    }

    #[tokio::test]
    async fn test_absent_framework_fails_silently() {
        let facade = facade();
        assert_eq!(facade.framework(), "alpaca");
        facade.set_framework("ascom");
        let mut sub = facade.signals().subscribe();
        assert!(!facade.start_communication().await);
        assert!(!facade.stop_communication().await);
        assert!(facade.discover_devices().await.is_empty());
        assert!(sub.try_recv().is_none());
        assert!(facade.data().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_succeeds() {
        let facade = facade();
        let mut sub = facade.signals().subscribe_to(&[SignalKind::DeviceDisconnected]);
        assert!(facade.stop_communication().await);
        assert!(sub.try_recv().is_none());
        assert!(facade.data().is_empty());
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let facade = facade();
        let defaults = facade.default_config();
        assert_eq!(defaults.framework, "alpaca");
        assert_eq!(defaults.frameworks["alpaca"]["updateRate"], 3000);

        let mut config = DeviceConfig::default();
        config
            .frameworks
            .insert("alpaca".into(), json!({"deviceName": "Sky:observingconditions:0", "updateRate": 1000}));
        assert!(facade.apply_config(&config));
        assert_eq!(facade.framework(), "alpaca");
        let current = facade.current_config();
        assert_eq!(current.frameworks["alpaca"]["deviceName"], "Sky:observingconditions:0");
        assert_eq!(facade.active().unwrap().core().update_rate(), 1000);
    }
}
