//! Event-protocol (INDI) adapter
//!
//! Vectors are pushed by the server and written straight into the data
//! dictionary by a listener task that lives as long as the session. The
//! recurring poll only probes server reachability and re-asserts the
//! device polling period.

use crate::adapter::{AdapterCore, AdapterSettings, ProtocolAdapter};
use crate::config::{settings_from, IndiSettings};
use crate::dictionary::Value;
use crate::error::BridgeResult;
use crate::event::DeviceSignal;
use async_trait::async_trait;
use observatory_indi::standard_properties as props;
use observatory_indi::{
    parse_number, BlobMode, IndiBlob, IndiClient, IndiEvent, IndiPropertyType, IndiVector,
};
use serde_json::Value as JsonValue;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Connection attempts after a failed start
const NUMBER_RETRY: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(1500);
/// How long discovery listens for device definitions
const DISCOVERY_WAIT: Duration = Duration::from_secs(2);

/// The INDI operations an adapter needs; implemented by [`IndiClient`]
#[async_trait]
pub trait IndiTransport: Send + Sync + 'static {
    async fn connect(&self, host: &str, port: u16) -> BridgeResult<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<IndiEvent>;

    async fn watch_device(&self, device: &str) -> BridgeResult<()>;

    async fn vector(&self, device: &str, name: &str) -> Option<IndiVector>;

    async fn devices(&self) -> Vec<String>;

    async fn set_switches(&self, device: &str, property: &str, elements: &[(&str, bool)]) -> BridgeResult<()>;

    async fn set_numbers(&self, device: &str, property: &str, elements: &[(&str, f64)]) -> BridgeResult<()>;

    async fn set_texts(&self, device: &str, property: &str, elements: &[(&str, &str)]) -> BridgeResult<()>;

    async fn enable_blob(&self, device: &str, mode: BlobMode) -> BridgeResult<()>;

    /// Short TCP reachability probe, independent of the session socket
    async fn probe(&self, host: &str, port: u16) -> bool;

    /// Devices on a server matching an interface mask
    async fn discover(&self, host: &str, port: u16, interface_mask: u32) -> BridgeResult<Vec<String>>;
}

#[async_trait]
impl IndiTransport for IndiClient {
    async fn connect(&self, host: &str, port: u16) -> BridgeResult<()> {
        Ok(IndiClient::connect(self, host, port).await?)
    }

    async fn disconnect(&self) {
        if let Err(e) = IndiClient::disconnect(self).await {
            tracing::debug!("INDI disconnect: {}", e);
        }
    }

    fn is_connected(&self) -> bool {
        IndiClient::is_connected(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        IndiClient::subscribe(self)
    }

    async fn watch_device(&self, device: &str) -> BridgeResult<()> {
        Ok(IndiClient::watch_device(self, device).await?)
    }

    async fn vector(&self, device: &str, name: &str) -> Option<IndiVector> {
        IndiClient::vector(self, device, name).await
    }

    async fn devices(&self) -> Vec<String> {
        IndiClient::devices(self).await
    }

    async fn set_switches(&self, device: &str, property: &str, elements: &[(&str, bool)]) -> BridgeResult<()> {
        Ok(IndiClient::set_switches(self, device, property, elements).await?)
    }

    async fn set_numbers(&self, device: &str, property: &str, elements: &[(&str, f64)]) -> BridgeResult<()> {
        Ok(IndiClient::set_numbers(self, device, property, elements).await?)
    }

    async fn set_texts(&self, device: &str, property: &str, elements: &[(&str, &str)]) -> BridgeResult<()> {
        Ok(IndiClient::set_texts(self, device, property, elements).await?)
    }

    async fn enable_blob(&self, device: &str, mode: BlobMode) -> BridgeResult<()> {
        Ok(IndiClient::enable_blob(self, device, mode).await?)
    }

    async fn probe(&self, host: &str, port: u16) -> bool {
        observatory_indi::probe_server(host, port, self.timeout_config().probe_timeout()).await
    }

    async fn discover(&self, host: &str, port: u16, interface_mask: u32) -> BridgeResult<Vec<String>> {
        Ok(observatory_indi::discover_devices(host, port, interface_mask, DISCOVERY_WAIT).await?)
    }
}

/// INDIGO drivers publish the power-box vectors under their own names.
/// Each row maps `VECTOR.ELEMENT` to the INDI key it is stored under.
static INDIGO_KEYS: &[(&str, &str, &str)] = &[
    ("AUX_INFO", "X_AUX_SKY_BRIGHTNESS", "SKY_QUALITY.SKY_BRIGHTNESS"),
    ("AUX_INFO", "X_AUX_SKY_TEMPERATURE", "SKY_QUALITY.SKY_TEMPERATURE"),
    ("AUX_INFO", "X_AUX_AVERAGE", "POWER_CONSUMPTION.CONSUMPTION_AVG_AMPS"),
    ("AUX_INFO", "X_AUX_AMP_HOUR", "POWER_CONSUMPTION.CONSUMPTION_AMP_HOURS"),
    ("AUX_INFO", "X_AUX_WATT_HOUR", "POWER_CONSUMPTION.CONSUMPTION_WATT_HOURS"),
    ("AUX_INFO", "X_AUX_VOLTAGE", "POWER_SENSORS.SENSOR_VOLTAGE"),
    ("AUX_INFO", "X_AUX_CURRENT", "POWER_SENSORS.SENSOR_CURRENT"),
    ("AUX_INFO", "X_AUX_POWER_OUTLET", "POWER_SENSORS.SENSOR_POWER"),
    ("AUX_POWER_OUTLET_CURRENT", "OUTLET_1", "POWER_CURRENT.POWER_CURRENT_1"),
    ("AUX_POWER_OUTLET_CURRENT", "OUTLET_2", "POWER_CURRENT.POWER_CURRENT_2"),
    ("AUX_POWER_OUTLET_CURRENT", "OUTLET_3", "POWER_CURRENT.POWER_CURRENT_3"),
    ("AUX_POWER_OUTLET_CURRENT", "OUTLET_4", "POWER_CURRENT.POWER_CURRENT_4"),
    ("AUX_HEATER_OUTLET_CURRENT", "OUTLET_1", "DEW_CURRENT.DEW_CURRENT_A"),
    ("AUX_HEATER_OUTLET_CURRENT", "OUTLET_2", "DEW_CURRENT.DEW_CURRENT_B"),
    ("AUX_HEATER_OUTLET_CURRENT", "OUTLET_3", "DEW_CURRENT.DEW_CURRENT_C"),
    ("AUX_HEATER_OUTLET", "OUTLET_1", "DEW_PWM.DEW_A"),
    ("AUX_HEATER_OUTLET", "OUTLET_2", "DEW_PWM.DEW_B"),
    ("AUX_HEATER_OUTLET", "OUTLET_3", "DEW_PWM.DEW_C"),
    ("AUX_POWER_OUTLET", "OUTLET_1", "POWER_CONTROL.POWER_CONTROL_1"),
    ("AUX_POWER_OUTLET", "OUTLET_2", "POWER_CONTROL.POWER_CONTROL_2"),
    ("AUX_POWER_OUTLET", "OUTLET_3", "POWER_CONTROL.POWER_CONTROL_3"),
    ("AUX_POWER_OUTLET", "OUTLET_4", "POWER_CONTROL.POWER_CONTROL_4"),
    ("AUX_USB_PORT", "PORT_1", "POWER_ON_BOOT.POWER_PORT_1"),
    ("AUX_USB_PORT", "PORT_2", "POWER_ON_BOOT.POWER_PORT_2"),
    ("AUX_USB_PORT", "PORT_3", "POWER_ON_BOOT.POWER_PORT_3"),
    ("AUX_USB_PORT", "PORT_4", "POWER_ON_BOOT.POWER_PORT_4"),
    ("AUX_USB_PORT", "PORT_5", "POWER_ON_BOOT.POWER_PORT_5"),
    ("AUX_USB_PORT", "PORT_6", "POWER_ON_BOOT.POWER_PORT_6"),
    ("AUX_DEW_CONTROL", "MANUAL", "AUTO_DEW.AUTO_DEW_DISABLED"),
    ("AUX_DEW_CONTROL", "AUTOMATIC", "AUTO_DEW.AUTO_DEW_ENABLED"),
    ("X_AUX_OUTLET_NAMES", "POWER_OUTLET_NAME_1", "POWER_CONTROL_LABEL.POWER_LABEL_1"),
    ("X_AUX_OUTLET_NAMES", "POWER_OUTLET_NAME_2", "POWER_CONTROL_LABEL.POWER_LABEL_2"),
    ("X_AUX_OUTLET_NAMES", "POWER_OUTLET_NAME_3", "POWER_CONTROL_LABEL.POWER_LABEL_3"),
    ("X_AUX_OUTLET_NAMES", "POWER_OUTLET_NAME_4", "POWER_CONTROL_LABEL.POWER_LABEL_4"),
];

/// Dictionary key of one vector element
pub fn dictionary_key(vector: &str, element: &str) -> String {
    INDIGO_KEYS
        .iter()
        .find(|(v, e, _)| *v == vector && *e == element)
        .map(|(_, _, key)| (*key).to_string())
        .unwrap_or_else(|| format!("{}.{}", vector, element))
}

fn element_value(kind: IndiPropertyType, raw: &str) -> Option<Value> {
    match kind {
        IndiPropertyType::Number => parse_number(raw).map(Value::Number),
        IndiPropertyType::Switch => Some(Value::Bool(raw.trim() == "On")),
        IndiPropertyType::Light => Some(Value::Status(raw.trim().to_string())),
        IndiPropertyType::Text => Some(Value::Text(raw.to_string())),
        IndiPropertyType::Blob => None,
    }
}

/// Message text and level of a driver message.
/// `[ERROR]` raises the level, the `[WARNING]` tag is only stripped.
pub fn parse_device_message(raw: &str) -> (String, u8) {
    for (tag, level) in [("[ERROR]", 2), ("[WARNING]", 0)] {
        if let Some(pos) = raw.find(tag) {
            let text = format!("{}{}", &raw[..pos], &raw[pos + tag.len()..]);
            return (text.trim().to_string(), level);
        }
    }
    (raw.trim().to_string(), 0)
}

/// Device-specific behaviour on top of the INDI lifecycle
#[async_trait]
pub trait IndiHooks: Send + Sync + 'static {
    /// Default poll interval in milliseconds
    const UPDATE_RATE: u64 = 1000;
    /// Vector and element of the driver polling period
    const POLLING: (&'static str, &'static str) = (props::POLLING_PERIOD, props::PERIOD_MS);
    /// Driver interface bits used for discovery
    const INTERFACE: u32;

    /// Push the client-side update configuration once the device is connected
    async fn on_device_connected(&self, ctx: &IndiContext<'_>) -> BridgeResult<()> {
        ctx.assert_polling_period(Self::POLLING).await;
        Ok(())
    }

    async fn on_vector(&self, _ctx: &IndiContext<'_>, _vector: &IndiVector) {}

    async fn on_blob(&self, _ctx: &IndiContext<'_>, _blob: IndiBlob) {}
}

/// What a hook or device operation sees of its link
pub struct IndiContext<'a> {
    pub core: &'a Arc<AdapterCore>,
    pub transport: &'a dyn IndiTransport,
    pub epoch: u64,
    pub device: String,
}

impl IndiContext<'_> {
    pub fn store(&self, key: &str, value: Option<Value>) -> bool {
        self.core.store(self.epoch, key, value)
    }

    pub fn is_current(&self) -> bool {
        self.core.is_current(self.epoch)
    }

    pub async fn vector(&self, name: &str) -> Option<IndiVector> {
        self.transport.vector(&self.device, name).await
    }

    pub async fn switches(&self, property: &str, elements: &[(&str, bool)]) -> bool {
        let result = self.transport.set_switches(&self.device, property, elements).await;
        self.report(property, result)
    }

    pub async fn numbers(&self, property: &str, elements: &[(&str, f64)]) -> bool {
        let result = self.transport.set_numbers(&self.device, property, elements).await;
        self.report(property, result)
    }

    pub async fn texts(&self, property: &str, elements: &[(&str, &str)]) -> bool {
        let result = self.transport.set_texts(&self.device, property, elements).await;
        self.report(property, result)
    }

    fn report(&self, property: &str, result: BridgeResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[INDI {}] setting {} failed: {}", self.device, property, e);
                false
            }
        }
    }

    /// Set the driver polling period to the update rate when it differs
    pub async fn assert_polling_period(&self, (vector, element): (&str, &str)) -> bool {
        let Some(current) = self.vector(vector).await else {
            return false;
        };
        let wanted = self.core.update_rate() as f64;
        if current.number(element) == Some(wanted) {
            return true;
        }
        tracing::debug!("[INDI {}] polling period {} -> {} ms", self.device, vector, wanted);
        self.numbers(vector, &[(element, wanted)]).await
    }
}

struct IndiInner<H> {
    core: Arc<AdapterCore>,
    transport: Arc<dyn IndiTransport>,
    hooks: H,
    defaults: IndiSettings,
    settings: RwLock<IndiSettings>,
}

/// Protocol adapter for INDI devices
pub struct IndiLink<H> {
    inner: Arc<IndiInner<H>>,
}

impl<H> Clone for IndiLink<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: IndiHooks> IndiLink<H> {
    pub fn new(core: Arc<AdapterCore>, transport: Arc<dyn IndiTransport>, hooks: H) -> Self {
        let defaults = IndiSettings::with_update_rate(H::UPDATE_RATE);
        Self {
            inner: Arc::new(IndiInner {
                core,
                transport,
                hooks,
                settings: RwLock::new(defaults.clone()),
                defaults,
            }),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.inner.hooks
    }

    pub fn settings(&self) -> IndiSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn context(&self, epoch: u64) -> IndiContext<'_> {
        IndiContext {
            core: &self.inner.core,
            transport: self.inner.transport.as_ref(),
            epoch,
            device: self.inner.core.device_name(),
        }
    }

    /// Context of the live session when the device is connected
    pub fn connected_context(&self) -> Option<IndiContext<'_>> {
        if !self.inner.core.is_device_connected() {
            return None;
        }
        self.inner.core.current_epoch().map(|epoch| self.context(epoch))
    }

    async fn connect_once(&self, epoch: u64) -> bool {
        let core = &self.inner.core;
        let settings = self.settings();
        match self.inner.transport.connect(&settings.host, settings.port).await {
            Ok(()) => {
                core.set_server_connected(epoch, true);
                if let Err(e) = self.inner.transport.watch_device(&settings.device_name).await {
                    tracing::warn!("[INDI {}] getProperties failed: {}", settings.device_name, e);
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    "[INDI {}] cannot reach {}:{}: {}",
                    core.device_type(),
                    settings.host,
                    settings.port,
                    e
                );
                false
            }
        }
    }

    async fn listen(self, epoch: u64, mut events: broadcast::Receiver<IndiEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !self.inner.core.is_current(epoch) {
                        break;
                    }
                    self.handle_event(epoch, event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("[INDI {}] listener lagged by {} events", self.inner.core.device_type(), n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_event(&self, epoch: u64, event: IndiEvent) {
        let core = &self.inner.core;
        let device = core.device_name();
        match event {
            IndiEvent::ConnectionStateChanged(true) => {
                core.set_server_connected(epoch, true);
            }
            IndiEvent::ConnectionStateChanged(false) => {
                core.set_device_connected(epoch, false);
                core.set_server_connected(epoch, false);
                core.data().clear(epoch);
            }
            IndiEvent::DeviceDefined(name) => {
                if name == device {
                    tracing::info!("[INDI] device {} defined", name);
                } else {
                    tracing::trace!("[INDI] ignoring device {}", name);
                }
            }
            IndiEvent::DeviceRemoved(name) if name == device => {
                core.set_device_connected(epoch, false);
                core.data().clear(epoch);
            }
            IndiEvent::PropertyDefined(dev, property, _) if dev == device => {
                if property == props::CONNECTION && !core.is_device_connected() {
                    if let Err(e) = self.inner.transport.set_switches(&device, props::CONNECTION, &[(props::CONNECT, true)]).await {
                        tracing::warn!("[INDI {}] connect request failed: {}", device, e);
                    }
                }
                self.update_vector(epoch, &device, &property).await;
            }
            IndiEvent::PropertyUpdated(dev, property) if dev == device => {
                self.update_vector(epoch, &device, &property).await;
            }
            IndiEvent::PropertyDeleted(dev, property) if dev == device => {
                core.data().remove_prefix(epoch, &property);
                for (vector, _, key) in INDIGO_KEYS {
                    if *vector == property {
                        core.store(epoch, key, None);
                    }
                }
            }
            IndiEvent::Message { device: dev, message } if dev == device => {
                if self.settings().messages {
                    let (text, level) = parse_device_message(&message);
                    core.message(format!("INDI {:<15} {}", dev, text), level);
                }
            }
            IndiEvent::BlobReceived(blob) if blob.device == device => {
                let ctx = self.context(epoch);
                self.inner.hooks.on_blob(&ctx, blob).await;
            }
            IndiEvent::Error(e) => tracing::warn!("[INDI {}] {}", device, e),
            _ => {}
        }
    }

    async fn update_vector(&self, epoch: u64, device: &str, property: &str) {
        let Some(vector) = self.inner.transport.vector(device, property).await else {
            return;
        };
        let core = &self.inner.core;
        for element in &vector.elements {
            let key = dictionary_key(&vector.name, &element.name);
            if let Some(value) = element_value(vector.kind, &element.value) {
                core.store(epoch, &key, Some(value));
            }
        }

        let ctx = self.context(epoch);
        if vector.name == props::CONNECTION {
            let connected = vector.switch(props::CONNECT) == Some(true);
            if core.set_device_connected(epoch, connected) && connected {
                if self.settings().load_config {
                    ctx.switches(props::CONFIG_PROCESS, &[(props::CONFIG_LOAD, true)]).await;
                }
                if let Err(e) = self.inner.hooks.on_device_connected(&ctx).await {
                    tracing::warn!("[INDI {}] update configuration failed: {}", device, e);
                }
            }
        }
        self.inner.hooks.on_vector(&ctx, &vector).await;
    }

    async fn poll_cycle(&self, epoch: u64) -> BridgeResult<()> {
        let core = &self.inner.core;
        let settings = self.settings();
        let transport = &self.inner.transport;

        if !transport.probe(&settings.host, settings.port).await {
            if core.is_server_connected() || core.is_device_connected() {
                tracing::warn!("[INDI {}] server {}:{} unreachable", core.device_type(), settings.host, settings.port);
                core.set_device_connected(epoch, false);
                core.set_server_connected(epoch, false);
                core.data().clear(epoch);
                transport.disconnect().await;
            }
            return Ok(());
        }
        if !transport.is_connected() {
            tracing::info!("[INDI {}] server reachable again, reconnecting", core.device_type());
            self.connect_once(epoch).await;
            return Ok(());
        }
        if core.is_device_connected() {
            self.context(epoch).assert_polling_period(H::POLLING).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<H: IndiHooks> ProtocolAdapter for IndiLink<H> {
    fn core(&self) -> &Arc<AdapterCore> {
        &self.inner.core
    }

    fn default_config(&self) -> JsonValue {
        serde_json::to_value(&self.inner.defaults).unwrap_or_default()
    }

    fn apply_config(&self, config: &JsonValue) -> bool {
        match settings_from::<IndiSettings>(&self.inner.defaults, config) {
            Ok(settings) => {
                self.inner.core.set_settings(AdapterSettings {
                    device_name: settings.device_name.clone(),
                    update_rate: settings.update_rate,
                    load_config: settings.load_config,
                });
                *self
                    .inner
                    .settings
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
                true
            }
            Err(e) => {
                tracing::warn!("[INDI {}] rejected configuration: {}", self.inner.core.device_type(), e);
                false
            }
        }
    }

    fn current_config(&self) -> JsonValue {
        serde_json::to_value(self.settings()).unwrap_or_default()
    }

    async fn start_communication(&self) -> bool {
        let core = Arc::clone(&self.inner.core);
        let epoch = core.begin_session();
        let settings = self.settings();
        tracing::info!(
            "[INDI {}] starting communication with [{}] on {}:{}",
            core.device_type(),
            settings.device_name,
            settings.host,
            settings.port
        );

        let listener = self.clone();
        let events = self.inner.transport.subscribe();
        core.spawn_listener(epoch, "listener", listener.listen(epoch, events));

        let connected = self.connect_once(epoch).await;
        if !connected {
            let link = self.clone();
            core.spawn_task(
                epoch,
                "reconnect",
                async move {
                    for attempt in 1..=NUMBER_RETRY {
                        tokio::time::sleep(RETRY_DELAY).await;
                        let core = &link.inner.core;
                        if !core.data().is_empty() || link.inner.transport.is_connected() {
                            return Ok(true);
                        }
                        tracing::debug!("[INDI {}] connect retry {}", core.device_type(), attempt);
                        if link.connect_once(epoch).await {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                },
                |result: BridgeResult<bool>| {
                    if let Ok(false) = result {
                        tracing::warn!("INDI server not reachable, giving up");
                    }
                },
            );
        }

        let poller = self.clone();
        core.start_polling(epoch, move || {
            let link = poller.clone();
            async move { link.poll_cycle(epoch).await }
        });
        connected
    }

    async fn stop_communication(&self) -> bool {
        let core = &self.inner.core;
        if core.end_session().is_none() {
            return true;
        }
        let name = core.device_name();
        let transport = &self.inner.transport;
        if transport.is_connected() {
            if let Err(e) = transport.set_switches(&name, props::CONNECTION, &[(props::DISCONNECT, true)]).await {
                tracing::debug!("[INDI {}] disconnect request failed: {}", name, e);
            }
        }
        transport.disconnect().await;
        core.emit(DeviceSignal::DeviceDisconnected { name: name.clone() });
        core.emit(DeviceSignal::server_disconnected(&name));
        core.message(format!("INDI device remove: [{}]", name), 0);
        true
    }

    async fn worker_get_initial_config(&self) -> bool {
        let Some(ctx) = self.connected_context() else {
            return false;
        };
        match self.inner.transport.watch_device(&ctx.device).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("[INDI {}] getProperties failed: {}", ctx.device, e);
                false
            }
        }
    }

    async fn worker_poll_data(&self) -> bool {
        match self.inner.core.current_epoch() {
            Some(epoch) => self.poll_cycle(epoch).await.is_ok(),
            None => false,
        }
    }

    async fn discover_devices(&self) -> Vec<String> {
        let settings = self.settings();
        match self
            .inner
            .transport
            .discover(&settings.host, settings.port, H::INTERFACE)
            .await
        {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("INDI discovery on {}:{} failed: {}", settings.host, settings.port, e);
                Vec::new()
            }
        }
    }
}

/// Whether a device type's INDI driver is an INDIGO one
pub fn is_indigo(core: &AdapterCore) -> bool {
    core.data()
        .text("DRIVER_INFO.DRIVER_NAME")
        .map_or(false, |name| name.to_lowercase().starts_with("indigo"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DeviceType, Framework};
    use crate::event::SignalKind;
    use crate::testing::{indi_core, SimulatedIndi};
    use observatory_indi::DriverInterface;

    #[derive(Default)]
    struct Plain;

    impl IndiHooks for Plain {
        const INTERFACE: u32 = DriverInterface::FOCUSER;
    }

    fn link(sim: &Arc<SimulatedIndi>) -> IndiLink<Plain> {
        let link = IndiLink::new(indi_core(DeviceType::Focuser), sim.clone(), Plain);
        assert!(link.apply_config(&serde_json::json!({"deviceName": "Focuser Simulator"})));
        link
    }

    #[test]
    fn test_indigo_translation() {
        assert_eq!(dictionary_key("AUX_HEATER_OUTLET", "OUTLET_2"), "DEW_PWM.DEW_B");
        assert_eq!(dictionary_key("AUX_DEW_CONTROL", "AUTOMATIC"), "AUTO_DEW.AUTO_DEW_ENABLED");
        assert_eq!(dictionary_key("FOCUS_MAX", "FOCUS_MAX_VALUE"), "FOCUS_MAX.FOCUS_MAX_VALUE");
    }

    #[test]
    fn test_device_messages() {
        assert_eq!(parse_device_message("[ERROR] port busy"), ("port busy".to_string(), 2));
        assert_eq!(parse_device_message("[WARNING] slow"), ("slow".to_string(), 0));
        assert_eq!(parse_device_message("hello "), ("hello".to_string(), 0));
    }

    #[test]
    fn test_element_values() {
        assert_eq!(element_value(IndiPropertyType::Switch, "On"), Some(Value::Bool(true)));
        assert_eq!(element_value(IndiPropertyType::Light, "Busy"), Some(Value::Status("Busy".into())));
        assert_eq!(element_value(IndiPropertyType::Number, "12.5"), Some(Value::Number(12.5)));
        assert_eq!(element_value(IndiPropertyType::Blob, "xx"), None);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_silent() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        let link = link(&sim);
        let mut sub = link.core().signals().subscribe();
        assert!(link.stop_communication().await);
        assert!(sub.try_recv().is_none());
        assert!(link.core().data().is_empty());
    }

    #[tokio::test]
    async fn test_connect_stores_vectors_and_signals() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        sim.define_number("ABS_FOCUS_POSITION", &[("FOCUS_ABSOLUTE_POSITION", 1200.0)]);
        sim.define_number("POLLING_PERIOD", &[("PERIOD_MS", 500.0)]);
        let link = link(&sim);
        assert_eq!(link.framework(), Framework::Indi);
        let mut sub = link.core().signals().subscribe();

        assert!(link.start_communication().await);
        sim.settle().await;

        let data = link.core().data();
        assert!(link.core().is_device_connected());
        assert_eq!(data.number("ABS_FOCUS_POSITION.FOCUS_ABSOLUTE_POSITION"), Some(1200.0));
        assert_eq!(data.bool("CONNECTION.CONNECT"), Some(true));
        // polling period pushed to the update rate
        assert!(sim.sent().iter().any(|c| c == "POLLING_PERIOD.PERIOD_MS=1000"));

        let kinds: Vec<_> = sub.drain().iter().map(|s| s.kind()).collect();
        assert!(kinds.contains(&SignalKind::ServerConnected));
        assert!(kinds.contains(&SignalKind::DeviceConnected));

        assert!(link.stop_communication().await);
        assert!(link.core().data().is_empty());
        assert!(!sim.is_connected());
        let kinds: Vec<_> = sub.drain().iter().map(|s| s.kind()).collect();
        assert!(kinds.contains(&SignalKind::DeviceDisconnected));
        assert!(kinds.contains(&SignalKind::ServerDisconnected));
    }

    #[tokio::test]
    async fn test_vector_deletion_removes_keys() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        sim.define_number("FOCUS_TEMPERATURE", &[("TEMPERATURE", 4.5)]);
        let link = link(&sim);
        link.start_communication().await;
        sim.settle().await;
        assert!(link.core().data().contains("FOCUS_TEMPERATURE.TEMPERATURE"));

        sim.delete("FOCUS_TEMPERATURE");
        sim.settle().await;
        assert!(!link.core().data().contains("FOCUS_TEMPERATURE.TEMPERATURE"));
        link.stop_communication().await;
    }

    #[tokio::test]
    async fn test_listener_runs_on_scheduler_for_the_session() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        let link = link(&sim);
        let scheduler = link.core().scheduler().clone();
        assert_eq!(scheduler.stats().listeners, 0);

        link.start_communication().await;
        sim.settle().await;
        assert_eq!(scheduler.stats().listeners, 1);

        link.stop_communication().await;
        sim.settle().await;
        assert_eq!(scheduler.stats().listeners, 0);
    }

    #[tokio::test]
    async fn test_messages_only_when_enabled() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        let link = link(&sim);
        link.start_communication().await;
        sim.settle().await;
        let mut sub = link.core().signals().subscribe_to(&[SignalKind::Message]);

        sim.message("[ERROR] motor stalled");
        sim.settle().await;
        assert!(sub.try_recv().is_none());

        link.apply_config(&serde_json::json!({"deviceName": "Focuser Simulator", "messages": true}));
        sim.message("[ERROR] motor stalled");
        sim.settle().await;
        let msg = sub.try_recv().expect("message");
        assert_eq!(
            msg.signal,
            DeviceSignal::Message {
                text: format!("INDI {:<15} motor stalled", "Focuser Simulator"),
                level: 2
            }
        );
        link.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_retries_then_recovers() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        sim.set_reachable(false);
        let link = link(&sim);
        assert!(!link.start_communication().await);
        assert_eq!(sim.connect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(sim.connect_attempts(), 3);

        sim.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(1600)).await;
        sim.settle().await;
        assert!(link.core().is_server_connected());
        assert!(link.core().is_device_connected());
        link.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_disconnects() {
        let sim = SimulatedIndi::new("Focuser Simulator");
        let link = link(&sim);
        link.start_communication().await;
        sim.settle().await;
        assert!(link.core().is_device_connected());
        let mut sub = link.core().signals().subscribe_to(&[SignalKind::ServerDisconnected]);

        sim.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        link.core().scheduler().flush().await;
        assert!(!link.core().is_device_connected());
        assert!(!link.core().is_server_connected());
        assert!(link.core().data().is_empty());
        assert!(sub.try_recv().is_some());
        link.stop_communication().await;
    }
}
