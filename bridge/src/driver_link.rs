//! Driver lifecycle shared by the synchronous protocols
//!
//! ASCOM COM drivers and Alpaca REST devices expose the same member names
//! (`Connected`, `CameraXSize`, `Position`, ...) and differ only in how a
//! member is reached. [`DriverTransport`] hides that difference; [`DriverLink`]
//! runs the connect handshake, the initial fetch and the recurring poll over
//! any transport, driven by a per-device [`DriverHooks`] table.

use crate::adapter::{AdapterCore, AdapterSettings, ProtocolAdapter};
use crate::dictionary::Value;
use crate::error::{BridgeError, BridgeResult};
use crate::event::DeviceSignal;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Attempts of the `Connected=true` handshake
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(300);
/// Upper bound for the best-effort `Connected=false` on stop
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A value read from or written to a driver member
#[derive(Debug, Clone, PartialEq)]
pub enum DriverValue {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Row-major pixel data
    IntArray {
        data: Vec<i32>,
        width: usize,
        height: usize,
    },
    TextArray(Vec<String>),
}

impl DriverValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DriverValue::Bool(b) => Some(*b),
            DriverValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DriverValue::Int(i) => Some(*i as f64),
            DriverValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DriverValue::Int(i) => Some(*i),
            DriverValue::Float(f) => Some(f.round() as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DriverValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Dictionary form; arrays and empty values have none
    pub fn to_value(&self) -> Option<Value> {
        match self {
            DriverValue::Bool(b) => Some(Value::Bool(*b)),
            DriverValue::Int(i) => Some(Value::Number(*i as f64)),
            DriverValue::Float(f) => Some(Value::Number(*f)),
            DriverValue::Text(s) => Some(Value::Text(s.clone())),
            _ => None,
        }
    }
}

/// How a driver value is translated before it is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    Plain,
    /// Boolean stored together with its negation under the given key
    Inverse(&'static str),
    MetresToMm,
    /// CoverCalibrator `CoverState` enumeration
    CoverState,
    /// CoverCalibrator `CalibratorState` enumeration
    CalibratorState,
    /// Dome `ShutterStatus` enumeration
    ShutterState,
}

/// One row of a device property table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyMap {
    pub property: &'static str,
    pub key: &'static str,
    /// Capability key that must be true for the read to be attempted
    pub requires: Option<&'static str>,
    pub convert: Convert,
}

impl PropertyMap {
    pub const fn new(property: &'static str, key: &'static str) -> Self {
        Self {
            property,
            key,
            requires: None,
            convert: Convert::Plain,
        }
    }

    pub const fn requires(mut self, capability: &'static str) -> Self {
        self.requires = Some(capability);
        self
    }

    pub const fn convert(mut self, convert: Convert) -> Self {
        self.convert = convert;
        self
    }
}

const COVER_STATES: [&str; 6] = ["NotPresent", "Closed", "Moving", "Open", "Unknown", "Error"];
const CALIBRATOR_STATES: [&str; 6] = ["NotPresent", "Off", "NotReady", "Ready", "Unknown", "Error"];
const SHUTTER_STATES: [&str; 5] = ["Open", "Closed", "Opening", "Closing", "Error"];

fn enum_status(table: &[&str], raw: &DriverValue) -> Option<Value> {
    let index = raw.as_i64()?;
    let label = usize::try_from(index)
        .ok()
        .and_then(|i| table.get(i))
        .copied()
        .unwrap_or("Unknown");
    Some(Value::Status(label.to_string()))
}

/// Transport to one synchronous-protocol device
#[async_trait]
pub trait DriverTransport: Send + Sync + 'static {
    fn framework(&self) -> crate::adapter::Framework;

    fn default_config(&self) -> JsonValue;

    /// Apply a merged sub-configuration, returning the generic settings
    fn apply_config(&self, config: &JsonValue) -> BridgeResult<AdapterSettings>;

    fn current_config(&self) -> JsonValue;

    /// Bind to the configured device
    async fn open(&self) -> BridgeResult<()>;

    async fn close(&self);

    async fn get(&self, property: &str) -> BridgeResult<DriverValue>;

    /// Read a large member (image data) with the long-operation timeout
    async fn get_long(&self, property: &str) -> BridgeResult<DriverValue> {
        self.get(property).await
    }

    async fn put(&self, property: &str, value: DriverValue) -> BridgeResult<()>;

    /// Invoke a method with named arguments in declaration order
    async fn call(&self, method: &str, args: &[(&str, DriverValue)]) -> BridgeResult<DriverValue>;

    async fn discover(&self) -> Vec<String>;
}

/// Per-device behaviour of a [`DriverLink`]
#[async_trait]
pub trait DriverHooks: Send + Sync + 'static {
    /// Read once after connecting
    const INITIAL: &'static [PropertyMap] = &[];
    /// Read every poll cycle
    const POLL: &'static [PropertyMap] = &[];

    async fn after_initial(&self, _ctx: &DriverContext<'_>) -> BridgeResult<()> {
        Ok(())
    }

    async fn after_poll(&self, _ctx: &DriverContext<'_>) -> BridgeResult<()> {
        Ok(())
    }
}

/// What a hook sees of its link
pub struct DriverContext<'a> {
    pub core: &'a Arc<AdapterCore>,
    pub transport: &'a dyn DriverTransport,
    pub epoch: u64,
}

impl DriverContext<'_> {
    pub fn store(&self, key: &str, value: Option<Value>) -> bool {
        self.core.store(self.epoch, key, value)
    }

    /// Read a member, logging and swallowing failures
    pub async fn read(&self, property: &str) -> Option<DriverValue> {
        match self.transport.get(property).await {
            Ok(value) => Some(value),
            Err(BridgeError::NotSupported(_)) => {
                tracing::trace!("[{}] {} not implemented", self.core.device_type(), property);
                None
            }
            Err(e) => {
                tracing::debug!("[{}] reading {} failed: {}", self.core.device_type(), property, e);
                None
            }
        }
    }

    /// Read a member straight into a dictionary key; `None` deletes
    pub async fn read_into(&self, property: &str, key: &str) -> Option<DriverValue> {
        let raw = self.read(property).await;
        self.store(key, raw.as_ref().and_then(DriverValue::to_value));
        raw
    }

    pub fn capable(&self, capability: &str) -> bool {
        self.core.data().bool(capability) == Some(true)
    }

    /// Write a member, logging failures
    pub async fn write(&self, property: &str, value: DriverValue) -> bool {
        match self.transport.put(property, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[{}] writing {} failed: {}", self.core.device_type(), property, e);
                false
            }
        }
    }

    /// Call a driver method, logging failures
    pub async fn invoke(&self, method: &str, args: &[(&str, DriverValue)]) -> Option<DriverValue> {
        match self.transport.call(method, args).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("[{}] {} failed: {}", self.core.device_type(), method, e);
                None
            }
        }
    }

    pub async fn apply_table(&self, table: &[PropertyMap]) {
        for row in table {
            if let Some(capability) = row.requires {
                if self.core.data().bool(capability) != Some(true) {
                    continue;
                }
            }
            let raw = self.read(row.property).await;
            match row.convert {
                Convert::Inverse(inverse) => {
                    let value = raw.as_ref().and_then(DriverValue::as_bool);
                    self.core.data().store_pair(self.epoch, row.key, inverse, value);
                }
                convert => {
                    let value = raw.as_ref().and_then(|raw| match convert {
                        Convert::MetresToMm => raw.as_f64().map(|m| Value::Number(m * 1000.0)),
                        Convert::CoverState => enum_status(&COVER_STATES, raw),
                        Convert::CalibratorState => enum_status(&CALIBRATOR_STATES, raw),
                        Convert::ShutterState => enum_status(&SHUTTER_STATES, raw),
                        _ => raw.to_value(),
                    });
                    self.store(row.key, value);
                }
            }
        }
    }
}

struct LinkInner<H> {
    core: Arc<AdapterCore>,
    transport: Arc<dyn DriverTransport>,
    hooks: H,
}

/// Protocol adapter for ASCOM and Alpaca devices
pub struct DriverLink<H> {
    inner: Arc<LinkInner<H>>,
}

impl<H> Clone for DriverLink<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: DriverHooks> DriverLink<H> {
    pub fn new(core: Arc<AdapterCore>, transport: Arc<dyn DriverTransport>, hooks: H) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                core,
                transport,
                hooks,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn DriverTransport> {
        &self.inner.transport
    }

    pub fn hooks(&self) -> &H {
        &self.inner.hooks
    }

    pub fn context(&self, epoch: u64) -> DriverContext<'_> {
        DriverContext {
            core: &self.inner.core,
            transport: self.inner.transport.as_ref(),
            epoch,
        }
    }

    /// Context of the live session when the device is connected
    pub fn command_context(&self) -> Option<DriverContext<'_>> {
        self.connected_epoch().map(|epoch| self.context(epoch))
    }

    /// Epoch of the live session when the device is connected
    pub fn connected_epoch(&self) -> Option<u64> {
        let core = &self.inner.core;
        if !core.is_device_connected() {
            return None;
        }
        core.current_epoch()
    }

    async fn handshake(&self) -> bool {
        let transport = &self.inner.transport;
        for attempt in 1..=CONNECT_ATTEMPTS {
            if let Err(e) = transport.put("Connected", DriverValue::Bool(true)).await {
                tracing::debug!("Connected=true attempt {} failed: {}", attempt, e);
            }
            match transport.get("Connected").await {
                Ok(value) if value.as_bool() == Some(true) => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!("Connected read-back attempt {} failed: {}", attempt, e),
            }
            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
        false
    }

    async fn fetch_initial(&self, epoch: u64) -> BridgeResult<()> {
        let ctx = self.context(epoch);
        ctx.read_into("Name", "DRIVER_INFO.DRIVER_NAME").await;
        ctx.read_into("DriverVersion", "DRIVER_INFO.DRIVER_VERSION").await;
        ctx.read_into("DriverInfo", "DRIVER_INFO.DRIVER_EXEC").await;
        ctx.apply_table(H::INITIAL).await;
        self.inner.hooks.after_initial(&ctx).await
    }

    async fn initial_config(&self, epoch: u64) -> BridgeResult<bool> {
        let core = &self.inner.core;
        let name = core.device_name();

        if let Err(e) = self.inner.transport.open().await {
            tracing::warn!("[{} {}] open {} failed: {}", core.framework(), core.device_type(), name, e);
            core.message(format!("{} connect error: [{}]", core.framework().label(), name), 2);
            return Ok(false);
        }
        if !self.handshake().await {
            core.message(format!("{} connect error: [{}]", core.framework().label(), name), 2);
            return Ok(false);
        }

        core.set_server_connected(epoch, true);
        core.set_device_connected(epoch, true);
        self.fetch_initial(epoch).await?;
        tracing::debug!("[{}] initial data: {:?}", core.device_type(), core.data().snapshot());
        Ok(true)
    }

    async fn poll_cycle(&self, epoch: u64) -> BridgeResult<()> {
        let core = &self.inner.core;
        let connected = match self.inner.transport.get("Connected").await {
            Ok(value) => {
                core.set_server_connected(epoch, true);
                value.as_bool().unwrap_or(false)
            }
            Err(e) if e.is_transport() => {
                tracing::warn!("[{} {}] unreachable: {}", core.framework(), core.device_type(), e);
                core.set_server_connected(epoch, false);
                false
            }
            Err(e) => {
                tracing::debug!("[{}] Connected read failed: {}", core.device_type(), e);
                false
            }
        };

        let was_connected = core.is_device_connected();
        core.set_device_connected(epoch, connected);
        if !connected {
            if was_connected {
                core.data().clear(epoch);
            }
            return Ok(());
        }
        if !was_connected {
            // device came back: constants may have changed
            self.fetch_initial(epoch).await?;
        }

        let ctx = self.context(epoch);
        ctx.apply_table(H::POLL).await;
        self.inner.hooks.after_poll(&ctx).await
    }
}

#[async_trait]
impl<H: DriverHooks> ProtocolAdapter for DriverLink<H> {
    fn core(&self) -> &Arc<AdapterCore> {
        &self.inner.core
    }

    fn default_config(&self) -> JsonValue {
        self.inner.transport.default_config()
    }

    fn apply_config(&self, config: &JsonValue) -> bool {
        match self.inner.transport.apply_config(config) {
            Ok(settings) => {
                self.inner.core.set_settings(settings);
                true
            }
            Err(e) => {
                tracing::warn!("[{}] rejected configuration: {}", self.inner.core.device_type(), e);
                false
            }
        }
    }

    fn current_config(&self) -> JsonValue {
        self.inner.transport.current_config()
    }

    async fn start_communication(&self) -> bool {
        let core = Arc::clone(&self.inner.core);
        let epoch = core.begin_session();
        tracing::info!(
            "[{} {}] starting communication with [{}]",
            core.framework(),
            core.device_type(),
            core.device_name()
        );

        let link = self.clone();
        let poller = self.clone();
        core.spawn_task(
            epoch,
            "initial config",
            async move { link.initial_config(epoch).await },
            move |result| match result {
                Ok(true) => {
                    let core = Arc::clone(&poller.inner.core);
                    core.start_polling(epoch, move || {
                        let link = poller.clone();
                        async move { link.poll_cycle(epoch).await }
                    });
                }
                Ok(false) | Err(BridgeError::Cancelled(_)) => {}
                Err(e) => tracing::warn!("Initial configuration failed: {}", e),
            },
        )
    }

    async fn stop_communication(&self) -> bool {
        let core = &self.inner.core;
        if core.end_session().is_none() {
            return true;
        }
        let name = core.device_name();
        let transport = &self.inner.transport;
        match tokio::time::timeout(DISCONNECT_TIMEOUT, transport.put("Connected", DriverValue::Bool(false))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Connected=false failed: {}", e),
            Err(_) => tracing::debug!("Connected=false timed out"),
        }
        transport.close().await;

        core.emit(DeviceSignal::DeviceDisconnected { name: name.clone() });
        core.emit(DeviceSignal::server_disconnected(&name));
        core.message(format!("{} device remove: [{}]", core.framework().label(), name), 0);
        true
    }

    async fn worker_get_initial_config(&self) -> bool {
        match self.connected_epoch() {
            Some(epoch) => self.fetch_initial(epoch).await.is_ok(),
            None => false,
        }
    }

    async fn worker_poll_data(&self) -> bool {
        match self.inner.core.current_epoch() {
            Some(epoch) => self.poll_cycle(epoch).await.is_ok(),
            None => false,
        }
    }

    async fn discover_devices(&self) -> Vec<String> {
        self.inner.transport.discover().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DeviceType;
    use crate::event::SignalKind;
    use crate::testing::{driver_core, SimulatedDriver};

    struct Plain;

    impl DriverHooks for Plain {
        const INITIAL: &'static [PropertyMap] = &[
            PropertyMap::new("CanFastReadout", "CAN_FAST"),
            PropertyMap::new("CoverState", "Status.Cover").convert(Convert::CoverState),
        ];
        const POLL: &'static [PropertyMap] = &[
            PropertyMap::new("CoolerPower", "CCD_COOLER_POWER.CCD_COOLER_VALUE")
                .requires("CAN_FAST"),
            PropertyMap::new("FastReadout", "READOUT_QUALITY.QUALITY_LOW")
                .convert(Convert::Inverse("READOUT_QUALITY.QUALITY_HIGH")),
            PropertyMap::new("FocalLength", "TELESCOPE_INFO.TELESCOPE_FOCAL_LENGTH")
                .convert(Convert::MetresToMm),
        ];
    }

    fn link(sim: &Arc<SimulatedDriver>) -> DriverLink<Plain> {
        let core = driver_core(DeviceType::Camera, "Camera Simulator");
        DriverLink::new(core, sim.clone(), Plain)
    }

    #[tokio::test]
    async fn test_stop_before_start_is_silent() {
        let sim = SimulatedDriver::new();
        let link = link(&sim);
        let mut sub = link.core().signals().subscribe();
        assert!(link.stop_communication().await);
        assert!(sub.try_recv().is_none());
        assert!(link.core().data().is_empty());
        assert!(sim.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_initial_and_poll() {
        let sim = SimulatedDriver::new();
        sim.set("Name", DriverValue::Text("Camera Simulator".into()));
        sim.set("CanFastReadout", DriverValue::Bool(false));
        sim.set("CoverState", DriverValue::Int(3));
        sim.set("FastReadout", DriverValue::Bool(true));
        sim.set("CoolerPower", DriverValue::Float(40.0));
        sim.set("FocalLength", DriverValue::Float(0.8));
        let link = link(&sim);
        let mut sub = link.core().signals().subscribe();

        assert!(link.start_communication().await);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        link.core().scheduler().flush().await;

        let data = link.core().data();
        assert_eq!(data.text("DRIVER_INFO.DRIVER_NAME").as_deref(), Some("Camera Simulator"));
        assert_eq!(data.text("Status.Cover").as_deref(), Some("Open"));
        assert_eq!(data.bool("READOUT_QUALITY.QUALITY_HIGH"), Some(false));
        assert_eq!(data.number("TELESCOPE_INFO.TELESCOPE_FOCAL_LENGTH"), Some(800.0));
        // gated on CAN_FAST
        assert!(!data.contains("CCD_COOLER_POWER.CCD_COOLER_VALUE"));
        assert!(!sim.calls().iter().any(|c| c == "get CoolerPower"));

        let kinds: Vec<_> = sub.drain().iter().map(|s| s.kind()).collect();
        assert!(kinds.contains(&SignalKind::ServerConnected));
        assert!(kinds.contains(&SignalKind::DeviceConnected));

        assert!(link.stop_communication().await);
        assert!(link.core().data().is_empty());
        assert_eq!(sim.get_value("Connected"), Some(DriverValue::Bool(false)));
        let kinds: Vec<_> = sub.drain().iter().map(|s| s.kind()).collect();
        assert!(kinds.contains(&SignalKind::DeviceDisconnected));
        assert!(kinds.contains(&SignalKind::ServerDisconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refused_emits_error_message() {
        let sim = SimulatedDriver::new();
        sim.refuse_connect();
        let link = link(&sim);
        let mut sub = link.core().signals().subscribe_to(&[SignalKind::Message]);

        link.start_communication().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        link.core().scheduler().flush().await;

        let msg = sub.try_recv().expect("error message");
        assert_eq!(
            msg.signal,
            DeviceSignal::Message {
                text: "ALPACA connect error: [Camera Simulator]".into(),
                level: 2
            }
        );
        let puts = sim.calls().iter().filter(|c| *c == "put Connected").count();
        assert_eq!(puts, 3);
        assert!(!link.core().is_device_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_config_idempotent() {
        let sim = SimulatedDriver::new();
        sim.set("CanFastReadout", DriverValue::Bool(true));
        sim.set("CoverState", DriverValue::Int(1));
        let link = link(&sim);
        link.start_communication().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        link.core().scheduler().flush().await;

        assert!(link.worker_get_initial_config().await);
        let once = link.core().data().snapshot();
        assert!(link.worker_get_initial_config().await);
        assert_eq!(link.core().data().snapshot(), once);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_drop_clears_and_signals() {
        let sim = SimulatedDriver::new();
        sim.set("CanFastReadout", DriverValue::Bool(true));
        let link = link(&sim);
        let mut sub = link.core().signals().subscribe_to(&[SignalKind::DeviceDisconnected]);
        link.start_communication().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        link.core().scheduler().flush().await;
        assert!(link.core().is_device_connected());

        sim.set("Connected", DriverValue::Bool(false));
        assert!(link.worker_poll_data().await);
        assert!(!link.core().is_device_connected());
        assert!(link.core().data().is_empty());
        assert!(sub.try_recv().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_after_stop_leaves_dictionary_empty() {
        let sim = SimulatedDriver::new();
        sim.set("CanFastReadout", DriverValue::Bool(true));
        sim.set("CoolerPower", DriverValue::Float(10.0));
        sim.set_delay("CoolerPower", Duration::from_secs(5));
        let link = link(&sim);

        link.start_communication().await;
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(link.stop_communication().await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        link.core().scheduler().flush().await;
        assert!(link.core().data().is_empty());
    }

    #[test]
    fn test_enum_status() {
        assert_eq!(
            enum_status(&SHUTTER_STATES, &DriverValue::Int(1)),
            Some(Value::Status("Closed".into()))
        );
        assert_eq!(
            enum_status(&COVER_STATES, &DriverValue::Int(42)),
            Some(Value::Status("Unknown".into()))
        );
    }
}
