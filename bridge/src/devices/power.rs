//! Power distribution units
//!
//! On INDI this is a Pegasus Ultimate Power Box; INDIGO publishes the same
//! controls under `AUX_*` vectors and is told apart by its driver name. On
//! Alpaca and ASCOM it is a Switch device where every switch is one port.

use super::refused;
use crate::adapter::{AdapterCore, DeviceType, ProtocolAdapter};
use crate::dictionary::Value;
use crate::driver_link::{DriverContext, DriverHooks, DriverLink, DriverTransport, DriverValue};
use crate::error::BridgeResult;
use crate::event::DeviceSignal;
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{is_indigo, IndiContext, IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use observatory_indi::{DriverInterface, IndiVector};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const SWITCH_COUNT: &str = "SWITCH.COUNT";

/// Dew heater outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DewPort {
    A,
    B,
    C,
}

impl DewPort {
    fn indigo_outlet(self) -> &'static str {
        match self {
            DewPort::A => "OUTLET_1",
            DewPort::B => "OUTLET_2",
            DewPort::C => "OUTLET_3",
        }
    }

    fn indi_element(self) -> &'static str {
        match self {
            DewPort::A => "DEW_A",
            DewPort::B => "DEW_B",
            DewPort::C => "DEW_C",
        }
    }
}

#[async_trait]
pub trait PowerAdapter: ProtocolAdapter {
    async fn toggle_power_port(&self, port: u32) -> bool;

    async fn toggle_power_port_boot(&self, _port: u32) -> bool {
        false
    }

    async fn toggle_hub_usb(&self) -> bool {
        false
    }

    async fn toggle_port_usb(&self, _port: u32) -> bool {
        false
    }

    async fn toggle_auto_dew(&self) -> bool {
        false
    }

    async fn send_dew(&self, _port: DewPort, _value: f64) -> bool {
        false
    }

    async fn send_adjustable_output(&self, _volts: f64) -> bool {
        false
    }

    async fn reboot(&self) -> bool {
        false
    }
}

/// Firmware generation of the box: 1 for the original UPB, 2 for UPBv2
pub fn model_version(model: Option<&str>, firmware: Option<&str>) -> Option<u8> {
    // firmware wins when both are published
    if let Some(firmware) = firmware {
        return Some(if firmware < "1.5" { 1 } else { 2 });
    }
    model.map(|model| if model == "UPB" { 1 } else { 2 })
}

pub struct PowerIndi {
    version: Arc<AtomicU8>,
}

#[async_trait]
impl IndiHooks for PowerIndi {
    const UPDATE_RATE: u64 = 1000;
    const POLLING: (&'static str, &'static str) = ("POLLING", "PERIOD");
    const INTERFACE: u32 = DriverInterface::AUX;

    async fn on_vector(&self, ctx: &IndiContext<'_>, vector: &IndiVector) {
        if vector.name != "DRIVER_INFO" && vector.name != "FIRMWARE_INFO" {
            return;
        }
        let data = ctx.core.data();
        let model = data.text("DRIVER_INFO.DEVICE_MODEL");
        let firmware = data.text("FIRMWARE_INFO.VERSION");
        let Some(version) = model_version(model.as_deref(), firmware.as_deref()) else {
            return;
        };
        if self.version.swap(version, Ordering::SeqCst) != version {
            tracing::info!("[INDI {}] power box generation {}", ctx.device, version);
            ctx.core.emit(DeviceSignal::Version(version));
        }
    }
}

impl IndiLink<PowerIndi> {
    fn version(&self) -> u8 {
        self.hooks().version.load(Ordering::SeqCst)
    }

    /// Flip switch elements of a vector; every element must exist
    async fn toggle(&self, operation: &str, vector: &str, elements: &[&str]) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), operation);
        };
        let Some(current) = ctx.vector(vector).await else {
            return false;
        };
        let mut flipped = Vec::with_capacity(elements.len());
        for element in elements {
            match current.switch(element) {
                Some(on) => flipped.push((*element, !on)),
                None => return false,
            }
        }
        ctx.switches(vector, &flipped).await
    }

    /// Set the two elements of an enable/disable pair to the opposite state
    async fn toggle_pair(&self, operation: &str, vector: &str, on: &str, off: &str) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), operation);
        };
        let Some(enabled) = ctx.vector(vector).await.and_then(|v| v.switch(on)) else {
            return false;
        };
        ctx.switches(vector, &[(on, !enabled), (off, enabled)]).await
    }

    async fn number(&self, operation: &str, vector: &str, element: &str, value: f64) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), operation);
        };
        match ctx.vector(vector).await {
            Some(current) if current.element(element).is_some() => {
                ctx.numbers(vector, &[(element, value)]).await
            }
            _ => false,
        }
    }

    fn indigo(&self) -> bool {
        is_indigo(self.core())
    }
}

#[async_trait]
impl PowerAdapter for IndiLink<PowerIndi> {
    async fn toggle_power_port(&self, port: u32) -> bool {
        let (vector, element) = if self.indigo() {
            ("AUX_POWER_OUTLET", format!("OUTLET_{}", port))
        } else {
            ("POWER_CONTROL", format!("POWER_CONTROL_{}", port))
        };
        self.toggle("power port", vector, &[element.as_str()]).await
    }

    async fn toggle_power_port_boot(&self, port: u32) -> bool {
        if self.indigo() {
            return false;
        }
        let element = format!("POWER_PORT_{}", port);
        self.toggle("power port boot", "POWER_ON_BOOT", &[element.as_str()]).await
    }

    async fn toggle_hub_usb(&self) -> bool {
        if self.indigo() {
            return false;
        }
        self.toggle_pair("usb hub", "USB_HUB_CONTROL", "INDI_ENABLED", "INDI_DISABLED").await
    }

    async fn toggle_port_usb(&self, port: u32) -> bool {
        let vector = if self.indigo() { "AUX_USB_PORT" } else { "USB_PORT_CONTROL" };
        let element = format!("PORT_{}", port);
        self.toggle("usb port", vector, &[element.as_str()]).await
    }

    async fn toggle_auto_dew(&self) -> bool {
        if self.indigo() {
            return self.toggle_pair("auto dew", "AUX_DEW_CONTROL", "AUTOMATIC", "MANUAL").await;
        }
        if self.version() == 1 {
            return self.toggle_pair("auto dew", "AUTO_DEW", "INDI_ENABLED", "INDI_DISABLED").await;
        }
        // UPBv2 switches all three heaters together, following DEW_A
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), "auto dew");
        };
        let Some(enabled) = ctx.vector("AUTO_DEW").await.and_then(|v| v.switch("DEW_A")) else {
            return false;
        };
        ctx.switches("AUTO_DEW", &[("DEW_A", !enabled), ("DEW_B", !enabled), ("DEW_C", !enabled)])
            .await
    }

    async fn send_dew(&self, port: DewPort, value: f64) -> bool {
        if self.indigo() {
            self.number("dew", "AUX_HEATER_OUTLET", port.indigo_outlet(), value).await
        } else {
            self.number("dew", "DEW_PWM", port.indi_element(), value).await
        }
    }

    async fn send_adjustable_output(&self, volts: f64) -> bool {
        if self.indigo() {
            self.number("adjustable output", "X_AUX_VARIABLE_POWER_OUTLET", "OUTLET_1", volts).await
        } else {
            self.number("adjustable output", "ADJUSTABLE_VOLTAGE", "ADJUSTABLE_VOLTAGE_VALUE", volts)
                .await
        }
    }

    async fn reboot(&self) -> bool {
        let vector = if self.indigo() { "X_AUX_REBOOT" } else { "REBOOT_DEVICE" };
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), "reboot");
        };
        match ctx.vector(vector).await {
            Some(current) if current.element("REBOOT").is_some() => {
                ctx.switches(vector, &[("REBOOT", true)]).await
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct PowerDriver;

fn switch_count(core: &AdapterCore) -> i64 {
    core.data().number(SWITCH_COUNT).map_or(0, |n| n as i64)
}

#[async_trait]
impl DriverHooks for PowerDriver {
    async fn after_initial(&self, ctx: &DriverContext<'_>) -> BridgeResult<()> {
        let count = ctx.read_into("MaxSwitch", SWITCH_COUNT).await.and_then(|c| c.as_i64());
        for id in 0..count.unwrap_or(0) {
            let name = ctx.invoke("GetSwitchName", &[("Id", DriverValue::Int(id))]).await;
            let label = name.and_then(|n| n.as_str().map(|s| Value::Text(s.to_string())));
            ctx.store(&format!("POWER_CONTROL_LABEL.POWER_LABEL_{}", id + 1), label);
        }
        Ok(())
    }

    async fn after_poll(&self, ctx: &DriverContext<'_>) -> BridgeResult<()> {
        for id in 0..switch_count(ctx.core) {
            let state = ctx.invoke("GetSwitch", &[("Id", DriverValue::Int(id))]).await;
            let value = state.and_then(|s| s.as_bool()).map(Value::Bool);
            ctx.store(&format!("POWER_CONTROL.POWER_CONTROL_{}", id + 1), value);
        }
        Ok(())
    }
}

#[async_trait]
impl PowerAdapter for DriverLink<PowerDriver> {
    async fn toggle_power_port(&self, port: u32) -> bool {
        let Some(ctx) = self.command_context() else {
            return refused(self.core(), "power port");
        };
        let id = i64::from(port) - 1;
        if id < 0 || id >= switch_count(ctx.core) {
            tracing::warn!("[{}] no switch {}", ctx.core.device_type(), port);
            return false;
        }
        let key = format!("POWER_CONTROL.POWER_CONTROL_{}", port);
        let current = ctx.core.data().bool(&key).unwrap_or(false);
        let args = [("Id", DriverValue::Int(id)), ("State", DriverValue::Bool(!current))];
        if ctx.invoke("SetSwitch", &args).await.is_none() {
            return false;
        }
        ctx.store(&key, Some(Value::Bool(!current)));
        true
    }
}

pub struct Power {
    facade: DeviceFacade<dyn PowerAdapter>,
    version: Arc<AtomicU8>,
}

device_facade!(Power, PowerAdapter);

impl Power {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Power),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Power, scheduler);
        let version = Arc::new(AtomicU8::new(0));
        let hooks = PowerIndi {
            version: Arc::clone(&version),
        };
        let mut adapters: Vec<Arc<dyn PowerAdapter>> = vec![Arc::new(parts.indi(indi, hooks))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, PowerDriver)));
        }
        Self {
            facade: parts.into_facade(adapters),
            version,
        }
    }

    /// Detected box generation, `None` until the driver reports it
    pub fn model_version(&self) -> Option<u8> {
        match self.version.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    pub async fn toggle_power_port(&self, port: u32) -> bool {
        match self.active() {
            Some(adapter) => adapter.toggle_power_port(port).await,
            None => false,
        }
    }

    pub async fn toggle_power_port_boot(&self, port: u32) -> bool {
        match self.active() {
            Some(adapter) => adapter.toggle_power_port_boot(port).await,
            None => false,
        }
    }

    pub async fn toggle_hub_usb(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.toggle_hub_usb().await,
            None => false,
        }
    }

    pub async fn toggle_port_usb(&self, port: u32) -> bool {
        match self.active() {
            Some(adapter) => adapter.toggle_port_usb(port).await,
            None => false,
        }
    }

    pub async fn toggle_auto_dew(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.toggle_auto_dew().await,
            None => false,
        }
    }

    pub async fn send_dew(&self, port: DewPort, value: f64) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_dew(port, value).await,
            None => false,
        }
    }

    pub async fn send_adjustable_output(&self, volts: f64) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_adjustable_output(volts).await,
            None => false,
        }
    }

    pub async fn reboot(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.reboot().await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::event::SignalKind;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{SimulatedDriver, SimulatedIndi};
    use std::time::Duration;

    fn power(framework: &str, indi: Arc<SimulatedIndi>, driver: Arc<SimulatedDriver>) -> Power {
        let power = Power::from_parts(
            PollingScheduler::current(SchedulerConfig::default()),
            indi,
            vec![driver],
        );
        let mut config = DeviceConfig {
            framework: framework.to_string(),
            ..Default::default()
        };
        config
            .frameworks
            .insert("indi".into(), serde_json::json!({"deviceName": "Pegasus UPB"}));
        assert!(power.apply_config(&config));
        power
    }

    #[test]
    fn test_model_version() {
        assert_eq!(model_version(Some("UPB"), None), Some(1));
        assert_eq!(model_version(Some("UPBv2"), None), Some(2));
        assert_eq!(model_version(Some("UPBv2"), Some("1.4")), Some(1));
        assert_eq!(model_version(None, Some("2.1")), Some(2));
        assert_eq!(model_version(None, None), None);
    }

    fn upb_v2(driver_name: &str) -> Arc<SimulatedIndi> {
        let indi = SimulatedIndi::new("Pegasus UPB");
        indi.define_text("DRIVER_INFO", &[("DRIVER_NAME", driver_name), ("DEVICE_MODEL", "UPBv2")]);
        indi.define_number("POLLING", &[("PERIOD", 500.0)]);
        indi.define_switch("POWER_CONTROL", &[("POWER_CONTROL_1", true), ("POWER_CONTROL_2", false)]);
        indi.define_switch("AUTO_DEW", &[("DEW_A", false), ("DEW_B", false), ("DEW_C", false)]);
        indi.define_number("DEW_PWM", &[("DEW_A", 0.0), ("DEW_B", 0.0), ("DEW_C", 0.0)]);
        indi
    }

    #[tokio::test]
    async fn test_indi_generation_and_ports() {
        let indi = upb_v2("Pegasus UPB");
        let power = power("indi", indi.clone(), SimulatedDriver::new());
        let mut sub = power.signals().subscribe_to(&[SignalKind::Version]);
        power.start_communication().await;
        indi.settle().await;

        assert_eq!(sub.try_recv().map(|e| e.signal), Some(DeviceSignal::Version(2)));
        assert_eq!(power.model_version(), Some(2));
        // polling period uses the UPB vector names
        assert!(indi.sent().iter().any(|c| c == "POLLING.PERIOD=1000"));

        assert!(power.toggle_power_port(2).await);
        assert!(indi.sent().iter().any(|c| c == "POWER_CONTROL.POWER_CONTROL_2=true"));
        assert!(!power.toggle_power_port(7).await);

        assert!(power.toggle_auto_dew().await);
        for heater in ["DEW_A", "DEW_B", "DEW_C"] {
            assert!(indi.sent().iter().any(|c| *c == format!("AUTO_DEW.{}=true", heater)));
        }

        assert!(power.send_dew(DewPort::B, 40.0).await);
        assert_eq!(indi.number("DEW_PWM", "DEW_B"), Some(40.0));
        // vectors the box does not define
        assert!(!power.toggle_hub_usb().await);
        assert!(!power.reboot().await);
        power.stop_communication().await;
    }

    #[tokio::test]
    async fn test_indigo_uses_aux_vectors() {
        let indi = SimulatedIndi::new("Pegasus UPB");
        indi.define_text("DRIVER_INFO", &[("DRIVER_NAME", "indigo_aux_upb"), ("DEVICE_MODEL", "UPB")]);
        indi.define_switch("AUX_POWER_OUTLET", &[("OUTLET_1", false)]);
        indi.define_number("AUX_HEATER_OUTLET", &[("OUTLET_1", 0.0), ("OUTLET_2", 0.0), ("OUTLET_3", 0.0)]);
        let power = power("indi", indi.clone(), SimulatedDriver::new());
        power.start_communication().await;
        indi.settle().await;

        // INDIGO outlets land under the INDI keys
        assert_eq!(power.data().bool("POWER_CONTROL.POWER_CONTROL_1"), Some(false));
        assert!(power.toggle_power_port(1).await);
        indi.settle().await;
        assert_eq!(power.data().bool("POWER_CONTROL.POWER_CONTROL_1"), Some(true));

        assert!(power.send_dew(DewPort::C, 25.0).await);
        assert_eq!(indi.number("AUX_HEATER_OUTLET", "OUTLET_3"), Some(25.0));
        assert!(!power.toggle_power_port_boot(1).await);
        assert!(!power.toggle_hub_usb().await);
        power.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_device_ports() {
        let sim = SimulatedDriver::new();
        sim.set("MaxSwitch", DriverValue::Int(4));
        sim.on_call("GetSwitchName", |args| match args.first() {
            Some((_, DriverValue::Int(id))) => DriverValue::Text(format!("Port {}", id + 1)),
            _ => DriverValue::Empty,
        });
        sim.on_call("GetSwitch", |args| DriverValue::Bool(matches!(args.first(), Some((_, DriverValue::Int(0))))));
        let power = power("alpaca", SimulatedIndi::new("Pegasus UPB"), sim.clone());
        power.start_communication().await;
        tokio::time::sleep(Duration::from_millis(3100)).await;
        power.active().unwrap().core().scheduler().flush().await;

        assert_eq!(power.data().number(SWITCH_COUNT), Some(4.0));
        assert_eq!(power.data().text("POWER_CONTROL_LABEL.POWER_LABEL_3").as_deref(), Some("Port 3"));
        assert_eq!(power.data().bool("POWER_CONTROL.POWER_CONTROL_1"), Some(true));
        assert_eq!(power.data().bool("POWER_CONTROL.POWER_CONTROL_2"), Some(false));

        assert!(power.toggle_power_port(1).await);
        assert_eq!(
            sim.call_args("SetSwitch"),
            vec![vec![
                ("Id".to_string(), DriverValue::Int(0)),
                ("State".to_string(), DriverValue::Bool(false))
            ]]
        );
        assert!(!power.toggle_power_port(5).await);
        assert!(!power.toggle_auto_dew().await);
        assert!(!power.reboot().await);
        power.stop_communication().await;
    }
}
