//! Flat panels and dust caps

use super::refused;
use crate::adapter::{DeviceType, ProtocolAdapter};
use crate::dictionary::Value;
use crate::driver_link::{Convert, DriverContext, DriverHooks, DriverLink, DriverTransport, DriverValue, PropertyMap};
use crate::error::BridgeResult;
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiContext, IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use observatory_indi::{DriverInterface, IndiPropertyState, IndiVector};
use std::sync::Arc;

const CAP_PARK: &str = "CAP_PARK";
const LIGHT_CONTROL: &str = "FLAT_LIGHT_CONTROL";
const LIGHT_INTENSITY: &str = "FLAT_LIGHT_INTENSITY";
const INTENSITY_KEY: &str = "FLAT_LIGHT_INTENSITY.FLAT_LIGHT_INTENSITY_VALUE";
const INTENSITY_MAX_KEY: &str = "FLAT_LIGHT_INTENSITY.FLAT_LIGHT_INTENSITY_MAX";
const COVER_STATUS: &str = "Status.Cover";
const CALIBRATOR_STATUS: &str = "Status.Calibrator";

#[async_trait]
pub trait CoverAdapter: ProtocolAdapter {
    async fn open_cover(&self) -> bool;

    async fn close_cover(&self) -> bool;

    async fn halt_cover(&self) -> bool;

    async fn light_on(&self) -> bool;

    async fn light_off(&self) -> bool;

    async fn set_brightness(&self, brightness: u32) -> bool;
}

#[derive(Default)]
pub struct CoverIndi;

#[async_trait]
impl IndiHooks for CoverIndi {
    const INTERFACE: u32 = DriverInterface::DUSTCAP | DriverInterface::LIGHTBOX;

    async fn on_vector(&self, ctx: &IndiContext<'_>, vector: &IndiVector) {
        if vector.name != CAP_PARK {
            return;
        }
        let status = if vector.state == IndiPropertyState::Busy {
            "Moving"
        } else if vector.switch("PARK") == Some(true) {
            "Closed"
        } else if vector.switch("UNPARK") == Some(true) {
            "Open"
        } else {
            "Unknown"
        };
        ctx.store(COVER_STATUS, Some(Value::Status(status.to_string())));
    }
}

impl IndiLink<CoverIndi> {
    /// Set one switch of a vector the driver actually defines
    async fn switch_on(&self, operation: &str, vector: &str, element: &str) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), operation);
        };
        if ctx.vector(vector).await.is_none() {
            tracing::debug!("[INDI {}] {} not defined, {} ignored", ctx.device, vector, operation);
            return false;
        }
        ctx.switches(vector, &[(element, true)]).await
    }
}

#[async_trait]
impl CoverAdapter for IndiLink<CoverIndi> {
    async fn open_cover(&self) -> bool {
        self.switch_on("open cover", CAP_PARK, "UNPARK").await
    }

    async fn close_cover(&self) -> bool {
        self.switch_on("close cover", CAP_PARK, "PARK").await
    }

    async fn halt_cover(&self) -> bool {
        // INDI dust caps have no abort
        false
    }

    async fn light_on(&self) -> bool {
        self.switch_on("light on", LIGHT_CONTROL, "FLAT_LIGHT_ON").await
    }

    async fn light_off(&self) -> bool {
        self.switch_on("light off", LIGHT_CONTROL, "FLAT_LIGHT_OFF").await
    }

    async fn set_brightness(&self, brightness: u32) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), "brightness");
        };
        if ctx.vector(LIGHT_INTENSITY).await.is_none() {
            return false;
        }
        ctx.numbers(LIGHT_INTENSITY, &[("FLAT_LIGHT_INTENSITY_VALUE", f64::from(brightness))])
            .await
    }
}

#[derive(Default)]
pub struct CoverDriver;

#[async_trait]
impl DriverHooks for CoverDriver {
    const INITIAL: &'static [PropertyMap] = &[PropertyMap::new("MaxBrightness", INTENSITY_MAX_KEY)];
    const POLL: &'static [PropertyMap] = &[
        PropertyMap::new("CoverState", COVER_STATUS).convert(Convert::CoverState),
        PropertyMap::new("CalibratorState", CALIBRATOR_STATUS).convert(Convert::CalibratorState),
        PropertyMap::new("Brightness", INTENSITY_KEY),
    ];

    /// Mirror the enumerations into the INDI switch keys
    async fn after_poll(&self, ctx: &DriverContext<'_>) -> BridgeResult<()> {
        let data = ctx.core.data();
        match data.text(COVER_STATUS).as_deref() {
            Some(status) if status != "NotPresent" => {
                ctx.store("CAP_PARK.PARK", Some(Value::Bool(status == "Closed")));
                ctx.store("CAP_PARK.UNPARK", Some(Value::Bool(status == "Open")));
            }
            _ => {
                ctx.store("CAP_PARK.PARK", None);
                ctx.store("CAP_PARK.UNPARK", None);
            }
        }
        let light = match data.text(CALIBRATOR_STATUS).as_deref() {
            Some("NotPresent") | None => None,
            Some(status) => Some(status == "Ready"),
        };
        ctx.core
            .data()
            .store_pair(ctx.epoch, "FLAT_LIGHT_CONTROL.FLAT_LIGHT_ON", "FLAT_LIGHT_CONTROL.FLAT_LIGHT_OFF", light);
        Ok(())
    }
}

impl DriverLink<CoverDriver> {
    async fn method(&self, operation: &str, method: &str, args: &[(&str, DriverValue)]) -> bool {
        match self.command_context() {
            Some(ctx) => ctx.invoke(method, args).await.is_some(),
            None => refused(self.core(), operation),
        }
    }
}

#[async_trait]
impl CoverAdapter for DriverLink<CoverDriver> {
    async fn open_cover(&self) -> bool {
        self.method("open cover", "OpenCover", &[]).await
    }

    async fn close_cover(&self) -> bool {
        self.method("close cover", "CloseCover", &[]).await
    }

    async fn halt_cover(&self) -> bool {
        self.method("halt cover", "HaltCover", &[]).await
    }

    async fn light_on(&self) -> bool {
        let data = self.core().data();
        let brightness = data
            .number(INTENSITY_KEY)
            .filter(|b| *b > 0.0)
            .or_else(|| data.number(INTENSITY_MAX_KEY))
            .unwrap_or(1.0);
        self.set_brightness(brightness as u32).await
    }

    async fn light_off(&self) -> bool {
        self.method("light off", "CalibratorOff", &[]).await
    }

    async fn set_brightness(&self, brightness: u32) -> bool {
        let args = [("Brightness", DriverValue::Int(i64::from(brightness)))];
        self.method("brightness", "CalibratorOn", &args).await
    }
}

pub struct Cover {
    facade: DeviceFacade<dyn CoverAdapter>,
}

device_facade!(Cover, CoverAdapter);

impl Cover {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Cover),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Cover, scheduler);
        let mut adapters: Vec<Arc<dyn CoverAdapter>> = vec![Arc::new(parts.indi(indi, CoverIndi))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, CoverDriver)));
        }
        Self {
            facade: parts.into_facade(adapters),
        }
    }

    pub async fn open_cover(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.open_cover().await,
            None => false,
        }
    }

    pub async fn close_cover(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.close_cover().await,
            None => false,
        }
    }

    pub async fn halt_cover(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.halt_cover().await,
            None => false,
        }
    }

    pub async fn light_on(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.light_on().await,
            None => false,
        }
    }

    pub async fn light_off(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.light_off().await,
            None => false,
        }
    }

    pub async fn set_brightness(&self, brightness: u32) -> bool {
        match self.active() {
            Some(adapter) => adapter.set_brightness(brightness).await,
            None => false,
        }
    }

    /// Open, Closed, Moving, Unknown, Error or NotPresent
    pub fn cover_status(&self) -> Option<String> {
        self.data().text(COVER_STATUS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{SimulatedDriver, SimulatedIndi};
    use std::time::Duration;

    fn cover(framework: &str, indi: Arc<SimulatedIndi>, driver: Arc<SimulatedDriver>) -> Cover {
        let cover = Cover::from_parts(
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
            .insert("indi".into(), serde_json::json!({"deviceName": "Flip Flat"}));
        assert!(cover.apply_config(&config));
        cover
    }

    #[tokio::test]
    async fn test_indi_cover_and_light() {
        let indi = SimulatedIndi::new("Flip Flat");
        indi.define_exclusive(CAP_PARK, &[("PARK", true), ("UNPARK", false)]);
        indi.define_exclusive(LIGHT_CONTROL, &[("FLAT_LIGHT_ON", false), ("FLAT_LIGHT_OFF", true)]);
        let cover = cover("indi", indi.clone(), SimulatedDriver::new());
        cover.start_communication().await;
        indi.settle().await;
        assert_eq!(cover.cover_status().as_deref(), Some("Closed"));

        assert!(cover.open_cover().await);
        indi.settle().await;
        assert_eq!(cover.cover_status().as_deref(), Some("Open"));
        assert_eq!(cover.data().bool("CAP_PARK.UNPARK"), Some(true));

        assert!(cover.light_on().await);
        indi.settle().await;
        assert_eq!(cover.data().bool("FLAT_LIGHT_CONTROL.FLAT_LIGHT_ON"), Some(true));
        assert_eq!(cover.data().bool("FLAT_LIGHT_CONTROL.FLAT_LIGHT_OFF"), Some(false));

        // no intensity vector, no abort
        assert!(!cover.set_brightness(128).await);
        assert!(!cover.halt_cover().await);
        cover.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_states_and_calibrator() {
        let sim = SimulatedDriver::new();
        sim.set("CoverState", DriverValue::Int(1));
        sim.set("CalibratorState", DriverValue::Int(3));
        sim.set("Brightness", DriverValue::Int(0));
        sim.set("MaxBrightness", DriverValue::Int(255));
        let cover = cover("alpaca", SimulatedIndi::new("Flip Flat"), sim.clone());
        cover.start_communication().await;
        tokio::time::sleep(Duration::from_millis(3100)).await;
        cover.active().unwrap().core().scheduler().flush().await;

        assert_eq!(cover.cover_status().as_deref(), Some("Closed"));
        assert_eq!(cover.data().text(CALIBRATOR_STATUS).as_deref(), Some("Ready"));
        assert_eq!(cover.data().bool("CAP_PARK.PARK"), Some(true));
        assert_eq!(cover.data().bool("FLAT_LIGHT_CONTROL.FLAT_LIGHT_OFF"), Some(false));
        assert_eq!(cover.data().number(INTENSITY_MAX_KEY), Some(255.0));

        assert!(cover.open_cover().await);
        assert!(cover.halt_cover().await);
        // brightness 0 falls back to the maximum
        assert!(cover.light_on().await);
        assert_eq!(
            sim.call_args("CalibratorOn"),
            vec![vec![("Brightness".to_string(), DriverValue::Int(255))]]
        );
        assert!(cover.light_off().await);
        let calls = sim.calls();
        for method in ["call OpenCover", "call HaltCover", "call CalibratorOff"] {
            assert!(calls.iter().any(|c| c == method), "{} missing", method);
        }
        cover.stop_communication().await;
    }

    #[tokio::test]
    async fn test_refused_when_disconnected() {
        let sim = SimulatedDriver::new();
        let cover = cover("alpaca", SimulatedIndi::new("Flip Flat"), sim.clone());
        assert!(!cover.open_cover().await);
        assert!(!cover.set_brightness(10).await);
        assert!(sim.calls().is_empty());
    }
}
