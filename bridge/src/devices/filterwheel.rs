//! Filter wheel
//!
//! Slots are 1-based in the dictionary whatever the protocol counts from.

use super::{refused, report_result};
use crate::adapter::{wait_until, DeviceType, ProtocolAdapter, MOTION_WAIT_CADENCE};
use crate::dictionary::Value;
use crate::driver_link::{DriverContext, DriverHooks, DriverLink, DriverTransport, DriverValue};
use crate::error::BridgeResult;
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use observatory_indi::{DriverInterface, IndiPropertyState};
use std::sync::Arc;
use std::time::Duration;

const SLOT_VECTOR: &str = "FILTER_SLOT";
const SLOT_ELEMENT: &str = "FILTER_SLOT_VALUE";
const SLOT_KEY: &str = "FILTER_SLOT.FILTER_SLOT_VALUE";
const NAME_PREFIX: &str = "FILTER_NAME.FILTER_SLOT_NAME_";

/// Upper bound for a wheel to reach its slot
pub const FILTER_CHANGE_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait FilterWheelAdapter: ProtocolAdapter {
    /// Move to a 1-based slot; the outcome follows as `Result{success}`
    async fn send_filter_number(&self, number: u32) -> bool;
}

#[derive(Default)]
pub struct FilterWheelIndi;

impl IndiHooks for FilterWheelIndi {
    const INTERFACE: u32 = DriverInterface::FILTER;
}

#[async_trait]
impl FilterWheelAdapter for IndiLink<FilterWheelIndi> {
    async fn send_filter_number(&self, number: u32) -> bool {
        let Some(epoch) = self.connected_context().map(|ctx| ctx.epoch) else {
            return refused(self.core(), "filter change");
        };
        if number == 0 {
            tracing::warn!("[{}] filter slots start at 1", self.core().device_type());
            return false;
        }
        let target = f64::from(number);
        let link = self.clone();
        let core = Arc::clone(self.core());
        core.run_command(
            epoch,
            "filter change",
            FILTER_CHANGE_TIMEOUT,
            async move {
                let ctx = link.context(epoch);
                if !ctx.numbers(SLOT_VECTOR, &[(SLOT_ELEMENT, target)]).await {
                    return Ok(false);
                }
                let ctx = &ctx;
                // the server answers asynchronously: first Busy or the new slot
                wait_until(MOTION_WAIT_CADENCE, move || async move {
                    Ok(match ctx.vector(SLOT_VECTOR).await {
                        Some(v) => {
                            v.state == IndiPropertyState::Busy || v.number(SLOT_ELEMENT) == Some(target)
                        }
                        None => true,
                    })
                })
                .await?;
                wait_until(MOTION_WAIT_CADENCE, move || async move {
                    Ok(match ctx.vector(SLOT_VECTOR).await {
                        Some(v) => v.state != IndiPropertyState::Busy,
                        None => true,
                    })
                })
                .await?;
                let slot = ctx.vector(SLOT_VECTOR).await.and_then(|v| v.number(SLOT_ELEMENT));
                Ok(slot == Some(target))
            },
            {
                let core = Arc::clone(&core);
                move |result| report_result(&core, "filter change", result)
            },
        )
    }
}

#[derive(Default)]
pub struct FilterWheelDriver;

impl FilterWheelDriver {
    /// Store the 0-based driver position as a 1-based slot
    async fn read_position(ctx: &DriverContext<'_>) -> Option<i64> {
        let position = ctx.read("Position").await.and_then(|p| p.as_i64());
        let slot = position.filter(|p| *p >= 0).map(|p| Value::Number((p + 1) as f64));
        ctx.store(SLOT_KEY, slot);
        position
    }
}

#[async_trait]
impl DriverHooks for FilterWheelDriver {
    async fn after_initial(&self, ctx: &DriverContext<'_>) -> BridgeResult<()> {
        if let Some(DriverValue::TextArray(names)) = ctx.read("Names").await {
            for (i, name) in names.into_iter().enumerate() {
                ctx.store(&format!("{}{}", NAME_PREFIX, i + 1), Some(Value::Text(name)));
            }
        }
        Ok(())
    }

    async fn after_poll(&self, ctx: &DriverContext<'_>) -> BridgeResult<()> {
        // -1 while the wheel is moving
        Self::read_position(ctx).await;
        Ok(())
    }
}

#[async_trait]
impl FilterWheelAdapter for DriverLink<FilterWheelDriver> {
    async fn send_filter_number(&self, number: u32) -> bool {
        let Some(epoch) = self.connected_epoch() else {
            return refused(self.core(), "filter change");
        };
        if number == 0 {
            tracing::warn!("[{}] filter slots start at 1", self.core().device_type());
            return false;
        }
        let target = i64::from(number) - 1;
        let link = self.clone();
        let core = Arc::clone(self.core());
        core.run_command(
            epoch,
            "filter change",
            FILTER_CHANGE_TIMEOUT,
            async move {
                let ctx = link.context(epoch);
                if !ctx.write("Position", DriverValue::Int(target)).await {
                    return Ok(false);
                }
                let ctx = &ctx;
                wait_until(MOTION_WAIT_CADENCE, move || async move {
                    Ok(FilterWheelDriver::read_position(ctx).await == Some(target))
                })
                .await?;
                Ok(true)
            },
            {
                let core = Arc::clone(&core);
                move |result| report_result(&core, "filter change", result)
            },
        )
    }
}

pub struct FilterWheel {
    facade: DeviceFacade<dyn FilterWheelAdapter>,
}

device_facade!(FilterWheel, FilterWheelAdapter);

impl FilterWheel {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::FilterWheel),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::FilterWheel, scheduler);
        let mut adapters: Vec<Arc<dyn FilterWheelAdapter>> =
            vec![Arc::new(parts.indi(indi, FilterWheelIndi))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, FilterWheelDriver)));
        }
        Self {
            facade: parts.into_facade(adapters),
        }
    }

    pub async fn send_filter_number(&self, number: u32) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_filter_number(number).await,
            None => false,
        }
    }

    /// Current 1-based slot
    pub fn filter_number(&self) -> Option<u32> {
        self.data()
            .number(SLOT_KEY)
            .filter(|n| *n >= 1.0)
            .map(|n| n as u32)
    }

    /// Filter names ordered by slot
    pub fn filter_names(&self) -> Vec<(u32, String)> {
        let mut names: Vec<(u32, String)> = self
            .data()
            .snapshot()
            .into_iter()
            .filter_map(|(key, value)| {
                let slot = key.strip_prefix(NAME_PREFIX)?.parse().ok()?;
                Some((slot, value.as_str()?.to_string()))
            })
            .collect();
        names.sort_by_key(|(slot, _)| *slot);
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::event::{DeviceSignal, SignalKind};
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{SimulatedDriver, SimulatedIndi};

    fn wheel(indi: Arc<SimulatedIndi>, driver: Arc<SimulatedDriver>) -> FilterWheel {
        FilterWheel::from_parts(
            PollingScheduler::current(SchedulerConfig::default()),
            indi,
            vec![driver],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_names_and_slot_are_one_based() {
        let sim = SimulatedDriver::new();
        sim.set(
            "Names",
            DriverValue::TextArray(vec!["L".into(), "R".into(), "G".into(), "B".into(), "Ha".into(), "OIII".into(), "SII".into(), "Dark".into(), "Clear".into(), "UV".into()]),
        );
        sim.set("Position", DriverValue::Int(0));
        let wheel = wheel(SimulatedIndi::new("Filter Simulator"), sim.clone());
        wheel.set_framework("alpaca");
        wheel.start_communication().await;
        tokio::time::sleep(Duration::from_millis(3100)).await;
        wheel.active().unwrap().core().scheduler().flush().await;

        let names = wheel.filter_names();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], (1, "L".to_string()));
        // numeric, not lexical, slot order
        assert_eq!(names[9], (10, "UV".to_string()));
        assert_eq!(wheel.filter_number(), Some(1));
        wheel.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_change_confirmed_by_read_back() {
        let sim = SimulatedDriver::new();
        sim.set("Position", DriverValue::Int(0));
        let wheel = wheel(SimulatedIndi::new("Filter Simulator"), sim.clone());
        wheel.set_framework("alpaca");
        wheel.start_communication().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut sub = wheel.signals().subscribe_to(&[SignalKind::Result]);

        assert!(wheel.send_filter_number(3).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        wheel.active().unwrap().core().scheduler().flush().await;

        assert_eq!(sim.get_value("Position"), Some(DriverValue::Int(2)));
        assert_eq!(sub.try_recv().map(|e| e.signal), Some(DeviceSignal::Result { success: true }));
        assert_eq!(wheel.filter_number(), Some(3));
        assert!(!wheel.send_filter_number(0).await);
        wheel.stop_communication().await;
    }

    async fn indi_wheel(indi: &Arc<SimulatedIndi>) -> FilterWheel {
        let wheel = wheel(indi.clone(), SimulatedDriver::new());
        let mut config = DeviceConfig {
            framework: "indi".into(),
            ..Default::default()
        };
        config
            .frameworks
            .insert("indi".into(), serde_json::json!({"deviceName": "Filter Simulator"}));
        assert!(wheel.apply_config(&config));
        wheel.start_communication().await;
        indi.settle().await;
        wheel
    }

    #[tokio::test]
    async fn test_indi_slot_change() {
        let indi = SimulatedIndi::new("Filter Simulator");
        indi.define_number(SLOT_VECTOR, &[(SLOT_ELEMENT, 1.0)]);
        indi.define_text("FILTER_NAME", &[("FILTER_SLOT_NAME_1", "Red"), ("FILTER_SLOT_NAME_2", "Green")]);
        let wheel = indi_wheel(&indi).await;
        assert_eq!(wheel.filter_names(), vec![(1, "Red".to_string()), (2, "Green".to_string())]);

        let mut sub = wheel.signals().subscribe_to(&[SignalKind::Result]);
        assert!(wheel.send_filter_number(2).await);
        let result = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("result in time")
            .expect("result");
        assert_eq!(result.signal, DeviceSignal::Result { success: true });
        indi.settle().await;
        assert_eq!(wheel.filter_number(), Some(2));
        wheel.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_indi_late_confirmation_succeeds() {
        let indi = SimulatedIndi::new("Filter Simulator");
        indi.define_number(SLOT_VECTOR, &[(SLOT_ELEMENT, 1.0)]);
        indi.delay_echo(SLOT_VECTOR, Duration::from_millis(100), Duration::from_millis(500));
        let wheel = indi_wheel(&indi).await;
        let mut sub = wheel.signals().subscribe_to(&[SignalKind::Result]);

        assert!(wheel.send_filter_number(2).await);
        let result = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("result in time")
            .expect("result");
        assert_eq!(result.signal, DeviceSignal::Result { success: true });
        assert_eq!(indi.number(SLOT_VECTOR, SLOT_ELEMENT), Some(2.0));
        indi.settle().await;
        assert_eq!(wheel.filter_number(), Some(2));
        wheel.stop_communication().await;
    }

    #[tokio::test]
    async fn test_indi_slot_zero_refused() {
        let indi = SimulatedIndi::new("Filter Simulator");
        indi.define_number(SLOT_VECTOR, &[(SLOT_ELEMENT, 1.0)]);
        let wheel = indi_wheel(&indi).await;
        let mut sub = wheel.signals().subscribe_to(&[SignalKind::Result]);

        assert!(!wheel.send_filter_number(0).await);
        indi.settle().await;
        assert!(!indi.sent().iter().any(|s| s.starts_with(SLOT_VECTOR)));
        assert!(sub.try_recv().is_none());
        assert_eq!(wheel.filter_number(), Some(1));
        wheel.stop_communication().await;
    }
}
