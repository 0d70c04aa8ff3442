//! Focuser
//!
//! `move_to` is a long command: it returns as soon as the move has been
//! accepted and reports the outcome with `Result{success}` once the focuser
//! stops or the timeout expires.

use super::{refused, report_result};
use crate::adapter::{wait_until, DeviceType, ProtocolAdapter, MOTION_WAIT_CADENCE};
use crate::dictionary::Value;
use crate::driver_link::{DriverHooks, DriverLink, DriverTransport, DriverValue, PropertyMap};
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiContext, IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use observatory_indi::{DriverInterface, IndiPropertyState, IndiVector};
use std::sync::Arc;
use std::time::Duration;

const ABS_POSITION: &str = "ABS_FOCUS_POSITION";
const POSITION: &str = "FOCUS_ABSOLUTE_POSITION";
const MOVING: &str = "Status.Moving";

#[async_trait]
pub trait FocuserAdapter: ProtocolAdapter {
    /// Start a move to an absolute position
    async fn move_to(&self, position: i64, timeout: Duration) -> bool;

    async fn halt(&self) -> bool;
}

#[derive(Default)]
pub struct FocuserIndi;

#[async_trait]
impl IndiHooks for FocuserIndi {
    const INTERFACE: u32 = DriverInterface::FOCUSER;

    async fn on_vector(&self, ctx: &IndiContext<'_>, vector: &IndiVector) {
        if vector.name == ABS_POSITION {
            ctx.store(MOVING, Some(Value::Bool(vector.state == IndiPropertyState::Busy)));
        }
    }
}

#[async_trait]
impl FocuserAdapter for IndiLink<FocuserIndi> {
    async fn move_to(&self, position: i64, timeout: Duration) -> bool {
        let Some(epoch) = self.connected_context().map(|ctx| ctx.epoch) else {
            return refused(self.core(), "move");
        };
        let link = self.clone();
        let core = Arc::clone(self.core());
        core.run_command(
            epoch,
            "move",
            timeout,
            async move {
                let ctx = link.context(epoch);
                if !ctx.numbers(ABS_POSITION, &[(POSITION, position as f64)]).await {
                    return Ok(false);
                }
                // give the driver a chance to flag the vector busy
                tokio::time::sleep(MOTION_WAIT_CADENCE).await;
                let ctx = &ctx;
                wait_until(MOTION_WAIT_CADENCE, move || async move {
                    Ok(ctx
                        .vector(ABS_POSITION)
                        .await
                        .map_or(true, |v| v.state != IndiPropertyState::Busy))
                })
                .await?;
                Ok(ctx
                    .vector(ABS_POSITION)
                    .await
                    .map_or(false, |v| v.state != IndiPropertyState::Alert))
            },
            {
                let core = Arc::clone(&core);
                move |result| report_result(&core, "move", result)
            },
        )
    }

    async fn halt(&self) -> bool {
        match self.connected_context() {
            Some(ctx) => ctx.switches("FOCUS_ABORT_MOTION", &[("ABORT", true)]).await,
            None => refused(self.core(), "halt"),
        }
    }
}

#[derive(Default)]
pub struct FocuserDriver;

impl DriverHooks for FocuserDriver {
    const INITIAL: &'static [PropertyMap] = &[PropertyMap::new("MaxStep", "FOCUS_MAX.FOCUS_MAX_VALUE")];
    const POLL: &'static [PropertyMap] = &[
        PropertyMap::new("Position", "ABS_FOCUS_POSITION.FOCUS_ABSOLUTE_POSITION"),
        PropertyMap::new("Temperature", "FOCUS_TEMPERATURE.TEMPERATURE"),
        PropertyMap::new("IsMoving", MOVING),
    ];
}

#[async_trait]
impl FocuserAdapter for DriverLink<FocuserDriver> {
    async fn move_to(&self, position: i64, timeout: Duration) -> bool {
        let Some(epoch) = self.connected_epoch() else {
            return refused(self.core(), "move");
        };
        let link = self.clone();
        let core = Arc::clone(self.core());
        core.run_command(
            epoch,
            "move",
            timeout,
            async move {
                let ctx = link.context(epoch);
                if ctx.invoke("Move", &[("Position", DriverValue::Int(position))]).await.is_none() {
                    return Ok(false);
                }
                let ctx = &ctx;
                wait_until(MOTION_WAIT_CADENCE, move || async move {
                    let moving = ctx.read_into("IsMoving", MOVING).await;
                    Ok(moving.and_then(|m| m.as_bool()) != Some(true))
                })
                .await?;
                ctx.read_into("Position", "ABS_FOCUS_POSITION.FOCUS_ABSOLUTE_POSITION").await;
                Ok(true)
            },
            {
                let core = Arc::clone(&core);
                move |result| report_result(&core, "move", result)
            },
        )
    }

    async fn halt(&self) -> bool {
        match self.command_context() {
            Some(ctx) => ctx.invoke("Halt", &[]).await.is_some(),
            None => refused(self.core(), "halt"),
        }
    }
}

pub struct Focuser {
    facade: DeviceFacade<dyn FocuserAdapter>,
}

device_facade!(Focuser, FocuserAdapter);

impl Focuser {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Focuser),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Focuser, scheduler);
        let mut adapters: Vec<Arc<dyn FocuserAdapter>> = vec![Arc::new(parts.indi(indi, FocuserIndi))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, FocuserDriver)));
        }
        Self {
            facade: parts.into_facade(adapters),
        }
    }

    pub async fn move_to(&self, position: i64, timeout: Duration) -> bool {
        match self.active() {
            Some(adapter) => adapter.move_to(position, timeout).await,
            None => false,
        }
    }

    pub async fn halt(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.halt().await,
            None => false,
        }
    }

    pub fn position(&self) -> Option<f64> {
        self.data().number("ABS_FOCUS_POSITION.FOCUS_ABSOLUTE_POSITION")
    }

    pub fn is_moving(&self) -> bool {
        self.data().bool(MOVING) == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::event::{DeviceSignal, SignalKind};
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{SimulatedDriver, SimulatedIndi};
    use serde_json::json;

    fn focuser(framework: &str, indi: Arc<SimulatedIndi>, driver: Arc<SimulatedDriver>) -> Focuser {
        let focuser = Focuser::from_parts(
            PollingScheduler::current(SchedulerConfig::default()),
            indi,
            vec![driver],
        );
        let mut config = DeviceConfig {
            framework: framework.to_string(),
            ..Default::default()
        };
        config.frameworks.insert("indi".into(), json!({"deviceName": "Focuser Simulator"}));
        assert!(focuser.apply_config(&config));
        focuser
    }

    async fn started_driver(sim: &Arc<SimulatedDriver>) -> Focuser {
        sim.set("Position", DriverValue::Int(100));
        sim.set("MaxStep", DriverValue::Int(60000));
        let focuser = focuser("alpaca", SimulatedIndi::new("Focuser Simulator"), sim.clone());
        assert!(focuser.start_communication().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        focuser.active().unwrap().core().scheduler().flush().await;
        focuser
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_move_waits_until_stopped() {
        let sim = SimulatedDriver::new();
        let focuser = started_driver(&sim).await;
        assert_eq!(focuser.data().number("FOCUS_MAX.FOCUS_MAX_VALUE"), Some(60000.0));
        let mut sub = focuser.signals().subscribe_to(&[SignalKind::Result]);

        sim.set("IsMoving", DriverValue::Bool(true));
        assert!(focuser.move_to(5000, Duration::from_secs(30)).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sub.try_recv().is_none());
        assert!(focuser.is_moving());

        sim.set("Position", DriverValue::Int(5000));
        sim.set("IsMoving", DriverValue::Bool(false));
        tokio::time::sleep(Duration::from_millis(300)).await;
        focuser.active().unwrap().core().scheduler().flush().await;

        let result = sub.try_recv().expect("result");
        assert_eq!(result.signal, DeviceSignal::Result { success: true });
        assert_eq!(sim.call_args("Move"), vec![vec![("Position".to_string(), DriverValue::Int(5000))]]);
        assert_eq!(focuser.position(), Some(5000.0));
        focuser.stop_communication().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_move_times_out() {
        let sim = SimulatedDriver::new();
        let focuser = started_driver(&sim).await;
        let mut sub = focuser.signals().subscribe_to(&[SignalKind::Result]);

        sim.set("IsMoving", DriverValue::Bool(true));
        assert!(focuser.move_to(5000, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        focuser.active().unwrap().core().scheduler().flush().await;

        let result = sub.try_recv().expect("result");
        assert_eq!(result.signal, DeviceSignal::Result { success: false });
        focuser.stop_communication().await;
    }

    #[tokio::test]
    async fn test_commands_refused_when_disconnected() {
        let sim = SimulatedDriver::new();
        let focuser = focuser("alpaca", SimulatedIndi::new("Focuser Simulator"), sim.clone());
        assert!(!focuser.move_to(10, Duration::from_secs(1)).await);
        assert!(!focuser.halt().await);
        assert!(sim.calls().is_empty());

        focuser.set_framework("ascom");
        assert!(!focuser.move_to(10, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_indi_move_and_busy_state() {
        let indi = SimulatedIndi::new("Focuser Simulator");
        indi.define_number(ABS_POSITION, &[(POSITION, 100.0)]);
        indi.define_switch("FOCUS_ABORT_MOTION", &[("ABORT", false)]);
        let focuser = focuser("indi", indi.clone(), SimulatedDriver::new());
        assert!(focuser.start_communication().await);
        indi.settle().await;
        assert!(focuser.is_connected());
        assert_eq!(focuser.position(), Some(100.0));

        indi.update_number(ABS_POSITION, IndiPropertyState::Busy, &[(POSITION, 150.0)]);
        indi.settle().await;
        assert!(focuser.is_moving());
        indi.update_number(ABS_POSITION, IndiPropertyState::Ok, &[(POSITION, 200.0)]);
        indi.settle().await;
        assert!(!focuser.is_moving());

        let mut sub = focuser.signals().subscribe_to(&[SignalKind::Result]);
        assert!(focuser.move_to(5000, Duration::from_secs(5)).await);
        let result = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("result in time")
            .expect("result");
        assert_eq!(result.signal, DeviceSignal::Result { success: true });
        assert!(indi.sent().iter().any(|c| c == "ABS_FOCUS_POSITION.FOCUS_ABSOLUTE_POSITION=5000"));

        assert!(focuser.halt().await);
        assert!(indi.sent().iter().any(|c| c == "FOCUS_ABORT_MOTION.ABORT=true"));
        focuser.stop_communication().await;
    }
}
