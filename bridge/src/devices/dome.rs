//! Dome
//!
//! Azimuth changes are emitted as `Azimuth(az)`. A slew ends with
//! `Slewed{success}` after the settling time, whether it was commanded
//! through [`Dome::slew_to_alt_az`] or started by another client.

use super::refused;
use crate::adapter::{wait_until, AdapterCore, DeviceType, ProtocolAdapter, MOTION_WAIT_CADENCE};
use crate::dictionary::Value;
use crate::driver_link::{Convert, DriverContext, DriverHooks, DriverLink, DriverTransport, DriverValue, PropertyMap};
use crate::error::{BridgeError, BridgeResult};
use crate::event::DeviceSignal;
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiContext, IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use observatory_indi::{DriverInterface, IndiPropertyState, IndiVector};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ABS_POSITION: &str = "ABS_DOME_POSITION";
const POSITION: &str = "DOME_ABSOLUTE_POSITION";
const AZIMUTH_KEY: &str = "ABS_DOME_POSITION.DOME_ABSOLUTE_POSITION";
const SHUTTER: &str = "DOME_SHUTTER";
const SLEWING_KEY: &str = "Status.Slewing";
const SHUTTER_KEY: &str = "Status.Shutter";
const CAN_SET_SHUTTER: &str = "CAN_SET_SHUTTER";
const CAN_SET_AZIMUTH: &str = "CAN_SET_AZIMUTH";

/// State shared by both protocol hooks and the facade
#[derive(Debug, Default)]
pub struct DomeShared {
    settling_ms: AtomicU64,
    azimuth: Mutex<Option<f64>>,
    slewing: AtomicBool,
    /// A commanded slew reports its own completion
    command_active: AtomicBool,
}

impl DomeShared {
    pub fn settling_time(&self) -> Duration {
        Duration::from_millis(self.settling_ms.load(Ordering::Relaxed))
    }

    fn set_settling_time(&self, settling: Duration) {
        let ms = u64::try_from(settling.as_millis()).unwrap_or(u64::MAX);
        self.settling_ms.store(ms, Ordering::Relaxed);
    }

    fn update_azimuth(&self, core: &AdapterCore, epoch: u64, azimuth: Option<f64>) {
        if !core.is_current(epoch) {
            return;
        }
        let mut last = self.azimuth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == azimuth {
            return;
        }
        *last = azimuth;
        if let Some(az) = azimuth {
            core.emit(DeviceSignal::Azimuth(az));
        }
    }

    /// Record the slewing flag; a finished slew nobody commanded settles and reports
    fn update_slewing(&self, core: &Arc<AdapterCore>, epoch: u64, slewing: bool) {
        core.store(epoch, SLEWING_KEY, Some(Value::Bool(slewing)));
        let was_slewing = self.slewing.swap(slewing, Ordering::SeqCst);
        if !was_slewing || slewing || self.command_active.load(Ordering::SeqCst) {
            return;
        }
        let settling = self.settling_time();
        let done = Arc::clone(core);
        core.spawn_task(
            epoch,
            "settle",
            async move {
                tokio::time::sleep(settling).await;
                Ok(())
            },
            move |result: BridgeResult<()>| {
                if result.is_ok() {
                    done.emit(DeviceSignal::Slewed { success: true });
                    done.emit(DeviceSignal::message(""));
                }
            },
        );
    }

    fn reset(&self) {
        *self.azimuth.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.slewing.store(false, Ordering::SeqCst);
        self.command_active.store(false, Ordering::SeqCst);
    }

    /// Run a commanded slew: `body` starts it and waits for the dome to stop
    fn run_slew<F>(self: &Arc<Self>, core: &Arc<AdapterCore>, epoch: u64, timeout: Duration, body: F) -> bool
    where
        F: std::future::Future<Output = BridgeResult<bool>> + Send + 'static,
    {
        self.command_active.store(true, Ordering::SeqCst);
        let shared = Arc::clone(self);
        let settling = self.settling_time();
        let done = Arc::clone(core);
        let finished = Arc::clone(self);
        let accepted = core.run_command(
            epoch,
            "slew",
            timeout,
            async move {
                if !body.await? {
                    return Ok(false);
                }
                tokio::time::sleep(settling).await;
                Ok(true)
            },
            move |result| {
                finished.command_active.store(false, Ordering::SeqCst);
                match result {
                    Ok(success) => {
                        done.emit(DeviceSignal::Slewed { success });
                        if success {
                            done.emit(DeviceSignal::message(""));
                        }
                    }
                    Err(BridgeError::Cancelled(_)) => {}
                    Err(e) => {
                        tracing::warn!("[dome] slew failed: {}", e);
                        done.emit(DeviceSignal::Slewed { success: false });
                    }
                }
            },
        );
        if !accepted {
            shared.command_active.store(false, Ordering::SeqCst);
        }
        accepted
    }
}

#[async_trait]
pub trait DomeAdapter: ProtocolAdapter {
    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64, timeout: Duration) -> bool;

    async fn open_shutter(&self) -> bool;

    async fn close_shutter(&self) -> bool;

    async fn abort_slew(&self) -> bool;
}

pub struct DomeIndi {
    shared: Arc<DomeShared>,
}

#[async_trait]
impl IndiHooks for DomeIndi {
    const INTERFACE: u32 = DriverInterface::DOME;

    async fn on_vector(&self, ctx: &IndiContext<'_>, vector: &IndiVector) {
        let busy = vector.state == IndiPropertyState::Busy;
        match vector.name.as_str() {
            ABS_POSITION => {
                ctx.store(CAN_SET_AZIMUTH, Some(Value::Bool(true)));
                self.shared.update_azimuth(ctx.core, ctx.epoch, vector.number(POSITION));
                self.shared.update_slewing(ctx.core, ctx.epoch, busy);
            }
            SHUTTER => {
                ctx.store(CAN_SET_SHUTTER, Some(Value::Bool(true)));
                let status = if busy {
                    "Moving"
                } else if vector.switch("SHUTTER_OPEN") == Some(true) {
                    "Open"
                } else if vector.switch("SHUTTER_CLOSE") == Some(true) {
                    "Closed"
                } else {
                    "Unknown"
                };
                ctx.store(SHUTTER_KEY, Some(Value::Status(status.to_string())));
            }
            _ => {}
        }
    }
}

impl IndiLink<DomeIndi> {
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
impl DomeAdapter for IndiLink<DomeIndi> {
    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64, timeout: Duration) -> bool {
        let Some(epoch) = self.connected_context().map(|ctx| ctx.epoch) else {
            return refused(self.core(), "slew");
        };
        tracing::debug!("[INDI dome] slew to alt {:.1} az {:.1}", altitude, azimuth);
        let link = self.clone();
        let core = Arc::clone(self.core());
        let shared = Arc::clone(&self.hooks().shared);
        shared.run_slew(&core, epoch, timeout, async move {
            let ctx = link.context(epoch);
            if !ctx.numbers(ABS_POSITION, &[(POSITION, azimuth)]).await {
                return Ok(false);
            }
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
        })
    }

    async fn open_shutter(&self) -> bool {
        self.switch_on("open shutter", SHUTTER, "SHUTTER_OPEN").await
    }

    async fn close_shutter(&self) -> bool {
        self.switch_on("close shutter", SHUTTER, "SHUTTER_CLOSE").await
    }

    async fn abort_slew(&self) -> bool {
        self.switch_on("abort", "DOME_ABORT_MOTION", "ABORT").await
    }
}

pub struct DomeDriver {
    shared: Arc<DomeShared>,
}

#[async_trait]
impl DriverHooks for DomeDriver {
    const INITIAL: &'static [PropertyMap] = &[
        PropertyMap::new("CanSetShutter", CAN_SET_SHUTTER),
        PropertyMap::new("CanSetAzimuth", CAN_SET_AZIMUTH),
    ];
    const POLL: &'static [PropertyMap] = &[
        PropertyMap::new("Azimuth", AZIMUTH_KEY),
        PropertyMap::new("ShutterStatus", SHUTTER_KEY)
            .requires(CAN_SET_SHUTTER)
            .convert(Convert::ShutterState),
    ];

    async fn after_poll(&self, ctx: &DriverContext<'_>) -> BridgeResult<()> {
        let data = ctx.core.data();
        self.shared.update_azimuth(ctx.core, ctx.epoch, data.number(AZIMUTH_KEY));
        if let Some(slewing) = ctx.read("Slewing").await.and_then(|v| v.as_bool()) {
            self.shared.update_slewing(ctx.core, ctx.epoch, slewing);
        }
        let open = match data.text(SHUTTER_KEY).as_deref() {
            Some("Open") => Some(true),
            Some("Closed") => Some(false),
            _ => None,
        };
        data.store_pair(ctx.epoch, "DOME_SHUTTER.SHUTTER_OPEN", "DOME_SHUTTER.SHUTTER_CLOSE", open);
        Ok(())
    }
}

impl DriverLink<DomeDriver> {
    async fn gated(&self, operation: &str, capability: &str, method: &str) -> bool {
        let Some(ctx) = self.command_context() else {
            return refused(self.core(), operation);
        };
        if !ctx.capable(capability) {
            tracing::debug!("[{}] {} not supported by the driver", ctx.core.device_type(), operation);
            return false;
        }
        ctx.invoke(method, &[]).await.is_some()
    }
}

#[async_trait]
impl DomeAdapter for DriverLink<DomeDriver> {
    async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64, timeout: Duration) -> bool {
        let Some(epoch) = self.connected_epoch() else {
            return refused(self.core(), "slew");
        };
        if !self.context(epoch).capable(CAN_SET_AZIMUTH) {
            return false;
        }
        tracing::debug!("[dome] slew to alt {:.1} az {:.1}", altitude, azimuth);
        let link = self.clone();
        let core = Arc::clone(self.core());
        let shared = Arc::clone(&self.hooks().shared);
        shared.run_slew(&core, epoch, timeout, async move {
            let ctx = link.context(epoch);
            let args = [("Azimuth", DriverValue::Float(azimuth))];
            if ctx.invoke("SlewToAzimuth", &args).await.is_none() {
                return Ok(false);
            }
            let ctx = &ctx;
            wait_until(MOTION_WAIT_CADENCE, move || async move {
                let slewing = ctx.read_into("Slewing", SLEWING_KEY).await;
                Ok(slewing.and_then(|s| s.as_bool()) != Some(true))
            })
            .await?;
            Ok(true)
        })
    }

    async fn open_shutter(&self) -> bool {
        self.gated("open shutter", CAN_SET_SHUTTER, "OpenShutter").await
    }

    async fn close_shutter(&self) -> bool {
        self.gated("close shutter", CAN_SET_SHUTTER, "CloseShutter").await
    }

    async fn abort_slew(&self) -> bool {
        match self.command_context() {
            Some(ctx) => ctx.invoke("AbortSlew", &[]).await.is_some(),
            None => refused(self.core(), "abort"),
        }
    }
}

pub struct Dome {
    facade: DeviceFacade<dyn DomeAdapter>,
    shared: Arc<DomeShared>,
}

device_facade!(Dome, DomeAdapter);

impl Dome {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Dome),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Dome, scheduler);
        let shared = Arc::new(DomeShared::default());
        let hooks = DomeIndi {
            shared: Arc::clone(&shared),
        };
        let mut adapters: Vec<Arc<dyn DomeAdapter>> = vec![Arc::new(parts.indi(indi, hooks))];
        for transport in drivers {
            let hooks = DomeDriver {
                shared: Arc::clone(&shared),
            };
            adapters.push(Arc::new(parts.driver(transport, hooks)));
        }
        Self {
            facade: parts.into_facade(adapters),
            shared,
        }
    }

    pub async fn start_communication(&self) -> bool {
        self.shared.reset();
        self.facade.start_communication().await
    }

    pub async fn slew_to_alt_az(&self, altitude: f64, azimuth: f64, timeout: Duration) -> bool {
        match self.active() {
            Some(adapter) => adapter.slew_to_alt_az(altitude, azimuth, timeout).await,
            None => false,
        }
    }

    pub async fn open_shutter(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.open_shutter().await,
            None => false,
        }
    }

    pub async fn close_shutter(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.close_shutter().await,
            None => false,
        }
    }

    pub async fn abort_slew(&self) -> bool {
        match self.active() {
            Some(adapter) => adapter.abort_slew().await,
            None => false,
        }
    }

    /// Wait applied after the dome stops before a slew is reported done
    pub fn set_settling_time(&self, settling: Duration) {
        self.shared.set_settling_time(settling);
    }

    pub fn settling_time(&self) -> Duration {
        self.shared.settling_time()
    }

    pub fn azimuth(&self) -> Option<f64> {
        self.data().number(AZIMUTH_KEY)
    }
}
