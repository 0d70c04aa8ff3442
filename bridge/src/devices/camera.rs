//! Camera
//!
//! An exposure is a long command. `expose` returns once the request has been
//! handed to the device; integration, download and saving are reported with
//! `Exposed`, `Downloaded` and `Saved` and the caller's callback receives the
//! image path, or `None` when the exposure failed, was aborted or timed out.
//!
//! Driver images are written as a raw little-endian `u16` dump in row-major
//! order. INDI images are written exactly as the server sends the BLOB.

use super::refused;
use crate::adapter::{AdapterCore, DeviceType, ProtocolAdapter, CAMERA_WAIT_CADENCE};
use crate::dictionary::Value;
use crate::driver_link::{Convert, DriverHooks, DriverLink, DriverTransport, DriverValue, PropertyMap};
use crate::error::{BridgeError, BridgeResult};
use crate::event::DeviceSignal;
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiContext, IndiHooks, IndiLink, IndiTransport};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use observatory_indi::{BlobMode, DriverInterface, IndiBlob, IndiPropertyState, IndiVector};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const CAN_FAST: &str = "CAN_FAST";
const CAN_ABORT: &str = "CAN_ABORT";
const CAN_SET_TEMPERATURE: &str = "CAN_SET_CCD_TEMPERATURE";
const MAX_X: &str = "CCD_INFO.CCD_MAX_X";
const MAX_Y: &str = "CCD_INFO.CCD_MAX_Y";
/// Blob vector carrying the primary chip image
const PRIMARY_CHIP: &str = "CCD1";

/// Called once with the saved image, or `None`
pub type ExposureCallback = Box<dyn FnOnce(Option<PathBuf>) + Send>;

/// Readout window in unbinned pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubFrame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// What a caller asks for
#[derive(Debug, Clone)]
pub struct ExposureRequest {
    pub image_path: PathBuf,
    /// Seconds
    pub exposure_time: f64,
    pub binning: u32,
    /// Centred sub frame in percent of the full chip
    pub sub_frame: u32,
    pub fast_readout: bool,
    /// Millimetres
    pub focal_length: f64,
    pub timeout: Duration,
}

impl Default for ExposureRequest {
    fn default() -> Self {
        Self {
            image_path: PathBuf::new(),
            exposure_time: 3.0,
            binning: 1,
            sub_frame: 100,
            fast_readout: true,
            focal_length: 1.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// A request resolved against the camera's capabilities
#[derive(Debug, Clone)]
pub struct ExposureParams {
    pub image_path: PathBuf,
    pub exposure_time: f64,
    pub binning: u32,
    pub frame: SubFrame,
    pub fast_readout: bool,
    pub focal_length: f64,
    pub timeout: Duration,
}

#[async_trait]
pub trait CameraAdapter: ProtocolAdapter {
    async fn expose(&self, params: ExposureParams, on_complete: ExposureCallback) -> bool;

    async fn abort(&self) -> bool;

    async fn send_cooler_switch(&self, on: bool) -> bool;

    async fn send_cooler_temp(&self, temperature: f64) -> bool;

    async fn send_offset(&self, offset: i32) -> bool;

    async fn send_gain(&self, gain: i32) -> bool;

    async fn send_download_mode(&self, fast: bool) -> bool;
}

/// Centred window covering `percent` of a `max_x` by `max_y` chip
pub fn sub_frame(max_x: u32, max_y: u32, percent: u32) -> SubFrame {
    if !(10..=100).contains(&percent) {
        return SubFrame {
            x: 0,
            y: 0,
            width: max_x,
            height: max_y,
        };
    }
    let width = (u64::from(max_x) * u64::from(percent) / 100) as u32;
    let height = (u64::from(max_y) * u64::from(percent) / 100) as u32;
    SubFrame {
        x: (max_x - width) / 2,
        y: (max_y - height) / 2,
        width,
        height,
    }
}

/// Signals and callback of a finished exposure
fn finish_exposure(core: &AdapterCore, result: BridgeResult<Option<PathBuf>>, on_complete: ExposureCallback) {
    let path = match result {
        Ok(path) => path,
        Err(BridgeError::Cancelled(_)) => {
            tracing::debug!("[{}] exposure cancelled", core.device_type());
            on_complete(None);
            return;
        }
        Err(e) => {
            tracing::warn!("[{}] exposure failed: {}", core.device_type(), e);
            None
        }
    };
    let success = path.is_some();
    if !success {
        core.emit(DeviceSignal::Exposed { success: false });
    }
    core.emit(DeviceSignal::Downloaded { success });
    core.emit(DeviceSignal::Saved { path: path.clone() });
    core.emit(DeviceSignal::message(""));
    match &path {
        Some(p) => tracing::info!("Saved image: [{}]", p.display()),
        None => tracing::info!("[{}] no image saved", core.device_type()),
    }
    on_complete(path);
}

struct PendingImage {
    path: PathBuf,
    done: oneshot::Sender<Option<PathBuf>>,
}

#[derive(Default)]
pub struct CameraIndi {
    pending: Mutex<Option<PendingImage>>,
    downloading: AtomicBool,
}

impl CameraIndi {
    fn take_pending(&self) -> Option<PendingImage> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn set_pending(&self, pending: PendingImage) {
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(pending);
        if previous.is_some() {
            tracing::debug!("[INDI camera] previous exposure superseded");
        }
    }

    fn exposure_state(&self, ctx: &IndiContext<'_>, vector: &IndiVector) {
        match vector.state {
            IndiPropertyState::Busy => {
                let left = vector.number("CCD_EXPOSURE_VALUE").unwrap_or(0.0);
                if left == 0.0 {
                    if !self.downloading.swap(true, Ordering::SeqCst) {
                        ctx.core.emit(DeviceSignal::Exposed { success: true });
                    }
                    ctx.core.emit(DeviceSignal::message("download"));
                } else {
                    ctx.core.emit(DeviceSignal::message(format!("expose {:2.0} s", left)));
                }
            }
            IndiPropertyState::Idle | IndiPropertyState::Ok => {
                ctx.core.emit(DeviceSignal::message(""));
                self.downloading.store(false, Ordering::SeqCst);
            }
            IndiPropertyState::Alert => {
                self.downloading.store(false, Ordering::SeqCst);
                if let Some(pending) = self.take_pending() {
                    tracing::warn!("[INDI {}] exposure reported alert", ctx.device);
                    let _ = pending.done.send(None);
                }
            }
        }
    }
}

/// Whether a vector of the device carries `element`
async fn has_element(ctx: &IndiContext<'_>, vector: &str, element: &str) -> bool {
    ctx.vector(vector)
        .await
        .map_or(false, |v| v.element(element).is_some())
}

#[async_trait]
impl IndiHooks for CameraIndi {
    const INTERFACE: u32 = DriverInterface::CCD;

    async fn on_device_connected(&self, ctx: &IndiContext<'_>) -> BridgeResult<()> {
        ctx.transport.enable_blob(&ctx.device, BlobMode::Also).await?;
        if has_element(ctx, "FITS_HEADER", "FITS_OBJECT").await {
            ctx.texts("FITS_HEADER", &[("FITS_OBJECT", "skymodel")]).await;
        }
        if has_element(ctx, "WCS_CONTROL", "WCS_DISABLE").await {
            ctx.switches("WCS_CONTROL", &[("WCS_ENABLE", false), ("WCS_DISABLE", true)]).await;
        }
        ctx.assert_polling_period(Self::POLLING).await;
        Ok(())
    }

    async fn on_vector(&self, ctx: &IndiContext<'_>, vector: &IndiVector) {
        match vector.name.as_str() {
            "CCD_EXPOSURE" => self.exposure_state(ctx, vector),
            "CCD_TEMPERATURE" => {
                ctx.store(CAN_SET_TEMPERATURE, Some(Value::Bool(true)));
            }
            "READOUT_QUALITY" => {
                ctx.store(CAN_FAST, Some(Value::Bool(true)));
            }
            "CCD_ABORT_EXPOSURE" => {
                ctx.store(CAN_ABORT, Some(Value::Bool(true)));
            }
            _ => {}
        }
    }

    async fn on_blob(&self, ctx: &IndiContext<'_>, blob: IndiBlob) {
        if blob.property != PRIMARY_CHIP {
            return;
        }
        let Some(pending) = self.take_pending() else {
            tracing::debug!("[INDI {}] unsolicited image ignored", ctx.device);
            return;
        };
        let saved = match tokio::fs::write(&pending.path, &blob.data).await {
            Ok(()) => Some(pending.path),
            Err(e) => {
                tracing::warn!("[INDI {}] writing {} failed: {}", ctx.device, pending.path.display(), e);
                None
            }
        };
        let _ = pending.done.send(saved);
    }
}

impl IndiLink<CameraIndi> {
    /// Write numbers only when the device exposes the element
    async fn number_if_present(&self, op: &str, vector: &str, element: &str, value: f64) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), op);
        };
        if !has_element(&ctx, vector, element).await {
            return false;
        }
        ctx.numbers(vector, &[(element, value)]).await
    }
}

#[async_trait]
impl CameraAdapter for IndiLink<CameraIndi> {
    async fn expose(&self, params: ExposureParams, on_complete: ExposureCallback) -> bool {
        let Some(epoch) = self.connected_context().map(|ctx| ctx.epoch) else {
            return refused(self.core(), "expose");
        };
        let (done, image) = oneshot::channel();
        self.hooks().set_pending(PendingImage {
            path: params.image_path.clone(),
            done,
        });
        self.hooks().downloading.store(false, Ordering::SeqCst);

        let link = self.clone();
        let finisher = self.clone();
        let core = Arc::clone(self.core());
        core.run_command(
            epoch,
            "expose",
            params.timeout,
            async move {
                let ctx = link.context(epoch);
                if ctx.vector("READOUT_QUALITY").await.is_some() {
                    let fast = params.fast_readout;
                    ctx.switches("READOUT_QUALITY", &[("QUALITY_LOW", fast), ("QUALITY_HIGH", !fast)]).await;
                }
                let bin = f64::from(params.binning);
                let frame = params.frame;
                let sent = ctx.numbers("CCD_BINNING", &[("HOR_BIN", bin), ("VER_BIN", bin)]).await
                    && ctx
                        .numbers(
                            "CCD_FRAME",
                            &[
                                ("X", f64::from(frame.x)),
                                ("Y", f64::from(frame.y)),
                                ("WIDTH", f64::from(frame.width)),
                                ("HEIGHT", f64::from(frame.height)),
                            ],
                        )
                        .await
                    && ctx.numbers("CCD_EXPOSURE", &[("CCD_EXPOSURE_VALUE", params.exposure_time)]).await;
                if !sent {
                    return Ok(None);
                }
                // the sender is dropped when the exposure is aborted
                Ok(image.await.unwrap_or(None))
            },
            move |result| {
                finisher.hooks().take_pending();
                finish_exposure(finisher.core(), result, on_complete);
            },
        )
    }

    async fn abort(&self) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), "abort");
        };
        if !has_element(&ctx, "CCD_ABORT_EXPOSURE", "ABORT").await {
            return false;
        }
        let sent = ctx.switches("CCD_ABORT_EXPOSURE", &[("ABORT", true)]).await;
        self.hooks().take_pending();
        sent
    }

    async fn send_cooler_switch(&self, on: bool) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), "cooler switch");
        };
        if !has_element(&ctx, "CCD_COOLER", "COOLER_ON").await {
            return false;
        }
        ctx.switches("CCD_COOLER", &[("COOLER_ON", on), ("COOLER_OFF", !on)]).await
    }

    async fn send_cooler_temp(&self, temperature: f64) -> bool {
        self.number_if_present("cooler temperature", "CCD_TEMPERATURE", "CCD_TEMPERATURE_VALUE", temperature)
            .await
    }

    async fn send_offset(&self, offset: i32) -> bool {
        self.number_if_present("offset", "CCD_OFFSET", "OFFSET", f64::from(offset)).await
    }

    async fn send_gain(&self, gain: i32) -> bool {
        self.number_if_present("gain", "CCD_GAIN", "GAIN", f64::from(gain)).await
    }

    async fn send_download_mode(&self, fast: bool) -> bool {
        let Some(ctx) = self.connected_context() else {
            return refused(self.core(), "download mode");
        };
        if ctx.vector("READOUT_QUALITY").await.is_none() {
            return false;
        }
        ctx.switches("READOUT_QUALITY", &[("QUALITY_LOW", fast), ("QUALITY_HIGH", !fast)]).await
    }
}

/// Pixel data as a little-endian `u16` dump
fn raw_image(value: DriverValue) -> Option<Vec<u8>> {
    match value {
        DriverValue::IntArray { data, width, height } if data.len() == width * height => Some(
            data.iter()
                .flat_map(|p| ((*p).clamp(0, i32::from(u16::MAX)) as u16).to_le_bytes())
                .collect(),
        ),
        _ => None,
    }
}

#[derive(Default)]
pub struct CameraDriver {
    aborted: AtomicBool,
}

impl DriverHooks for CameraDriver {
    const INITIAL: &'static [PropertyMap] = &[
        PropertyMap::new("CameraXSize", MAX_X),
        PropertyMap::new("CameraYSize", MAX_Y),
        PropertyMap::new("CanFastReadout", CAN_FAST),
        PropertyMap::new("CanStopExposure", CAN_ABORT),
        PropertyMap::new("CanSetCCDTemperature", CAN_SET_TEMPERATURE),
        PropertyMap::new("CanGetCoolerPower", "CAN_GET_COOLER_POWER"),
        PropertyMap::new("PixelSizeX", "CCD_INFO.CCD_PIXEL_SIZE_X"),
        PropertyMap::new("PixelSizeY", "CCD_INFO.CCD_PIXEL_SIZE_Y"),
        PropertyMap::new("MaxBinX", "CCD_BINNING.HOR_BIN_MAX"),
        PropertyMap::new("MaxBinY", "CCD_BINNING.VERT_BIN_MAX"),
        PropertyMap::new("GainMax", "CCD_INFO.GAIN_MAX"),
        PropertyMap::new("GainMin", "CCD_INFO.GAIN_MIN"),
        PropertyMap::new("StartX", "CCD_FRAME.X"),
        PropertyMap::new("StartY", "CCD_FRAME.Y"),
    ];
    const POLL: &'static [PropertyMap] = &[
        PropertyMap::new("BinX", "CCD_BINNING.HOR_BIN"),
        PropertyMap::new("BinY", "CCD_BINNING.VERT_BIN"),
        PropertyMap::new("CameraState", "CAMERA.STATE"),
        PropertyMap::new("Gain", "CCD_GAIN.GAIN"),
        PropertyMap::new("Offset", "CCD_OFFSET.OFFSET"),
        PropertyMap::new("FastReadout", "READOUT_QUALITY.QUALITY_LOW")
            .convert(Convert::Inverse("READOUT_QUALITY.QUALITY_HIGH")),
        PropertyMap::new("CCDTemperature", "CCD_TEMPERATURE.CCD_TEMPERATURE_VALUE"),
        PropertyMap::new("CoolerOn", "CCD_COOLER.COOLER_ON"),
        PropertyMap::new("CoolerPower", "CCD_COOLER_POWER.CCD_COOLER_VALUE").requires("CAN_GET_COOLER_POWER"),
    ];
}

impl DriverLink<CameraDriver> {
    async fn integrate(&self, epoch: u64, params: ExposureParams) -> BridgeResult<Option<PathBuf>> {
        let ctx = self.context(epoch);
        let core = self.core();
        if ctx.capable(CAN_FAST) {
            ctx.write("FastReadout", DriverValue::Bool(params.fast_readout)).await;
        }
        let bin = params.binning.max(1);
        let frame = params.frame;
        let settings = [
            ("BinX", bin),
            ("BinY", bin),
            ("StartX", frame.x / bin),
            ("StartY", frame.y / bin),
            ("NumX", frame.width / bin),
            ("NumY", frame.height / bin),
        ];
        for (property, value) in settings {
            if !ctx.write(property, DriverValue::Int(i64::from(value))).await {
                return Ok(None);
            }
        }
        let started = ctx
            .invoke(
                "StartExposure",
                &[
                    ("Duration", DriverValue::Float(params.exposure_time)),
                    ("Light", DriverValue::Bool(true)),
                ],
            )
            .await;
        if started.is_none() {
            return Ok(None);
        }

        let begin = tokio::time::Instant::now();
        let mut shown = None;
        loop {
            if self.hooks().aborted.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if ctx.read("ImageReady").await.and_then(|r| r.as_bool()) == Some(true) {
                break;
            }
            let left = (params.exposure_time - begin.elapsed().as_secs_f64()).max(0.0).round() as u64;
            if shown != Some(left) {
                shown = Some(left);
                core.emit(DeviceSignal::message(format!("expose {:3} s", left)));
            }
            tokio::time::sleep(CAMERA_WAIT_CADENCE).await;
        }

        core.emit(DeviceSignal::Exposed { success: true });
        core.emit(DeviceSignal::message("download"));
        let pixels = match ctx.transport.get_long("ImageArray").await {
            Ok(value) => raw_image(value),
            Err(e) => {
                tracing::warn!("[{}] image download failed: {}", core.device_type(), e);
                None
            }
        };
        let Some(bytes) = pixels else {
            return Ok(None);
        };
        if self.hooks().aborted.load(Ordering::SeqCst) {
            return Ok(None);
        }
        core.emit(DeviceSignal::message("saving"));
        tokio::fs::write(&params.image_path, bytes).await?;
        Ok(Some(params.image_path))
    }
}

#[async_trait]
impl CameraAdapter for DriverLink<CameraDriver> {
    async fn expose(&self, params: ExposureParams, on_complete: ExposureCallback) -> bool {
        let Some(epoch) = self.connected_epoch() else {
            return refused(self.core(), "expose");
        };
        self.hooks().aborted.store(false, Ordering::SeqCst);
        let link = self.clone();
        let core = Arc::clone(self.core());
        core.run_command(
            epoch,
            "expose",
            params.timeout,
            async move { link.integrate(epoch, params).await },
            {
                let core = Arc::clone(&core);
                move |result| finish_exposure(&core, result, on_complete)
            },
        )
    }

    async fn abort(&self) -> bool {
        let Some(ctx) = self.command_context() else {
            return refused(self.core(), "abort");
        };
        if !ctx.capable(CAN_ABORT) {
            return true;
        }
        self.hooks().aborted.store(true, Ordering::SeqCst);
        ctx.invoke("StopExposure", &[]).await.is_some()
    }

    async fn send_cooler_switch(&self, on: bool) -> bool {
        match self.command_context() {
            Some(ctx) => ctx.write("CoolerOn", DriverValue::Bool(on)).await,
            None => refused(self.core(), "cooler switch"),
        }
    }

    async fn send_cooler_temp(&self, temperature: f64) -> bool {
        let Some(ctx) = self.command_context() else {
            return refused(self.core(), "cooler temperature");
        };
        if !ctx.capable(CAN_SET_TEMPERATURE) {
            return false;
        }
        ctx.write("SetCCDTemperature", DriverValue::Float(temperature)).await
    }

    async fn send_offset(&self, offset: i32) -> bool {
        match self.command_context() {
            Some(ctx) => ctx.write("Offset", DriverValue::Int(i64::from(offset))).await,
            None => refused(self.core(), "offset"),
        }
    }

    async fn send_gain(&self, gain: i32) -> bool {
        match self.command_context() {
            Some(ctx) => ctx.write("Gain", DriverValue::Int(i64::from(gain))).await,
            None => refused(self.core(), "gain"),
        }
    }

    async fn send_download_mode(&self, fast: bool) -> bool {
        let Some(ctx) = self.command_context() else {
            return refused(self.core(), "download mode");
        };
        if !ctx.capable(CAN_FAST) {
            return false;
        }
        ctx.write("FastReadout", DriverValue::Bool(fast)).await
    }
}

pub struct Camera {
    facade: DeviceFacade<dyn CameraAdapter>,
}

device_facade!(Camera, CameraAdapter);

impl Camera {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Camera),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Camera, scheduler);
        let mut adapters: Vec<Arc<dyn CameraAdapter>> = vec![Arc::new(parts.indi(indi, CameraIndi::default()))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, CameraDriver::default())));
        }
        Self {
            facade: parts.into_facade(adapters),
        }
    }

    pub fn can_sub_frame(&self, percent: u32) -> bool {
        (10..=100).contains(&percent) && self.data().contains("CCD_FRAME.X") && self.data().contains("CCD_FRAME.Y")
    }

    pub fn can_binning(&self, binning: u32) -> bool {
        (1..=4).contains(&binning) && self.data().contains("CCD_BINNING.HOR_BIN")
    }

    /// Sub frame for `percent`, `None` until the chip size is known
    pub fn calc_sub_frame(&self, percent: u32) -> Option<SubFrame> {
        let max_x = self.data().number(MAX_X)?;
        let max_y = self.data().number(MAX_Y)?;
        Some(sub_frame(max_x.max(0.0) as u32, max_y.max(0.0) as u32, percent))
    }

    pub async fn expose(&self, request: ExposureRequest, on_complete: ExposureCallback) -> bool {
        let Some(adapter) = self.active() else {
            return false;
        };
        if request.image_path.as_os_str().is_empty() {
            return false;
        }
        if !self.can_sub_frame(request.sub_frame) {
            tracing::warn!("Camera does not support sub frame {}%", request.sub_frame);
            return false;
        }
        let binning = if self.can_binning(request.binning) {
            request.binning
        } else {
            tracing::info!("Camera does not support binning {}, using 1", request.binning);
            1
        };
        let Some(frame) = self.calc_sub_frame(request.sub_frame) else {
            return false;
        };
        tracing::debug!(
            "Image bin:{}, frame:{:?}, fast:{}, focal length:{}",
            binning,
            frame,
            request.fast_readout,
            request.focal_length
        );
        let params = ExposureParams {
            image_path: request.image_path,
            exposure_time: request.exposure_time,
            binning,
            frame,
            fast_readout: request.fast_readout,
            focal_length: request.focal_length,
            timeout: request.timeout,
        };
        adapter.expose(params, on_complete).await
    }

    pub async fn abort(&self) -> bool {
        let Some(adapter) = self.active() else {
            return false;
        };
        let success = adapter.abort().await;
        adapter.core().emit(DeviceSignal::message(""));
        success
    }

    pub async fn send_cooler_switch(&self, on: bool) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_cooler_switch(on).await,
            None => false,
        }
    }

    pub async fn send_cooler_temp(&self, temperature: f64) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_cooler_temp(temperature).await,
            None => false,
        }
    }

    pub async fn send_offset(&self, offset: i32) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_offset(offset).await,
            None => false,
        }
    }

    pub async fn send_gain(&self, gain: i32) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_gain(gain).await,
            None => false,
        }
    }

    pub async fn send_download_mode(&self, fast: bool) -> bool {
        match self.active() {
            Some(adapter) => adapter.send_download_mode(fast).await,
            None => false,
        }
    }
}
