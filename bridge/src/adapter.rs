//! Protocol adapter contract
//!
//! Every adapter, whatever its wire protocol, owns an [`AdapterCore`]: the
//! device's dictionary and signal bus, the injected scheduler, its settings
//! and connection flags, and the set of tasks belonging to the current
//! session. A session starts with `start_communication` and ends with
//! `stop_communication`; its epoch tags every dictionary write so that work
//! finishing after the session ended is discarded.

use crate::dictionary::{DataDictionary, Value};
use crate::error::{BridgeError, BridgeResult};
use crate::event::{DeviceSignal, SignalBus};
use crate::scheduler::{PollGuard, PollingScheduler, TaskHandle};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

/// Status wait cadence of camera commands
pub const CAMERA_WAIT_CADENCE: Duration = Duration::from_millis(100);

/// Status wait cadence of dome, focuser and cover commands
pub const MOTION_WAIT_CADENCE: Duration = Duration::from_millis(250);

/// Wire protocol families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Framework {
    Indi,
    Alpaca,
    Ascom,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Indi => "indi",
            Framework::Alpaca => "alpaca",
            Framework::Ascom => "ascom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "indi" => Some(Framework::Indi),
            "alpaca" => Some(Framework::Alpaca),
            "ascom" => Some(Framework::Ascom),
            _ => None,
        }
    }

    /// Prefix used in user messages
    pub fn label(&self) -> &'static str {
        match self {
            Framework::Indi => "INDI",
            Framework::Alpaca => "ALPACA",
            Framework::Ascom => "ASCOM",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical device categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Camera,
    Cover,
    Dome,
    FilterWheel,
    Focuser,
    Telescope,
    Weather,
    Power,
}

impl DeviceType {
    pub const ALL: [DeviceType; 8] = [
        DeviceType::Camera,
        DeviceType::Cover,
        DeviceType::Dome,
        DeviceType::FilterWheel,
        DeviceType::Focuser,
        DeviceType::Telescope,
        DeviceType::Weather,
        DeviceType::Power,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Camera => "camera",
            DeviceType::Cover => "cover",
            DeviceType::Dome => "dome",
            DeviceType::FilterWheel => "filterwheel",
            DeviceType::Focuser => "focuser",
            DeviceType::Telescope => "telescope",
            DeviceType::Weather => "weather",
            DeviceType::Power => "power",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings every adapter carries regardless of protocol
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSettings {
    /// Physical unit at the protocol layer; empty means not yet bound
    pub device_name: String,
    /// Poll interval in milliseconds
    pub update_rate: u64,
    /// Push client-side configuration to the device on connect
    pub load_config: bool,
}

struct Session {
    epoch: u64,
    tasks: Vec<TaskHandle>,
    aborts: Vec<AbortHandle>,
}

/// State shared by all adapters of one protocol for one device
pub struct AdapterCore {
    device_type: DeviceType,
    framework: Framework,
    data: DataDictionary,
    signals: Arc<SignalBus>,
    scheduler: PollingScheduler,
    settings: RwLock<AdapterSettings>,
    device_connected: AtomicBool,
    server_connected: AtomicBool,
    poll_guard: PollGuard,
    session: Mutex<Option<Session>>,
}

impl AdapterCore {
    pub fn new(
        device_type: DeviceType,
        framework: Framework,
        data: DataDictionary,
        signals: Arc<SignalBus>,
        scheduler: PollingScheduler,
        settings: AdapterSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_type,
            framework,
            data,
            signals,
            scheduler,
            settings: RwLock::new(settings),
            device_connected: AtomicBool::new(false),
            server_connected: AtomicBool::new(false),
            poll_guard: PollGuard::new(),
            session: Mutex::new(None),
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn framework(&self) -> Framework {
        self.framework
    }

    pub fn data(&self) -> &DataDictionary {
        &self.data
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn poll_guard(&self) -> &PollGuard {
        &self.poll_guard
    }

    pub fn settings(&self) -> AdapterSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_settings(&self, settings: AdapterSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    pub fn device_name(&self) -> String {
        self.settings().device_name
    }

    pub fn update_rate(&self) -> u64 {
        self.settings().update_rate
    }

    pub fn load_config(&self) -> bool {
        self.settings().load_config
    }

    pub fn is_device_connected(&self) -> bool {
        self.device_connected.load(Ordering::SeqCst)
    }

    pub fn is_server_connected(&self) -> bool {
        self.server_connected.load(Ordering::SeqCst)
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new session: abort any previous one, clear the dictionary
    /// under a fresh epoch and reset the connection flags.
    pub fn begin_session(&self) -> u64 {
        let mut session = self.session();
        if let Some(previous) = session.take() {
            abort_all(&previous);
        }
        let epoch = self.data.invalidate();
        self.device_connected.store(false, Ordering::SeqCst);
        self.server_connected.store(false, Ordering::SeqCst);
        *session = Some(Session {
            epoch,
            tasks: Vec::new(),
            aborts: Vec::new(),
        });
        tracing::debug!(
            "[{} {}] session {} started",
            self.framework,
            self.device_type,
            epoch
        );
        epoch
    }

    /// End the current session. Returns its epoch, or `None` when nothing
    /// was running.
    pub fn end_session(&self) -> Option<u64> {
        let ended = self.session().take()?;
        abort_all(&ended);
        self.data.invalidate();
        self.device_connected.store(false, Ordering::SeqCst);
        self.server_connected.store(false, Ordering::SeqCst);
        tracing::debug!(
            "[{} {}] session {} ended",
            self.framework,
            self.device_type,
            ended.epoch
        );
        Some(ended.epoch)
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.session().as_ref().map(|s| s.epoch)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == Some(epoch)
    }

    /// Attach a scheduler task to the session so stop can cancel it
    pub fn track(&self, epoch: u64, handle: TaskHandle) {
        let mut session = self.session();
        match session.as_mut() {
            Some(s) if s.epoch == epoch => {
                s.tasks.retain(|t| !t.is_finished());
                s.tasks.push(handle);
            }
            _ => handle.cancel(),
        }
    }

    /// Attach a raw runtime task (timer, listener) to the session
    pub fn track_abort(&self, epoch: u64, handle: AbortHandle) {
        let mut session = self.session();
        match session.as_mut() {
            Some(s) if s.epoch == epoch => {
                s.aborts.retain(|h| !h.is_finished());
                s.aborts.push(handle);
            }
            _ => handle.abort(),
        }
    }

    /// Start a session-long listener; it is aborted when the session ends
    pub fn spawn_listener<F>(&self, epoch: u64, name: &str, listener: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = format!("{} {} {}", self.framework, self.device_type, name);
        let handle = self.scheduler.spawn_listener(&label, listener);
        self.track_abort(epoch, handle);
    }

    pub fn emit(&self, signal: DeviceSignal) {
        self.signals.emit(signal);
    }

    /// Emit a user message and log it
    pub fn message(&self, text: impl Into<String>, level: u8) {
        let text = text.into();
        match level {
            0 => tracing::info!("[{}] {}", self.device_type, text),
            1 => tracing::warn!("[{}] {}", self.device_type, text),
            _ => tracing::error!("[{}] {}", self.device_type, text),
        }
        self.signals.emit(DeviceSignal::Message { text, level });
    }

    /// Write one key under `epoch`
    pub fn store(&self, epoch: u64, key: &str, value: Option<Value>) -> bool {
        self.data.store(epoch, key, value)
    }

    /// Record a device connection transition. Emits only on change and only
    /// for the current session.
    pub fn set_device_connected(&self, epoch: u64, connected: bool) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        if self.device_connected.swap(connected, Ordering::SeqCst) == connected {
            return false;
        }
        let name = self.device_name();
        if connected {
            self.message(format!("{} device found: [{}]", self.framework.label(), name), 0);
            self.emit(DeviceSignal::DeviceConnected { name });
        } else {
            self.message(format!("{} device remove: [{}]", self.framework.label(), name), 0);
            self.emit(DeviceSignal::DeviceDisconnected { name });
        }
        true
    }

    /// Record a server reachability transition
    pub fn set_server_connected(&self, epoch: u64, connected: bool) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        if self.server_connected.swap(connected, Ordering::SeqCst) == connected {
            return false;
        }
        if connected {
            tracing::info!("[{} {}] server connected", self.framework, self.device_type);
            self.emit(DeviceSignal::ServerConnected);
        } else {
            tracing::warn!("[{} {}] server disconnected", self.framework, self.device_type);
            self.emit(DeviceSignal::server_disconnected(&self.device_name()));
        }
        true
    }

    /// Submit a one-shot task belonging to the session.
    ///
    /// `on_done` sees `Cancelled` if the session ended before it runs.
    pub fn spawn_task<T, F, C>(&self, epoch: u64, name: &str, task: F, on_done: C) -> bool
    where
        T: Send + 'static,
        F: Future<Output = BridgeResult<T>> + Send + 'static,
        C: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        if !self.is_current(epoch) {
            return false;
        }
        let label = format!("{} {} {}", self.framework, self.device_type, name);
        let session_label = label.clone();
        let data = self.data.clone();
        let handle = self.scheduler.submit(&label, task, move |result| {
            // the dictionary epoch only moves when a session begins or ends
            let result = if data.epoch() == epoch {
                result
            } else {
                Err(BridgeError::Cancelled(session_label))
            };
            on_done(result)
        });
        self.track(epoch, handle);
        true
    }

    /// Run a long device command bounded by `timeout`.
    ///
    /// On timeout `on_done` receives `BridgeError::Timeout`.
    pub fn run_command<T, F, C>(
        &self,
        epoch: u64,
        name: &str,
        timeout: Duration,
        body: F,
        on_done: C,
    ) -> bool
    where
        T: Send + 'static,
        F: Future<Output = BridgeResult<T>> + Send + 'static,
        C: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        let operation = name.to_string();
        let bounded = async move {
            match tokio::time::timeout(timeout, body).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::timeout(operation, timeout)),
            }
        };
        self.spawn_task(epoch, name, bounded, on_done)
    }

    /// Submit one poll unless the previous one is still in flight
    pub fn poll_now<F, Fut>(&self, epoch: u64, poll: &F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        let Some(permit) = self.poll_guard.try_acquire() else {
            tracing::debug!(
                "[{} {}] previous poll still running, skipping",
                self.framework,
                self.device_type
            );
            self.scheduler.record_skipped();
            return false;
        };
        let device = self.device_type;
        self.spawn_task(epoch, "poll", poll(), move |result| {
            let _permit = permit;
            match result {
                Ok(()) | Err(BridgeError::Cancelled(_)) => {}
                Err(e) => tracing::debug!("[{}] poll failed: {}", device, e),
            }
        })
    }

    /// Re-submit `poll` every `update_rate` milliseconds while the session lasts
    pub fn start_polling<F, Fut>(self: &Arc<Self>, epoch: u64, poll: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<()>> + Send + 'static,
    {
        if !self.is_current(epoch) {
            return false;
        }
        let period = Duration::from_millis(self.update_rate().max(10));
        let core = Arc::clone(self);
        let timer = self.scheduler.handle().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !core.is_current(epoch) {
                    break;
                }
                core.poll_now(epoch, &poll);
            }
        });
        tracing::debug!(
            "[{} {}] polling every {:?}",
            self.framework,
            self.device_type,
            period
        );
        self.track_abort(epoch, timer.abort_handle());
        true
    }
}

fn abort_all(session: &Session) {
    for task in &session.tasks {
        task.cancel();
    }
    for handle in &session.aborts {
        handle.abort();
    }
}

/// Poll `check` every `cadence` until it reports true.
///
/// Callers bound the wait with [`AdapterCore::run_command`]'s timeout.
pub async fn wait_until<F, Fut>(cadence: Duration, mut check: F) -> BridgeResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BridgeResult<bool>>,
{
    loop {
        if check().await? {
            return Ok(());
        }
        tokio::time::sleep(cadence).await;
    }
}

/// The contract every protocol adapter satisfies
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn core(&self) -> &Arc<AdapterCore>;

    fn framework(&self) -> Framework {
        self.core().framework()
    }

    /// This adapter's default sub-configuration
    fn default_config(&self) -> JsonValue;

    /// Apply a sub-configuration merged over the defaults
    fn apply_config(&self, config: &JsonValue) -> bool;

    fn current_config(&self) -> JsonValue;

    /// Connect and start the initial fetch followed by polling
    async fn start_communication(&self) -> bool;

    /// Cancel the session, tear down the connection and clear the dictionary.
    /// A no-op success when nothing was started.
    async fn stop_communication(&self) -> bool;

    /// Read static properties into the dictionary; safe to repeat
    async fn worker_get_initial_config(&self) -> bool;

    /// One poll cycle
    async fn worker_poll_data(&self) -> bool;

    /// Device names for configuration UIs
    async fn discover_devices(&self) -> Vec<String>;
}
