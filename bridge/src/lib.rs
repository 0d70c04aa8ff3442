// Observatory device bridge
//
// Protocol-independent access to telescope peripherals. Each device type is
// reached through a facade that forwards to the INDI, Alpaca or ASCOM adapter
// selected in its configuration.

pub mod adapter;
pub mod alpaca_transport;
pub mod ascom_transport;
pub mod config;
pub mod devices;
pub mod dictionary;
pub mod driver_link;
pub mod error;
pub mod event;
pub mod facade;
pub mod indi_link;
pub mod observatory;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use adapter::{DeviceType, Framework, ProtocolAdapter};
pub use config::{ConfigStore, DeviceConfig, JsonConfigStore, MemoryConfigStore, ObservatoryConfig};
pub use devices::*;
pub use dictionary::{DataDictionary, Value};
pub use error::{BridgeError, BridgeResult};
pub use event::{DeviceSignal, SignalBus, SignalKind};
pub use facade::DeviceFacade;
pub use observatory::Observatory;
pub use scheduler::{PollingScheduler, SchedulerConfig};

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "observatory.log";

/// Keeps the file writer alive for the process lifetime
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Logging bootstrap options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
    /// Daily rolling log files are written here when set
    pub directory: Option<PathBuf>,
    /// Days of log files kept
    pub keep_days: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            directory: None,
            keep_days: 7,
        }
    }
}

/// Install the global subscriber. Returns false if one is already installed.
pub fn init_logging(config: LogConfig) -> bool {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    let Some(log_dir) = config.directory else {
        return tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .is_ok();
    };

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        return init_logging(LogConfig {
            directory: None,
            ..config
        });
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return false;
    }
    LOG_GUARD.set(guard).ok();

    tracing::info!("Observatory bridge logging to {}", log_dir.display());
    let removed = cleanup_old_logs(&log_dir, config.keep_days);
    if removed > 0 {
        tracing::debug!("Removed {} old log files", removed);
    }
    true
}

/// Today's log file, if file logging goes to `log_dir`
pub fn current_log_file(log_dir: &Path) -> PathBuf {
    let today = chrono::Local::now().format("%Y-%m-%d");
    log_dir.join(format!("{}.{}", LOG_FILE_PREFIX, today))
}

/// Delete daily log files older than `keep_days`, returning how many went
pub fn cleanup_old_logs(log_dir: &Path, keep_days: i64) -> usize {
    let cutoff = chrono::Local::now().date_naive() - chrono::Duration::days(keep_days);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // observatory.log.2024-01-15
        let Some(date) = name
            .strip_prefix(LOG_FILE_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            continue;
        };
        if file_date >= cutoff {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    removed
}
