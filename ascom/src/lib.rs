//! ASCOM COM Interface (Windows Only)
//!
//! Drives ASCOM drivers through `IDispatch`. Each driver lives on its own
//! apartment-threaded worker thread; callers talk to it through an async
//! [`ComWorker`] handle. On other platforms the crate compiles to stubs that
//! report unavailability.

use std::fmt;

#[cfg(windows)]
mod windows_impl;

/// ASCOM device information discovered from the Windows Registry
#[derive(Debug, Clone)]
pub struct AscomDevice {
    /// The COM ProgID used to instantiate the driver
    pub prog_id: String,
    /// Human-readable name
    pub name: String,
}

/// ASCOM device types as defined by ASCOM standard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AscomDeviceType {
    Camera,
    CoverCalibrator,
    Dome,
    FilterWheel,
    Focuser,
    ObservingConditions,
    Switch,
    Telescope,
}

impl AscomDeviceType {
    /// Get the registry key name for this device type
    pub fn registry_name(&self) -> &'static str {
        match self {
            AscomDeviceType::Camera => "Camera",
            AscomDeviceType::CoverCalibrator => "CoverCalibrator",
            AscomDeviceType::Dome => "Dome",
            AscomDeviceType::FilterWheel => "FilterWheel",
            AscomDeviceType::Focuser => "Focuser",
            AscomDeviceType::ObservingConditions => "ObservingConditions",
            AscomDeviceType::Switch => "Switch",
            AscomDeviceType::Telescope => "Telescope",
        }
    }
}

/// A value crossing the COM boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ComValue {
    Empty,
    Bool(bool),
    Int(i32),
    Double(f64),
    Str(String),
    /// Column-major pixel data with its two dimensions
    IntArray { data: Vec<i32>, dim1: usize, dim2: usize },
    StrArray(Vec<String>),
}

impl ComValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ComValue::Bool(b) => Some(*b),
            ComValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ComValue::Double(d) => Some(*d),
            ComValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ComValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// HRESULT raised by drivers for a property or method they do not implement
pub const NOT_IMPLEMENTED_HRESULT: i32 = 0x8004_0400_u32 as i32;

/// ASCOM-specific error types
#[derive(Debug, Clone)]
pub enum AscomError {
    /// COM error with HRESULT code
    ComError { hresult: i32, message: String },
    /// Exception raised by the driver
    AscomException { code: i32, source: String, description: String },
    /// Member not implemented by the driver
    NotImplemented(String),
    /// Returned value had an unexpected type
    InvalidValue { member: String, reason: String },
    /// The worker thread has exited
    WorkerGone(String),
    /// COM is not available on this platform
    Unavailable,
}

impl fmt::Display for AscomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AscomError::ComError { hresult, message } => {
                write!(f, "COM error (HRESULT {:#X}): {}", hresult, message)
            }
            AscomError::AscomException { code, source, description } => {
                write!(f, "ASCOM exception (code {:#X}): {} - {}", code, source, description)
            }
            AscomError::NotImplemented(member) => write!(f, "{} is not implemented", member),
            AscomError::InvalidValue { member, reason } => {
                write!(f, "Invalid value from '{}': {}", member, reason)
            }
            AscomError::WorkerGone(prog_id) => write!(f, "ASCOM worker for {} has stopped", prog_id),
            AscomError::Unavailable => write!(f, "ASCOM is only available on Windows"),
        }
    }
}

impl std::error::Error for AscomError {}

/// Result type for ASCOM operations
pub type AscomResult<T> = Result<T, AscomError>;

/// Check if ASCOM is available on this platform
pub fn is_available() -> bool {
    cfg!(windows)
}

/// Discover ASCOM drivers of a specific type registered in the Windows Registry
#[cfg(windows)]
pub fn discover_devices(device_type: AscomDeviceType) -> Vec<AscomDevice> {
    windows_impl::discover_devices(device_type.registry_name())
}

/// Discover ASCOM devices (non-Windows stub)
#[cfg(not(windows))]
pub fn discover_devices(_device_type: AscomDeviceType) -> Vec<AscomDevice> {
    Vec::new()
}

#[cfg(windows)]
pub use windows_impl::ComWorker;

/// Driver handle (non-Windows stub); every call reports [`AscomError::Unavailable`]
#[cfg(not(windows))]
pub struct ComWorker {
    prog_id: String,
}

#[cfg(not(windows))]
impl ComWorker {
    pub async fn spawn(_prog_id: &str) -> AscomResult<Self> {
        Err(AscomError::Unavailable)
    }

    pub fn prog_id(&self) -> &str {
        &self.prog_id
    }

    pub async fn get(&self, _name: &str) -> AscomResult<ComValue> {
        Err(AscomError::Unavailable)
    }

    pub async fn put(&self, _name: &str, _value: ComValue) -> AscomResult<()> {
        Err(AscomError::Unavailable)
    }

    pub async fn call(&self, _name: &str, _args: Vec<ComValue>) -> AscomResult<ComValue> {
        Err(AscomError::Unavailable)
    }

    pub async fn shutdown(&self) {}
}
