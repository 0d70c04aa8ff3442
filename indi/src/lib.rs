//! INDI Protocol Client
//!
//! Event-driven XML-over-TCP access to INDI (and INDIGO) servers.
//!
//! ## Features
//!
//! - Device/vector cache maintained by a background reader task
//! - Broadcast [`IndiEvent`] stream for definitions, updates, BLOBs and messages
//! - Permission checking before vector writes
//! - Reachability probe and driver-interface based discovery

mod client;
mod error;
mod protocol;
mod stream;
pub mod discovery;

pub use client::{IndiBlob, IndiClient, IndiEvent};
pub use discovery::{discover_devices, probe_server, DriverInterface};
pub use error::{IndiError, IndiResult};
pub use protocol::{parse_number, standard_properties, BlobMode, INDI_PROTOCOL_VERSION};

use std::time::Duration;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// Check if INDI is available on this platform
pub fn is_available() -> bool {
    true
}

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl IndiPropertyType {
    /// Map the type infix of a vector tag (`defNumberVector` -> `Number`)
    pub fn from_tag(infix: &str) -> Option<Self> {
        match infix {
            "Text" => Some(Self::Text),
            "Number" => Some(Self::Number),
            "Switch" => Some(Self::Switch),
            "Light" => Some(Self::Light),
            "BLOB" => Some(Self::Blob),
            _ => None,
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

impl IndiPropertyState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Ok" => Self::Ok,
            "Busy" => Self::Busy,
            "Alert" => Self::Alert,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Ok => "Ok",
            Self::Busy => "Busy",
            Self::Alert => "Alert",
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPermission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IndiPermission {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ro" => Self::ReadOnly,
            "wo" => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// One element of a vector, value kept as received
#[derive(Debug, Clone, PartialEq)]
pub struct IndiElement {
    pub name: String,
    pub label: String,
    pub value: String,
}

/// Snapshot of a property vector
#[derive(Debug, Clone)]
pub struct IndiVector {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub kind: IndiPropertyType,
    pub state: IndiPropertyState,
    pub perm: IndiPermission,
    pub elements: Vec<IndiElement>,
}

impl IndiVector {
    pub fn element(&self, name: &str) -> Option<&IndiElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.element(name).and_then(|e| parse_number(&e.value))
    }

    pub fn switch(&self, name: &str) -> Option<bool> {
        self.element(name).map(|e| e.value.trim() == "On")
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.element(name).map(|e| e.value.as_str())
    }

    /// Merge the element values of an update into this vector
    pub(crate) fn merge(&mut self, update: &IndiVector) {
        self.state = update.state;
        for element in &update.elements {
            match self.elements.iter_mut().find(|e| e.name == element.name) {
                Some(existing) => existing.value = element.value.clone(),
                None => self.elements.push(element.clone()),
            }
        }
    }
}

/// Timeout configuration for INDI operations
#[derive(Debug, Clone)]
pub struct IndiTimeoutConfig {
    /// Connection timeout for the TCP connection (default: 3 seconds)
    pub connection_timeout_secs: u64,
    /// Reachability probe timeout (default: 500ms)
    pub probe_timeout_ms: u64,
    /// Read inactivity interval after which the reader re-checks the connection flag
    pub read_poll_secs: u64,
}

impl Default for IndiTimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 3,
            probe_timeout_ms: 500,
            read_poll_secs: 5,
        }
    }
}

impl IndiTimeoutConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_secs(self.read_poll_secs)
    }
}
