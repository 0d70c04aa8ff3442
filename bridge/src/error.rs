//! Error types for the observatory core
//!
//! `BridgeError` is used between the adapters and their helpers. It never
//! crosses a device facade: the facade contract turns every failure into a
//! `false`/empty return plus signals and a log entry.

use thiserror::Error;
use std::time::Duration;

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Socket refused, HTTP failure, COM call threw
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation '{operation}' timed out after {:.1}s", .timeout.as_secs_f64())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl BridgeError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        BridgeError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// True when the remote side is gone rather than refusing a request
    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Transport(_) | BridgeError::NotConnected(_))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<observatory_indi::IndiError> for BridgeError {
    fn from(err: observatory_indi::IndiError) -> Self {
        use observatory_indi::IndiError;
        match err {
            IndiError::NotConnected => BridgeError::NotConnected("INDI server".to_string()),
            IndiError::ConnectionTimeout { host, port, duration } => {
                BridgeError::timeout(format!("connect {}:{}", host, port), duration)
            }
            IndiError::PermissionDenied(msg) => BridgeError::NotSupported(msg),
            IndiError::PropertyNotFound { device, property } => {
                BridgeError::NotSupported(format!("{}.{}", device, property))
            }
            other if other.is_connection() => BridgeError::Transport(other.to_string()),
            other => BridgeError::InvalidParameter(other.to_string()),
        }
    }
}

impl From<observatory_alpaca::AlpacaError> for BridgeError {
    fn from(err: observatory_alpaca::AlpacaError) -> Self {
        use observatory_alpaca::AlpacaError;
        match err {
            AlpacaError::NotImplemented(msg) => BridgeError::NotSupported(msg),
            AlpacaError::Timeout { operation, duration_ms } => {
                BridgeError::timeout(operation, Duration::from_millis(duration_ms))
            }
            AlpacaError::DeviceError { code, message } => {
                BridgeError::InvalidParameter(format!("device error {:#x}: {}", code, message))
            }
            AlpacaError::ParseError(msg) => BridgeError::InvalidParameter(msg),
            other => BridgeError::Transport(other.to_string()),
        }
    }
}

impl From<observatory_ascom::AscomError> for BridgeError {
    fn from(err: observatory_ascom::AscomError) -> Self {
        use observatory_ascom::AscomError;
        match err {
            AscomError::NotImplemented(member) => BridgeError::NotSupported(member),
            AscomError::Unavailable => BridgeError::NotSupported(err.to_string()),
            AscomError::InvalidValue { .. } | AscomError::AscomException { .. } => {
                BridgeError::InvalidParameter(err.to_string())
            }
            other => BridgeError::Transport(other.to_string()),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_mapping() {
        let err: BridgeError =
            observatory_alpaca::AlpacaError::NotImplemented("halt".to_string()).into();
        assert!(matches!(err, BridgeError::NotSupported(_)));

        let err: BridgeError = observatory_indi::IndiError::NotConnected.into();
        assert!(err.is_transport());
        let err: BridgeError = observatory_indi::IndiError::ChannelClosed("writer".to_string()).into();
        assert!(err.is_transport());
        let err: BridgeError = observatory_indi::IndiError::ParseError("bad tag".to_string()).into();
        assert!(!err.is_transport());

        let err: BridgeError = observatory_ascom::AscomError::WorkerGone("x".to_string()).into();
        assert!(err.is_transport());
    }

    #[test]
    fn test_timeout_display() {
        let err = BridgeError::timeout("expose", Duration::from_millis(2500));
        assert_eq!(err.to_string(), "Operation 'expose' timed out after 2.5s");
    }
}
