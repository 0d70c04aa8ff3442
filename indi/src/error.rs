//! INDI error types

use std::fmt;
use std::time::Duration;

/// INDI client errors
#[derive(Debug, Clone)]
pub enum IndiError {
    /// Connection to INDI server failed
    ConnectionFailed(String),
    /// Connection timeout with context
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// XML parse error
    ParseError(String),
    /// Vector not known for the device
    PropertyNotFound { device: String, property: String },
    /// Attempted to write a read-only vector
    PermissionDenied(String),
    /// Send channel closed
    ChannelClosed(String),
    /// Not connected to server
    NotConnected,
    /// BLOB payload could not be decoded
    BlobDecode {
        device: String,
        property: String,
        message: String,
    },
}

impl std::error::Error for IndiError {}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            IndiError::ConnectionTimeout { host, port, duration } => {
                write!(
                    f,
                    "Connection timeout: failed to connect to {}:{} after {:?}",
                    host, port, duration
                )
            }
            IndiError::ParseError(msg) => write!(f, "XML parse error: {}", msg),
            IndiError::PropertyNotFound { device, property } => {
                write!(f, "Property not found: {}.{}", device, property)
            }
            IndiError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            IndiError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            IndiError::NotConnected => write!(f, "Not connected to INDI server"),
            IndiError::BlobDecode {
                device,
                property,
                message,
            } => {
                write!(f, "BLOB decode error for {}.{}: {}", device, property, message)
            }
        }
    }
}

impl IndiError {
    /// True when the session itself is gone rather than one request failing
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            IndiError::ConnectionFailed(_)
                | IndiError::ConnectionTimeout { .. }
                | IndiError::ChannelClosed(_)
                | IndiError::NotConnected
        )
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_vector() {
        let err = IndiError::PropertyNotFound {
            device: "Dome Simulator".to_string(),
            property: "DOME_SHUTTER".to_string(),
        };
        assert_eq!(err.to_string(), "Property not found: Dome Simulator.DOME_SHUTTER");

        let err = IndiError::BlobDecode {
            device: "CCD Simulator".to_string(),
            property: "CCD1".to_string(),
            message: "invalid padding".to_string(),
        };
        assert_eq!(err.to_string(), "BLOB decode error for CCD Simulator.CCD1: invalid padding");
    }

    #[test]
    fn test_connection_errors() {
        let timeout = IndiError::ConnectionTimeout {
            host: "astro.local".to_string(),
            port: 7624,
            duration: Duration::from_secs(5),
        };
        assert!(timeout.is_connection());
        assert!(timeout.to_string().contains("astro.local:7624"));
        assert!(IndiError::NotConnected.is_connection());
        assert!(!IndiError::PermissionDenied("CCD_INFO".to_string()).is_connection());
        assert!(!IndiError::ParseError("eof".to_string()).is_connection());
    }
}
