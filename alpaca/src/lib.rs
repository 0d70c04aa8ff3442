//! Alpaca Protocol Client
//!
//! Implements the ASCOM Alpaca REST API for cross-platform device control.
//! Every property access is one HTTP request/response pair; there is no push
//! channel, so callers poll.

mod client;
mod discovery;

pub use client::*;
pub use discovery::*;

use std::fmt;

/// Alpaca API version
pub const ALPACA_API_VERSION: u32 = 1;

/// Default Alpaca API port
pub const ALPACA_DEFAULT_PORT: u16 = 11111;

/// Alpaca error number for "not implemented"
pub const ALPACA_NOT_IMPLEMENTED: i32 = 0x400;

/// Alpaca device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpacaDeviceType {
    Camera,
    CoverCalibrator,
    Dome,
    FilterWheel,
    Focuser,
    ObservingConditions,
    Switch,
    Telescope,
}

impl AlpacaDeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlpacaDeviceType::Camera => "camera",
            AlpacaDeviceType::CoverCalibrator => "covercalibrator",
            AlpacaDeviceType::Dome => "dome",
            AlpacaDeviceType::FilterWheel => "filterwheel",
            AlpacaDeviceType::Focuser => "focuser",
            AlpacaDeviceType::ObservingConditions => "observingconditions",
            AlpacaDeviceType::Switch => "switch",
            AlpacaDeviceType::Telescope => "telescope",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "camera" => Some(AlpacaDeviceType::Camera),
            "covercalibrator" => Some(AlpacaDeviceType::CoverCalibrator),
            "dome" => Some(AlpacaDeviceType::Dome),
            "filterwheel" => Some(AlpacaDeviceType::FilterWheel),
            "focuser" => Some(AlpacaDeviceType::Focuser),
            "observingconditions" => Some(AlpacaDeviceType::ObservingConditions),
            "switch" => Some(AlpacaDeviceType::Switch),
            "telescope" => Some(AlpacaDeviceType::Telescope),
            _ => None,
        }
    }
}

impl fmt::Display for AlpacaDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an Alpaca server lives and how to talk to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlpacaEndpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub api_version: u32,
    /// Basic-auth user; empty disables authentication
    pub user: String,
    pub password: String,
}

impl Default for AlpacaEndpoint {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: ALPACA_DEFAULT_PORT,
            api_version: ALPACA_API_VERSION,
            user: String::new(),
            password: String::new(),
        }
    }
}

impl AlpacaEndpoint {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// A device on a server, written `label:devicetype:number`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlpacaDeviceAddress {
    pub label: String,
    pub device_type: AlpacaDeviceType,
    pub number: u32,
}

impl AlpacaDeviceAddress {
    /// Parse `label:devicetype:number`; the label itself may contain colons
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.rsplitn(3, ':');
        let number = parts.next()?.trim().parse().ok()?;
        let device_type = AlpacaDeviceType::parse(parts.next()?.trim())?;
        let label = parts.next()?.to_string();
        Some(Self {
            label,
            device_type,
            number,
        })
    }
}

impl fmt::Display for AlpacaDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.label, self.device_type, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_address_parse() {
        let address = AlpacaDeviceAddress::parse("Sim: Camera:camera:0").unwrap();
        assert_eq!(address.label, "Sim: Camera");
        assert_eq!(address.device_type, AlpacaDeviceType::Camera);
        assert_eq!(address.number, 0);
        assert_eq!(address.to_string(), "Sim: Camera:camera:0");

        assert!(AlpacaDeviceAddress::parse("").is_none());
        assert!(AlpacaDeviceAddress::parse("label:toaster:1").is_none());
        assert!(AlpacaDeviceAddress::parse("label:dome:x").is_none());
    }

    #[test]
    fn test_endpoint_base_url() {
        let endpoint = AlpacaEndpoint {
            protocol: "https".to_string(),
            host: "observatory.local".to_string(),
            port: 443,
            ..Default::default()
        };
        assert_eq!(endpoint.base_url(), "https://observatory.local:443");
        assert_eq!(AlpacaEndpoint::default().base_url(), "http://localhost:11111");
    }
}
