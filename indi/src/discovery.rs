//! INDI server reachability and device discovery
//!
//! Discovery connects a throw-away client, lets the server announce its
//! devices, and classifies each by the `DRIVER_INFO.DRIVER_INTERFACE`
//! bitmask. Drivers that do not publish it are classified from the
//! vectors they define.

use crate::client::IndiClient;
use crate::error::IndiResult;
use crate::protocol::standard_properties as props;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// `DRIVER_INTERFACE` bit values
pub struct DriverInterface;

impl DriverInterface {
    pub const GENERAL: u32 = 0;
    pub const TELESCOPE: u32 = 1 << 0;
    pub const CCD: u32 = 1 << 1;
    pub const GUIDER: u32 = 1 << 2;
    pub const FOCUSER: u32 = 1 << 3;
    pub const FILTER: u32 = 1 << 4;
    pub const DOME: u32 = 1 << 5;
    pub const GPS: u32 = 1 << 6;
    pub const WEATHER: u32 = 1 << 7;
    pub const AO: u32 = 1 << 8;
    pub const DUSTCAP: u32 = 1 << 9;
    pub const LIGHTBOX: u32 = 1 << 10;
    pub const DETECTOR: u32 = 1 << 11;
    pub const ROTATOR: u32 = 1 << 12;
    pub const SPECTROGRAPH: u32 = 1 << 13;
    pub const CORRELATOR: u32 = 1 << 14;
    pub const AUX: u32 = 1 << 15;
}

/// True if a TCP connection to the server can be opened within `wait`
pub async fn probe_server(host: &str, port: u16, wait: Duration) -> bool {
    let addr = format!("{}:{}", host, port);
    match timeout(wait, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!("INDI probe of {} failed: {}", addr, e);
            false
        }
        Err(_) => {
            tracing::debug!("INDI probe of {} timed out", addr);
            false
        }
    }
}

/// Guess the interface bits of a driver from the vectors it defines
fn infer_interface(vector_names: &[String]) -> u32 {
    let has = |name: &str| vector_names.iter().any(|n| n == name);
    let mut mask = DriverInterface::GENERAL;
    if has(props::CCD_EXPOSURE) {
        mask |= DriverInterface::CCD;
    }
    if has(props::ABS_FOCUS_POSITION) || has(props::REL_FOCUS_POSITION) {
        mask |= DriverInterface::FOCUSER;
    }
    if has(props::FILTER_SLOT) {
        mask |= DriverInterface::FILTER;
    }
    if has(props::DOME_SHUTTER) || has(props::ABS_DOME_POSITION) {
        mask |= DriverInterface::DOME;
    }
    if has(props::CAP_PARK) {
        mask |= DriverInterface::DUSTCAP;
    }
    if has(props::FLAT_LIGHT_CONTROL) {
        mask |= DriverInterface::LIGHTBOX;
    }
    if has(props::WEATHER_PARAMETERS) {
        mask |= DriverInterface::WEATHER;
    }
    if has(props::TELESCOPE_INFO) || has("EQUATORIAL_EOD_COORD") {
        mask |= DriverInterface::TELESCOPE;
    }
    mask
}

/// Interface mask a client currently knows for `device`
pub async fn device_interface(client: &IndiClient, device: &str) -> u32 {
    if let Some(mask) = client
        .vector(device, props::DRIVER_INFO)
        .await
        .and_then(|v| v.text(props::DRIVER_INTERFACE).map(str::to_string))
        .and_then(|t| t.trim().parse::<u32>().ok())
    {
        return mask;
    }
    let names: Vec<String> = client
        .vectors(device)
        .await
        .into_iter()
        .map(|v| v.name)
        .collect();
    infer_interface(&names)
}

/// List the devices on a server whose interface intersects `interface_mask`.
///
/// A mask of [`DriverInterface::GENERAL`] returns every device.
pub async fn discover_devices(
    host: &str,
    port: u16,
    interface_mask: u32,
    wait: Duration,
) -> IndiResult<Vec<String>> {
    let client = IndiClient::new();
    client.connect(host, port).await?;
    tokio::time::sleep(wait).await;

    let mut found = Vec::new();
    for device in client.devices().await {
        let mask = device_interface(&client, &device).await;
        if interface_mask == DriverInterface::GENERAL || mask & interface_mask != 0 {
            found.push(device);
        }
    }
    client.disconnect().await?;

    tracing::info!(
        "INDI discovery on {}:{} found {} device(s) for mask {:#x}",
        host,
        port,
        found.len(),
        interface_mask
    );
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_infer_interface_from_vectors() {
        let names = vec![
            "CONNECTION".to_string(),
            "CCD_EXPOSURE".to_string(),
            "FILTER_SLOT".to_string(),
        ];
        let mask = infer_interface(&names);
        assert_ne!(mask & DriverInterface::CCD, 0);
        assert_ne!(mask & DriverInterface::FILTER, 0);
        assert_eq!(mask & DriverInterface::DOME, 0);
    }

    #[tokio::test]
    async fn test_probe_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_server("127.0.0.1", port, Duration::from_millis(500)).await);
        drop(listener);
        assert!(!probe_server("127.0.0.1", port, Duration::from_millis(500)).await);
    }
}
