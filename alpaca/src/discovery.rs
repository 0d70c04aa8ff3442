//! Alpaca management API: the devices a server exposes

use crate::{AlpacaDeviceAddress, AlpacaDeviceType, AlpacaEndpoint, AlpacaError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Configured device from management API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfiguredDevice {
    pub device_name: String,
    pub device_type: String,
    pub device_number: u32,
    #[serde(rename = "UniqueID", default)]
    pub unique_id: String,
}

/// Get configured devices from an Alpaca server
pub async fn get_configured_devices(
    endpoint: &AlpacaEndpoint,
    timeout_duration: Duration,
) -> Result<Vec<ConfiguredDevice>, AlpacaError> {
    let url = format!(
        "{}/management/v{}/configureddevices",
        endpoint.base_url(),
        endpoint.api_version
    );

    let client = reqwest::Client::builder()
        .timeout(timeout_duration)
        .build()
        .map_err(|e| AlpacaError::RequestFailed(e.to_string()))?;

    let mut request = client.get(&url);
    if !endpoint.user.is_empty() {
        request = request.basic_auth(&endpoint.user, Some(&endpoint.password));
    }
    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(AlpacaError::HttpError {
            status: status.as_u16(),
            message: format!("Failed to get configured devices from {}", url),
        });
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct ApiResponse {
        value: Vec<ConfiguredDevice>,
    }

    let api_response: ApiResponse = response.json().await?;
    debug!(
        "Alpaca server {} reports {} configured device(s)",
        endpoint.base_url(),
        api_response.value.len()
    );
    Ok(api_response.value)
}

/// Devices of one type, formatted as `label:devicetype:number`
pub async fn discover_devices_of_type(
    endpoint: &AlpacaEndpoint,
    device_type: AlpacaDeviceType,
    timeout_duration: Duration,
) -> Result<Vec<String>, AlpacaError> {
    Ok(get_configured_devices(endpoint, timeout_duration)
        .await?
        .into_iter()
        .filter(|d| AlpacaDeviceType::parse(&d.device_type) == Some(device_type))
        .map(|d| {
            AlpacaDeviceAddress {
                label: d.device_name,
                device_type,
                number: d.device_number,
            }
            .to_string()
        })
        .collect())
}
