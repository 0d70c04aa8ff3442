//! Alpaca HTTP Client

use crate::{AlpacaDeviceType, AlpacaEndpoint, ALPACA_NOT_IMPLEMENTED};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Client ID for Alpaca API calls (thread-safe)
static CLIENT_ID: AtomicU32 = AtomicU32::new(1);
static TRANSACTION_ID: AtomicU32 = AtomicU32::new(0);

/// Alpaca-specific error types
#[derive(Debug, Error)]
pub enum AlpacaError {
    #[error("Connection timeout after {duration_ms}ms during {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Connection refused: {url} - {cause}")]
    ConnectionRefused { url: String, cause: String },

    #[error("HTTP error {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Device error {code}: {message}")]
    DeviceError { code: i32, message: String },

    #[error("Not implemented by device: {0}")]
    NotImplemented(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl AlpacaError {
    /// Create a timeout error with operation context
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        AlpacaError::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            AlpacaError::Timeout { .. } => true,
            AlpacaError::ConnectionRefused { .. } => true,
            AlpacaError::HttpError { status, .. } => {
                // Retry on 5xx server errors and 429 rate limiting
                *status >= 500 || *status == 429
            }
            AlpacaError::RequestFailed(_) => true,
            AlpacaError::DeviceError { .. } => false,
            AlpacaError::NotImplemented(_) => false,
            AlpacaError::ParseError(_) => false,
            AlpacaError::RetryExhausted { .. } => false,
        }
    }

    /// True for transport-level failures (as opposed to the device refusing)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AlpacaError::Timeout { .. }
                | AlpacaError::ConnectionRefused { .. }
                | AlpacaError::HttpError { .. }
                | AlpacaError::RequestFailed(_)
                | AlpacaError::RetryExhausted { .. }
        )
    }
}

impl From<reqwest::Error> for AlpacaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AlpacaError::Timeout {
                operation: "HTTP request".to_string(),
                duration_ms: 0,
            }
        } else if err.is_connect() {
            let url = err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            AlpacaError::ConnectionRefused {
                url,
                cause: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            AlpacaError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            AlpacaError::ParseError(err.to_string())
        } else {
            AlpacaError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AlpacaError {
    fn from(err: serde_json::Error) -> Self {
        AlpacaError::ParseError(err.to_string())
    }
}

pub fn get_client_transaction() -> (u32, u32) {
    let client_id = CLIENT_ID.load(Ordering::SeqCst);
    let transaction_id = TRANSACTION_ID.fetch_add(1, Ordering::SeqCst);
    (client_id, transaction_id)
}

/// Timeout configuration for different operation types
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Property reads and short commands
    pub standard_operation_ms: u64,
    /// Image downloads
    pub long_operation_ms: u64,
    /// Connection timeout
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            standard_operation_ms: 10000,
            long_operation_ms: 300000,
            connect_ms: 5000,
        }
    }
}

/// Retry configuration for failed requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first included
    pub max_attempts: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to retry delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.use_jitter {
            // +/- 25%
            capped_delay * (0.75 + jitter_unit() * 0.5)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Cheap jitter source in [0, 1)
fn jitter_unit() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    nanos as f64 / 1_000_000_000.0
}

/// Alpaca API response envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AlpacaResponse {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error_number: i32,
    #[serde(default)]
    error_message: String,
}

impl AlpacaResponse {
    fn into_value(self) -> Result<Value, AlpacaError> {
        match self.error_number {
            0 => Ok(self.value),
            ALPACA_NOT_IMPLEMENTED => Err(AlpacaError::NotImplemented(self.error_message)),
            code => Err(AlpacaError::DeviceError {
                code,
                message: self.error_message,
            }),
        }
    }
}

/// Alpaca client bound to one device on one server
pub struct AlpacaClient {
    http_client: Client,
    endpoint: AlpacaEndpoint,
    device_type: AlpacaDeviceType,
    device_number: u32,
    timeout_config: TimeoutConfig,
    retry_config: RetryConfig,
}

impl AlpacaClient {
    /// Create a new Alpaca client for a device with default configuration
    pub fn new(
        endpoint: AlpacaEndpoint,
        device_type: AlpacaDeviceType,
        device_number: u32,
    ) -> Result<Self, AlpacaError> {
        Self::with_config(
            endpoint,
            device_type,
            device_number,
            TimeoutConfig::default(),
            RetryConfig::default(),
        )
    }

    /// Create a new Alpaca client with custom timeout and retry configuration
    pub fn with_config(
        endpoint: AlpacaEndpoint,
        device_type: AlpacaDeviceType,
        device_number: u32,
        timeout_config: TimeoutConfig,
        retry_config: RetryConfig,
    ) -> Result<Self, AlpacaError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(timeout_config.standard_operation_ms))
            .connect_timeout(Duration::from_millis(timeout_config.connect_ms))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AlpacaError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint,
            device_type,
            device_number,
            timeout_config,
            retry_config,
        })
    }

    pub fn endpoint(&self) -> &AlpacaEndpoint {
        &self.endpoint
    }

    pub fn device_type(&self) -> AlpacaDeviceType {
        self.device_type
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    /// Build the URL for an API endpoint
    pub fn build_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/v{}/{}/{}/{}",
            self.endpoint.base_url(),
            self.endpoint.api_version,
            self.device_type.as_str(),
            self.device_number,
            endpoint.to_lowercase()
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http_client.request(method, url);
        if self.endpoint.user.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.endpoint.user, Some(&self.endpoint.password))
        }
    }

    /// Execute a request with retry logic
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, AlpacaError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, AlpacaError>>,
    {
        let mut last_error = AlpacaError::RequestFailed("No attempts made".to_string());

        for attempt in 0..self.retry_config.max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = e;

                    if !last_error.is_retryable() {
                        return Err(last_error);
                    }

                    if attempt + 1 < self.retry_config.max_attempts {
                        let delay = self.retry_config.delay_for_attempt(attempt);
                        debug!(
                            "Request failed (attempt {}/{}), retrying in {:?}: {}",
                            attempt + 1,
                            self.retry_config.max_attempts,
                            delay,
                            last_error
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if self.retry_config.max_attempts <= 1 {
            return Err(last_error);
        }
        Err(AlpacaError::RetryExhausted {
            attempts: self.retry_config.max_attempts,
            last_error: last_error.to_string(),
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, AlpacaError> {
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlpacaError::HttpError {
                status: status.as_u16(),
                message: body,
            });
        }

        let alpaca_response: AlpacaResponse = response.json().await?;
        alpaca_response.into_value()
    }

    /// GET an endpoint, returning the raw `Value` of the envelope
    pub async fn get_value(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Value, AlpacaError> {
        let url = self.build_url(endpoint);
        self.execute_with_retry(|| async {
            let (client_id, transaction_id) = get_client_transaction();
            let mut params: Vec<(&str, String)> = vec![
                ("ClientID", client_id.to_string()),
                ("ClientTransactionID", transaction_id.to_string()),
            ];
            params.extend(query.iter().cloned());
            self.send(self.request(Method::GET, &url).query(&params))
                .await
        })
        .await
    }

    /// GET with the long-operation timeout and no retry (image downloads)
    pub async fn get_value_long(&self, endpoint: &str) -> Result<Value, AlpacaError> {
        let url = self.build_url(endpoint);
        let (client_id, transaction_id) = get_client_transaction();
        let timeout_ms = self.timeout_config.long_operation_ms;
        self.send(
            self.request(Method::GET, &url)
                .timeout(Duration::from_millis(timeout_ms))
                .query(&[
                    ("ClientID", client_id.to_string()),
                    ("ClientTransactionID", transaction_id.to_string()),
                ]),
        )
        .await
        .map_err(|e| match e {
            AlpacaError::Timeout { .. } => AlpacaError::timeout(endpoint, timeout_ms),
            other => other,
        })
    }

    /// GET and deserialize the envelope value
    pub async fn get_typed<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, AlpacaError> {
        let value = self.get_value(endpoint, &[]).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// PUT form parameters to an endpoint
    pub async fn put_value(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Value, AlpacaError> {
        let url = self.build_url(endpoint);
        self.execute_with_retry(|| async {
            let (client_id, transaction_id) = get_client_transaction();
            let mut form: Vec<(&str, String)> = vec![
                ("ClientID", client_id.to_string()),
                ("ClientTransactionID", transaction_id.to_string()),
            ];
            form.extend(params.iter().cloned());
            self.send(self.request(Method::PUT, &url).form(&form)).await
        })
        .await
    }

    /// Check if the device is connected
    pub async fn is_connected(&self) -> Result<bool, AlpacaError> {
        self.get_typed("connected").await
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve canned responses in order, forwarding each raw request
    pub async fn serve(responses: Vec<(u16, String)>) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap();
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        (port, rx)
    }
}
