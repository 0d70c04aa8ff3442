//! INDI client implementation
//!
//! One TCP connection per client. A writer task drains the command channel,
//! a reader task parses the XML stream, maintains the vector cache and
//! broadcasts [`IndiEvent`]s to subscribers.

use crate::error::{IndiError, IndiResult};
use crate::protocol::{self, standard_properties as props, BlobMode};
use crate::stream::{Parsed, StreamParser};
use crate::{IndiPermission, IndiPropertyType, IndiTimeoutConfig, IndiVector};
use quick_xml::events::Event;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;

/// Event channel depth; BLOB events are large so subscribers should keep up
const EVENT_BUFFER_SIZE: usize = 256;

/// INDI client event
#[derive(Debug, Clone)]
pub enum IndiEvent {
    /// First vector of a device seen
    DeviceDefined(String),
    /// All vectors of a device deleted
    DeviceRemoved(String),
    /// Vector defined (device, name, type)
    PropertyDefined(String, String, IndiPropertyType),
    /// Vector updated (device, name)
    PropertyUpdated(String, String),
    /// Vector deleted (device, name)
    PropertyDeleted(String, String),
    /// BLOB received and decoded
    BlobReceived(IndiBlob),
    /// Free-text message from the server or a driver
    Message { device: String, message: String },
    /// Connection state changed
    ConnectionStateChanged(bool),
    /// Error occurred
    Error(String),
}

/// Decoded BLOB payload
#[derive(Debug, Clone)]
pub struct IndiBlob {
    pub device: String,
    pub property: String,
    pub element: String,
    pub format: String,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct Cache {
    devices: BTreeSet<String>,
    vectors: HashMap<(String, String), IndiVector>,
}

/// INDI client for communicating with an INDI server
pub struct IndiClient {
    connected: Arc<AtomicBool>,
    cache: Arc<RwLock<Cache>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    event_tx: broadcast::Sender<IndiEvent>,
    timeout_config: IndiTimeoutConfig,
}

impl IndiClient {
    /// Create a new, unconnected INDI client
    pub fn new() -> Self {
        Self::with_timeout_config(IndiTimeoutConfig::default())
    }

    /// Create a new INDI client with custom timeout configuration
    pub fn with_timeout_config(timeout_config: IndiTimeoutConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            cache: Arc::new(RwLock::new(Cache::default())),
            tx: RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            event_tx,
            timeout_config,
        }
    }

    pub fn timeout_config(&self) -> &IndiTimeoutConfig {
        &self.timeout_config
    }

    /// Subscribe to INDI events
    pub fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to the INDI server, dropping any previous connection
    pub async fn connect(&self, host: &str, port: u16) -> IndiResult<()> {
        if self.is_connected() {
            self.disconnect().await?;
        }

        let addr = format!("{}:{}", host, port);
        let connection_timeout = self.timeout_config.connection_timeout();

        let stream = match timeout(connection_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(IndiError::ConnectionTimeout {
                    host: host.to_string(),
                    port,
                    duration: connection_timeout,
                });
            }
        };

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<String>(100);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.tx.write().await = Some(tx);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        tokio::spawn(Self::writer_task(write_half, rx));

        self.connected.store(true, Ordering::SeqCst);
        tokio::spawn(Self::reader_task(
            read_half,
            self.cache.clone(),
            self.connected.clone(),
            self.event_tx.clone(),
            self.timeout_config.clone(),
            shutdown_rx,
        ));

        tracing::info!("Connected to INDI server {}", addr);
        let _ = self.event_tx.send(IndiEvent::ConnectionStateChanged(true));

        self.send_command(&protocol::get_properties(None)).await
    }

    /// Writer task - sends commands to INDI server
    async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = writer.write_all(cmd.as_bytes()).await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
        }
    }

    /// Reader task - runs until EOF, a read error or the shutdown signal
    async fn reader_task<R: AsyncRead + Unpin>(
        reader: R,
        cache: Arc<RwLock<Cache>>,
        connected: Arc<AtomicBool>,
        event_tx: broadcast::Sender<IndiEvent>,
        timeout_config: IndiTimeoutConfig,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            _ = Self::read_stream(reader, &cache, &connected, &event_tx, &timeout_config) => {}
            _ = &mut shutdown_rx => {
                tracing::debug!("INDI reader task received shutdown signal");
                return;
            }
        }

        // Lost the server: forget everything it told us
        connected.store(false, Ordering::SeqCst);
        {
            let mut cache = cache.write().await;
            cache.devices.clear();
            cache.vectors.clear();
        }
        let _ = event_tx.send(IndiEvent::ConnectionStateChanged(false));
    }

    async fn read_stream<R: AsyncRead + Unpin>(
        reader: R,
        cache: &Arc<RwLock<Cache>>,
        connected: &Arc<AtomicBool>,
        event_tx: &broadcast::Sender<IndiEvent>,
        timeout_config: &IndiTimeoutConfig,
    ) {
        let mut reader = quick_xml::reader::Reader::from_reader(tokio::io::BufReader::new(reader));
        reader.trim_text(true);
        // The stream is a sequence of documents, not one rooted tree
        reader.check_end_names(false);

        let mut buf = Vec::new();
        let mut parser = StreamParser::default();

        loop {
            let parsed = match timeout(
                timeout_config.read_poll(),
                reader.read_event_into_async(&mut buf),
            )
            .await
            {
                Ok(Ok(Event::Start(e))) => parser.start(&e),
                Ok(Ok(Event::Empty(e))) => {
                    let mut parsed = parser.start(&e);
                    parsed.extend(parser.end(e.name().as_ref()));
                    parsed
                }
                Ok(Ok(Event::Text(e))) => {
                    parser.text(&e.unescape().unwrap_or_default());
                    Vec::new()
                }
                Ok(Ok(Event::End(e))) => parser.end(e.name().as_ref()),
                Ok(Ok(Event::Eof)) => {
                    tracing::info!("INDI connection closed (EOF)");
                    break;
                }
                Ok(Ok(_)) => Vec::new(),
                Ok(Err(e)) => {
                    tracing::error!(
                        "INDI XML parse error: {}. Raw buffer (first 200 chars): {:?}",
                        e,
                        String::from_utf8_lossy(&buf[..buf.len().min(200)])
                    );
                    let _ = event_tx.send(IndiEvent::Error(e.to_string()));
                    if matches!(e, quick_xml::Error::Io(_)) {
                        break;
                    }
                    Vec::new()
                }
                Err(_) => {
                    if !connected.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
            };
            buf.clear();

            for item in parsed {
                Self::apply(item, cache, event_tx).await;
            }
        }
    }

    /// Fold one parsed item into the cache and publish the matching event
    async fn apply(item: Parsed, cache: &RwLock<Cache>, event_tx: &broadcast::Sender<IndiEvent>) {
        match item {
            Parsed::Defined(vector) => {
                let device = vector.device.clone();
                let name = vector.name.clone();
                let kind = vector.kind;
                let new_device = {
                    let mut cache = cache.write().await;
                    let new_device = cache.devices.insert(device.clone());
                    cache.vectors.insert((device.clone(), name.clone()), vector);
                    new_device
                };
                if new_device {
                    let _ = event_tx.send(IndiEvent::DeviceDefined(device.clone()));
                }
                let _ = event_tx.send(IndiEvent::PropertyDefined(device, name, kind));
            }
            Parsed::Updated(update) => {
                let device = update.device.clone();
                let name = update.name.clone();
                {
                    let mut cache = cache.write().await;
                    match cache.vectors.get_mut(&(device.clone(), name.clone())) {
                        Some(existing) => existing.merge(&update),
                        None => {
                            cache.vectors.insert((device.clone(), name.clone()), update);
                        }
                    }
                }
                let _ = event_tx.send(IndiEvent::PropertyUpdated(device, name));
            }
            Parsed::Deleted { device, name: Some(name) } => {
                cache
                    .write()
                    .await
                    .vectors
                    .remove(&(device.clone(), name.clone()));
                let _ = event_tx.send(IndiEvent::PropertyDeleted(device, name));
            }
            Parsed::Deleted { device, name: None } => {
                {
                    let mut cache = cache.write().await;
                    cache.vectors.retain(|(d, _), _| *d != device);
                    cache.devices.remove(&device);
                }
                let _ = event_tx.send(IndiEvent::DeviceRemoved(device));
            }
            Parsed::Message { device, message } => {
                let _ = event_tx.send(IndiEvent::Message { device, message });
            }
            Parsed::Blob(blob) => {
                tracing::debug!(
                    "BLOB received for {}.{}.{}: {} bytes",
                    blob.device,
                    blob.property,
                    blob.element,
                    blob.data.len()
                );
                let _ = event_tx.send(IndiEvent::BlobReceived(blob));
            }
        }
    }

    /// Disconnect from the INDI server and clear cached state
    pub async fn disconnect(&self) -> IndiResult<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        // Dropping the sender closes the writer task
        *self.tx.write().await = None;

        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        {
            let mut cache = self.cache.write().await;
            cache.devices.clear();
            cache.vectors.clear();
        }
        if was_connected {
            tracing::info!("Disconnected from INDI server");
            let _ = self.event_tx.send(IndiEvent::ConnectionStateChanged(false));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a raw INDI command
    pub async fn send_command(&self, command: &str) -> IndiResult<()> {
        match self.tx.read().await.as_ref() {
            Some(tx) => tx.send(command.to_string()).await.map_err(|e| {
                IndiError::ChannelClosed(format!(
                    "Failed to send INDI command: {}. The connection may have been lost.",
                    e
                ))
            }),
            None => Err(IndiError::NotConnected),
        }
    }

    /// Ask the server to (re)send the definitions of one device
    pub async fn watch_device(&self, device: &str) -> IndiResult<()> {
        self.send_command(&protocol::get_properties(Some(device)))
            .await
    }

    /// Names of all devices the server announced
    pub async fn devices(&self) -> Vec<String> {
        self.cache.read().await.devices.iter().cloned().collect()
    }

    /// All vectors of one device
    pub async fn vectors(&self, device: &str) -> Vec<IndiVector> {
        self.cache
            .read()
            .await
            .vectors
            .values()
            .filter(|v| v.device == device)
            .cloned()
            .collect()
    }

    pub async fn vector(&self, device: &str, name: &str) -> Option<IndiVector> {
        self.cache
            .read()
            .await
            .vectors
            .get(&(device.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn enable_blob(&self, device: &str, mode: BlobMode) -> IndiResult<()> {
        self.send_command(&protocol::enable_blob(device, mode)).await
    }

    /// Refuse writes to vectors the server declared read-only
    async fn check_write_permission(&self, device: &str, property: &str) -> IndiResult<()> {
        match self.vector(device, property).await.map(|v| v.perm) {
            Some(IndiPermission::ReadOnly) => Err(IndiError::PermissionDenied(format!(
                "Property '{}' is read-only",
                property
            ))),
            _ => Ok(()),
        }
    }

    pub async fn set_switches(
        &self,
        device: &str,
        property: &str,
        elements: &[(&str, bool)],
    ) -> IndiResult<()> {
        self.check_write_permission(device, property).await?;
        self.send_command(&protocol::new_switch_vector(device, property, elements))
            .await
    }

    pub async fn set_numbers(
        &self,
        device: &str,
        property: &str,
        elements: &[(&str, f64)],
    ) -> IndiResult<()> {
        self.check_write_permission(device, property).await?;
        self.send_command(&protocol::new_number_vector(device, property, elements))
            .await
    }

    pub async fn set_texts(
        &self,
        device: &str,
        property: &str,
        elements: &[(&str, &str)],
    ) -> IndiResult<()> {
        self.check_write_permission(device, property).await?;
        self.send_command(&protocol::new_text_vector(device, property, elements))
            .await
    }

    /// Connect to a device (turn on CONNECTION switch)
    pub async fn connect_device(&self, device: &str) -> IndiResult<()> {
        self.set_switches(device, props::CONNECTION, &[(props::CONNECT, true)])
            .await
    }

    /// Disconnect from a device
    pub async fn disconnect_device(&self, device: &str) -> IndiResult<()> {
        self.set_switches(device, props::CONNECTION, &[(props::DISCONNECT, true)])
            .await
    }

    pub async fn is_device_connected(&self, device: &str) -> bool {
        self.vector(device, props::CONNECTION)
            .await
            .and_then(|v| v.switch(props::CONNECT))
            .unwrap_or(false)
    }
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new()
    }
}
