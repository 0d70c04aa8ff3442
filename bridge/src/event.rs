//! Per-device signal bus
//!
//! One bus is owned by each logical device and shared by whichever protocol
//! adapter is active, so subscribers survive framework switches.
//!
//! # Features
//!
//! - **Sequence Numbers**: every emission gets a monotonically increasing id
//! - **Kind Filtering**: subscribe to a subset of [`SignalKind`]s
//! - **Overflow Handling**: lagging subscribers skip ahead with a warning and
//!   the skipped count is kept for diagnostics
//!
//! Emission order is preserved for every subscriber of one bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Default signal buffer size per device
pub const DEFAULT_SIGNAL_BUFFER_SIZE: usize = 1024;

/// Device signals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceSignal {
    ServerConnected,
    /// Reason codes per device name (0 = regular shutdown)
    ServerDisconnected { devices: BTreeMap<String, i32> },
    DeviceConnected { name: String },
    DeviceDisconnected { name: String },
    /// Integration finished
    Exposed { success: bool },
    Downloaded { success: bool },
    /// Terminal artifact of an exposure, `None` on failure
    Saved { path: Option<PathBuf> },
    Azimuth(f64),
    Slewed { success: bool },
    /// Human readable status line, level 0 info, 1 warning, 2 error
    Message { text: String, level: u8 },
    Result { success: bool },
    /// Hardware generation of a power unit
    Version(u8),
}

/// Signal kinds used for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignalKind {
    ServerConnected,
    ServerDisconnected,
    DeviceConnected,
    DeviceDisconnected,
    Exposed,
    Downloaded,
    Saved,
    Azimuth,
    Slewed,
    Message,
    Result,
    Version,
}

impl DeviceSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            DeviceSignal::ServerConnected => SignalKind::ServerConnected,
            DeviceSignal::ServerDisconnected { .. } => SignalKind::ServerDisconnected,
            DeviceSignal::DeviceConnected { .. } => SignalKind::DeviceConnected,
            DeviceSignal::DeviceDisconnected { .. } => SignalKind::DeviceDisconnected,
            DeviceSignal::Exposed { .. } => SignalKind::Exposed,
            DeviceSignal::Downloaded { .. } => SignalKind::Downloaded,
            DeviceSignal::Saved { .. } => SignalKind::Saved,
            DeviceSignal::Azimuth(_) => SignalKind::Azimuth,
            DeviceSignal::Slewed { .. } => SignalKind::Slewed,
            DeviceSignal::Message { .. } => SignalKind::Message,
            DeviceSignal::Result { .. } => SignalKind::Result,
            DeviceSignal::Version(_) => SignalKind::Version,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        DeviceSignal::Message {
            text: text.into(),
            level: 0,
        }
    }

    /// `ServerDisconnected` for a single device with reason code 0
    pub fn server_disconnected(name: &str) -> Self {
        let mut devices = BTreeMap::new();
        devices.insert(name.to_string(), 0);
        DeviceSignal::ServerDisconnected { devices }
    }
}

/// A signal as delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct SignalEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Device type the bus belongs to
    pub device: String,
    pub signal: DeviceSignal,
}

/// Statistics about a bus
#[derive(Debug, Clone, Default)]
pub struct SignalBusStats {
    pub signals_published: u64,
    /// Entries skipped by lagging subscribers
    pub signals_lagged: u64,
    pub subscriber_count: usize,
}

/// Broadcast bus for one logical device
pub struct SignalBus {
    device: String,
    sender: broadcast::Sender<SignalEnvelope>,
    /// Next sequence number; held while sending so delivery follows numbering
    sequence: Mutex<u64>,
    published: AtomicU64,
    lagged: Arc<AtomicU64>,
}

impl SignalBus {
    pub fn new(device: impl Into<String>) -> Self {
        Self::with_capacity(device, DEFAULT_SIGNAL_BUFFER_SIZE)
    }

    pub fn with_capacity(device: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            device: device.into(),
            sender,
            sequence: Mutex::new(1),
            published: AtomicU64::new(0),
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Publish a signal, returning its sequence number
    pub fn emit(&self, signal: DeviceSignal) -> u64 {
        let mut next = self.sequence.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let sequence = *next;
        *next += 1;
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("[{}] signal #{} {:?}", self.device, sequence, signal);

        let envelope = SignalEnvelope {
            sequence,
            timestamp: Utc::now(),
            device: self.device.clone(),
            signal,
        };
        // No receivers is fine
        let _ = self.sender.send(envelope);
        sequence
    }

    pub fn subscribe(&self) -> SignalSubscription {
        SignalSubscription {
            receiver: self.sender.subscribe(),
            filter: None,
            lagged: Arc::clone(&self.lagged),
        }
    }

    /// Subscribe to the given kinds only
    pub fn subscribe_to(&self, kinds: &[SignalKind]) -> SignalSubscription {
        SignalSubscription {
            receiver: self.sender.subscribe(),
            filter: Some(kinds.to_vec()),
            lagged: Arc::clone(&self.lagged),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> SignalBusStats {
        SignalBusStats {
            signals_published: self.published.load(Ordering::Relaxed),
            signals_lagged: self.lagged.load(Ordering::Relaxed),
            subscriber_count: self.sender.receiver_count(),
        }
    }
}

/// Receiving end of a [`SignalBus`]
pub struct SignalSubscription {
    receiver: broadcast::Receiver<SignalEnvelope>,
    filter: Option<Vec<SignalKind>>,
    lagged: Arc<AtomicU64>,
}

impl SignalSubscription {
    fn wanted(&self, envelope: &SignalEnvelope) -> bool {
        match &self.filter {
            Some(kinds) => kinds.contains(&envelope.signal.kind()),
            None => true,
        }
    }

    /// Next signal; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if self.wanted(&envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Signal subscriber lagged, skipped {} signals", skipped);
                    self.lagged.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued signal without waiting
    pub fn try_recv(&mut self) -> Option<SignalEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if self.wanted(&envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Signal subscriber lagged, skipped {} signals", skipped);
                    self.lagged.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<DeviceSignal> {
        let mut out = Vec::new();
        while let Some(envelope) = self.try_recv() {
            out.push(envelope.signal);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_order_and_sequence() {
        let bus = SignalBus::new("camera");
        let mut sub = bus.subscribe();

        bus.emit(DeviceSignal::ServerConnected);
        bus.emit(DeviceSignal::DeviceConnected { name: "CCD Simulator".into() });
        bus.emit(DeviceSignal::Exposed { success: true });

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        let third = sub.recv().await.unwrap();
        assert_eq!(first.signal, DeviceSignal::ServerConnected);
        assert_eq!(second.signal.kind(), SignalKind::DeviceConnected);
        assert_eq!(third.signal, DeviceSignal::Exposed { success: true });
        assert!(first.sequence < second.sequence && second.sequence < third.sequence);
        assert_eq!(first.device, "camera");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_emitters_deliver_in_sequence() {
        let bus = Arc::new(SignalBus::with_capacity("dome", 1024));
        let mut sub = bus.subscribe();

        let emitters: Vec<_> = (0..4)
            .map(|_| {
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    for i in 0..200 {
                        bus.emit(DeviceSignal::Azimuth(i as f64));
                    }
                })
            })
            .collect();
        for emitter in emitters {
            emitter.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..800 {
            let got = sub.try_recv().expect("signal");
            assert_eq!(got.sequence, last + 1);
            last = got.sequence;
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = SignalBus::new("dome");
        let mut sub = bus.subscribe_to(&[SignalKind::Azimuth]);

        bus.emit(DeviceSignal::message("moving"));
        bus.emit(DeviceSignal::Azimuth(181.5));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.signal, DeviceSignal::Azimuth(181.5));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_and_counts() {
        let bus = SignalBus::with_capacity("focuser", 2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(DeviceSignal::Azimuth(i as f64));
        }

        let got = sub.recv().await.unwrap();
        assert_eq!(got.signal, DeviceSignal::Azimuth(3.0));
        assert_eq!(bus.stats().signals_lagged, 3);
        assert_eq!(bus.stats().signals_published, 5);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = SignalBus::new("weather");
        assert_eq!(bus.emit(DeviceSignal::ServerConnected), 1);
        assert_eq!(bus.emit(DeviceSignal::server_disconnected("x")), 2);
        assert_eq!(bus.stats().subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = SignalBus::new("power");
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
