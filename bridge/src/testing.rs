//! Protocol-free transports for tests
//!
//! `SimulatedDriver` stands in for an Alpaca or COM driver: a property table
//! with optional per-member delays and a log of every call. `SimulatedIndi`
//! stands in for an INDI server holding the vectors of one device.

use crate::adapter::{AdapterCore, AdapterSettings, DeviceType, Framework};
use crate::dictionary::DataDictionary;
use crate::driver_link::{DriverTransport, DriverValue};
use crate::error::{BridgeError, BridgeResult};
use crate::event::SignalBus;
use crate::indi_link::IndiTransport;
use crate::scheduler::{PollingScheduler, SchedulerConfig};
use async_trait::async_trait;
use observatory_indi::{
    BlobMode, IndiBlob, IndiElement, IndiEvent, IndiPermission, IndiPropertyState,
    IndiPropertyType, IndiVector,
};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

pub fn driver_core(device_type: DeviceType, name: &str) -> Arc<AdapterCore> {
    AdapterCore::new(
        device_type,
        Framework::Alpaca,
        DataDictionary::new(),
        Arc::new(SignalBus::new(device_type.as_str())),
        PollingScheduler::current(SchedulerConfig::default()),
        AdapterSettings {
            device_name: name.to_string(),
            update_rate: 3000,
            load_config: false,
        },
    )
}

pub fn indi_core(device_type: DeviceType) -> Arc<AdapterCore> {
    AdapterCore::new(
        device_type,
        Framework::Indi,
        DataDictionary::new(),
        Arc::new(SignalBus::new(device_type.as_str())),
        PollingScheduler::current(SchedulerConfig::default()),
        AdapterSettings {
            device_name: String::new(),
            update_rate: 1000,
            load_config: false,
        },
    )
}

type MethodHandler = Box<dyn Fn(&[(&str, DriverValue)]) -> DriverValue + Send>;

#[derive(Default)]
struct DriverState {
    values: HashMap<String, DriverValue>,
    delays: HashMap<String, Duration>,
    methods: HashMap<String, MethodHandler>,
    args: Vec<(String, Vec<(String, DriverValue)>)>,
    calls: Vec<String>,
    refuse_connect: bool,
    unreachable: bool,
    device_name: String,
    update_rate: u64,
}

/// Alpaca/COM stand-in
pub struct SimulatedDriver {
    state: Mutex<DriverState>,
}

impl SimulatedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DriverState {
                update_rate: 3000,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, property: &str, value: DriverValue) {
        self.state().values.insert(property.to_string(), value);
    }

    pub fn get_value(&self, property: &str) -> Option<DriverValue> {
        self.state().values.get(property).cloned()
    }

    pub fn set_delay(&self, property: &str, delay: Duration) {
        self.state().delays.insert(property.to_string(), delay);
    }

    pub fn refuse_connect(&self) {
        self.state().refuse_connect = true;
    }

    /// Every request fails as if the server were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn on_call<F>(&self, method: &str, handler: F)
    where
        F: Fn(&[(&str, DriverValue)]) -> DriverValue + Send + 'static,
    {
        self.state().methods.insert(method.to_string(), Box::new(handler));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Arguments of every call to `method`, oldest first
    pub fn call_args(&self, method: &str) -> Vec<Vec<(String, DriverValue)>> {
        self.state()
            .args
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    fn record(&self, entry: String, member: &str) -> BridgeResult<Option<Duration>> {
        let mut state = self.state();
        state.calls.push(entry);
        if state.unreachable {
            return Err(BridgeError::Transport("connection refused".to_string()));
        }
        Ok(state.delays.get(member).copied())
    }
}

#[async_trait]
impl DriverTransport for SimulatedDriver {
    fn framework(&self) -> Framework {
        Framework::Alpaca
    }

    fn default_config(&self) -> JsonValue {
        json!({"deviceName": "", "updateRate": 3000})
    }

    fn apply_config(&self, config: &JsonValue) -> BridgeResult<AdapterSettings> {
        let mut state = self.state();
        if let Some(name) = config.get("deviceName").and_then(JsonValue::as_str) {
            state.device_name = name.to_string();
        }
        if let Some(rate) = config.get("updateRate").and_then(JsonValue::as_u64) {
            state.update_rate = rate;
        }
        Ok(AdapterSettings {
            device_name: state.device_name.clone(),
            update_rate: state.update_rate,
            load_config: false,
        })
    }

    fn current_config(&self) -> JsonValue {
        let state = self.state();
        json!({"deviceName": state.device_name, "updateRate": state.update_rate})
    }

    async fn open(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn close(&self) {}

    async fn get(&self, property: &str) -> BridgeResult<DriverValue> {
        if let Some(delay) = self.record(format!("get {}", property), property)? {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        match state.values.get(property) {
            Some(value) => Ok(value.clone()),
            None if property == "Connected" => Ok(DriverValue::Bool(false)),
            None => Err(BridgeError::NotSupported(property.to_string())),
        }
    }

    async fn put(&self, property: &str, value: DriverValue) -> BridgeResult<()> {
        if let Some(delay) = self.record(format!("put {}", property), property)? {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if property == "Connected" && state.refuse_connect {
            return Err(BridgeError::Transport("driver refused connection".to_string()));
        }
        state.values.insert(property.to_string(), value);
        Ok(())
    }

    async fn call(&self, method: &str, args: &[(&str, DriverValue)]) -> BridgeResult<DriverValue> {
        if let Some(delay) = self.record(format!("call {}", method), method)? {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.args.push((
            method.to_string(),
            args.iter().map(|(n, v)| (n.to_string(), v.clone())).collect(),
        ));
        Ok(match state.methods.get(method) {
            Some(handler) => handler(args),
            None => DriverValue::Empty,
        })
    }

    async fn discover(&self) -> Vec<String> {
        vec!["Simulator:camera:0".to_string()]
    }
}

struct IndiState {
    vectors: BTreeMap<String, IndiVector>,
    /// One-of-many switch vectors
    exclusive: BTreeSet<String>,
    connected: bool,
    reachable: bool,
    connect_attempts: u32,
    sent: Vec<String>,
    /// Number vectors the server confirms late: (delay before Busy, time Busy)
    delayed_echo: HashMap<String, (Duration, Duration)>,
}

/// INDI server stand-in serving one device
pub struct SimulatedIndi {
    device: String,
    state: Arc<Mutex<IndiState>>,
    events: broadcast::Sender<IndiEvent>,
}

impl SimulatedIndi {
    pub fn new(device: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let sim = Self {
            device: device.to_string(),
            state: Arc::new(Mutex::new(IndiState {
                vectors: BTreeMap::new(),
                exclusive: BTreeSet::from(["CONNECTION".to_string()]),
                connected: false,
                reachable: true,
                connect_attempts: 0,
                sent: Vec::new(),
                delayed_echo: HashMap::new(),
            })),
            events,
        };
        sim.insert(
            "CONNECTION",
            IndiPropertyType::Switch,
            IndiPropertyState::Ok,
            &[("CONNECT", "Off".to_string()), ("DISCONNECT", "On".to_string())],
        );
        Arc::new(sim)
    }

    fn state(&self) -> MutexGuard<'_, IndiState> {
        lock_state(&self.state)
    }

    fn insert(&self, name: &str, kind: IndiPropertyType, state: IndiPropertyState, elements: &[(&str, String)]) {
        let vector = IndiVector {
            device: self.device.clone(),
            name: name.to_string(),
            label: name.to_string(),
            group: "Main".to_string(),
            kind,
            state,
            perm: IndiPermission::ReadWrite,
            elements: elements
                .iter()
                .map(|(n, v)| IndiElement {
                    name: n.to_string(),
                    label: n.to_string(),
                    value: v.clone(),
                })
                .collect(),
        };
        let connected = {
            let mut st = self.state();
            st.vectors.insert(name.to_string(), vector);
            st.connected
        };
        if connected {
            let _ = self.events.send(IndiEvent::PropertyDefined(self.device.clone(), name.to_string(), kind));
        }
    }

    pub fn define_number(&self, name: &str, elements: &[(&str, f64)]) {
        let elements: Vec<_> = elements.iter().map(|(n, v)| (*n, v.to_string())).collect();
        self.insert(name, IndiPropertyType::Number, IndiPropertyState::Ok, &elements);
    }

    pub fn define_switch(&self, name: &str, elements: &[(&str, bool)]) {
        let elements: Vec<_> = elements
            .iter()
            .map(|(n, v)| (*n, if *v { "On" } else { "Off" }.to_string()))
            .collect();
        self.insert(name, IndiPropertyType::Switch, IndiPropertyState::Ok, &elements);
    }

    /// Switch vector where setting one element clears the others
    pub fn define_exclusive(&self, name: &str, elements: &[(&str, bool)]) {
        self.state().exclusive.insert(name.to_string());
        self.define_switch(name, elements);
    }

    pub fn define_text(&self, name: &str, elements: &[(&str, &str)]) {
        let elements: Vec<_> = elements.iter().map(|(n, v)| (*n, v.to_string())).collect();
        self.insert(name, IndiPropertyType::Text, IndiPropertyState::Ok, &elements);
    }

    pub fn define_light(&self, name: &str, elements: &[(&str, &str)]) {
        let elements: Vec<_> = elements.iter().map(|(n, v)| (*n, v.to_string())).collect();
        self.insert(name, IndiPropertyType::Light, IndiPropertyState::Ok, &elements);
    }

    /// Server-side number update with a vector state
    pub fn update_number(&self, name: &str, state: IndiPropertyState, elements: &[(&str, f64)]) {
        apply_numbers(&self.state, &self.events, &self.device, name, state, elements);
    }

    /// Answer writes to a number vector late: the new values arrive with
    /// state Busy after `delay`, and the vector returns to Ok `busy` later.
    pub fn delay_echo(&self, name: &str, delay: Duration, busy: Duration) {
        self.state().delayed_echo.insert(name.to_string(), (delay, busy));
    }

    pub fn delete(&self, name: &str) {
        self.state().vectors.remove(name);
        let _ = self.events.send(IndiEvent::PropertyDeleted(self.device.clone(), name.to_string()));
    }

    pub fn message(&self, text: &str) {
        let _ = self.events.send(IndiEvent::Message {
            device: self.device.clone(),
            message: text.to_string(),
        });
    }

    pub fn push_blob(&self, property: &str, element: &str, data: Vec<u8>) {
        let _ = self.events.send(IndiEvent::BlobReceived(IndiBlob {
            device: self.device.clone(),
            property: property.to_string(),
            element: element.to_string(),
            format: ".fits".to_string(),
            data,
        }));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Every client write as `VECTOR.ELEMENT=value`
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    pub fn number(&self, vector: &str, element: &str) -> Option<f64> {
        self.state().vectors.get(vector).and_then(|v| v.number(element))
    }

    /// Let the adapter's listener drain everything sent so far
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn updated(&self, name: &str) {
        let _ = self.events.send(IndiEvent::PropertyUpdated(self.device.clone(), name.to_string()));
    }

    fn write<T: ToString>(&self, device: &str, property: &str, elements: &[(&str, T)], render: fn(&T) -> String) -> BridgeResult<()> {
        if device != self.device {
            return Err(BridgeError::NotSupported(format!("{}.{}", device, property)));
        }
        let known = {
            let mut st = self.state();
            if !st.connected {
                return Err(BridgeError::NotConnected("INDI server".to_string()));
            }
            for (element, value) in elements {
                st.sent.push(format!("{}.{}={}", property, element, value.to_string()));
            }
            let exclusive = st.exclusive.contains(property);
            match st.vectors.get_mut(property) {
                Some(vector) => {
                    if exclusive {
                        for e in vector.elements.iter_mut() {
                            e.value = "Off".to_string();
                        }
                    }
                    for (element, value) in elements {
                        match vector.elements.iter_mut().find(|e| e.name == *element) {
                            Some(e) => e.value = render(value),
                            None => vector.elements.push(IndiElement {
                                name: element.to_string(),
                                label: element.to_string(),
                                value: render(value),
                            }),
                        }
                    }
                    true
                }
                None => false,
            }
        };
        if known {
            self.updated(property);
        }
        Ok(())
    }
}

#[async_trait]
impl IndiTransport for SimulatedIndi {
    async fn connect(&self, _host: &str, _port: u16) -> BridgeResult<()> {
        {
            let mut st = self.state();
            st.connect_attempts += 1;
            if !st.reachable {
                return Err(BridgeError::Transport("connection refused".to_string()));
            }
            st.connected = true;
        }
        let _ = self.events.send(IndiEvent::ConnectionStateChanged(true));
        Ok(())
    }

    async fn disconnect(&self) {
        let was = std::mem::replace(&mut self.state().connected, false);
        if was {
            let _ = self.events.send(IndiEvent::ConnectionStateChanged(false));
        }
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.events.subscribe()
    }

    async fn watch_device(&self, device: &str) -> BridgeResult<()> {
        if device != self.device {
            return Ok(());
        }
        let defined: Vec<(String, IndiPropertyType)> = {
            let st = self.state();
            if !st.connected {
                return Err(BridgeError::NotConnected("INDI server".to_string()));
            }
            st.vectors.values().map(|v| (v.name.clone(), v.kind)).collect()
        };
        let _ = self.events.send(IndiEvent::DeviceDefined(self.device.clone()));
        for (name, kind) in defined {
            let _ = self.events.send(IndiEvent::PropertyDefined(self.device.clone(), name, kind));
        }
        Ok(())
    }

    async fn vector(&self, device: &str, name: &str) -> Option<IndiVector> {
        let st = self.state();
        if !st.connected || device != self.device {
            return None;
        }
        st.vectors.get(name).cloned()
    }

    async fn devices(&self) -> Vec<String> {
        if self.state().connected {
            vec![self.device.clone()]
        } else {
            Vec::new()
        }
    }

    async fn set_switches(&self, device: &str, property: &str, elements: &[(&str, bool)]) -> BridgeResult<()> {
        self.write(device, property, elements, |v| if *v { "On" } else { "Off" }.to_string())
    }

    async fn set_numbers(&self, device: &str, property: &str, elements: &[(&str, f64)]) -> BridgeResult<()> {
        let echo = self.state().delayed_echo.get(property).copied();
        let Some((delay, busy)) = echo else {
            return self.write(device, property, elements, |v| v.to_string());
        };
        if device != self.device {
            return Err(BridgeError::NotSupported(format!("{}.{}", device, property)));
        }
        {
            let mut st = self.state();
            if !st.connected {
                return Err(BridgeError::NotConnected("INDI server".to_string()));
            }
            for (element, value) in elements {
                st.sent.push(format!("{}.{}={}", property, element, value));
            }
        }
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let device = self.device.clone();
        let property = property.to_string();
        let values: Vec<(String, f64)> = elements.iter().map(|(e, v)| (e.to_string(), *v)).collect();
        tokio::spawn(async move {
            let values: Vec<(&str, f64)> = values.iter().map(|(e, v)| (e.as_str(), *v)).collect();
            tokio::time::sleep(delay).await;
            apply_numbers(&state, &events, &device, &property, IndiPropertyState::Busy, &values);
            tokio::time::sleep(busy).await;
            apply_numbers(&state, &events, &device, &property, IndiPropertyState::Ok, &[]);
        });
        Ok(())
    }

    async fn set_texts(&self, device: &str, property: &str, elements: &[(&str, &str)]) -> BridgeResult<()> {
        self.write(device, property, elements, |v| v.to_string())
    }

    async fn enable_blob(&self, _device: &str, mode: BlobMode) -> BridgeResult<()> {
        self.state().sent.push(format!("BLOB={}", mode.as_str()));
        Ok(())
    }

    async fn probe(&self, _host: &str, _port: u16) -> bool {
        self.state().reachable
    }

    async fn discover(&self, _host: &str, _port: u16, _interface_mask: u32) -> BridgeResult<Vec<String>> {
        if self.state().reachable {
            Ok(vec![self.device.clone()])
        } else {
            Err(BridgeError::Transport("connection refused".to_string()))
        }
    }
}

fn lock_state(state: &Mutex<IndiState>) -> MutexGuard<'_, IndiState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn apply_numbers(
    state: &Mutex<IndiState>,
    events: &broadcast::Sender<IndiEvent>,
    device: &str,
    name: &str,
    vector_state: IndiPropertyState,
    elements: &[(&str, f64)],
) {
    {
        let mut st = lock_state(state);
        let Some(vector) = st.vectors.get_mut(name) else {
            return;
        };
        vector.state = vector_state;
        for (element, value) in elements {
            if let Some(e) = vector.elements.iter_mut().find(|e| e.name == *element) {
                e.value = value.to_string();
            }
        }
    }
    let _ = events.send(IndiEvent::PropertyUpdated(device.to_string(), name.to_string()));
}
