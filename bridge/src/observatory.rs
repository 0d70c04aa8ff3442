//! Observatory context
//!
//! Owns one facade per device type, all sharing a single polling scheduler,
//! and moves their configuration to and from a [`ConfigStore`].

use crate::adapter::{DeviceType, ProtocolAdapter};
use crate::config::{ConfigStore, DeviceConfig};
use crate::devices::{Camera, Cover, Dome, FilterWheel, Focuser, Power, Telescope, Weather};
use crate::error::BridgeResult;
use crate::facade::DeviceFacade;
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// What the observatory needs of a facade regardless of its device type
#[async_trait]
trait ManagedDevice: Send + Sync {
    fn apply(&self, config: &DeviceConfig) -> bool;

    fn config(&self) -> DeviceConfig;

    async fn stop(&self) -> bool;
}

#[async_trait]
impl<A: ProtocolAdapter + ?Sized> ManagedDevice for DeviceFacade<A> {
    fn apply(&self, config: &DeviceConfig) -> bool {
        self.apply_config(config)
    }

    fn config(&self) -> DeviceConfig {
        self.current_config()
    }

    async fn stop(&self) -> bool {
        self.stop_communication().await
    }
}

pub struct Observatory {
    scheduler: PollingScheduler,
    store: Arc<dyn ConfigStore>,
    camera: Camera,
    cover: Cover,
    dome: Dome,
    filterwheel: FilterWheel,
    focuser: Focuser,
    telescope: Telescope,
    weather: Weather,
    power: Power,
}

impl Observatory {
    /// Build every facade and apply the stored configuration
    pub fn new(scheduler: PollingScheduler, store: Arc<dyn ConfigStore>) -> Self {
        let observatory = Self {
            camera: Camera::new(scheduler.clone()),
            cover: Cover::new(scheduler.clone()),
            dome: Dome::new(scheduler.clone()),
            filterwheel: FilterWheel::new(scheduler.clone()),
            focuser: Focuser::new(scheduler.clone()),
            telescope: Telescope::new(scheduler.clone()),
            weather: Weather::new(scheduler.clone()),
            power: Power::new(scheduler.clone()),
            scheduler,
            store,
        };
        observatory.load_config();
        observatory
    }

    fn devices(&self) -> [(DeviceType, &dyn ManagedDevice); 8] {
        [
            (DeviceType::Camera, &*self.camera),
            (DeviceType::Cover, &*self.cover),
            (DeviceType::Dome, &*self.dome),
            (DeviceType::FilterWheel, &*self.filterwheel),
            (DeviceType::Focuser, &*self.focuser),
            (DeviceType::Telescope, &*self.telescope),
            (DeviceType::Weather, &*self.weather),
            (DeviceType::Power, &*self.power),
        ]
    }

    /// Apply the stored configuration of every device type; missing entries keep the defaults
    pub fn load_config(&self) -> bool {
        let mut ok = true;
        for (device_type, device) in self.devices() {
            let Some(config) = self.store.load(device_type.as_str()) else {
                continue;
            };
            if !device.apply(&config) {
                tracing::warn!("[{}] stored configuration partly rejected", device_type);
                ok = false;
            }
        }
        ok
    }

    /// Write the current configuration of every device back to the store
    pub fn save_config(&self) -> BridgeResult<()> {
        for (device_type, device) in self.devices() {
            self.store.save(device_type.as_str(), &device.config())?;
        }
        tracing::debug!("Observatory configuration saved");
        Ok(())
    }

    /// Current configuration of one device type
    pub fn device_config(&self, device_type: DeviceType) -> DeviceConfig {
        self.devices()
            .into_iter()
            .find(|(t, _)| *t == device_type)
            .map(|(_, device)| device.config())
            .unwrap_or_default()
    }

    /// Stop every device; true when all of them stopped cleanly
    pub async fn shutdown(&self) -> bool {
        let devices = self.devices();
        let results = join_all(devices.iter().map(|(_, device)| device.stop())).await;
        tracing::info!("Observatory shut down");
        results.into_iter().all(|stopped| stopped)
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn cover(&self) -> &Cover {
        &self.cover
    }

    pub fn dome(&self) -> &Dome {
        &self.dome
    }

    pub fn filterwheel(&self) -> &FilterWheel {
        &self.filterwheel
    }

    pub fn focuser(&self) -> &Focuser {
        &self.focuser
    }

    pub fn telescope(&self) -> &Telescope {
        &self.telescope
    }

    pub fn weather(&self) -> &Weather {
        &self.weather
    }

    pub fn power(&self) -> &Power {
        &self.power
    }
}
