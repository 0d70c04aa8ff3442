//! Weather sensors (INDI weather drivers, observing-conditions devices)

use crate::adapter::{DeviceType, ProtocolAdapter};
use crate::driver_link::{DriverHooks, DriverTransport, PropertyMap};
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiHooks, IndiTransport};
use crate::scheduler::PollingScheduler;
use observatory_indi::DriverInterface;
use std::collections::BTreeMap;
use std::sync::Arc;

const PREFIX: &str = "WEATHER_PARAMETERS.";

#[derive(Default)]
pub struct WeatherIndi;

impl IndiHooks for WeatherIndi {
    const UPDATE_RATE: u64 = 3000;
    const INTERFACE: u32 = DriverInterface::WEATHER;
}

#[derive(Default)]
pub struct WeatherDriver;

impl DriverHooks for WeatherDriver {
    const POLL: &'static [PropertyMap] = &[
        PropertyMap::new("Temperature", "WEATHER_PARAMETERS.WEATHER_TEMPERATURE"),
        PropertyMap::new("Pressure", "WEATHER_PARAMETERS.WEATHER_PRESSURE"),
        PropertyMap::new("Humidity", "WEATHER_PARAMETERS.WEATHER_HUMIDITY"),
        PropertyMap::new("DewPoint", "WEATHER_PARAMETERS.WEATHER_DEWPOINT"),
        PropertyMap::new("CloudCover", "WEATHER_PARAMETERS.WEATHER_CLOUD_COVER"),
        PropertyMap::new("RainRate", "WEATHER_PARAMETERS.WEATHER_RAIN_RATE"),
        PropertyMap::new("WindSpeed", "WEATHER_PARAMETERS.WEATHER_WIND_SPEED"),
        PropertyMap::new("WindDirection", "WEATHER_PARAMETERS.WEATHER_WIND_DIRECTION"),
        PropertyMap::new("SkyBrightness", "WEATHER_PARAMETERS.WEATHER_SKY_BRIGHTNESS"),
        PropertyMap::new("SkyTemperature", "WEATHER_PARAMETERS.WEATHER_SKY_TEMPERATURE"),
    ];
}

pub struct Weather {
    facade: DeviceFacade<dyn ProtocolAdapter>,
}

device_facade!(Weather, ProtocolAdapter);

impl Weather {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Weather),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Weather, scheduler);
        let mut adapters: Vec<Arc<dyn ProtocolAdapter>> = vec![Arc::new(parts.indi(indi, WeatherIndi))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, WeatherDriver)));
        }
        Self {
            facade: parts.into_facade(adapters),
        }
    }

    /// Current numeric readings keyed by parameter name
    pub fn parameters(&self) -> BTreeMap<String, f64> {
        self.data()
            .snapshot()
            .into_iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(PREFIX)?;
                Some((name.to_string(), value.as_f64()?))
            })
            .collect()
    }
}
