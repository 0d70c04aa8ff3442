//! Telescope (optical tube) metadata

use crate::adapter::{DeviceType, ProtocolAdapter};
use crate::driver_link::{Convert, DriverHooks, DriverTransport, PropertyMap};
use crate::facade::{device_facade, DeviceFacade, DeviceParts};
use crate::indi_link::{IndiHooks, IndiTransport};
use crate::scheduler::PollingScheduler;
use observatory_indi::DriverInterface;
use std::sync::Arc;

pub const APERTURE: &str = "TELESCOPE_INFO.TELESCOPE_APERTURE";
pub const FOCAL_LENGTH: &str = "TELESCOPE_INFO.TELESCOPE_FOCAL_LENGTH";

#[derive(Default)]
pub struct TelescopeIndi;

impl IndiHooks for TelescopeIndi {
    const UPDATE_RATE: u64 = 3000;
    const INTERFACE: u32 = DriverInterface::TELESCOPE;
}

#[derive(Default)]
pub struct TelescopeDriver;

impl DriverHooks for TelescopeDriver {
    // drivers report metres
    const INITIAL: &'static [PropertyMap] = &[
        PropertyMap::new("ApertureDiameter", APERTURE).convert(Convert::MetresToMm),
        PropertyMap::new("FocalLength", FOCAL_LENGTH).convert(Convert::MetresToMm),
    ];
}

pub struct Telescope {
    facade: DeviceFacade<dyn ProtocolAdapter>,
}

device_facade!(Telescope, ProtocolAdapter);

impl Telescope {
    pub fn new(scheduler: PollingScheduler) -> Self {
        Self::from_parts(
            scheduler,
            DeviceParts::indi_transport(),
            DeviceParts::driver_transports(DeviceType::Telescope),
        )
    }

    pub fn from_parts(
        scheduler: PollingScheduler,
        indi: Arc<dyn IndiTransport>,
        drivers: Vec<Arc<dyn DriverTransport>>,
    ) -> Self {
        let parts = DeviceParts::new(DeviceType::Telescope, scheduler);
        let mut adapters: Vec<Arc<dyn ProtocolAdapter>> = vec![Arc::new(parts.indi(indi, TelescopeIndi))];
        for transport in drivers {
            adapters.push(Arc::new(parts.driver(transport, TelescopeDriver)));
        }
        Self {
            facade: parts.into_facade(adapters),
        }
    }

    /// Aperture in millimetres
    pub fn aperture(&self) -> Option<f64> {
        self.data().number(APERTURE)
    }

    /// Focal length in millimetres
    pub fn focal_length(&self) -> Option<f64> {
        self.data().number(FOCAL_LENGTH)
    }
}
