//! Device facades for the eight device types
//!
//! Each device defines an adapter trait extending [`ProtocolAdapter`] with its
//! operations, INDI and driver hooks implementing the protocol specifics, and
//! a wrapper struct that dereferences to its [`DeviceFacade`].
//!
//! [`ProtocolAdapter`]: crate::adapter::ProtocolAdapter
//! [`DeviceFacade`]: crate::facade::DeviceFacade

pub mod camera;
pub mod cover;
pub mod dome;
pub mod filterwheel;
pub mod focuser;
pub mod power;
pub mod telescope;
pub mod weather;

pub use camera::{Camera, CameraAdapter, ExposureCallback, ExposureParams, ExposureRequest, SubFrame};
pub use cover::{Cover, CoverAdapter};
pub use dome::{Dome, DomeAdapter};
pub use filterwheel::{FilterWheel, FilterWheelAdapter};
pub use focuser::{Focuser, FocuserAdapter};
pub use power::{DewPort, Power, PowerAdapter};
pub use telescope::Telescope;
pub use weather::Weather;

use crate::adapter::AdapterCore;
use crate::error::{BridgeError, BridgeResult};
use crate::event::DeviceSignal;

/// Emit `Result{success}` for a finished command
pub(crate) fn report_result(core: &AdapterCore, operation: &str, result: BridgeResult<bool>) {
    let success = match result {
        Ok(success) => success,
        Err(BridgeError::Cancelled(_)) => {
            tracing::debug!("[{}] {} cancelled", core.device_type(), operation);
            return;
        }
        Err(e) => {
            tracing::warn!("[{}] {} failed: {}", core.device_type(), operation, e);
            false
        }
    };
    core.emit(DeviceSignal::Result { success });
}

/// Log a command that was refused before reaching the device
pub(crate) fn refused(core: &AdapterCore, operation: &str) -> bool {
    tracing::debug!(
        "[{} {}] {} ignored: device not connected",
        core.framework(),
        core.device_type(),
        operation
    );
    false
}
