/*!
 * Beamline Devices
 *
 * Process-variable channels, the device model with health and status
 * aggregation, and the beamline devices built on it: motors, shutters,
 * the detector, the sample automounter and the goniometer.
 */

#![warn(missing_docs)]

// Re-export core types
pub use beamline_core::prelude;

pub mod channel;
pub mod device;
pub mod devices;
pub mod error;
pub mod registry;
pub mod transport;

#[cfg(feature = "sim")]
pub mod sim;

pub use channel::{Channel, ChannelEvent, ConnectionState};
pub use device::{
    Device, DeviceContext, DeviceCore, DeviceEvent, DeviceGroup, DeviceStatus, HealthManager,
    Severity,
};
pub use error::{DeviceError, Result};
pub use registry::{DeviceRegistry, DeviceRegistryBuilder, DeviceSpec};
pub use transport::{SharedTransport, Transport, TransportEvent};

/// Beamline devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), beamline_core::error::Error> {
    tracing::info!("Beamline Devices {} initialized", VERSION);
    Ok(())
}

/// Device types known to [`DeviceRegistryBuilder::with_standard_types`]
pub fn available_device_types() -> Vec<&'static str> {
    vec![
        "Motor",
        "Shutter",
        "Detector",
        "Automounter",
        "Goniometer",
        "DeviceGroup",
    ]
}
