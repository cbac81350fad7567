/*!
 * Beamline context.
 *
 * Holds the devices the automation layer drives, found by conventional
 * names in a [`DeviceRegistry`], together with the single coarse lock that
 * serializes sample mounting, centring and data collection.
 */
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::info;

use beamline_core::config::Config;
use beamline_devices::devices::{Automounter, Detector, Goniometer, Motor, Shutter};
use beamline_devices::registry::{DeviceRegistry, DeviceRegistryBuilder, DeviceSpec};
use beamline_devices::DeviceContext;

use crate::error::Result;

/// Registry names the context looks up
pub mod names {
    /// Energy motor
    pub const ENERGY: &str = "energy";
    /// Detector distance motor
    pub const DISTANCE: &str = "distance";
    /// Exposure shutter
    pub const SHUTTER: &str = "shutter";
    /// Area detector
    pub const DETECTOR: &str = "detector";
    /// Goniometer
    pub const GONIOMETER: &str = "goniometer";
    /// Sample automounter
    pub const AUTOMOUNTER: &str = "automounter";
}

/// The devices of one beamline and the lock guarding them
pub struct Beamline {
    name: String,
    context: DeviceContext,
    registry: DeviceRegistry,
    lock: Arc<Mutex<()>>,
    /// Energy motor
    pub energy: Arc<Motor>,
    /// Detector distance motor
    pub distance: Arc<Motor>,
    /// Exposure shutter
    pub shutter: Arc<Shutter>,
    /// Area detector
    pub detector: Arc<Detector>,
    /// Goniometer
    pub goniometer: Arc<Goniometer>,
    /// Sample automounter
    pub automounter: Arc<Automounter>,
}

impl fmt::Debug for Beamline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beamline")
            .field("name", &self.name)
            .field("devices", &self.registry.names())
            .finish()
    }
}

impl Beamline {
    /// Take the standard devices out of an already built registry
    pub fn from_registry(name: &str, context: DeviceContext, registry: DeviceRegistry) -> Result<Arc<Self>> {
        let beamline = Self {
            name: name.to_string(),
            energy: registry.get(names::ENERGY)?,
            distance: registry.get(names::DISTANCE)?,
            shutter: registry.get(names::SHUTTER)?,
            detector: registry.get(names::DETECTOR)?,
            goniometer: registry.get(names::GONIOMETER)?,
            automounter: registry.get(names::AUTOMOUNTER)?,
            lock: Arc::new(Mutex::new(())),
            context,
            registry,
        };
        info!("Beamline {} ready with {} devices", beamline.name, beamline.registry.len());
        Ok(Arc::new(beamline))
    }

    /// Build the registry from `specs` with the standard device types
    pub fn build(name: &str, context: DeviceContext, specs: &[DeviceSpec]) -> Result<Arc<Self>> {
        let registry = DeviceRegistryBuilder::new()
            .with_standard_types()
            .build(&context, specs)?;
        Self::from_registry(name, context, registry)
    }

    /// Beamline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared device context
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Configuration the devices were built with
    pub fn config(&self) -> &Config {
        self.context.config()
    }

    /// Every device by name
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Wait for exclusive use of the beamline
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Exclusive use of the beamline that can outlive the borrow
    pub async fn lock_owned(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    /// Whether something holds the beamline
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Register the calling worker with the transport
    pub fn register_worker(&self) -> Result<()> {
        self.context.transport().register_worker()?;
        Ok(())
    }
}

#[cfg(feature = "sim")]
pub use self::simulated::{simulated, STANDARD_DEVICES};

#[cfg(feature = "sim")]
mod simulated {
    use std::sync::Arc;

    use beamline_core::config::{Config, SharedConfig};
    use beamline_core::event::Dispatcher;
    use beamline_devices::registry::parse_specs;
    use beamline_devices::sim::{
        simulate_automounter, simulate_detector, simulate_goniometer, simulate_motor,
        simulate_shutter, SimTransport,
    };
    use beamline_devices::DeviceContext;

    use super::Beamline;
    use crate::error::Result;

    /// Device list for a simulated beamline
    pub const STANDARD_DEVICES: &str = r#"[
        {"name": "energy", "type": "Motor", "args": {"pv": "SIM:energy", "precision": 0.001}},
        {"name": "distance", "type": "Motor", "args": {"pv": "SIM:distance", "precision": 0.01}},
        {"name": "shutter", "type": "Shutter", "args": {"pv": "SIM:shutter"}},
        {"name": "detector", "type": "Detector", "args": {"pv": "SIM:det"}},
        {"name": "goniometer", "type": "Goniometer", "args": {"pv": "SIM:gonio"}},
        {"name": "automounter", "type": "Automounter", "args": {"pv": "SIM:sam"}},
        {"name": "endstation", "type": "DeviceGroup", "args": {"devices": ["goniometer", "automounter"]}}
    ]"#;

    /// A beamline whose devices answer from an in-memory transport. Must be
    /// called inside a tokio runtime.
    pub fn simulated(config: Config) -> Result<(Arc<Beamline>, SimTransport)> {
        let sim = SimTransport::new();
        simulate_motor(&sim, "SIM:energy", 12.658);
        simulate_motor(&sim, "SIM:distance", 250.0);
        simulate_shutter(&sim, "SIM:shutter");
        simulate_detector(&sim, "SIM:det");
        simulate_goniometer(&sim, "SIM:gonio");
        simulate_automounter(&sim, "SIM:sam");

        let name = config.general.beamline.clone();
        let dispatcher = Dispatcher::spawn()?;
        let context = DeviceContext::new(dispatcher, Arc::new(sim.clone()), SharedConfig::new(config));
        let beamline = Beamline::build(&name, context, &parse_specs(STANDARD_DEVICES)?)?;
        Ok((beamline, sim))
    }
}
