/*!
 * Beamline Engine
 *
 * The automation layer on top of the beamline devices: the beamline context
 * and its lock, frame list generation, the data collection run loop and
 * sample transfer automation.
 */

#![warn(missing_docs)]

// Re-export core types
pub use beamline_core::prelude;

// Re-export types from beamline_core for convenience
pub use beamline_core::types::{Id, Value};

pub mod automation;
pub mod collection;
pub mod context;
pub mod error;
pub mod runlist;

// Re-export main types for convenience
pub use automation::{
    center_sample, dismount_sample, mount_sample, AutomationEvent, Automator, Sample, Task,
};
pub use collection::{CollectionEvent, DataCollector, RunOutcome};
pub use context::Beamline;
pub use error::{CenteringError, CollectionError, Error, MountError, Result};
pub use runlist::{generate_frames, Energy, Frame, RunParameters};

/// Beamline engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("Beamline Engine {} initialized", VERSION);
    Ok(())
}
