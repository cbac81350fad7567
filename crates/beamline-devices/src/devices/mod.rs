/*!
 * Beamline device implementations.
 */

pub mod automounter;
pub mod detector;
pub mod goniometer;
pub mod motor;
pub mod shutter;

pub use automounter::{Automounter, AutomounterState, MountRecord, PortId, PortState};
pub use detector::{Detector, DetectorParameters};
pub use goniometer::{classify, GonioFeedback, GonioMode, Goniometer};
pub use motor::Motor;
pub use shutter::Shutter;
