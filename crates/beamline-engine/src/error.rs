/*!
 * Error types for the beamline engine crate.
 */
use thiserror::Error;

use beamline_devices::DeviceError;

/// Sample transfer failures
#[derive(Error, Debug)]
pub enum MountError {
    /// The port holds nothing the robot can pick up
    #[error("Port {0} is not mountable")]
    NotMountable(String),

    /// The robot finished without the sample on the goniometer
    #[error("Mounting {0} failed")]
    Failed(String),

    /// The goniometer is still holding a sample
    #[error("Dismounting failed")]
    DismountFailed,

    /// The goniometer did not reach the required mode
    #[error("Goniometer did not switch to {0} mode")]
    Goniometer(String),

    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Sample centring failures
#[derive(Error, Debug)]
pub enum CenteringError {
    /// Nothing mounted at the expected port
    #[error("Sample not mounted: {0}")]
    NotMounted(String),

    /// The goniometer did not reach centring mode
    #[error("Goniometer did not switch to centering mode")]
    ModeChange,

    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Data collection failures
#[derive(Error, Debug)]
pub enum CollectionError {
    /// A run is already in progress on this collector
    #[error("Data collection already running")]
    AlreadyRunning,

    /// Some motors did not finish moving
    #[error("Motion timed out: {0}")]
    Motion(String),

    /// The goniometer did not reach collect mode
    #[error("Goniometer did not switch to collect mode")]
    ModeChange,

    /// The exposure did not complete
    #[error("Exposure failed for frame {0}")]
    Exposure(String),

    /// Position outside the frame list
    #[error("Position {position} outside frame list of {total}")]
    InvalidPosition {
        /// Requested position
        position: usize,
        /// Number of frames
        total: usize,
    },

    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Error type for beamline engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Mount error
    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    /// Centering error
    #[error("Centering error: {0}")]
    Centering(#[from] CenteringError),

    /// Collection error
    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] beamline_core::error::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for beamline engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
