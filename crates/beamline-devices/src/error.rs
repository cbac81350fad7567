/*!
 * Error types for device operations.
 */
use thiserror::Error;

use beamline_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The channel is not connected
    #[error("Channel not connected: {0}")]
    NotConnected(String),

    /// The device did not become ready for a command in time
    #[error("Not ready: {0}")]
    NotReady(String),

    /// A dismount was requested with nothing mounted
    #[error("No sample to dismount")]
    NoSampleToDismount,

    /// The device is in an invalid state for the operation
    #[error("Invalid device state: {0}")]
    InvalidState(String),

    /// An argument (port id, mode, value) is not valid for the device
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Hardware-reported text could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Device construction or wiring error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new invalid state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidState(msg.as_ref().to_string())
    }

    /// Create a new not-ready error
    pub fn not_ready<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::NotReady(msg.as_ref().to_string())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidArgument(msg.as_ref().to_string())
    }

    /// Create a new parse error
    pub fn parse<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Parse(msg.as_ref().to_string())
    }

    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Transport(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Configuration(msg.as_ref().to_string())
    }
}
