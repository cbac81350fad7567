/*!
 * Beamline Core
 *
 * Shared foundations for beamline control: the single event dispatcher,
 * the poll-with-timeout wait primitive, layered configuration and logging.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;
pub mod wait;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Beamline core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the given configuration
pub fn init(config: &config::Config) -> Result<(), error::Error> {
    logging::init_from_config(&config.logging)?;
    tracing::info!(
        "Beamline Core {} initialized for {}",
        VERSION,
        config.general.beamline
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
