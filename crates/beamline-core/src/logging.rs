/*!
 * Logging setup for beamline control.
 *
 * Installs a `tracing` subscriber filtered by `RUST_LOG` or the configured
 * level, and provides span helpers so device and procedure logs can be told
 * apart.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "beamline_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true)
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.with_target)
}

fn install(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for a device
///
/// # Arguments
///
/// * `kind` - The device type (e.g. "automounter")
/// * `name` - The device name
pub fn component_span(kind: &str, name: &str) -> Span {
    tracing::info_span!("device", kind = %kind, name = %name)
}

/// Create a span for a high-level procedure (collection, mount, centering)
pub fn operation_span(name: &str, target: &str) -> Span {
    tracing::info_span!("operation", name = %name, target = %target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails_cleanly() {
        let _ = init();
        assert!(matches!(init_with_filter("debug"), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_spans() {
        let span = component_span("motor", "energy");
        assert!(span.is_none() || span.id().is_some());
        let span = operation_span("collect", "run-1");
        assert!(span.is_none() || span.id().is_some());
    }
}
