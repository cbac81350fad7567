/*!
 * Prelude module for beamline core.
 *
 * Re-exports commonly used types and functions.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Value};

// Re-export event types
pub use crate::event::{Dispatcher, Signal, Signals, SubscriptionId};

// Re-export the wait primitive
pub use crate::wait::{cancellable_sleep, wait_for, wait_until, StopSignal, WaitOptions};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{format_sentences, spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
