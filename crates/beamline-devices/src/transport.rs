/*!
 * The seam between devices and the control-system transport.
 *
 * A transport exposes named process variables with get/set/subscribe
 * semantics. It reports connection changes and monitored value updates
 * through a sink; it may call the sink from its own I/O thread. Channels
 * forward everything they receive onto the dispatcher.
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use beamline_core::types::Value;

use crate::error::Result;

/// Notification from the transport about a single process variable
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server side of the variable became reachable
    Connected,
    /// The server side of the variable went away
    Disconnected,
    /// A monitored value update
    Value(Value),
}

/// Callback through which a transport reports events for one variable
pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Transport trait for control-system access
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Get the transport name
    fn name(&self) -> &'static str;

    /// Attach the calling worker to the transport's I/O context.
    ///
    /// Every worker entry point calls this before touching a channel.
    fn register_worker(&self) -> Result<()>;

    /// Start connecting to a variable.
    ///
    /// Returns immediately; connection changes and, when `monitor` is set,
    /// value updates are reported through `sink` in the order the server
    /// produced them.
    fn connect(&self, channel: &str, monitor: bool, sink: TransportSink) -> Result<()>;

    /// Read a variable with a round-trip to the server
    async fn read(&self, channel: &str) -> Result<Value>;

    /// Write a variable
    async fn write(&self, channel: &str, value: Value) -> Result<()>;
}

/// A shared transport handle
pub type SharedTransport = Arc<dyn Transport>;
