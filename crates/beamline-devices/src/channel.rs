/*!
 * Named hardware read/write points.
 *
 * A `Channel` wraps one process variable: it tracks the connection state,
 * caches the last monitored value and fans changes out to subscribers. All
 * transport notifications are moved onto the dispatcher before they touch the
 * channel, so subscribers observe a single ordered stream per channel.
 */
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use beamline_core::event::{Dispatcher, Signal, Signals, SubscriptionId};
use beamline_core::types::Value;
use beamline_core::utils::with_timeout;

use crate::error::{DeviceError, Result};
use crate::transport::{SharedTransport, TransportEvent, TransportSink};

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never asked to connect
    NeverConnected,
    /// Waiting for the server
    Connecting,
    /// Connected and usable
    Connected,
    /// The server went away; a reconnect follows automatically
    Closed,
}

/// Notification delivered to channel subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The connection state changed
    Connection(ConnectionState),
    /// A new value was received
    Changed(Value),
}

impl Signal for ChannelEvent {
    fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Connection(_) => "connection",
            ChannelEvent::Changed(_) => "changed",
        }
    }
}

struct ChannelShared {
    name: String,
    state: RwLock<ConnectionState>,
    value: RwLock<Option<Value>>,
    signals: Signals<ChannelEvent>,
}

impl ChannelShared {
    fn update_state(&self, state: ConnectionState) -> bool {
        match self.state.write() {
            Ok(mut current) if *current != state => {
                *current = state;
                true
            }
            _ => false,
        }
    }

    // Runs on the dispatcher. Subscribers are called before the next
    // transport event is applied, so the cache they read matches the event.
    fn apply(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                debug!("({}) connected", self.name);
                self.apply_state(ConnectionState::Connected);
            }
            TransportEvent::Disconnected => {
                warn!("({}) disconnected", self.name);
                self.apply_state(ConnectionState::Closed);
                self.apply_state(ConnectionState::Connecting);
            }
            TransportEvent::Value(value) => {
                if let Ok(mut cached) = self.value.write() {
                    *cached = Some(value.clone());
                }
                self.signals.deliver_now(ChannelEvent::Changed(value));
            }
        }
    }

    fn apply_state(&self, state: ConnectionState) {
        if self.update_state(state) {
            self.signals.deliver_now(ChannelEvent::Connection(state));
        }
    }
}

/// A named process variable owned by one device
pub struct Channel {
    monitored: bool,
    get_timeout: Duration,
    transport: SharedTransport,
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("monitored", &self.monitored)
            .finish()
    }
}

impl Channel {
    /// Create a channel; nothing is sent to the transport until [`Channel::connect`]
    pub fn new(
        name: &str,
        monitored: bool,
        transport: SharedTransport,
        dispatcher: Dispatcher,
        get_timeout: Duration,
    ) -> Self {
        Self {
            monitored,
            get_timeout,
            transport,
            shared: Arc::new(ChannelShared {
                name: name.to_string(),
                state: RwLock::new(ConnectionState::NeverConnected),
                value: RwLock::new(None),
                signals: Signals::new(dispatcher),
            }),
        }
    }

    /// Process variable name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether value updates are pushed by the transport
    pub fn is_monitored(&self) -> bool {
        self.monitored
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared
            .state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Whether the channel is usable
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start connecting. Calling this on a channel that already connected
    /// once is a no-op.
    pub fn connect(&self) -> Result<()> {
        if self.state() != ConnectionState::NeverConnected {
            return Ok(());
        }
        if self.shared.update_state(ConnectionState::Connecting) {
            self.shared
                .signals
                .emit(ChannelEvent::Connection(ConnectionState::Connecting));
        }

        let weak: Weak<ChannelShared> = Arc::downgrade(&self.shared);
        let dispatcher = self.shared.signals.dispatcher().clone();
        let sink: TransportSink = Arc::new(move |event| {
            let weak = weak.clone();
            dispatcher.post(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.apply(event);
                }
            });
        });

        self.transport.connect(self.name(), self.monitored, sink)
    }

    /// Cached value. Fails with `NotConnected` while disconnected.
    pub fn value(&self) -> Result<Value> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name().to_string()));
        }
        Ok(self
            .shared
            .value
            .read()
            .ok()
            .and_then(|v| v.clone())
            .unwrap_or(Value::Null))
    }

    /// Read the channel. Monitored channels answer from the cache; others
    /// do a bounded round-trip.
    pub async fn get(&self) -> Result<Value> {
        if self.monitored {
            return self.value();
        }
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name().to_string()));
        }
        with_timeout(self.get_timeout, self.transport.read(self.name())).await
    }

    /// Write the channel
    pub async fn set<V: Into<Value>>(&self, value: V) -> Result<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name().to_string()));
        }
        let value = value.into();
        debug!("({}) <- {}", self.name(), value);
        self.transport.write(self.name(), value).await
    }

    /// Attach a handler for "connection" or "changed" events
    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.shared.signals.subscribe(event, handler)
    }

    /// Detach a handler
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.signals.unsubscribe(id)
    }

    /// Receive every event for this channel
    pub fn watch(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.signals.watch()
    }
}
