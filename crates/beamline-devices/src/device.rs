/*!
 * Device trait and core device abstractions.
 *
 * A device aggregates channels and child devices behind a small state record
 * (`active`, `busy`, `error`, `message`). `active` is derived: a device is
 * active exactly when none of its components is pending, where a channel is
 * pending while disconnected and a child device while inactive. Every state
 * change is deduplicated and then emitted on the dispatcher.
 */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use beamline_core::config::{Config, SharedConfig};
use beamline_core::event::{Dispatcher, Signal, Signals, SubscriptionId};
use beamline_core::types::Value;

use crate::channel::{Channel, ChannelEvent, ConnectionState};
use crate::devices::automounter::MountRecord;
use crate::devices::goniometer::GonioMode;
use crate::error::Result;
use crate::transport::SharedTransport;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Route value changes of `channel` to a method of its owner
pub(crate) fn on_changed<T, F>(channel: &Channel, owner: &Weak<T>, handler: F) -> SubscriptionId
where
    T: Send + Sync + 'static,
    F: Fn(&Arc<T>, &Value) + Send + Sync + 'static,
{
    let owner = owner.clone();
    channel.subscribe("changed", move |event| {
        if let (Some(owner), ChannelEvent::Changed(value)) = (owner.upgrade(), event) {
            handler(&owner, value);
        }
    })
}

/// Error severity shared by every device type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    /// No problem
    #[default]
    Ok = 0,
    /// Minor, no action needed
    Minor = 1,
    /// Marginal, needs attention soon
    Marginal = 2,
    /// Serious but recoverable
    Serious = 3,
    /// Critical, unrecoverable without intervention
    Critical = 4,
}

impl Severity {
    /// Numeric code (0 to 4)
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Severity for a numeric code; anything above 4 is critical
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Severity::Ok,
            1 => Severity::Minor,
            2 => Severity::Marginal,
            3 => Severity::Serious,
            _ => Severity::Critical,
        }
    }
}

/// Tracks health problems reported by different parts of a device.
///
/// Each context ("active", "status", "calibration", ...) holds at most one
/// entry. The combined health is the worst severity with all messages joined.
#[derive(Debug, Clone, Default)]
pub struct HealthManager {
    entries: BTreeMap<String, (Severity, String)>,
}

impl HealthManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry for a context
    pub fn add(&mut self, severity: Severity, context: &str, message: &str) {
        self.entries
            .insert(context.to_string(), (severity, message.trim().to_string()));
    }

    /// Clear the entry for a context
    pub fn remove(&mut self, context: &str) {
        self.entries.remove(context);
    }

    /// Combined severity and message
    pub fn get(&self) -> (Severity, String) {
        let severity = self
            .entries
            .values()
            .map(|(severity, _)| *severity)
            .max()
            .unwrap_or_default();
        let message = self
            .entries
            .values()
            .filter(|(_, msg)| !msg.is_empty())
            .map(|(_, msg)| msg.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        (severity, message)
    }
}

/// Snapshot of a device's state record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// All components connected
    pub active: bool,
    /// An action is in progress
    pub busy: bool,
    /// Combined health
    pub error: (Severity, String),
    /// Last status message
    pub message: String,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            active: false,
            busy: false,
            error: (Severity::Ok, String::new()),
            message: String::new(),
        }
    }
}

/// Named change events exposed by devices
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// `active` changed
    Active(bool),
    /// `busy` changed
    Busy(bool),
    /// Combined health changed
    Error {
        /// Worst severity
        severity: Severity,
        /// Joined messages
        message: String,
    },
    /// Status message changed
    Message(String),
    /// Primary value changed (motor position, shutter state)
    Changed(Value),
    /// Ready to accept commands (automounter)
    Enabled(bool),
    /// Sample mounted or dismounted (automounter)
    Mounted(Option<MountRecord>),
    /// Fraction of the current operation completed
    Progress(f64),
    /// Operating mode changed (goniometer)
    Mode(GonioMode),
}

impl Signal for DeviceEvent {
    fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Active(_) => "active",
            DeviceEvent::Busy(_) => "busy",
            DeviceEvent::Error { .. } => "error",
            DeviceEvent::Message(_) => "message",
            DeviceEvent::Changed(_) => "changed",
            DeviceEvent::Enabled(_) => "enabled",
            DeviceEvent::Mounted(_) => "mounted",
            DeviceEvent::Progress(_) => "progress",
            DeviceEvent::Mode(_) => "mode",
        }
    }
}

/// What every device needs at construction: the dispatcher, the transport
/// and the configuration
#[derive(Clone, Debug)]
pub struct DeviceContext {
    dispatcher: Dispatcher,
    transport: SharedTransport,
    config: SharedConfig,
}

impl DeviceContext {
    /// Create a new context
    pub fn new(dispatcher: Dispatcher, transport: SharedTransport, config: SharedConfig) -> Self {
        Self {
            dispatcher,
            transport,
            config,
        }
    }

    /// The event dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The control-system transport
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// The configuration
    pub fn config(&self) -> &Config {
        self.config.get()
    }
}

/// State and wiring shared by every device type
pub struct DeviceCore {
    name: String,
    kind: &'static str,
    context: DeviceContext,
    status: Mutex<DeviceStatus>,
    pending: Mutex<BTreeSet<String>>,
    health: Mutex<HealthManager>,
    channels: Mutex<Vec<Arc<Channel>>>,
    children: Mutex<Vec<Weak<DeviceCore>>>,
    signals: Signals<DeviceEvent>,
}

impl Debug for DeviceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCore")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl DeviceCore {
    /// Create the core for a device
    pub fn new(context: &DeviceContext, kind: &'static str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            signals: Signals::new(context.dispatcher().clone()),
            context: context.clone(),
            status: Mutex::new(DeviceStatus::default()),
            pending: Mutex::new(BTreeSet::new()),
            health: Mutex::new(HealthManager::new()),
            channels: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device type name
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Construction context
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Create a channel owned by this device. The channel counts as pending
    /// until it reports connected; call [`DeviceCore::start`] once all
    /// handlers are attached.
    pub fn add_channel(self: &Arc<Self>, name: &str, monitored: bool) -> Arc<Channel> {
        let timeout = Duration::from_millis(self.context.config().channel.get_timeout_ms);
        let channel = Arc::new(Channel::new(
            name,
            monitored,
            self.context.transport().clone(),
            self.context.dispatcher().clone(),
            timeout,
        ));

        let key = format!("pv:{}", name);
        lock(&self.pending).insert(key.clone());

        let weak = Arc::downgrade(self);
        channel.subscribe("connection", move |event| {
            if let (Some(core), ChannelEvent::Connection(state)) = (weak.upgrade(), event) {
                match state {
                    ConnectionState::Connected => core.remove_pending(&key),
                    _ => core.add_pending(&key),
                }
            }
        });

        lock(&self.channels).push(channel.clone());
        channel
    }

    /// Make `child` a component of this device
    pub fn add_child(self: &Arc<Self>, child: &Arc<DeviceCore>) {
        let key = format!("device:{}", child.name());
        let weak = Arc::downgrade(self);
        let active_key = key.clone();
        child.subscribe("active", move |event| {
            if let (Some(core), DeviceEvent::Active(active)) = (weak.upgrade(), event) {
                if *active {
                    core.remove_pending(&active_key);
                } else {
                    core.add_pending(&active_key);
                }
            }
        });

        let weak = Arc::downgrade(self);
        child.subscribe("busy", move |_| {
            if let Some(core) = weak.upgrade() {
                core.update_group_busy();
            }
        });

        if !child.is_active() {
            lock(&self.pending).insert(key);
        }
        lock(&self.children).push(Arc::downgrade(child));
    }

    /// Connect every channel and publish the initial `active` state
    pub fn start(&self) -> Result<()> {
        let channels = lock(&self.channels).clone();
        for channel in channels {
            channel.connect()?;
        }
        self.update_active();
        info!("({}) {} started", self.name, self.kind);
        Ok(())
    }

    fn add_pending(&self, key: &str) {
        if lock(&self.pending).insert(key.to_string()) {
            debug!("({}) component {} inactive", self.name, key);
            self.update_active();
        }
    }

    fn remove_pending(&self, key: &str) {
        if lock(&self.pending).remove(key) {
            debug!("({}) component {} active", self.name, key);
            self.update_active();
        }
    }

    fn update_active(&self) {
        let count = lock(&self.pending).len();
        if count == 0 {
            self.remove_health("active");
        } else {
            self.add_health(
                Severity::Critical,
                "active",
                &format!("[{}] inactive components.", count),
            );
        }
        self.set_active(count == 0);
    }

    fn update_group_busy(&self) {
        let busy = lock(&self.children)
            .iter()
            .filter_map(Weak::upgrade)
            .any(|child| child.is_busy());
        self.set_busy(busy);
    }

    /// Components currently keeping the device inactive
    pub fn pending_components(&self) -> Vec<String> {
        lock(&self.pending).iter().cloned().collect()
    }

    /// Snapshot of the state record
    pub fn status(&self) -> DeviceStatus {
        lock(&self.status).clone()
    }

    /// Whether every component is connected
    pub fn is_active(&self) -> bool {
        lock(&self.status).active
    }

    /// Whether an action is in progress
    pub fn is_busy(&self) -> bool {
        lock(&self.status).busy
    }

    /// Combined health
    pub fn health(&self) -> (Severity, String) {
        lock(&self.status).error.clone()
    }

    /// Last status message
    pub fn message(&self) -> String {
        lock(&self.status).message.clone()
    }

    fn update<T, F>(&self, field: F, value: T) -> bool
    where
        T: PartialEq,
        F: FnOnce(&mut DeviceStatus) -> &mut T,
    {
        let mut status = lock(&self.status);
        let slot = field(&mut status);
        if *slot == value {
            false
        } else {
            *slot = value;
            true
        }
    }

    fn set_active(&self, active: bool) {
        if self.update(|s| &mut s.active, active) {
            if active {
                info!("({}) is now active", self.name);
            } else {
                warn!("({}) is now inactive", self.name);
            }
            self.signals.emit(DeviceEvent::Active(active));
        }
    }

    /// Set `busy`; emits only on change
    pub fn set_busy(&self, busy: bool) {
        if self.update(|s| &mut s.busy, busy) {
            self.signals.emit(DeviceEvent::Busy(busy));
        }
    }

    /// Set the status message; emits only on change
    pub fn set_message<S: Into<String>>(&self, message: S) {
        let message = message.into();
        if self.update(|s| &mut s.message, message.clone()) {
            self.signals.emit(DeviceEvent::Message(message));
        }
    }

    /// Record a health problem for a context
    pub fn add_health(&self, severity: Severity, context: &str, message: &str) {
        let health = {
            let mut manager = lock(&self.health);
            manager.add(severity, context, message);
            manager.get()
        };
        self.set_error(health);
    }

    /// Clear the health problem for a context
    pub fn remove_health(&self, context: &str) {
        let health = {
            let mut manager = lock(&self.health);
            manager.remove(context);
            manager.get()
        };
        self.set_error(health);
    }

    fn set_error(&self, error: (Severity, String)) {
        if self.update(|s| &mut s.error, error.clone()) {
            let (severity, message) = error;
            if severity >= Severity::Serious {
                warn!("({}) health {:?}: {}", self.name, severity, message);
            }
            self.signals.emit(DeviceEvent::Error { severity, message });
        }
    }

    /// Emit a device-specific event without deduplication
    pub fn emit(&self, event: DeviceEvent) {
        self.signals.emit(event);
    }

    /// Attach a handler for a named event
    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.signals.subscribe(event, handler)
    }

    /// Detach a handler
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.signals.unsubscribe(id)
    }

    /// Receive every event of this device
    pub fn watch(&self) -> broadcast::Receiver<DeviceEvent> {
        self.signals.watch()
    }
}

/// The core device trait
pub trait Device: Send + Sync + Debug {
    /// Shared state and wiring
    fn core(&self) -> &Arc<DeviceCore>;

    /// Device name
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Device type name
    fn kind(&self) -> &'static str {
        self.core().kind()
    }

    /// Snapshot of the state record
    fn status(&self) -> DeviceStatus {
        self.core().status()
    }

    /// Whether every component is connected
    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    /// Whether an action is in progress
    fn is_busy(&self) -> bool {
        self.core().is_busy()
    }

    /// Combined health
    fn health(&self) -> (Severity, String) {
        self.core().health()
    }

    /// Attach a handler for a named event
    fn subscribe(&self, event: &str, handler: Box<dyn Fn(&DeviceEvent) + Send + Sync>) -> SubscriptionId {
        self.core().subscribe(event, handler)
    }

    /// Detach a handler
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core().unsubscribe(id)
    }
}

/// A device made only of other devices
#[derive(Debug)]
pub struct DeviceGroup {
    core: Arc<DeviceCore>,
    children: Vec<Arc<dyn Device>>,
}

impl DeviceGroup {
    /// Group `children` under `name`
    pub fn new(context: &DeviceContext, name: &str, children: Vec<Arc<dyn Device>>) -> Result<Arc<Self>> {
        let core = DeviceCore::new(context, "group", name);
        for child in &children {
            core.add_child(child.core());
        }
        core.start()?;
        Ok(Arc::new(Self { core, children }))
    }

    /// Member devices
    pub fn children(&self) -> &[Arc<dyn Device>] {
        &self.children
    }

    /// Member device by name
    pub fn child(&self, name: &str) -> Option<&Arc<dyn Device>> {
        self.children.iter().find(|c| c.name() == name)
    }
}

impl Device for DeviceGroup {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}

#[cfg(all(test, feature = "sim"))]
pub(crate) mod tests {
    use super::*;
    use crate::sim::SimTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn context() -> (DeviceContext, SimTransport) {
        let sim = SimTransport::new();
        let dispatcher = Dispatcher::spawn().unwrap();
        let context = DeviceContext::new(dispatcher, Arc::new(sim.clone()), SharedConfig::default());
        (context, sim)
    }

    fn counter(core: &DeviceCore, event: &str, wanted: DeviceEvent) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        core.subscribe(event, move |e| {
            if *e == wanted {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[test]
    fn test_health_manager() {
        let mut health = HealthManager::new();
        assert_eq!(health.get(), (Severity::Ok, String::new()));
        health.add(Severity::Minor, "notices", "Gripper warm.");
        health.add(Severity::Critical, "status", "Needs Staff Attention.");
        assert_eq!(health.get().0, Severity::Critical);
        assert!(health.get().1.contains("Needs Staff Attention."));
        health.remove("status");
        assert_eq!(health.get(), (Severity::Minor, "Gripper warm.".to_string()));
    }

    #[test]
    fn test_severity_codes() {
        assert_eq!(Severity::Marginal.code(), 2);
        assert_eq!(Severity::from_code(3), Severity::Serious);
        assert_eq!(Severity::from_code(16), Severity::Critical);
    }

    #[tokio::test]
    async fn test_active_tracks_pending_channels() {
        let (context, sim) = context();
        let core = DeviceCore::new(&context, "test", "dev");
        core.add_channel("BL:a", true);
        core.add_channel("BL:b", false);
        let inactive = counter(&core, "active", DeviceEvent::Active(false));

        core.start().unwrap();
        context.dispatcher().flush().await;
        assert!(core.is_active());
        assert!(core.pending_components().is_empty());

        sim.disconnect("BL:a");
        sim.disconnect("BL:a");
        context.dispatcher().flush().await;
        assert!(!core.is_active());
        assert_eq!(inactive.load(Ordering::SeqCst), 1);
        assert_eq!(core.health().0, Severity::Critical);

        sim.reconnect("BL:a");
        context.dispatcher().flush().await;
        assert!(core.is_active());
        assert_eq!(core.health(), (Severity::Ok, String::new()));
    }

    #[tokio::test]
    async fn test_offline_channel_keeps_device_inactive() {
        let (context, sim) = context();
        sim.set_offline("BL:missing");
        let core = DeviceCore::new(&context, "test", "dev");
        core.add_channel("BL:missing", true);
        core.start().unwrap();
        context.dispatcher().flush().await;

        assert!(!core.is_active());
        assert_eq!(core.pending_components(), vec!["pv:BL:missing".to_string()]);
        assert_eq!(core.health().1, "[1] inactive components.");
    }

    #[tokio::test]
    async fn test_set_state_deduplicates() {
        let (context, _) = context();
        let core = DeviceCore::new(&context, "test", "dev");
        let busy = counter(&core, "busy", DeviceEvent::Busy(true));
        let messages = Arc::new(AtomicUsize::new(0));
        let seen = messages.clone();
        core.subscribe("message", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        core.set_busy(true);
        core.set_busy(true);
        core.set_message("Ready.");
        core.set_message("Ready.");
        core.set_message("Moving.");
        context.dispatcher().flush().await;

        assert_eq!(busy.load(Ordering::SeqCst), 1);
        assert_eq!(messages.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_group_follows_children() {
        let (context, sim) = context();
        let child = DeviceCore::new(&context, "test", "child");
        child.add_channel("BL:child:fbk", true);
        child.start().unwrap();

        let group = DeviceCore::new(&context, "group", "parent");
        group.add_child(&child);
        group.start().unwrap();
        context.dispatcher().flush().await;
        assert!(group.is_active());

        sim.disconnect("BL:child:fbk");
        context.dispatcher().flush().await;
        assert!(!child.is_active());
        assert!(!group.is_active());

        child.set_busy(true);
        context.dispatcher().flush().await;
        assert!(group.is_busy());

        sim.reconnect("BL:child:fbk");
        child.set_busy(false);
        context.dispatcher().flush().await;
        assert!(group.is_active());
        assert!(!group.is_busy());
    }

    #[tokio::test]
    async fn test_unsubscribe_through_trait() {
        let (context, _) = context();
        let group = DeviceGroup::new(&context, "empty", Vec::new()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let id = group.subscribe(
            "message",
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(group.unsubscribe(id));
        group.core().set_message("ignored");
        context.dispatcher().flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(group.is_active());
    }
}
