/*!
 * In-memory transport for simulation and tests.
 *
 * `SimTransport` keeps every process variable in a map. Values can be pushed
 * from the outside to mimic hardware feedback, variables can be dropped and
 * restored, and write hooks let a test stand in for controller logic (a
 * setpoint write that starts a motion, a mount command that moves the robot).
 */
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, trace};

use beamline_core::types::Value;

use crate::error::{DeviceError, Result};
use crate::transport::{Transport, TransportEvent, TransportSink};

/// Hook run after a write to a simulated variable
pub type WriteHook = Arc<dyn Fn(&SimTransport, &Value) + Send + Sync>;

struct SimVariable {
    value: Value,
    connected: bool,
    sinks: Vec<(bool, TransportSink)>,
}

impl SimVariable {
    fn new(connected: bool) -> Self {
        Self {
            value: Value::Null,
            connected,
            sinks: Vec::new(),
        }
    }
}

#[derive(Default)]
struct SimState {
    variables: Mutex<HashMap<String, SimVariable>>,
    offline: Mutex<HashSet<String>>,
    hooks: Mutex<HashMap<String, WriteHook>>,
    writes: Mutex<Vec<(String, Value)>>,
    workers: AtomicUsize,
}

/// In-memory transport. Clones share the same variables.
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<SimState>,
}

impl fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimTransport")
            .field("workers", &self.worker_registrations())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimTransport {
    /// Create an empty simulation
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a value as if the hardware reported it
    pub fn set_value<V: Into<Value>>(&self, channel: &str, value: V) {
        let value = value.into();
        trace!("sim {} <- {}", channel, value);
        let sinks = {
            let mut variables = lock(&self.state.variables);
            let connected = !lock(&self.state.offline).contains(channel);
            let variable = variables
                .entry(channel.to_string())
                .or_insert_with(|| SimVariable::new(connected));
            variable.value = value.clone();
            if variable.connected {
                variable
                    .sinks
                    .iter()
                    .filter(|(monitor, _)| *monitor)
                    .map(|(_, sink)| sink.clone())
                    .collect()
            } else {
                Vec::new()
            }
        };
        for sink in sinks {
            sink(TransportEvent::Value(value.clone()));
        }
    }

    /// Current simulated value
    pub fn value(&self, channel: &str) -> Option<Value> {
        lock(&self.state.variables).get(channel).map(|v| v.value.clone())
    }

    /// Mark a variable as unreachable before anything connects to it
    pub fn set_offline(&self, channel: &str) {
        lock(&self.state.offline).insert(channel.to_string());
    }

    /// Drop the server side of a variable
    pub fn disconnect(&self, channel: &str) {
        self.set_connected(channel, false);
    }

    /// Restore the server side of a variable; monitored clients receive the
    /// current value again
    pub fn reconnect(&self, channel: &str) {
        lock(&self.state.offline).remove(channel);
        self.set_connected(channel, true);
    }

    fn set_connected(&self, channel: &str, connected: bool) {
        let (sinks, value) = {
            let mut variables = lock(&self.state.variables);
            let variable = variables
                .entry(channel.to_string())
                .or_insert_with(|| SimVariable::new(!connected));
            variable.connected = connected;
            (variable.sinks.clone(), variable.value.clone())
        };
        debug!("sim {} connected={}", channel, connected);
        for (monitor, sink) in sinks {
            if connected {
                sink(TransportEvent::Connected);
                if monitor {
                    sink(TransportEvent::Value(value.clone()));
                }
            } else {
                sink(TransportEvent::Disconnected);
            }
        }
    }

    /// Run `hook` after every write to `channel`
    pub fn on_write<F>(&self, channel: &str, hook: F)
    where
        F: Fn(&SimTransport, &Value) + Send + Sync + 'static,
    {
        lock(&self.state.hooks).insert(channel.to_string(), Arc::new(hook));
    }

    /// Every write seen so far, in order
    pub fn writes(&self) -> Vec<(String, Value)> {
        lock(&self.state.writes).clone()
    }

    /// Values written to one variable, in order
    pub fn writes_to(&self, channel: &str) -> Vec<Value> {
        lock(&self.state.writes)
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        lock(&self.state.writes).clear();
    }

    /// How many workers registered with the transport
    pub fn worker_registrations(&self) -> usize {
        self.state.workers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn register_worker(&self) -> Result<()> {
        self.state.workers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&self, channel: &str, monitor: bool, sink: TransportSink) -> Result<()> {
        let (connected, value) = {
            let mut variables = lock(&self.state.variables);
            let online = !lock(&self.state.offline).contains(channel);
            let variable = variables
                .entry(channel.to_string())
                .or_insert_with(|| SimVariable::new(online));
            variable.sinks.push((monitor, sink.clone()));
            (variable.connected, variable.value.clone())
        };
        if connected {
            sink(TransportEvent::Connected);
            if monitor {
                sink(TransportEvent::Value(value));
            }
        }
        Ok(())
    }

    async fn read(&self, channel: &str) -> Result<Value> {
        match lock(&self.state.variables).get(channel) {
            Some(variable) if variable.connected => Ok(variable.value.clone()),
            _ => Err(DeviceError::NotConnected(channel.to_string())),
        }
    }

    async fn write(&self, channel: &str, value: Value) -> Result<()> {
        let connected = lock(&self.state.variables)
            .get(channel)
            .map_or(false, |v| v.connected);
        if !connected {
            return Err(DeviceError::NotConnected(channel.to_string()));
        }

        lock(&self.state.writes).push((channel.to_string(), value.clone()));
        self.set_value(channel, value.clone());

        let hook = lock(&self.state.hooks).get(channel).cloned();
        if let Some(hook) = hook {
            hook(self, &value);
        }
        Ok(())
    }
}

// Simulated controllers. Each one seeds the feedback variables a device
// reads at startup and installs write hooks that answer commands
// immediately.

/// A motor at `position` that reaches every setpoint at once
pub fn simulate_motor(sim: &SimTransport, pv: &str, position: f64) {
    let fbk = format!("{}:fbk", pv);
    let moving = format!("{}:moving", pv);
    sim.set_value(&fbk, position);
    sim.set_value(&moving, 0);
    sim.set_value(&format!("{}:calibrated", pv), 1);
    sim.on_write(&format!("{}:sp", pv), move |sim, value| {
        sim.set_value(&moving, 1);
        sim.set_value(&fbk, value.clone());
        sim.set_value(&moving, 0);
    });
}

/// A closed shutter
pub fn simulate_shutter(sim: &SimTransport, pv: &str) {
    let state = format!("{}:state", pv);
    sim.set_value(&state, 0);
    let opened = state.clone();
    sim.on_write(&format!("{}:opr:open", pv), move |sim, _| sim.set_value(&opened, 1));
    sim.on_write(&format!("{}:opr:close", pv), move |sim, _| sim.set_value(&state, 0));
}

/// A detector that stays busy from `acquire` until `save`
pub fn simulate_detector(sim: &SimTransport, pv: &str) {
    let state = format!("{}:state", pv);
    sim.set_value(&state, 0);
    let armed = state.clone();
    sim.on_write(&format!("{}:acquire", pv), move |sim, _| sim.set_value(&armed, 1));
    sim.on_write(&format!("{}:save", pv), move |sim, _| sim.set_value(&state, 0));
}

const GONIO_PHASES: [(&str, &str); 4] = [
    ("mode:mounting.PROC", "mode:mounting:fbk"),
    ("mode:centering.PROC", "mode:centering:fbk"),
    ("mode:collect.PROC", "mode:collect:fbk"),
    ("beam:check.PROC", "beam:check:fbk"),
];

/// A calibrated goniometer that switches phases and scans instantly
pub fn simulate_goniometer(sim: &SimTransport, pv: &str) {
    let name = |suffix: &str| format!("{}:{}", pv, suffix);
    for (_, flag) in GONIO_PHASES {
        sim.set_value(&name(flag), 0);
    }
    sim.set_value(&name("mode:moving:fbk"), 0);
    sim.set_value(&name("scanFrame:status"), 0);
    sim.set_value(&name("mode:calibrated:fbk"), 1);

    for (command, flag) in GONIO_PHASES {
        let pv = pv.to_string();
        sim.on_write(&name(command), move |sim, _| {
            let moving = format!("{}:mode:moving:fbk", pv);
            sim.set_value(&moving, 1);
            for (_, other) in GONIO_PHASES {
                sim.set_value(&format!("{}:{}", pv, other), i32::from(other == flag));
            }
            sim.set_value(&moving, 0);
        });
    }

    let status = name("scanFrame:status");
    sim.on_write(&name("scanFrame.PROC"), move |sim, _| {
        sim.set_value(&status, 1);
        sim.set_value(&status, 0);
    });
}

/// Port states for a puck adapter on the left, a cassette in the middle and
/// a calibration cassette on the right
pub fn sample_cassette_status() -> String {
    let mut left = String::from("3");
    left.push_str("1j");
    left.push_str(&"u".repeat(62));
    left.push_str(&"-".repeat(32));

    let mut middle = String::from("1");
    middle.push('m');
    middle.push_str(&"0".repeat(7));
    middle.push_str(&"1".repeat(88));

    let mut right = String::from("2");
    right.push_str(&"b".repeat(96));

    format!("{}\n{}  {}", left, middle, right)
}

/// An enabled, idle robot loaded with [`sample_cassette_status`]. Every
/// operation finishes immediately, stepping the tool through three points.
pub fn simulate_automounter(sim: &SimTransport, pv: &str) {
    let name = |suffix: &str| format!("{}:{}", pv, suffix);
    sim.set_value(&name("cassette:fbk"), sample_cassette_status());
    sim.set_value(&name("status:state"), "idle");
    sim.set_value(&name("mod:normal"), 0);
    sim.set_value(&name("mnt:usrEnable"), 1);
    sim.set_value(&name("mntEn"), 1);
    sim.set_value(&name("sample:sts"), 0);
    sim.set_value(&name("goniPos:mntEn"), 1);
    sim.set_value(&name("status:mounted"), "");
    sim.set_value(&name("state:curPnt"), "P0");
    sim.set_value(&name("bcode:barcode"), "CLS0001");
    sim.set_value(&name("status:needs"), 0);
    sim.set_value(&name("status:reason"), 0);

    let run = {
        let pv = pv.to_string();
        move |sim: &SimTransport, mounted: String| {
            let name = |suffix: &str| format!("{}:{}", pv, suffix);
            sim.set_value(&name("status:state"), "busy");
            sim.set_value(&name("sample:sts"), 1);
            for point in ["P1", "P2", "P3"] {
                sim.set_value(&name("state:curPnt"), point);
            }
            sim.set_value(&name("status:mounted"), mounted);
            sim.set_value(&name("sample:sts"), 0);
            sim.set_value(&name("status:state"), "idle");
            sim.set_value(&name("sample:msg"), "done");
        }
    };

    for command in ["mntX:opr", "mntNextX:opr"] {
        let mount = run.clone();
        let param = name("mntX:param");
        sim.on_write(&name(command), move |sim, _| {
            let target = sim.value(&param).unwrap_or_default().to_string();
            mount(sim, target);
        });
    }
    sim.on_write(&name("dismntX:opr"), move |sim, _| run(sim, String::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (TransportSink, Arc<Mutex<Vec<TransportEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        let sink: TransportSink = Arc::new(move |event| seen.lock().unwrap().push(event));
        (sink, events)
    }

    #[tokio::test]
    async fn test_connect_reports_value() {
        let sim = SimTransport::new();
        sim.set_value("BL:energy:fbk", 12.658);
        let (sink, events) = recorder();
        sim.connect("BL:energy:fbk", true, sink).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![TransportEvent::Connected, TransportEvent::Value(Value::Float(12.658))]
        );
    }

    #[tokio::test]
    async fn test_offline_and_reconnect() {
        let sim = SimTransport::new();
        sim.set_offline("BL:shutter:state");
        let (sink, events) = recorder();
        sim.connect("BL:shutter:state", false, sink).unwrap();
        assert!(events.lock().unwrap().is_empty());
        assert!(sim.read("BL:shutter:state").await.is_err());

        sim.reconnect("BL:shutter:state");
        assert_eq!(*events.lock().unwrap(), vec![TransportEvent::Connected]);
        sim.disconnect("BL:shutter:state");
        assert_eq!(events.lock().unwrap().last(), Some(&TransportEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_write_records_and_runs_hook() {
        let sim = SimTransport::new();
        let (sink, _) = recorder();
        sim.connect("BL:mntX:opr", false, sink).unwrap();
        sim.on_write("BL:mntX:opr", |sim, _| sim.set_value("BL:sample:sts", 1));

        sim.write("BL:mntX:opr", Value::from(1)).await.unwrap();

        assert_eq!(sim.writes_to("BL:mntX:opr"), vec![Value::from(1)]);
        assert_eq!(sim.value("BL:sample:sts"), Some(Value::from(1)));
        sim.clear_writes();
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_to_unknown_variable_fails() {
        let sim = SimTransport::new();
        assert!(matches!(
            sim.write("BL:nothing", Value::from(1)).await,
            Err(DeviceError::NotConnected(_))
        ));
    }

    #[test]
    fn test_worker_registration() {
        let sim = SimTransport::new();
        sim.register_worker().unwrap();
        sim.register_worker().unwrap();
        assert_eq!(sim.worker_registrations(), 2);
    }
}
