/*!
 * Sample-mounting robot.
 *
 * The automounter moves samples between the dewar and the goniometer. Its
 * feedback arrives on a set of monitored channels: the container status
 * string, robot state words, the mounted-port record, tool position and the
 * needs/reason bitmasks. Commands are parameter writes followed by an
 * operation trigger.
 *
 * Mount and dismount wait first for the endstation to report enabled, then
 * track the robot through the wait primitive. Progress is reported as the
 * fraction of tool positions seen against a per-operation budget.
 */
mod container;
mod needs;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use beamline_core::config::AutomounterConfig;
use beamline_core::types::Value;
use beamline_core::utils::{format_sentences, spawn_and_log};
use beamline_core::wait::{wait_for, wait_until, StopSignal, WaitOptions};

use crate::channel::Channel;
use crate::device::{lock, on_changed, Device, DeviceContext, DeviceCore, DeviceEvent, Severity};
use crate::error::{DeviceError, Result};

pub use container::{
    parse_states, Container, ContainerType, Containers, Location, PortId, PortSample, PortState,
    SEGMENT_LENGTH, STATUS_LENGTH,
};
pub use needs::{decode, format_needs, format_reasons, NEEDS, REASONS};

/// Robot states that never count as busy
const IDLE_STATES: [&str; 2] = ["robot_standby", "idle"];

/// What the automounter is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AutomounterState {
    /// Waiting for a command
    Idle,
    /// Rescanning the dewar
    Probing,
    /// Mounting a sample
    Mounting,
    /// Returning a sample to the dewar
    Dismounting,
}

/// The sample currently on the goniometer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Port the sample came from
    pub port: PortId,
    /// Barcode read while mounting, empty when unread
    pub barcode: String,
}

#[derive(Debug, Default)]
struct Progress {
    steps: u32,
    budget: u32,
}

/// Automounter device
pub struct Automounter {
    core: Arc<DeviceCore>,
    config: AutomounterConfig,

    state_fbk: Arc<Channel>,
    normal: Arc<Channel>,
    user_enable: Arc<Channel>,
    mount_enabled: Arc<Channel>,
    robot_busy: Arc<Channel>,
    mounted_fbk: Arc<Channel>,
    barcode: Arc<Channel>,

    mount_cmd: Arc<Channel>,
    mount_param: Arc<Channel>,
    dismount_cmd: Arc<Channel>,
    dismount_param: Arc<Channel>,
    mount_next_cmd: Arc<Channel>,
    abort_cmd: Arc<Channel>,
    wash_param: Arc<Channel>,
    barcode_reset: Arc<Channel>,
    probe_param: Arc<Channel>,
    probe_cmd: Arc<Channel>,

    containers: RwLock<Containers>,
    mounted: Mutex<Option<MountRecord>>,
    enabled: AtomicBool,
    /// Last command issued, cleared when the robot goes idle
    command: Mutex<Option<AutomounterState>>,
    /// The robot went busy after the last command
    command_seen: AtomicBool,
    progress: Mutex<Progress>,
    last_warning: Mutex<String>,
}

impl fmt::Debug for Automounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Automounter")
            .field("name", &self.core.name())
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .field("mounted", &self.mounted())
            .finish()
    }
}

impl Automounter {
    /// Create an automounter rooted at `pv`
    pub fn new(context: &DeviceContext, name: &str, pv: &str) -> Result<Arc<Self>> {
        let core = DeviceCore::new(context, "automounter", name);
        let config = context.config().automounter.clone();
        let monitor = |suffix: &str| core.add_channel(&format!("{}:{}", pv, suffix), true);
        let command = |suffix: &str| core.add_channel(&format!("{}:{}", pv, suffix), false);

        let automounter = Arc::new_cyclic(|weak: &Weak<Automounter>| {
            let ports = monitor("cassette:fbk");
            let message = monitor("sample:msg");
            let warning = monitor("status:warning");
            let state_fbk = monitor("status:state");
            let normal = monitor("mod:normal");
            let user_enable = monitor("mnt:usrEnable");
            let gonio_safe = monitor("goniPos:mntEn");
            let mounted_fbk = monitor("status:mounted");
            let position = monitor("state:curPnt");
            let mount_enabled = monitor("mntEn");
            let robot_busy = monitor("sample:sts");
            let needs = monitor("status:needs");
            let reason = monitor("status:reason");
            let barcode = monitor("bcode:barcode");

            on_changed(&ports, weak, |am: &Arc<Automounter>, value| am.on_ports(value));
            on_changed(&message, weak, |am: &Arc<Automounter>, value| am.on_message(value));
            on_changed(&warning, weak, |am: &Arc<Automounter>, value| am.on_warning(value));
            on_changed(&gonio_safe, weak, |am: &Arc<Automounter>, value| am.on_safety(value));
            on_changed(&mounted_fbk, weak, |am: &Arc<Automounter>, value| am.on_mounted(value));
            on_changed(&position, weak, |am: &Arc<Automounter>, _| am.on_position());
            on_changed(&needs, weak, |am: &Arc<Automounter>, value| am.on_needs(value));
            on_changed(&reason, weak, |am: &Arc<Automounter>, value| am.on_reason(value));
            for channel in [&state_fbk, &normal, &user_enable, &mount_enabled, &robot_busy] {
                on_changed(channel, weak, |am: &Arc<Automounter>, _| am.on_state_changed());
            }

            Automounter {
                core: core.clone(),
                config,
                state_fbk,
                normal,
                user_enable,
                mount_enabled,
                robot_busy,
                mounted_fbk,
                barcode,
                mount_cmd: command("mntX:opr"),
                mount_param: command("mntX:param"),
                dismount_cmd: command("dismntX:opr"),
                dismount_param: command("dismntX:param"),
                mount_next_cmd: command("mntNextX:opr"),
                abort_cmd: command("abort:opr"),
                wash_param: command("washX:param"),
                barcode_reset: command("bcode:clear"),
                probe_param: command("probe:wvParam"),
                probe_cmd: command("probe:opr"),
                containers: RwLock::new(Containers::default()),
                mounted: Mutex::new(None),
                enabled: AtomicBool::new(false),
                command: Mutex::new(None),
                command_seen: AtomicBool::new(false),
                progress: Mutex::new(Progress::default()),
                last_warning: Mutex::new(String::new()),
            }
        });
        automounter.core.start()?;
        Ok(automounter)
    }

    fn on_ports(&self, value: &Value) {
        let Some(text) = value.as_str() else {
            return;
        };
        match parse_states(text) {
            Ok(containers) => {
                if let Ok(mut current) = self.containers.write() {
                    *current = containers;
                }
                debug!("({}) container states updated", self.name());
            }
            Err(e) => warn!("({}) ignoring container states: {}", self.name(), e),
        }
    }

    fn on_message(&self, value: &Value) {
        let text = value.as_str().unwrap_or_default().trim();
        let message = if text == "done" {
            "Ready.".to_string()
        } else {
            format_sentences(text)
        };
        self.core.set_message(message);
    }

    fn on_warning(&self, value: &Value) {
        let text = value.as_str().unwrap_or_default().trim();
        if text.is_empty() {
            lock(&self.last_warning).clear();
            self.core.remove_health("notices");
            return;
        }
        let warning = format_sentences(text);
        let mut last = lock(&self.last_warning);
        if *last != warning {
            warn!("({}) {}", self.name(), warning);
            self.core.add_health(Severity::Minor, "notices", &warning);
            *last = warning;
        }
    }

    fn on_state_changed(&self) {
        let state = self.state_fbk.value().unwrap_or_default();
        let Some(state) = state.as_str().and_then(|s| s.split_whitespace().next()) else {
            return;
        };
        let normal = self.normal.value().ok().and_then(|v| v.as_integer());
        let user_enable = self.user_enable.value().ok().and_then(|v| v.as_integer());
        let mount_enabled = self.mount_enabled.value().ok().and_then(|v| v.as_integer());
        let robot_busy = self.robot_busy.value().ok().and_then(|v| v.as_integer());

        let mut severity = Severity::Ok;
        let mut messages = Vec::new();
        if normal.map_or(false, |n| n != 0) {
            severity = severity.max(Severity::Critical);
            messages.push("Needs Staff Attention.");
        }
        if user_enable == Some(0) {
            severity = severity.max(Severity::Serious);
            messages.push("Disabled by staff.");
        }
        if severity == Severity::Ok {
            self.core.remove_health("status");
        } else {
            self.core.add_health(severity, "status", &messages.join(" "));
        }

        let busy = !IDLE_STATES.contains(&state) && robot_busy == Some(1);
        if busy {
            if lock(&self.command).is_some() {
                self.command_seen.store(true, Ordering::SeqCst);
            }
        } else {
            lock(&self.command).take();
        }
        self.core.set_busy(busy);
        self.set_enabled(mount_enabled == Some(1));
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!("({}) enabled={}", self.name(), enabled);
            self.core.emit(DeviceEvent::Enabled(enabled));
        }
    }

    fn on_safety(self: &Arc<Self>, value: &Value) {
        if self.is_busy() && value.as_integer() != Some(1) {
            warn!("({}) endstation became unsafe while automounter was busy", self.name());
            let automounter = self.clone();
            spawn_and_log("automounter-abort", async move { automounter.abort().await });
        }
    }

    fn on_mounted(&self, value: &Value) {
        let port = value.as_str().and_then(PortId::from_param);
        let mut mounted = lock(&self.mounted);
        if mounted.as_ref().map(|m| &m.port) == port.as_ref() {
            return;
        }
        let record = port.map(|port| MountRecord {
            port,
            barcode: self
                .barcode
                .value()
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        });
        match &record {
            Some(record) => info!("({}) mounted port={} barcode={}", self.name(), record.port, record.barcode),
            None => info!("({}) sample dismounted", self.name()),
        }
        *mounted = record.clone();
        drop(mounted);
        self.core.emit(DeviceEvent::Mounted(record));
    }

    fn on_position(&self) {
        let fraction = {
            let mut progress = lock(&self.progress);
            if progress.budget == 0 {
                return;
            }
            progress.steps += 1;
            (f64::from(progress.steps) / f64::from(progress.budget)).min(1.0)
        };
        self.core.emit(DeviceEvent::Progress(fraction));
    }

    /// Status bitmask carried by `value`; an empty record means no bits
    fn bitmask(&self, kind: &str, value: &Value) -> Option<u32> {
        let raw = value.as_integer().unwrap_or(0);
        match u32::try_from(raw) {
            Ok(mask) => Some(mask),
            Err(_) => {
                warn!("({}) ignoring out of range {} mask {}", self.name(), kind, raw);
                None
            }
        }
    }

    fn on_needs(&self, value: &Value) {
        let Some(mask) = self.bitmask("needs", value) else {
            return;
        };
        let message = format_needs(&decode(mask, &NEEDS));
        if message.is_empty() {
            self.core.remove_health("needs");
        } else {
            self.core.add_health(Severity::Marginal, "needs", &message);
        }
    }

    fn on_reason(&self, value: &Value) {
        let Some(mask) = self.bitmask("reason", value) else {
            return;
        };
        let reasons = decode(mask, &REASONS);
        if reasons.is_empty() {
            self.core.remove_health("reason");
        } else {
            let message = format_sentences(&format_reasons(&reasons));
            self.core.add_health(Severity::Critical, "reason", &message);
        }
    }

    fn begin(&self, command: AutomounterState, budget: u32) {
        *lock(&self.progress) = Progress { steps: 0, budget };
        *lock(&self.command) = Some(command);
        self.command_seen.store(false, Ordering::SeqCst);
        self.core.emit(DeviceEvent::Progress(0.0));
    }

    async fn wait_for_enable(&self) -> bool {
        wait_until(
            "automounter enable",
            || self.is_enabled(),
            Duration::from_millis(self.config.enable_poll_ms),
            self.config.enable_timeout(),
            None,
        )
        .await
    }

    fn mounted_param(&self) -> String {
        self.mounted_fbk
            .value()
            .ok()
            .and_then(|v| v.as_str().map(|s| s.trim().to_string()))
            .unwrap_or_default()
    }

    /// Mount the sample at `port`, optionally washing it. Dismounts any
    /// other mounted sample in the same operation. Does nothing when `port`
    /// is already mounted.
    ///
    /// With `wait`, returns whether `port` ended up mounted.
    pub async fn mount(&self, port: &str, wash: bool, wait: bool) -> Result<bool> {
        let port: PortId = port.parse()?;
        if !self.wait_for_enable().await {
            warn!("({}) mount requested while disabled", self.name());
            self.core.set_message("Mounting Failed. Endstation was not ready.");
            return Err(DeviceError::not_ready("Mounting Failed. Endstation was not ready."));
        }

        let param = port.to_param();
        self.wash_param.set(if wash { "1" } else { "0" }).await?;
        self.barcode_reset.set(1).await?;

        let current = self.mounted_param();
        if current == param {
            info!("({}) sample at {} already mounted", self.name(), port);
            self.core.set_message("Sample already mounted.");
            return Ok(true);
        }

        if current.is_empty() {
            self.mount_param.set(param.as_str()).await?;
            self.begin(AutomounterState::Mounting, self.config.mount_steps);
            self.mount_cmd.set(1).await?;
        } else {
            self.dismount_param.set(current.as_str()).await?;
            self.mount_param.set(param.as_str()).await?;
            self.begin(AutomounterState::Mounting, self.config.mount_next_steps);
            self.mount_next_cmd.set(1).await?;
        }
        info!("({}) mount command: {}", self.name(), port);

        if !wait {
            return Ok(true);
        }
        let success = self.wait(None).await && self.is_mounted(Some(&port.to_string()));
        if !success {
            warn!("({}) mount of {} failed", self.name(), port);
            self.core.set_message("Mounting failed!");
        }
        Ok(success)
    }

    /// Return the mounted sample to `port`, or to the port it came from.
    ///
    /// With `wait`, returns whether the goniometer ended up empty.
    pub async fn dismount(&self, port: Option<&str>, wait: bool) -> Result<bool> {
        if !self.wait_for_enable().await {
            warn!("({}) dismount requested while disabled", self.name());
            self.core.set_message("Dismount failed. Endstation was not ready.");
            return Err(DeviceError::not_ready("Dismount failed. Endstation was not ready."));
        }

        let port = match port {
            Some(port) => Some(port.parse::<PortId>()?),
            None => self
                .mounted()
                .map(|record| record.port)
                .or_else(|| PortId::from_param(&self.mounted_param())),
        };
        let Some(port) = port else {
            self.core.set_message("No sample to dismount");
            return Err(DeviceError::NoSampleToDismount);
        };

        self.dismount_param.set(port.to_param()).await?;
        self.begin(AutomounterState::Dismounting, self.config.dismount_steps);
        self.dismount_cmd.set(1).await?;
        info!("({}) dismount command: {}", self.name(), port);

        if !wait {
            return Ok(true);
        }
        let success = self.wait(None).await && self.mounted().is_none();
        if !success {
            warn!("({}) dismount to {} failed", self.name(), port);
            self.core.set_message("Dismounting Failed!");
        }
        Ok(success)
    }

    /// Ask the robot to rescan every port. Does not wait for the scan.
    pub async fn probe(&self) -> Result<bool> {
        if !self.wait_for_enable().await {
            warn!("({}) probe requested while disabled", self.name());
            return Err(DeviceError::not_ready("Probe failed. Endstation was not ready."));
        }
        self.probe_param.set("1".repeat(STATUS_LENGTH)).await?;
        self.begin(AutomounterState::Probing, 0);
        self.probe_cmd.set(1).await?;
        info!("({}) probe command", self.name());
        Ok(true)
    }

    /// Abort the current operation
    pub async fn abort(&self) -> Result<()> {
        warn!("({}) aborting", self.name());
        self.abort_cmd.set(1).await
    }

    /// Wait for the current operation to start and finish
    pub async fn wait(&self, cancel: Option<&StopSignal>) -> bool {
        let options = WaitOptions::new(
            Duration::from_millis(self.config.poll_ms),
            Duration::from_millis(self.config.timeout_ms),
        )
        .with_start_timeout(Duration::from_millis(self.config.start_timeout_ms));
        let started = || self.command_seen.load(Ordering::SeqCst) || self.is_busy();
        wait_for(self.name(), started, || self.is_busy(), &options, cancel).await
    }

    /// Current operation
    pub fn state(&self) -> AutomounterState {
        if !self.is_busy() {
            return AutomounterState::Idle;
        }
        let command = *lock(&self.command);
        command.unwrap_or(AutomounterState::Mounting)
    }

    /// Whether the endstation accepts commands
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The mounted sample, if any
    pub fn mounted(&self) -> Option<MountRecord> {
        lock(&self.mounted).clone()
    }

    /// Whether `port` is mounted; with no port, whether anything is
    pub fn is_mounted(&self, port: Option<&str>) -> bool {
        let mounted = lock(&self.mounted);
        match (port, mounted.as_ref()) {
            (None, record) => record.is_some(),
            (Some(port), Some(record)) => port
                .parse::<PortId>()
                .map_or(false, |port| port == record.port),
            (Some(_), None) => false,
        }
    }

    /// Whether `port` was marked mountable by the last probe
    pub fn is_mountable(&self, port: &str) -> bool {
        port.parse::<PortId>()
            .ok()
            .and_then(|port| self.port_state(&port))
            .map_or(false, PortState::is_mountable)
    }

    /// State of a port; `None` when the port does not exist
    pub fn port_state(&self, port: &PortId) -> Option<PortState> {
        self.containers
            .read()
            .ok()
            .and_then(|containers| containers.port_state(port))
    }

    /// Snapshot of all containers
    pub fn containers(&self) -> Containers {
        self.containers
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl Device for Automounter {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::device::tests::context;
    use crate::sim::{simulate_automounter, SimTransport};
    use std::sync::atomic::AtomicUsize;

    async fn automounter() -> (Arc<Automounter>, DeviceContext, SimTransport) {
        let (context, sim) = context();
        simulate_automounter(&sim, "BL:sam");
        let automounter = Automounter::new(&context, "automounter", "BL:sam").unwrap();
        context.dispatcher().flush().await;
        (automounter, context, sim)
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (am, _, _) = automounter().await;
        assert!(am.is_active());
        assert!(am.is_enabled());
        assert_eq!(am.state(), AutomounterState::Idle);
        assert!(am.mounted().is_none());
        assert!(am.is_mountable("LA1"));
        assert!(!am.is_mountable("LA2"));
        assert!(am.is_mountable("MA1"));
        assert!(!am.is_mountable("MA2"));
        assert!(!am.is_mountable("RA1"));
        assert!(!am.is_mountable("LE1"));
        assert!(!am.is_mountable("nonsense"));
    }

    #[test_log::test(tokio::test)]
    async fn test_mount_and_dismount() {
        let (am, context, sim) = automounter().await;
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        am.core().subscribe("progress", move |event| {
            if let DeviceEvent::Progress(p) = event {
                seen.lock().unwrap().push(*p);
            }
        });

        assert!(am.mount("LA1", false, true).await.unwrap());
        context.dispatcher().flush().await;
        assert!(am.is_mounted(Some("LA1")));
        assert!(am.is_mounted(None));
        assert_eq!(am.mounted().unwrap().barcode, "CLS0001");
        assert_eq!(sim.writes_to("BL:sam:mntX:param"), vec![Value::from("l 1 A")]);
        assert_eq!(sim.writes_to("BL:sam:washX:param"), vec![Value::from("0")]);
        assert_eq!(sim.writes_to("BL:sam:bcode:clear"), vec![Value::from(1)]);
        assert_eq!(am.core().message(), "Ready.");
        assert_eq!(
            *progress.lock().unwrap(),
            vec![0.0, 1.0 / 26.0, 2.0 / 26.0, 3.0 / 26.0]
        );

        assert!(am.dismount(None, true).await.unwrap());
        assert!(am.mounted().is_none());
        assert_eq!(sim.writes_to("BL:sam:dismntX:param"), vec![Value::from("l 1 A")]);
    }

    #[tokio::test]
    async fn test_mount_next_when_occupied() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:status:mounted", "l 1 A");
        context.dispatcher().flush().await;

        assert!(am.mount("MB2", true, true).await.unwrap());
        assert_eq!(sim.writes_to("BL:sam:dismntX:param"), vec![Value::from("l 1 A")]);
        assert_eq!(sim.writes_to("BL:sam:mntX:param"), vec![Value::from("m 2 B")]);
        assert_eq!(sim.writes_to("BL:sam:mntNextX:opr"), vec![Value::from(1)]);
        assert!(sim.writes_to("BL:sam:mntX:opr").is_empty());
        assert_eq!(sim.writes_to("BL:sam:washX:param"), vec![Value::from("1")]);
        assert!(am.is_mounted(Some("MB2")));
    }

    #[tokio::test]
    async fn test_mount_already_mounted_issues_no_command() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:status:mounted", "l 1 A");
        context.dispatcher().flush().await;
        sim.clear_writes();

        assert!(am.mount("LA1", false, true).await.unwrap());
        assert!(sim.writes_to("BL:sam:mntX:opr").is_empty());
        assert!(sim.writes_to("BL:sam:mntNextX:opr").is_empty());
        context.dispatcher().flush().await;
        assert_eq!(am.core().message(), "Sample already mounted.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_fails_when_not_enabled() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:mntEn", 0);
        context.dispatcher().flush().await;

        let begin = tokio::time::Instant::now();
        let err = am.mount("LA1", false, true).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotReady(_)));
        assert!(begin.elapsed() >= Duration::from_secs(20));
        context.dispatcher().flush().await;
        assert_eq!(am.core().message(), "Mounting Failed. Endstation was not ready.");
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_dismount_without_sample() {
        let (am, context, sim) = automounter().await;
        let err = am.dismount(None, true).await.unwrap_err();
        assert!(matches!(err, DeviceError::NoSampleToDismount));
        context.dispatcher().flush().await;
        assert_eq!(am.core().message(), "No sample to dismount");
        assert!(sim.writes_to("BL:sam:dismntX:opr").is_empty());
    }

    #[tokio::test]
    async fn test_probe_writes_full_pattern() {
        let (am, _, sim) = automounter().await;
        assert!(am.probe().await.unwrap());
        let pattern = sim.writes_to("BL:sam:probe:wvParam");
        assert_eq!(pattern.len(), 1);
        assert_eq!(pattern[0].as_str().map(str::len), Some(STATUS_LENGTH));
        assert!(pattern[0].as_str().unwrap().chars().all(|c| c == '1'));
        assert_eq!(sim.writes_to("BL:sam:probe:opr"), vec![Value::from(1)]);
    }

    #[tokio::test]
    async fn test_malformed_status_keeps_containers() {
        let (am, context, sim) = automounter().await;
        let before = am.containers();
        sim.set_value("BL:sam:cassette:fbk", "31uuu");
        context.dispatcher().flush().await;
        assert_eq!(am.containers(), before);
        assert!(am.is_mountable("LA1"));
    }

    #[tokio::test]
    async fn test_status_health() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:mod:normal", 1);
        sim.set_value("BL:sam:mnt:usrEnable", 0);
        context.dispatcher().flush().await;
        let (severity, message) = am.health();
        assert_eq!(severity, Severity::Critical);
        assert!(message.contains("Needs Staff Attention."));
        assert!(message.contains("Disabled by staff."));

        sim.set_value("BL:sam:mod:normal", 0);
        context.dispatcher().flush().await;
        assert_eq!(am.health(), (Severity::Serious, "Disabled by staff.".to_string()));

        sim.set_value("BL:sam:mnt:usrEnable", 1);
        sim.set_value("BL:sam:status:needs", 1 | 4 | 16);
        context.dispatcher().flush().await;
        assert_eq!(
            am.health(),
            (Severity::Marginal, "Needs staff inspection, calibration".to_string())
        );

        sim.set_value("BL:sam:status:needs", 0);
        sim.set_value("BL:sam:status:reason", 8192);
        context.dispatcher().flush().await;
        assert_eq!(am.health(), (Severity::Critical, "Gripper jam.".to_string()));
    }

    #[test_log::test(tokio::test)]
    async fn test_out_of_range_masks_are_ignored() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:status:needs", 2);
        context.dispatcher().flush().await;
        assert_eq!(am.health(), (Severity::Marginal, "Needs reset".to_string()));

        // Would truncate to bit 1 as a u32
        sim.set_value("BL:sam:status:needs", (1i64 << 32) | 1);
        sim.set_value("BL:sam:status:reason", -1i64);
        context.dispatcher().flush().await;
        assert_eq!(am.health(), (Severity::Marginal, "Needs reset".to_string()));
    }

    #[tokio::test]
    async fn test_messages_are_formatted() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:sample:msg", "MOVING TO PORT. please wait");
        context.dispatcher().flush().await;
        assert_eq!(am.core().message(), "Moving to port. Please wait.");

        sim.set_value("BL:sam:status:warning", "lid open");
        context.dispatcher().flush().await;
        assert_eq!(am.health(), (Severity::Minor, "Lid open.".to_string()));
        sim.set_value("BL:sam:status:warning", "");
        context.dispatcher().flush().await;
        assert_eq!(am.health().0, Severity::Ok);
    }

    #[tokio::test]
    async fn test_busy_follows_robot_state() {
        let (am, context, sim) = automounter().await;
        let enabled = Arc::new(AtomicUsize::new(0));
        let seen = enabled.clone();
        am.core().subscribe("enabled", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        sim.set_value("BL:sam:sample:sts", 1);
        context.dispatcher().flush().await;
        assert!(!am.is_busy());

        sim.set_value("BL:sam:status:state", "mounting");
        context.dispatcher().flush().await;
        assert!(am.is_busy());

        sim.set_value("BL:sam:status:state", "robot_standby");
        sim.set_value("BL:sam:mntEn", 0);
        context.dispatcher().flush().await;
        assert!(!am.is_busy());
        assert!(!am.is_enabled());
        assert_eq!(enabled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsafe_goniometer_aborts_busy_robot() {
        let (am, context, sim) = automounter().await;
        sim.set_value("BL:sam:sample:sts", 1);
        sim.set_value("BL:sam:status:state", "mounting");
        context.dispatcher().flush().await;
        assert!(am.is_busy());

        sim.set_value("BL:sam:goniPos:mntEn", 0);
        context.dispatcher().flush().await;
        let aborted = wait_until(
            "abort",
            || !sim.writes_to("BL:sam:abort:opr").is_empty(),
            Duration::from_millis(5),
            Duration::from_secs(1),
            None,
        )
        .await;
        assert!(aborted);
    }
}
