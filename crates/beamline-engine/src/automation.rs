/*!
 * Sample automation.
 *
 * The transfer procedures ([`mount_sample`], [`dismount_sample`],
 * [`center_sample`]) take the beamline lock for their duration and drive
 * the goniometer into the right mode around each robot operation.
 *
 * An [`Automator`] runs a task list on every sample in turn.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn, Instrument};

use beamline_core::event::{Signal, Signals, SubscriptionId};
use beamline_core::logging::operation_span;
use beamline_core::types::Id;
use beamline_core::wait::{cancellable_sleep, StopSignal};
use beamline_devices::devices::{GonioMode, PortId};

use crate::collection::{DataCollector, RunOutcome};
use crate::context::Beamline;
use crate::error::{CenteringError, Error, MountError, Result};
use crate::runlist::RunParameters;

/// Mount the sample at `port` and leave the goniometer ready for centring
pub async fn mount_sample(beamline: &Beamline, port: &str, wash: bool) -> std::result::Result<(), MountError> {
    let _guard = beamline.lock().await;
    let automounter = &beamline.automounter;
    if !automounter.is_mounted(Some(port)) && !automounter.is_mountable(port) {
        return Err(MountError::NotMountable(port.to_string()));
    }
    if !beamline.goniometer.set_mode(GonioMode::Mounting, true).await? {
        return Err(MountError::Goniometer(GonioMode::Mounting.to_string()));
    }
    if !automounter.mount(port, wash, true).await? {
        warn!("Sample mounting failed");
        return Err(MountError::Failed(port.to_string()));
    }
    info!("Sample mounting succeeded");
    if !beamline.goniometer.set_mode(GonioMode::Centering, true).await? {
        return Err(MountError::Goniometer(GonioMode::Centering.to_string()));
    }
    Ok(())
}

/// Return the mounted sample to its port
pub async fn dismount_sample(beamline: &Beamline) -> std::result::Result<(), MountError> {
    let _guard = beamline.lock().await;
    if !beamline.goniometer.set_mode(GonioMode::Mounting, true).await? {
        return Err(MountError::Goniometer(GonioMode::Mounting.to_string()));
    }
    if !beamline.automounter.dismount(None, true).await? {
        warn!("Sample dismounting failed");
        return Err(MountError::DismountFailed);
    }
    info!("Sample dismounting succeeded");
    Ok(())
}

/// Put the goniometer into centring mode for the sample at `port`
pub async fn center_sample(beamline: &Beamline, port: &str) -> std::result::Result<(), CenteringError> {
    let _guard = beamline.lock().await;
    if !beamline.automounter.is_mounted(Some(port)) {
        return Err(CenteringError::NotMounted(port.to_string()));
    }
    if !beamline.goniometer.set_mode(GonioMode::Centering, true).await? {
        return Err(CenteringError::ModeChange);
    }
    Ok(())
}

/// A step applied to each sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Task {
    /// Mount the sample
    Mount {
        /// Wash the sample before mounting
        #[serde(default)]
        wash: bool,
    },
    /// Prepare the sample for centring
    Center,
    /// Wait for an operator to resume
    Pause,
    /// Collect a dataset named after the sample
    Acquire(RunParameters),
    /// Return the sample to its port
    Dismount,
}

impl Task {
    /// Display name
    pub fn label(&self) -> &'static str {
        match self {
            Task::Mount { .. } => "Mount",
            Task::Center => "Center",
            Task::Pause => "Pause",
            Task::Acquire(_) => "Acquire",
            Task::Dismount => "Dismount",
        }
    }
}

/// A sample in the automounter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unique id
    #[serde(default)]
    pub id: Id,
    /// Sample name
    pub name: String,
    /// Group the sample belongs to
    #[serde(default)]
    pub group: String,
    /// Automounter port, e.g. `LA1`
    pub port: String,
    /// Expected barcode, if the pin carries one
    #[serde(default)]
    pub barcode: Option<String>,
}

impl Sample {
    /// Create a sample without a barcode
    pub fn new(name: &str, group: &str, port: &str) -> Self {
        Self {
            id: Id::new(),
            name: name.to_string(),
            group: group.to_string(),
            port: port.to_string(),
            barcode: None,
        }
    }
}

/// Events emitted by an [`Automator`]
#[derive(Debug, Clone, PartialEq)]
pub enum AutomationEvent {
    /// The sequence began
    Started,
    /// Fraction done and the task being run
    Progress(f64, String),
    /// Work on a sample began
    SampleStarted(Id),
    /// Work on a sample finished
    SampleDone(Id),
    /// Paused (true) with a reason, or resumed (false)
    Paused(bool, String),
    /// The mounted sample is not the expected one
    Mismatch(String),
    /// Ended early
    Stopped,
    /// Every task ran on every sample
    Done,
    /// A task failed; the sequence stops
    Error(String),
}

impl Signal for AutomationEvent {
    fn name(&self) -> &'static str {
        match self {
            AutomationEvent::Started => "started",
            AutomationEvent::Progress(..) => "progress",
            AutomationEvent::SampleStarted(_) => "sample_started",
            AutomationEvent::SampleDone(_) => "sample_done",
            AutomationEvent::Paused(..) => "paused",
            AutomationEvent::Mismatch(_) => "mismatch",
            AutomationEvent::Stopped => "stopped",
            AutomationEvent::Done => "done",
            AutomationEvent::Error(_) => "error",
        }
    }
}

const PAUSE_TASK_MESSAGE: &str = "As requested, automation has been paused for manual intervention. \
     Please resume after intervening to continue the sequence.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs a task list over a list of samples
pub struct Automator {
    beamline: Arc<Beamline>,
    collector: Arc<DataCollector>,
    samples: Mutex<Vec<Sample>>,
    tasks: Mutex<Vec<Task>>,
    paused: AtomicBool,
    pause_message: Mutex<String>,
    stop: StopSignal,
    signals: Signals<AutomationEvent>,
}

impl std::fmt::Debug for Automator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automator")
            .field("samples", &lock(&self.samples).len())
            .field("tasks", &lock(&self.tasks).len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Automator {
    /// Create an automator collecting through `collector`
    pub fn new(beamline: Arc<Beamline>, collector: Arc<DataCollector>) -> Arc<Self> {
        let signals = Signals::new(beamline.context().dispatcher().clone());
        Arc::new(Self {
            beamline,
            collector,
            samples: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            pause_message: Mutex::new(String::new()),
            stop: StopSignal::new(),
            signals,
        })
    }

    /// Set the samples and the tasks to run on each, clearing any earlier
    /// stop request
    pub fn configure(&self, samples: Vec<Sample>, tasks: Vec<Task>) {
        *lock(&self.samples) = samples;
        *lock(&self.tasks) = tasks;
        self.stop.reset();
    }

    /// Whether the sequence is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Why the sequence is paused
    pub fn pause_message(&self) -> String {
        lock(&self.pause_message).clone()
    }

    /// Hold the sequence before the next task
    pub fn pause(&self, message: &str) {
        if !message.is_empty() {
            warn!("{}", message);
        }
        *lock(&self.pause_message) = message.to_string();
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Continue a paused sequence, and the collector with it
    pub fn resume(&self) {
        lock(&self.pause_message).clear();
        self.paused.store(false, Ordering::SeqCst);
        self.collector.resume();
    }

    /// End the sequence, stopping any collection in progress
    pub fn stop(&self) {
        self.stop.stop();
        self.paused.store(false, Ordering::SeqCst);
        self.collector.stop();
    }

    /// Attach a handler for an automation event
    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&AutomationEvent) + Send + Sync + 'static,
    {
        self.signals.subscribe(event, handler)
    }

    /// Detach a handler
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.signals.unsubscribe(id)
    }

    /// Receive every automation event
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<AutomationEvent> {
        self.signals.watch()
    }

    /// Clear any earlier stop request and run the sequence in a background
    /// task
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<RunOutcome>> {
        self.stop.reset();
        let automator = self.clone();
        let span = operation_span("automation", self.beamline.name());
        tokio::spawn(async move { automator.run().await }.instrument(span))
    }

    /// Run every task on every sample. A failed task stops the sequence
    /// and is returned after the `error` event. A completed sequence ends
    /// by dismounting whatever is still mounted. A stop request stays in
    /// force until the automator is configured or started again.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.beamline.register_worker()?;
        self.paused.store(false, Ordering::SeqCst);
        self.signals.emit(AutomationEvent::Started);

        let samples = lock(&self.samples).clone();
        let tasks = lock(&self.tasks).clone();
        let total = (samples.len() * tasks.len()).max(1);
        let pause_poll = Duration::from_millis(self.beamline.config().collection.pause_poll_ms);
        let mut pos = 0;

        'samples: for sample in &samples {
            if self.stop.is_stopped() {
                break;
            }
            self.signals.emit(AutomationEvent::SampleStarted(sample.id.clone()));
            for task in &tasks {
                if self.is_paused() {
                    self.signals.emit(AutomationEvent::Paused(true, self.pause_message()));
                    while self.is_paused() && !self.stop.is_stopped() {
                        cancellable_sleep(pause_poll, Some(&self.stop)).await;
                    }
                    self.signals.emit(AutomationEvent::Paused(false, String::new()));
                }
                if self.stop.is_stopped() {
                    break 'samples;
                }

                pos += 1;
                let label = format!("{}: {}/{}", task.label(), sample.group, sample.name);
                info!("Sample: {}/{}, Task: {}", sample.group, sample.name, task.label());
                self.signals.emit(AutomationEvent::Progress(pos as f64 / total as f64, label));

                if let Err(e) = self.run_task(task, sample).await {
                    return Err(self.fail(e));
                }
            }
            self.signals.emit(AutomationEvent::SampleDone(sample.id.clone()));
        }

        if self.stop.is_stopped() {
            info!("Automation stopped");
            self.signals.emit(AutomationEvent::Stopped);
            return Ok(RunOutcome::Stopped);
        }

        if self.beamline.automounter.is_mounted(None) {
            if let Err(e) = dismount_sample(&self.beamline).await {
                return Err(self.fail(e.into()));
            }
        }
        info!("Automation complete");
        self.signals.emit(AutomationEvent::Done);
        Ok(RunOutcome::Completed)
    }

    fn fail(&self, e: Error) -> Error {
        error!("{}", e);
        self.collector.stop();
        self.stop.stop();
        self.signals.emit(AutomationEvent::Error(e.to_string()));
        e
    }

    async fn run_task(&self, task: &Task, sample: &Sample) -> Result<()> {
        let beamline = &self.beamline;
        match task {
            Task::Pause => self.pause(PAUSE_TASK_MESSAGE),
            Task::Mount { wash } => {
                mount_sample(beamline, &sample.port, *wash).await?;
                self.check_mounted(sample);
            }
            Task::Center => center_sample(beamline, &sample.port).await?,
            Task::Acquire(options) => {
                if !beamline.automounter.is_mounted(Some(&sample.port)) {
                    return Err(CenteringError::NotMounted(sample.port.clone()).into());
                }
                let directory = format!(
                    "{}/{}",
                    beamline.config().general.data_dir.trim_end_matches('/'),
                    sample.name
                );
                let run = RunParameters {
                    name: sample.name.clone(),
                    directory,
                    ..options.clone()
                };
                info!("Acquiring frames for sample {} in {}", sample.name, run.directory);
                self.collector.configure_runs(&[run])?;
                if self.stop.is_stopped() {
                    return Ok(());
                }
                if self.collector.run().await? == RunOutcome::Stopped {
                    // A stopped collection ends the sequence too
                    self.stop.stop();
                }
            }
            Task::Dismount => dismount_sample(beamline).await?,
        }
        Ok(())
    }

    fn check_mounted(&self, sample: &Sample) {
        let Some(record) = self.beamline.automounter.mounted() else {
            return;
        };
        let expected_port = sample.port.parse::<PortId>().ok();
        if expected_port.as_ref() != Some(&record.port) {
            let message = format!("Port mismatch. Expected {}.", sample.port);
            warn!("{}", message);
            self.signals.emit(AutomationEvent::Mismatch(message));
            return;
        }
        match &sample.barcode {
            Some(expected) if !record.barcode.is_empty() && *expected != record.barcode => {
                let message = format!("Barcode mismatch. Expected {}.", expected);
                warn!("{} Found {}.", message, record.barcode);
                self.signals.emit(AutomationEvent::Mismatch(message));
            }
            _ => {}
        }
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::context::simulated;
    use beamline_core::config::Config;
    use beamline_core::types::Value;
    use tokio::sync::broadcast::Receiver;

    async fn beamline() -> (Arc<Beamline>, beamline_devices::sim::SimTransport) {
        let (beamline, sim) = simulated(Config::default()).unwrap();
        beamline.context().dispatcher().flush().await;
        (beamline, sim)
    }

    fn events(rx: &mut Receiver<AutomationEvent>) -> Vec<AutomationEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn short_run() -> RunParameters {
        RunParameters {
            total_angle: 2.0,
            ..RunParameters::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_and_dismount() {
        let (beamline, sim) = beamline().await;
        mount_sample(&beamline, "LA1", false).await.unwrap();
        beamline.context().dispatcher().flush().await;

        assert!(beamline.automounter.is_mounted(Some("LA1")));
        assert_eq!(beamline.goniometer.mode(), GonioMode::Centering);
        assert_eq!(sim.writes_to("SIM:gonio:mode:mounting.PROC").len(), 1);
        assert!(!beamline.is_locked());

        center_sample(&beamline, "LA1").await.unwrap();
        dismount_sample(&beamline).await.unwrap();
        beamline.context().dispatcher().flush().await;
        assert!(!beamline.automounter.is_mounted(None));
        assert_eq!(sim.writes_to("SIM:gonio:mode:mounting.PROC").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmountable_port_is_refused() {
        let (beamline, sim) = beamline().await;
        let err = mount_sample(&beamline, "LA2", false).await.unwrap_err();
        assert!(matches!(err, MountError::NotMountable(_)));
        assert!(sim.writes_to("SIM:sam:mntX:opr").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_centering_requires_sample() {
        let (beamline, _) = beamline().await;
        let err = center_sample(&beamline, "LA1").await.unwrap_err();
        assert!(matches!(err, CenteringError::NotMounted(_)));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_full_sequence() {
        let (beamline, sim) = beamline().await;
        let collector = DataCollector::new(beamline.clone());
        let automator = Automator::new(beamline.clone(), collector.clone());
        let sample = Sample::new("lyso1", "lysozyme", "MA1");
        let id = sample.id.clone();
        automator.configure(
            vec![sample],
            vec![Task::Mount { wash: false }, Task::Center, Task::Acquire(short_run())],
        );
        let mut rx = automator.watch();

        assert_eq!(automator.run().await.unwrap(), RunOutcome::Completed);
        beamline.context().dispatcher().flush().await;

        assert_eq!(collector.position(), 2);
        assert_eq!(collector.frames()[0].name, "lyso1_001");
        assert_eq!(sim.value("SIM:det:filename"), Some(Value::from("lyso1_002")));
        // Left mounted at the end, so returned to its port
        assert!(!beamline.automounter.is_mounted(None));
        assert_eq!(sim.writes_to("SIM:sam:dismntX:opr").len(), 1);

        let seen = events(&mut rx);
        assert_eq!(seen.first(), Some(&AutomationEvent::Started));
        assert!(seen.contains(&AutomationEvent::SampleStarted(id.clone())));
        assert!(seen.contains(&AutomationEvent::SampleDone(id)));
        assert!(seen.contains(&AutomationEvent::Progress(
            1.0,
            "Acquire: lysozyme/lyso1".to_string()
        )));
        assert_eq!(seen.last(), Some(&AutomationEvent::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_barcode_mismatch_is_reported() {
        let (beamline, _) = beamline().await;
        let collector = DataCollector::new(beamline.clone());
        let automator = Automator::new(beamline.clone(), collector);
        let sample = Sample {
            barcode: Some("CLS9999".to_string()),
            ..Sample::new("thau", "thaumatin", "LA1")
        };
        automator.configure(vec![sample], vec![Task::Mount { wash: true }, Task::Dismount]);
        let mut rx = automator.watch();

        assert_eq!(automator.run().await.unwrap(), RunOutcome::Completed);
        beamline.context().dispatcher().flush().await;
        assert!(events(&mut rx)
            .contains(&AutomationEvent::Mismatch("Barcode mismatch. Expected CLS9999.".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_without_sample_fails() {
        let (beamline, _) = beamline().await;
        let collector = DataCollector::new(beamline.clone());
        let automator = Automator::new(beamline.clone(), collector);
        automator.configure(
            vec![Sample::new("a", "g", "LA1"), Sample::new("b", "g", "MA1")],
            vec![Task::Acquire(short_run())],
        );
        let mut rx = automator.watch();

        let err = automator.run().await.unwrap_err();
        assert!(matches!(err, Error::Centering(CenteringError::NotMounted(_))));
        beamline.context().dispatcher().flush().await;
        let seen = events(&mut rx);
        assert!(matches!(seen.last(), Some(AutomationEvent::Error(_))));
        assert!(!seen.contains(&AutomationEvent::SampleStarted(
            automator.samples.lock().unwrap()[1].id.clone()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_right_after_start() {
        let (beamline, sim) = beamline().await;
        let collector = DataCollector::new(beamline.clone());
        let automator = Automator::new(beamline.clone(), collector);
        automator.configure(
            vec![Sample::new("s", "g", "LA1")],
            vec![Task::Mount { wash: false }, Task::Acquire(short_run())],
        );

        let handle = automator.start();
        automator.stop();
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Stopped);
        assert!(sim.writes_to("SIM:sam:mntX:opr").is_empty());
        assert!(sim.writes_to("SIM:det:acquire").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_task_waits_for_resume() {
        let (beamline, sim) = beamline().await;
        let collector = DataCollector::new(beamline.clone());
        let automator = Automator::new(beamline.clone(), collector);
        automator.configure(
            vec![Sample::new("p", "g", "LA1")],
            vec![Task::Pause, Task::Mount { wash: false }],
        );

        let handle = automator.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(automator.is_paused());
        assert!(automator.pause_message().starts_with("As requested"));
        assert!(sim.writes_to("SIM:sam:mntX:opr").is_empty());

        automator.resume();
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Completed);
        assert_eq!(sim.writes_to("SIM:sam:mntX:opr").len(), 1);
    }

    #[test]
    fn test_tasks_from_json() {
        let tasks: Vec<Task> = serde_json::from_str(
            r#"[{"type": "mount", "wash": true}, {"type": "center"}, {"type": "dismount"}]"#,
        )
        .unwrap();
        assert_eq!(tasks, vec![Task::Mount { wash: true }, Task::Center, Task::Dismount]);
        assert_eq!(tasks[0].label(), "Mount");
    }
}
