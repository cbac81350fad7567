/*!
 * Data collection run loop.
 *
 * A [`DataCollector`] executes an ordered frame list on the beamline. For
 * each frame it moves energy and distance only when needed, waits for all
 * motions together, then configures the goniometer and detector, exposes
 * and saves. `pause`, `resume` and `stop` are cooperative: they take effect
 * at the top of the next frame or inside the current wait.
 *
 * Whatever way a run ends, the exposure shutter is closed and the beamline
 * lock released before the final `done`, `stopped` or `error` event.
 */
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use beamline_core::event::{Signal, Signals, SubscriptionId};
use beamline_core::logging::operation_span;
use beamline_core::utils::spawn_and_log;
use beamline_core::wait::{cancellable_sleep, StopSignal};
use beamline_devices::devices::{GonioMode, Motor};
use beamline_devices::Device;

use crate::context::Beamline;
use crate::error::{CollectionError, Error, Result};
use crate::runlist::{generate_frames, Frame, RunParameters};

/// Events emitted while collecting
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// The run began
    Started,
    /// Paused (true) or resumed (false)
    Paused(bool),
    /// The run ended early on request
    Stopped,
    /// Every frame was collected
    Done,
    /// The run failed
    Error(String),
    /// A frame was saved
    NewImage {
        /// Frame index
        index: usize,
        /// Image path
        path: String,
    },
    /// Fraction of the frame list completed
    Progress(f64),
}

impl Signal for CollectionEvent {
    fn name(&self) -> &'static str {
        match self {
            CollectionEvent::Started => "started",
            CollectionEvent::Paused(_) => "paused",
            CollectionEvent::Stopped => "stopped",
            CollectionEvent::Done => "done",
            CollectionEvent::Error(_) => "error",
            CollectionEvent::NewImage { .. } => "new_image",
            CollectionEvent::Progress(_) => "progress",
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every frame was collected
    Completed,
    /// Stopped before the end
    Stopped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Executes frame lists on a beamline
pub struct DataCollector {
    beamline: Arc<Beamline>,
    frames: Mutex<Vec<Frame>>,
    position: AtomicUsize,
    paused: AtomicBool,
    running: AtomicBool,
    stop: StopSignal,
    skip_collected: AtomicBool,
    signals: Signals<CollectionEvent>,
}

impl std::fmt::Debug for DataCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCollector")
            .field("position", &self.position())
            .field("total", &self.total())
            .field("paused", &self.is_paused())
            .field("running", &self.is_running())
            .finish()
    }
}

impl DataCollector {
    /// Create a collector with an empty frame list
    pub fn new(beamline: Arc<Beamline>) -> Arc<Self> {
        let signals = Signals::new(beamline.context().dispatcher().clone());
        let skip_collected = beamline.config().collection.skip_collected;
        Arc::new(Self {
            beamline,
            frames: Mutex::new(Vec::new()),
            position: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop: StopSignal::new(),
            skip_collected: AtomicBool::new(skip_collected),
            signals,
        })
    }

    /// Replace the frame list, rewind to the start and clear any earlier
    /// stop request
    pub fn configure(&self, frames: Vec<Frame>) -> Result<()> {
        if self.is_running() {
            return Err(CollectionError::AlreadyRunning.into());
        }
        info!("Configured {} frames", frames.len());
        *lock(&self.frames) = frames;
        self.position.store(0, Ordering::SeqCst);
        self.stop.reset();
        Ok(())
    }

    /// Generate the frame list for `runs` and configure it
    pub fn configure_runs(&self, runs: &[RunParameters]) -> Result<()> {
        self.configure(generate_frames(runs)?)
    }

    /// Whether frames already saved are skipped
    pub fn set_skip_collected(&self, skip: bool) {
        self.skip_collected.store(skip, Ordering::SeqCst);
    }

    /// Index of the next frame to collect
    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }

    /// Move the run to `position`. Frames are collected from there on the
    /// next iteration.
    pub fn set_position(&self, position: usize) -> Result<()> {
        let total = self.total();
        if position > total {
            return Err(CollectionError::InvalidPosition { position, total }.into());
        }
        info!("Resetting position to {}", position);
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }

    /// Number of frames
    pub fn total(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Snapshot of the frame list
    pub fn frames(&self) -> Vec<Frame> {
        lock(&self.frames).clone()
    }

    /// Whether a run is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the run is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Hold the run before the next frame. A collector paused before it
    /// starts holds at the first frame.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Data collection paused");
            self.signals.emit(CollectionEvent::Paused(true));
        }
    }

    /// Continue a paused run
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Data collection resumed");
            self.signals.emit(CollectionEvent::Paused(false));
        }
    }

    /// End the run at the next check
    pub fn stop(&self) {
        info!("Stopping data collection");
        self.stop.stop();
    }

    /// Attach a handler for a collection event
    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&CollectionEvent) + Send + Sync + 'static,
    {
        self.signals.subscribe(event, handler)
    }

    /// Detach a handler
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.signals.unsubscribe(id)
    }

    /// Receive every collection event
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<CollectionEvent> {
        self.signals.watch()
    }

    /// Clear any earlier stop request and run in a background task. A
    /// `stop` issued after this call ends the run before its first frame.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<RunOutcome>> {
        self.stop.reset();
        let collector = self.clone();
        tokio::spawn(async move { collector.run().await })
    }

    /// Collect the configured frames from the current position. A stop
    /// request stays in force until the collector is configured or started
    /// again, so a stopped collector returns at once.
    ///
    /// If this future is dropped before it finishes, the shutter is closed
    /// and the beamline lock released in a background task.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CollectionError::AlreadyRunning.into());
        }
        let mut guard = RunGuard {
            collector: self,
            lock: None,
        };
        let result = self
            .run_locked(&mut guard)
            .instrument(operation_span("collect", self.beamline.name()))
            .await;
        drop(guard);

        match &result {
            Ok(RunOutcome::Completed) => {
                info!("Data collection complete");
                self.signals.emit(CollectionEvent::Done);
            }
            Ok(RunOutcome::Stopped) => {
                info!("Data collection stopped at frame {}", self.position());
                self.signals.emit(CollectionEvent::Stopped);
            }
            Err(e) => {
                error!("Data collection failed: {}", e);
                self.signals.emit(CollectionEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn run_locked(&self, guard: &mut RunGuard<'_>) -> Result<RunOutcome> {
        self.beamline.register_worker()?;
        guard.lock = Some(self.beamline.lock_owned().await);
        self.signals.emit(CollectionEvent::Started);

        let result = self.collect().await;

        if let Err(e) = self.beamline.shutter.close(false).await {
            warn!("Could not close shutter after collection: {}", e);
        }
        guard.lock = None;
        result.map_err(Error::from)
    }

    async fn collect(&self) -> std::result::Result<RunOutcome, CollectionError> {
        if self.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }
        let beamline = &self.beamline;
        if !beamline.goniometer.set_mode(GonioMode::Collecting, true).await? {
            return Err(CollectionError::ModeChange);
        }
        beamline.shutter.close(true).await?;

        let pause_poll = Duration::from_millis(beamline.config().collection.pause_poll_ms);
        loop {
            if self.is_stopped() {
                return Ok(RunOutcome::Stopped);
            }
            while self.is_paused() && !self.is_stopped() {
                cancellable_sleep(pause_poll, Some(&self.stop)).await;
            }
            if self.is_stopped() {
                return Ok(RunOutcome::Stopped);
            }

            let position = self.position();
            let (frame, total) = {
                let frames = lock(&self.frames);
                match frames.get(position) {
                    Some(frame) => (frame.clone(), frames.len()),
                    None => return Ok(RunOutcome::Completed),
                }
            };

            if frame.saved && self.skip_collected.load(Ordering::SeqCst) {
                debug!("Skipping collected frame {}", frame.name);
                self.advance(position, total);
                continue;
            }

            if !self.collect_frame(&frame).await? {
                return Ok(RunOutcome::Stopped);
            }

            lock(&self.frames)[position].saved = true;
            self.advance(position, total);
            self.signals.emit(CollectionEvent::NewImage {
                index: frame.index,
                path: frame.path(),
            });
        }
    }

    fn advance(&self, position: usize, total: usize) {
        let _ = self.position.compare_exchange(
            position,
            position + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let fraction = if total == 0 { 1.0 } else { self.position() as f64 / total as f64 };
        self.signals.emit(CollectionEvent::Progress(fraction));
    }

    /// Move, expose and save one frame. Returns false when stopped partway.
    async fn collect_frame(&self, frame: &Frame) -> std::result::Result<bool, CollectionError> {
        let beamline = &self.beamline;
        info!("Collecting frame {} at {:.2}°", frame.name, frame.start_angle);

        let targets: [(&Arc<Motor>, f64); 2] = [
            (&beamline.energy, frame.energy),
            (&beamline.distance, frame.distance),
        ];
        let mut moving = Vec::new();
        for (motor, target) in targets {
            if motor.needs_move(target) {
                motor.move_to(target, false).await?;
                moving.push(motor);
            }
        }
        let arrived = join_all(moving.iter().map(|motor| motor.wait(Some(&self.stop)))).await;
        if self.is_stopped() {
            return Ok(false);
        }
        let stuck: Vec<&str> = moving
            .iter()
            .zip(&arrived)
            .filter(|(_, arrived)| !**arrived)
            .map(|(motor, _)| motor.name())
            .collect();
        if !stuck.is_empty() {
            return Err(CollectionError::Motion(stuck.join(", ")));
        }

        beamline
            .goniometer
            .configure(frame.exposure, frame.delta, frame.start_angle)
            .await?;
        beamline.detector.set_parameters(&frame.detector_parameters()).await?;
        if self.is_stopped() {
            return Ok(false);
        }

        beamline.detector.start().await?;
        let scanned = beamline.goniometer.scan(true, Some(&self.stop)).await?;
        if self.is_stopped() {
            return Ok(false);
        }
        if !scanned {
            return Err(CollectionError::Exposure(frame.name.clone()));
        }
        if !beamline.detector.save(Some(&self.stop)).await? {
            if self.is_stopped() {
                return Ok(false);
            }
            return Err(CollectionError::Exposure(frame.name.clone()));
        }
        Ok(true)
    }
}

/// Marks the collector idle when a run ends. Still holding the beamline lock
/// means the run was dropped partway: the shutter is then closed before the
/// lock is released.
struct RunGuard<'a> {
    collector: &'a DataCollector,
    lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.collector.running.store(false, Ordering::SeqCst);
        let Some(held) = self.lock.take() else {
            return;
        };
        warn!("Data collection abandoned at frame {}", self.collector.position());
        self.collector.signals.emit(CollectionEvent::Stopped);
        let shutter = self.collector.beamline.shutter.clone();
        match Handle::try_current() {
            Ok(_) => {
                spawn_and_log("close-shutter", async move {
                    let closed = shutter.close(false).await;
                    drop(held);
                    closed
                });
            }
            Err(_) => error!("No runtime left to close the shutter after collection"),
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

    fn run(name: &str, frames: f64) -> RunParameters {
        RunParameters {
            total_angle: frames,
            ..RunParameters::new(name, "/data/test")
        }
    }

    async fn collector() -> (Arc<DataCollector>, Arc<Beamline>, beamline_devices::sim::SimTransport) {
        let (beamline, sim) = simulated(Config::default()).unwrap();
        beamline.context().dispatcher().flush().await;
        (DataCollector::new(beamline.clone()), beamline, sim)
    }

    fn events(rx: &mut Receiver<CollectionEvent>) -> Vec<CollectionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_full_run() {
        let (collector, beamline, sim) = collector().await;
        collector.configure_runs(&[run("lyso", 4.0)]).unwrap();
        let mut rx = collector.watch();

        assert_eq!(collector.run().await.unwrap(), RunOutcome::Completed);
        beamline.context().dispatcher().flush().await;

        assert_eq!(collector.position(), 4);
        assert!(collector.frames().iter().all(|f| f.saved));
        assert_eq!(sim.writes_to("SIM:det:acquire").len(), 4);
        assert_eq!(sim.writes_to("SIM:gonio:mode:collect.PROC").len(), 1);
        // Energy and distance already match the defaults
        assert!(sim.writes_to("SIM:energy:sp").is_empty());
        assert!(sim.writes_to("SIM:distance:sp").is_empty());
        assert!(!beamline.is_locked());
        assert_eq!(sim.worker_registrations(), 1);

        let seen = events(&mut rx);
        assert_eq!(seen.first(), Some(&CollectionEvent::Started));
        assert_eq!(seen.last(), Some(&CollectionEvent::Done));
        assert!(seen.contains(&CollectionEvent::NewImage {
            index: 3,
            path: "/data/test/lyso_004.img".to_string()
        }));
        assert!(seen.contains(&CollectionEvent::Progress(1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_only_when_needed() {
        let (collector, _, sim) = collector().await;
        let far = RunParameters {
            distance: 300.0,
            ..run("far", 3.0)
        };
        collector.configure_runs(&[far]).unwrap();

        assert_eq!(collector.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(sim.writes_to("SIM:distance:sp"), vec![Value::Float(300.0)]);
        assert!(sim.writes_to("SIM:energy:sp").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_frames_are_skipped() {
        let (collector, _, sim) = collector().await;
        let mut frames = generate_frames(&[run("resume", 4.0)]).unwrap();
        frames[0].saved = true;
        frames[2].saved = true;
        collector.configure(frames).unwrap();

        assert_eq!(collector.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(collector.position(), 4);
        let numbers = sim.writes_to("SIM:det:frame_number");
        assert_eq!(numbers, vec![Value::Integer(2), Value::Integer(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_frame() {
        let (collector, beamline, sim) = collector().await;
        collector.configure_runs(&[run("stop", 5.0)]).unwrap();
        let target = collector.clone();
        sim.on_write("SIM:det:frame_number", move |_, value| {
            if value.as_integer() == Some(3) {
                target.stop();
            }
        });

        assert_eq!(collector.run().await.unwrap(), RunOutcome::Stopped);
        assert_eq!(collector.position(), 2);
        assert_eq!(sim.writes_to("SIM:det:acquire").len(), 2);
        assert!(!collector.frames()[2].saved);
        assert!(!beamline.shutter.is_open());
        assert!(!beamline.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_right_after_start() {
        let (collector, beamline, sim) = collector().await;
        collector.configure_runs(&[run("early", 3.0)]).unwrap();

        let handle = collector.start();
        collector.stop();
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Stopped);

        assert_eq!(collector.position(), 0);
        assert!(sim.writes_to("SIM:det:acquire").is_empty());
        assert!(sim.writes_to("SIM:gonio:mode:collect.PROC").is_empty());
        assert!(!beamline.is_locked());

        // A new configuration clears the stop
        collector.configure_runs(&[run("early", 1.0)]).unwrap();
        assert_eq!(collector.run().await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_cleans_up() {
        let (collector, beamline, sim) = collector().await;
        collector.configure_runs(&[run("dropped", 2.0)]).unwrap();
        // The scan opens the shutter and never reports back
        sim.on_write("SIM:gonio:scanFrame.PROC", |sim, _| sim.set_value("SIM:shutter:state", 1));

        let result = tokio::time::timeout(Duration::from_millis(300), collector.run()).await;
        assert!(result.is_err());
        assert!(!collector.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        beamline.context().dispatcher().flush().await;
        assert!(!beamline.shutter.is_open());
        assert!(!sim.writes_to("SIM:shutter:opr:close").is_empty());
        assert!(!beamline.is_locked());

        beamline_devices::sim::simulate_goniometer(&sim, "SIM:gonio");
        assert_eq!(collector.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(collector.position(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_until_resume() {
        let (collector, _, sim) = collector().await;
        collector.configure_runs(&[run("pause", 2.0)]).unwrap();
        collector.pause();

        let handle = collector.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(collector.position(), 0);
        assert!(sim.writes_to("SIM:det:acquire").is_empty());
        assert!(collector.is_running());

        collector.resume();
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Completed);
        assert_eq!(collector.position(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_after_refused_move() {
        let (collector, beamline, sim) = collector().await;
        sim.set_value("SIM:distance:calibrated", 0);
        beamline.context().dispatcher().flush().await;
        let far = RunParameters {
            distance: 400.0,
            ..run("broken", 2.0)
        };
        collector.configure_runs(&[far]).unwrap();
        let mut rx = collector.watch();

        let err = collector.run().await.unwrap_err();
        assert!(matches!(err, Error::Collection(CollectionError::Device(_))));
        assert!(err.to_string().contains("not in a sane state"));
        beamline.context().dispatcher().flush().await;

        assert_eq!(collector.position(), 0);
        assert!(!beamline.is_locked());
        assert!(!beamline.shutter.is_open());
        assert!(!collector.is_running());
        let seen = events(&mut rx);
        assert!(matches!(seen.last(), Some(CollectionEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_position_bounds() {
        let (collector, _, _) = collector().await;
        collector.configure_runs(&[run("pos", 3.0)]).unwrap();
        tokio_test::assert_ok!(collector.set_position(2));
        assert_eq!(collector.position(), 2);
        tokio_test::assert_err!(collector.set_position(4));
    }
}
