/*!
 * Goniometer and its operating-mode machine.
 *
 * The goniometer reports one flag per phase (mounting, centering, collect,
 * beam check) plus motion and scan activity. The current mode is a pure
 * function of those flags and the last requested mode, re-evaluated on every
 * feedback change.
 */
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use beamline_core::config::GoniometerConfig;
use beamline_core::types::Value;
use beamline_core::wait::{wait_for, wait_until, StopSignal, WaitOptions};

use crate::channel::Channel;
use crate::device::{lock, on_changed, Device, DeviceContext, DeviceCore, DeviceEvent};
use crate::error::{DeviceError, Result};

/// Goniometer operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GonioMode {
    /// No feedback received yet
    Init,
    /// Ready for sample transfer
    Mounting,
    /// Sample centering
    Centering,
    /// Data collection
    Collecting,
    /// Data collection requested as a fluorescence scan
    Scanning,
    /// Beam position check
    Beam,
    /// In motion between modes
    Moving,
    /// Feedback matches no mode
    Unknown,
}

impl GonioMode {
    /// Display name
    pub fn as_str(&self) -> &'static str {
        match self {
            GonioMode::Init => "Init",
            GonioMode::Mounting => "Mounting",
            GonioMode::Centering => "Centering",
            GonioMode::Collecting => "Collecting",
            GonioMode::Scanning => "Scanning",
            GonioMode::Beam => "Beam",
            GonioMode::Moving => "Moving",
            GonioMode::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for GonioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GonioMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "init" => Ok(GonioMode::Init),
            "mounting" | "mount" => Ok(GonioMode::Mounting),
            "centering" | "center" => Ok(GonioMode::Centering),
            "collecting" | "collect" => Ok(GonioMode::Collecting),
            "scanning" | "scan" => Ok(GonioMode::Scanning),
            "beam" => Ok(GonioMode::Beam),
            "moving" => Ok(GonioMode::Moving),
            "unknown" => Ok(GonioMode::Unknown),
            _ => Err(DeviceError::invalid_argument(format!("Unknown goniometer mode: {}", s))),
        }
    }
}

/// Snapshot of the goniometer feedback flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GonioFeedback {
    /// Axes in motion
    pub moving: bool,
    /// Oscillation scan in progress
    pub scanning: bool,
    /// Centering phase active
    pub centering: bool,
    /// Transfer phase active
    pub mounting: bool,
    /// Axes calibrated
    pub calibrated: bool,
    /// Beam check phase active
    pub beam_check: bool,
    /// Collect phase active
    pub collect: bool,
}

/// Classify feedback into a mode. The first matching rule wins: motion,
/// centering, calibrated mounting, beam check, collect (reported as the
/// requested collect-like mode), then unknown.
pub fn classify(feedback: &GonioFeedback, requested: Option<GonioMode>) -> GonioMode {
    if feedback.moving || feedback.scanning {
        GonioMode::Moving
    } else if feedback.centering {
        GonioMode::Centering
    } else if feedback.mounting && feedback.calibrated {
        GonioMode::Mounting
    } else if feedback.beam_check {
        GonioMode::Beam
    } else if feedback.collect {
        match requested {
            Some(mode @ (GonioMode::Collecting | GonioMode::Scanning)) => mode,
            _ => GonioMode::Collecting,
        }
    } else {
        GonioMode::Unknown
    }
}

struct Feedback {
    moving: Arc<Channel>,
    scanning: Arc<Channel>,
    centering: Arc<Channel>,
    mounting: Arc<Channel>,
    calibrated: Arc<Channel>,
    beam_check: Arc<Channel>,
    collect: Arc<Channel>,
}

impl Feedback {
    fn channels(&self) -> [&Arc<Channel>; 7] {
        [
            &self.moving,
            &self.scanning,
            &self.centering,
            &self.mounting,
            &self.calibrated,
            &self.beam_check,
            &self.collect,
        ]
    }

    /// `None` until at least one flag has a value
    fn snapshot(&self) -> Option<GonioFeedback> {
        let flag = |channel: &Arc<Channel>| channel.value().unwrap_or_default();
        if self.channels().into_iter().all(|c| flag(c).is_null()) {
            return None;
        }
        Some(GonioFeedback {
            moving: flag(&self.moving).is_set(),
            scanning: flag(&self.scanning).is_set(),
            centering: flag(&self.centering).is_set(),
            mounting: flag(&self.mounting).is_set(),
            calibrated: flag(&self.calibrated).is_set(),
            beam_check: flag(&self.beam_check).is_set(),
            collect: flag(&self.collect).is_set(),
        })
    }
}

/// Goniometer device
pub struct Goniometer {
    this: Weak<Goniometer>,
    core: Arc<DeviceCore>,
    config: GoniometerConfig,
    feedback: Feedback,
    mount_cmd: Arc<Channel>,
    center_cmd: Arc<Channel>,
    collect_cmd: Arc<Channel>,
    beam_cmd: Arc<Channel>,
    scan_cmd: Arc<Channel>,
    stop_cmd: Arc<Channel>,
    exposure_time: Arc<Channel>,
    delta: Arc<Channel>,
    start_angle: Arc<Channel>,
    mode: Mutex<GonioMode>,
    requested: Mutex<Option<GonioMode>>,
    scan_pending: AtomicBool,
    scan_seen: AtomicBool,
    /// Configured exposure time in seconds, as `f64` bits
    exposure: AtomicU64,
}

impl fmt::Debug for Goniometer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Goniometer")
            .field("name", &self.core.name())
            .field("mode", &self.mode())
            .field("busy", &self.core.is_busy())
            .finish()
    }
}

impl Goniometer {
    /// Create a goniometer rooted at `pv`
    pub fn new(context: &DeviceContext, name: &str, pv: &str) -> Result<Arc<Self>> {
        let core = DeviceCore::new(context, "goniometer", name);
        let config = context.config().goniometer.clone();
        let monitor = |suffix: &str| core.add_channel(&format!("{}:{}", pv, suffix), true);
        let command = |suffix: &str| core.add_channel(&format!("{}:{}", pv, suffix), false);

        let goniometer = Arc::new_cyclic(|weak: &Weak<Goniometer>| {
            let feedback = Feedback {
                moving: monitor("mode:moving:fbk"),
                scanning: monitor("scanFrame:status"),
                centering: monitor("mode:centering:fbk"),
                mounting: monitor("mode:mounting:fbk"),
                calibrated: monitor("mode:calibrated:fbk"),
                beam_check: monitor("beam:check:fbk"),
                collect: monitor("mode:collect:fbk"),
            };
            for channel in feedback.channels() {
                on_changed(channel, weak, |gonio: &Arc<Goniometer>, _| gonio.on_feedback());
            }

            Goniometer {
                this: weak.clone(),
                core: core.clone(),
                config,
                feedback,
                mount_cmd: command("mode:mounting.PROC"),
                center_cmd: command("mode:centering.PROC"),
                collect_cmd: command("mode:collect.PROC"),
                beam_cmd: command("beam:check.PROC"),
                scan_cmd: command("scanFrame.PROC"),
                stop_cmd: command("stop"),
                exposure_time: command("expTime"),
                delta: command("deltaOmega"),
                start_angle: command("openSHPos"),
                mode: Mutex::new(GonioMode::Init),
                requested: Mutex::new(None),
                scan_pending: AtomicBool::new(false),
                scan_seen: AtomicBool::new(false),
                exposure: AtomicU64::new(0f64.to_bits()),
            }
        });
        goniometer.core.start()?;
        Ok(goniometer)
    }

    fn on_feedback(&self) {
        let Some(feedback) = self.feedback.snapshot() else {
            return;
        };
        if feedback.scanning && self.scan_pending.load(Ordering::SeqCst) {
            self.scan_seen.store(true, Ordering::SeqCst);
        }
        self.core.set_busy(feedback.moving || feedback.scanning);

        let requested = *lock(&self.requested);
        let mode = classify(&feedback, requested);
        let changed = {
            let mut current = lock(&self.mode);
            let changed = *current != mode;
            *current = mode;
            changed
        };
        if changed {
            debug!("({}) mode {}", self.name(), mode);
            self.core.emit(DeviceEvent::Mode(mode));
        }
    }

    /// Current mode
    pub fn mode(&self) -> GonioMode {
        *lock(&self.mode)
    }

    /// Last requested mode
    pub fn requested_mode(&self) -> Option<GonioMode> {
        *lock(&self.requested)
    }

    fn mode_command(&self, mode: GonioMode) -> Result<&Arc<Channel>> {
        match mode {
            GonioMode::Mounting => Ok(&self.mount_cmd),
            GonioMode::Centering => Ok(&self.center_cmd),
            GonioMode::Collecting | GonioMode::Scanning => Ok(&self.collect_cmd),
            GonioMode::Beam => Ok(&self.beam_cmd),
            other => Err(DeviceError::invalid_argument(format!(
                "Goniometer mode {} cannot be requested",
                other
            ))),
        }
    }

    async fn wait_idle(&self, timeout: Duration, cancel: Option<&StopSignal>) -> bool {
        let options = WaitOptions::new(Duration::from_millis(self.config.poll_ms), timeout).phases(false, true);
        wait_for(self.name(), || true, || self.is_busy(), &options, cancel).await
    }

    /// Switch to `mode`. With `wait`, returns whether the goniometer reported
    /// that mode in time.
    pub async fn set_mode(&self, mode: GonioMode, wait: bool) -> Result<bool> {
        let command = self.mode_command(mode)?;
        let timeout = Duration::from_millis(self.config.mode_timeout_ms);
        if self.is_busy() {
            self.wait_idle(timeout, None).await;
        }

        info!("({}) switching mode to {}", self.name(), mode);
        self.core.set_message(format!("Switching mode to: {}", mode));
        *lock(&self.requested) = Some(mode);
        command.set(1).await?;
        // Feedback may already match and never change again
        let this = self.this.clone();
        self.core.context().dispatcher().post(move || {
            if let Some(gonio) = this.upgrade() {
                gonio.on_feedback();
            }
        });

        if !wait {
            return Ok(true);
        }
        Ok(wait_until(
            self.name(),
            || self.reported_mode() == mode,
            Duration::from_millis(self.config.poll_ms),
            timeout,
            None,
        )
        .await)
    }

    /// Mode as the current feedback classifies it, honouring the last
    /// request
    fn reported_mode(&self) -> GonioMode {
        match self.feedback.snapshot() {
            Some(feedback) => classify(&feedback, self.requested_mode()),
            None => GonioMode::Init,
        }
    }

    /// Write the oscillation parameters for the next scan
    pub async fn configure(&self, time: f64, delta: f64, angle: f64) -> Result<()> {
        self.exposure_time.set(time).await?;
        self.delta.set(delta).await?;
        self.start_angle.set(angle).await?;
        self.exposure.store(time.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    /// Run one oscillation. With `wait`, returns whether the scan feedback
    /// rose and fell in time.
    pub async fn scan(&self, wait: bool, cancel: Option<&StopSignal>) -> Result<bool> {
        let exposure = f64::from_bits(self.exposure.load(Ordering::SeqCst));
        let timeout = Duration::from_secs_f64(exposure.max(0.0))
            + Duration::from_millis(self.config.scan_margin_ms);

        self.core.set_message("Scanning ...");
        self.wait_idle(timeout, cancel).await;
        self.scan_seen.store(false, Ordering::SeqCst);
        self.scan_pending.store(true, Ordering::SeqCst);
        if let Err(e) = self.scan_cmd.set(1).await {
            self.scan_pending.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let options = WaitOptions::new(Duration::from_millis(self.config.poll_ms), timeout).phases(true, wait);
        let started = || self.scan_seen.load(Ordering::SeqCst) || self.is_busy();
        let done = wait_for(self.name(), started, || self.is_busy(), &options, cancel).await;
        self.scan_pending.store(false, Ordering::SeqCst);
        if done && wait {
            self.core.set_message("Scan complete!");
        }
        Ok(done)
    }

    /// Stop motion and abort any scan
    pub async fn stop(&self) -> Result<()> {
        info!("({}) stopping", self.name());
        self.stop_cmd.set(1).await
    }
}

impl Device for Goniometer {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}

impl From<GonioMode> for Value {
    fn from(mode: GonioMode) -> Self {
        Value::String(mode.as_str().to_string())
    }
}
