/*!
 * Area detector.
 *
 * The detector is armed with a frame header, started, and then asked to save
 * the frame. `busy` follows the acquisition state channel.
 */
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use beamline_core::config::DetectorConfig;
use beamline_core::types::Value;
use beamline_core::wait::{wait_for, StopSignal, WaitOptions};

use crate::channel::{Channel, ChannelEvent};
use crate::device::{Device, DeviceContext, DeviceCore};
use crate::error::Result;

/// Header written to the detector before each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorParameters {
    /// Frame file name without extension
    pub filename: String,
    /// Output directory
    pub directory: String,
    /// Exposure time in seconds
    pub exposure: f64,
    /// Oscillation start angle in degrees
    pub start_angle: f64,
    /// Oscillation width in degrees
    pub delta: f64,
    /// Detector distance in mm
    pub distance: f64,
    /// Photon energy in keV
    pub energy: f64,
    /// Frame index within the run
    pub frame_number: u32,
}

impl DetectorParameters {
    fn fields(&self) -> [(&'static str, Value); 8] {
        [
            ("filename", Value::from(self.filename.as_str())),
            ("directory", Value::from(self.directory.as_str())),
            ("exposure", Value::from(self.exposure)),
            ("start_angle", Value::from(self.start_angle)),
            ("delta", Value::from(self.delta)),
            ("distance", Value::from(self.distance)),
            ("energy", Value::from(self.energy)),
            ("frame_number", Value::from(i64::from(self.frame_number))),
        ]
    }
}

/// Detector device
pub struct Detector {
    core: Arc<DeviceCore>,
    pv: String,
    state: Arc<Channel>,
    acquire: Arc<Channel>,
    save_cmd: Arc<Channel>,
    parameters: Vec<(&'static str, Arc<Channel>)>,
    config: DetectorConfig,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("name", &self.core.name())
            .field("pv", &self.pv)
            .field("busy", &self.core.is_busy())
            .finish()
    }
}

const PARAMETERS: [&str; 8] = [
    "filename",
    "directory",
    "exposure",
    "start_angle",
    "delta",
    "distance",
    "energy",
    "frame_number",
];

impl Detector {
    /// Create a detector rooted at `pv`
    pub fn new(context: &DeviceContext, name: &str, pv: &str) -> Result<Arc<Self>> {
        let core = DeviceCore::new(context, "detector", name);
        let config = context.config().detector.clone();
        let detector = Arc::new_cyclic(|weak: &Weak<Detector>| {
            let state = core.add_channel(&format!("{}:state", pv), true);
            let handle = weak.clone();
            state.subscribe("changed", move |event| {
                if let (Some(detector), ChannelEvent::Changed(value)) = (handle.upgrade(), event) {
                    detector.core.set_busy(value.is_set());
                }
            });
            let parameters = PARAMETERS
                .iter()
                .map(|field| (*field, core.add_channel(&format!("{}:{}", pv, field), false)))
                .collect();
            Detector {
                core: core.clone(),
                pv: pv.to_string(),
                acquire: core.add_channel(&format!("{}:acquire", pv), false),
                save_cmd: core.add_channel(&format!("{}:save", pv), false),
                state,
                parameters,
                config,
            }
        });
        detector.core.start()?;
        Ok(detector)
    }

    /// Whether the detector reports an acquisition in progress
    pub fn is_acquiring(&self) -> bool {
        self.state.value().map_or(false, |v| v.is_set())
    }

    /// Write the frame header
    pub async fn set_parameters(&self, params: &DetectorParameters) -> Result<()> {
        for (field, value) in params.fields() {
            if let Some((_, channel)) = self.parameters.iter().find(|(name, _)| *name == field) {
                channel.set(value).await?;
            }
        }
        Ok(())
    }

    /// Start an acquisition
    pub async fn start(&self) -> Result<()> {
        info!("({}) starting acquisition", self.name());
        self.acquire.set(1).await
    }

    /// Save the acquired frame and wait for the readout to finish
    pub async fn save(&self, cancel: Option<&StopSignal>) -> Result<bool> {
        self.save_cmd.set(1).await?;
        let options = WaitOptions::new(
            Duration::from_millis(self.config.poll_ms),
            Duration::from_millis(self.config.timeout_ms),
        )
        .phases(false, true);
        Ok(wait_for(self.name(), || true, || self.is_busy(), &options, cancel).await)
    }
}

impl Device for Detector {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }
}
