/*!
 * Frame list generation.
 *
 * A run describes an oscillation dataset: a total angle split into wedges,
 * optionally with inverse-beam wedges 180° away, at one or more energies.
 * [`generate_frames`] turns a set of runs into the ordered frame list the
 * data collector executes, collecting one wedge of each run in turn.
 */
use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use beamline_devices::devices::DetectorParameters;

use crate::error::{Error, Result};

const EPSILON: f64 = 1e-6;

/// One energy of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Energy {
    /// Energy in keV
    pub value: f64,
    /// Short label appended to the run name
    pub label: String,
}

impl Energy {
    /// Create an energy point
    pub fn new(value: f64, label: &str) -> Self {
        Self {
            value,
            label: label.to_string(),
        }
    }
}

/// Parameters of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Dataset name, the prefix of every frame name
    pub name: String,
    /// Output directory
    pub directory: String,
    /// Detector distance in mm
    pub distance: f64,
    /// Oscillation width per frame in degrees
    pub delta: f64,
    /// Exposure time per frame in seconds
    pub exposure: f64,
    /// Starting angle in degrees
    pub start: f64,
    /// Total angle covered in degrees
    pub total_angle: f64,
    /// Number of the first frame
    pub first: u32,
    /// Angle collected before moving on to the next wedge or run
    pub wedge: f64,
    /// Add a wedge 180° away after each wedge
    pub inverse_beam: bool,
    /// Energies; more than one splits the run into one dataset per energy
    pub energies: Vec<Energy>,
    /// Frame numbers to leave out, e.g. `"1-5,7"`
    pub skip: String,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            name: "test".to_string(),
            directory: "/tmp".to_string(),
            distance: 250.0,
            delta: 1.0,
            exposure: 1.0,
            start: 0.0,
            total_angle: 180.0,
            first: 1,
            wedge: 360.0,
            inverse_beam: false,
            energies: vec![Energy::new(12.658, "E0")],
            skip: String::new(),
        }
    }
}

impl RunParameters {
    /// A run with default parameters
    pub fn new(name: &str, directory: &str) -> Self {
        Self {
            name: name.to_string(),
            directory: directory.to_string(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("Run name is empty"));
        }
        if !(self.delta > 0.0) {
            return Err(Error::validation(format!("{}: delta must be positive", self.name)));
        }
        if !(self.wedge > 0.0) {
            return Err(Error::validation(format!("{}: wedge must be positive", self.name)));
        }
        if !(self.total_angle >= 0.0) || !self.start.is_finite() {
            return Err(Error::validation(format!("{}: invalid angle range", self.name)));
        }
        if self.energies.is_empty() {
            return Err(Error::validation(format!("{}: no energy given", self.name)));
        }
        Ok(())
    }

    /// One single-energy run per energy, named `name_label` when there is
    /// more than one
    pub fn split_energies(&self) -> Vec<RunParameters> {
        if self.energies.len() < 2 {
            return vec![self.clone()];
        }
        self.energies
            .iter()
            .map(|energy| RunParameters {
                name: format!("{}_{}", self.name, energy.label),
                energies: vec![energy.clone()],
                ..self.clone()
            })
            .collect()
    }
}

/// One exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Position in the frame list
    pub index: usize,
    /// Dataset the frame belongs to
    pub dataset: String,
    /// Frame number within the dataset
    pub number: u32,
    /// File name without extension
    pub name: String,
    /// Output directory
    pub directory: String,
    /// Oscillation start in degrees
    pub start_angle: f64,
    /// Oscillation width in degrees
    pub delta: f64,
    /// Exposure time in seconds
    pub exposure: f64,
    /// Energy in keV
    pub energy: f64,
    /// Detector distance in mm
    pub distance: f64,
    /// Whether the image has been written
    pub saved: bool,
}

impl Frame {
    /// Full output path of the image
    pub fn path(&self) -> String {
        format!("{}/{}.img", self.directory.trim_end_matches('/'), self.name)
    }

    /// Detector header for this frame
    pub fn detector_parameters(&self) -> DetectorParameters {
        DetectorParameters {
            filename: self.name.clone(),
            directory: self.directory.clone(),
            exposure: self.exposure,
            start_angle: self.start_angle,
            delta: self.delta,
            distance: self.distance,
            energy: self.energy,
            frame_number: self.number,
        }
    }
}

/// Frame name for `number` in dataset `name`
pub fn frame_name(name: &str, number: u32) -> String {
    format!("{}_{:03}", name, number)
}

/// Parse a frame set such as `"1-5,7"`. Malformed entries are ignored.
pub fn parse_frame_set(text: &str) -> BTreeSet<u32> {
    let mut frames = BTreeSet::new();
    for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let bounds: std::result::Result<Vec<u32>, _> =
            entry.split('-').map(|v| v.trim().parse::<u32>()).collect();
        match bounds.as_deref() {
            Ok([single]) => {
                frames.insert(*single);
            }
            Ok([first, last]) => frames.extend(*first..=*last),
            _ => warn!("Ignoring frame range '{}'", entry),
        }
    }
    frames
}

/// Collapse frame numbers into ranges, e.g. `[1,2,3,4,6,7,8]` into `"1-4,6-8"`
pub fn summarize_frames<I: IntoIterator<Item = u32>>(frames: I) -> String {
    let frames: BTreeSet<u32> = frames.into_iter().collect();
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for frame in frames {
        match ranges.last_mut() {
            Some((_, last)) if frame == *last + 1 => *last = frame,
            _ => ranges.push((frame, frame)),
        }
    }
    ranges
        .iter()
        .map(|&(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{}-{}", first, last)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Contiguous `(frame number, angle)` runs of one dataset. Skipped frames
/// split a wedge into separate sets.
pub fn frame_sets(run: &RunParameters) -> Result<Vec<Vec<(u32, f64)>>> {
    run.validate()?;
    let delta = run.delta;
    let mut wedge = run.wedge;
    if wedge < run.total_angle {
        wedge = delta * (wedge / delta).round();
        if wedge < delta {
            wedge = delta;
        }
    }
    let excluded = parse_frame_set(&run.skip);
    let frames_per_wedge = (wedge / delta).round() as usize;
    let offsets: &[f64] = if run.inverse_beam { &[0.0, 180.0] } else { &[0.0] };
    let last_angle = run.start + (run.total_angle - delta);

    let mut sets = Vec::new();
    let mut wedge_start = run.start;
    while wedge_start <= last_angle + EPSILON {
        let mut current = Vec::new();
        for offset in offsets {
            for i in 0..frames_per_wedge {
                let angle = wedge_start + i as f64 * delta;
                if angle > last_angle + EPSILON {
                    break;
                }
                let angle = angle + offset;
                let number = (f64::from(run.first) + (angle - run.start) / delta).round() as u32;
                if excluded.contains(&number) {
                    if !current.is_empty() {
                        sets.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push((number, angle));
                }
            }
        }
        if !current.is_empty() {
            sets.push(current);
        }
        wedge_start += wedge;
    }
    Ok(sets)
}

/// Hands out one wedge worth of frame sets at a time
struct Chunker {
    run: RunParameters,
    wedge: f64,
    sets: VecDeque<Vec<(u32, f64)>>,
    end: f64,
}

impl Chunker {
    fn new(run: RunParameters) -> Result<Self> {
        let sets = frame_sets(&run)?.into();
        Ok(Self {
            wedge: run.wedge,
            end: run.start + run.wedge,
            sets,
            run,
        })
    }

    fn has_items(&self) -> bool {
        !self.sets.is_empty()
    }

    fn fetch(&mut self) -> Vec<Vec<(u32, f64)>> {
        let mut stride = Vec::new();
        while let Some(set) = self.sets.front() {
            let first_angle = set.first().map_or(f64::MAX, |&(_, angle)| angle);
            if first_angle < self.end - EPSILON {
                stride.extend(self.sets.pop_front());
            } else {
                self.end = first_angle + self.wedge;
                break;
            }
        }
        stride
    }
}

/// Ordered frame list for `runs`. Multi-energy runs are split first; then
/// one wedge of each dataset is taken in turn until all are consumed.
pub fn generate_frames(runs: &[RunParameters]) -> Result<Vec<Frame>> {
    let mut chunkers = runs
        .iter()
        .flat_map(RunParameters::split_energies)
        .map(Chunker::new)
        .collect::<Result<Vec<_>>>()?;

    let mut frames = Vec::new();
    let mut pos = 0;
    while chunkers.iter().any(Chunker::has_items) {
        let chunker = &mut chunkers[pos];
        for set in chunker.fetch() {
            let run = &chunker.run;
            let energy = run.energies.first().map_or(12.658, |e| e.value);
            for (number, angle) in set {
                frames.push(Frame {
                    index: frames.len(),
                    dataset: run.name.clone(),
                    number,
                    name: frame_name(&run.name, number),
                    directory: run.directory.clone(),
                    start_angle: angle,
                    delta: run.delta,
                    exposure: run.exposure,
                    energy,
                    distance: run.distance,
                    saved: false,
                });
            }
        }
        pos = (pos + 1) % chunkers.len();
    }
    debug!("Generated {} frames from {} runs", frames.len(), runs.len());
    Ok(frames)
}
