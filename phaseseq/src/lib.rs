//! Flight phase segmentation and fixed-shape phase sequence extraction.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod dataset;
pub mod extract;
pub mod health;
pub mod segment;
pub mod sequence;
pub mod series;
pub mod validate;

pub use dataset::{
    assemble, Assembler, CancelToken, Dataset, FailureReason, FailureRecord, FlightResult,
    Summary,
};
pub use extract::{extract, ExtractionError, PhaseSlice};
pub use health::{health_check, HealthConfig, HealthReport};
pub use segment::{extract_runs, find_repeated_phases, segment, PhaseLabel, Run, Segment};
pub use sequence::{build, Sequence, SequenceError};
pub use series::{channels, TimeSeries};
pub use validate::{validate, ValidatedSeries, ValidationError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("required_channels must not be empty")]
    NoRequiredChannels,
    #[error("required_channels must include '{0}'")]
    MissingAltitudeChannel(String),
    #[error("channel '{0}' is extracted but not required, so it is never validated")]
    UnvalidatedChannel(String),
    #[error("phase_labels must not be empty")]
    NoPhaseLabels,
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("target_sequence_length must be at least 2, got {0}")]
    TargetLengthTooShort(usize),
    #[error("duration bounds for {label} are inverted: min {min_s}s > max {max_s}s")]
    InvertedDurationBounds {
        label: PhaseLabel,
        min_s: f64,
        max_s: f64,
    },
    #[error("range for channel '{channel}' is inverted: min {min} > max {max}")]
    InvertedRange { channel: String, min: f64, max: f64 },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Inclusive `[min_s, max_s]` bounds on a phase duration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DurationBounds {
    pub min_s: f64,
    pub max_s: f64,
}

impl DurationBounds {
    pub fn new(min_s: f64, max_s: f64) -> Self {
        Self { min_s, max_s }
    }

    pub fn contains(&self, duration_s: f64) -> bool {
        duration_s >= self.min_s && duration_s <= self.max_s
    }
}

/// Physically plausible value range for one channel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelRange {
    pub min: f64,
    pub max: f64,
}

impl ChannelRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Thresholds driving per-sample phase classification.
///
/// The defaults are tuned placeholders for 1 Hz airliner telemetry in feet,
/// seconds and knots; nothing about them is meant to be universal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhaseThresholds {
    /// Altitude rate (ft/s) separating level flight from climb/descent.
    pub derivative_threshold: f64,
    /// Width in samples of the centered difference used for the derivative.
    pub derivative_window: usize,
    /// Running median applied to altitude before differentiation (1 = off).
    pub smoothing_window: usize,
    /// Runs shorter than this are treated as noise.
    pub min_segment_samples: usize,
    /// Optional rolling-mode relabelling window.
    pub label_mode_window: Option<usize>,
    /// Level samples slower than this (kt) are taxi.
    pub taxi_airspeed_max: f64,
    /// Level samples at or above this altitude (ft) are cruise.
    pub cruise_min_altitude: f64,
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self {
            derivative_threshold: 5.0,
            derivative_window: 9,
            smoothing_window: 5,
            min_segment_samples: 30,
            label_mode_window: None,
            taxi_airspeed_max: 60.0,
            cruise_min_altitude: 2000.0,
        }
    }
}

/// How to pick one segment when a flight holds several of a wanted label.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentPolicy {
    First,
    Longest,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        SegmentPolicy::First
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub required_channels: BTreeSet<String>,
    pub max_timestamp_gap_s: f64,
    pub channel_ranges: BTreeMap<String, ChannelRange>,
    pub phase_thresholds: PhaseThresholds,
    pub climb_duration_bounds: DurationBounds,
    /// Bounds for labels other than climb; absent labels are unbounded.
    pub phase_duration_bounds: BTreeMap<PhaseLabel, DurationBounds>,
    pub altitude_tolerance: f64,
    pub min_phase_samples: usize,
    pub target_sequence_length: usize,
    pub channels_to_extract: BTreeSet<String>,
    pub phase_labels: Vec<PhaseLabel>,
    pub segment_policy: SegmentPolicy,
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        let schema: BTreeSet<String> = channels::SCHEMA.iter().map(|c| c.to_string()).collect();
        let mut channel_ranges = BTreeMap::new();
        channel_ranges.insert(channels::ALTITUDE.to_string(), ChannelRange::new(-2000.0, 60000.0));
        channel_ranges.insert(channels::AIRSPEED.to_string(), ChannelRange::new(0.0, 700.0));
        channel_ranges.insert(
            channels::VERTICAL_RATE.to_string(),
            ChannelRange::new(-15000.0, 15000.0),
        );
        channel_ranges.insert(channels::FUEL_FLOW.to_string(), ChannelRange::new(0.0, 20000.0));
        Self {
            required_channels: schema.clone(),
            max_timestamp_gap_s: 10.0,
            channel_ranges,
            phase_thresholds: PhaseThresholds::default(),
            climb_duration_bounds: DurationBounds::new(120.0, 3600.0),
            phase_duration_bounds: BTreeMap::new(),
            altitude_tolerance: 100.0,
            min_phase_samples: 2,
            target_sequence_length: 100,
            channels_to_extract: schema,
            phase_labels: vec![PhaseLabel::Climb],
            segment_policy: SegmentPolicy::First,
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject inconsistent settings before any flight is processed.
    pub fn check(&self) -> Result<(), ConfigurationError> {
        if self.required_channels.is_empty() {
            return Err(ConfigurationError::NoRequiredChannels);
        }
        if !self.required_channels.contains(channels::ALTITUDE) {
            return Err(ConfigurationError::MissingAltitudeChannel(
                channels::ALTITUDE.to_string(),
            ));
        }
        if let Some(missing) = self
            .channels_to_extract
            .iter()
            .find(|c| !self.required_channels.contains(*c))
        {
            return Err(ConfigurationError::UnvalidatedChannel(missing.clone()));
        }
        if self.phase_labels.is_empty() {
            return Err(ConfigurationError::NoPhaseLabels);
        }
        positive("max_timestamp_gap_s", self.max_timestamp_gap_s)?;
        positive(
            "phase_thresholds.derivative_threshold",
            self.phase_thresholds.derivative_threshold,
        )?;
        positive(
            "phase_thresholds.derivative_window",
            self.phase_thresholds.derivative_window as f64,
        )?;
        positive(
            "phase_thresholds.smoothing_window",
            self.phase_thresholds.smoothing_window as f64,
        )?;
        positive(
            "phase_thresholds.min_segment_samples",
            self.phase_thresholds.min_segment_samples as f64,
        )?;
        if let Some(window) = self.phase_thresholds.label_mode_window {
            positive("phase_thresholds.label_mode_window", window as f64)?;
        }
        if !(self.altitude_tolerance >= 0.0) {
            return Err(ConfigurationError::NonPositive {
                field: "altitude_tolerance",
                value: self.altitude_tolerance,
            });
        }
        positive("min_phase_samples", self.min_phase_samples as f64)?;
        if self.target_sequence_length < 2 {
            return Err(ConfigurationError::TargetLengthTooShort(
                self.target_sequence_length,
            ));
        }
        let bounds = std::iter::once((PhaseLabel::Climb, &self.climb_duration_bounds))
            .chain(self.phase_duration_bounds.iter().map(|(l, b)| (*l, b)));
        for (label, b) in bounds {
            if !(b.min_s <= b.max_s) {
                return Err(ConfigurationError::InvertedDurationBounds {
                    label,
                    min_s: b.min_s,
                    max_s: b.max_s,
                });
            }
        }
        for (channel, range) in &self.channel_ranges {
            if !(range.min <= range.max) {
                return Err(ConfigurationError::InvertedRange {
                    channel: channel.clone(),
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }

    /// Duration bounds applied to `label` by the extractor.
    pub fn duration_bounds(&self, label: PhaseLabel) -> Option<DurationBounds> {
        match label {
            PhaseLabel::Climb => Some(self.climb_duration_bounds),
            other => self.phase_duration_bounds.get(&other).copied(),
        }
    }

    /// SHA-256 of the JSON form; identical configurations hash identically.
    pub fn params_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&bytes)
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::NonPositive { field, value })
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
