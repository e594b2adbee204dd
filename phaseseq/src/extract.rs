//! Phase-specific consistency checks on one segment of a validated series.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::segment::{PhaseLabel, Segment};
use crate::series::{channels, missing_runs, missing_span_s, TimeSeries};
use crate::validate::ValidatedSeries;
use crate::Config;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    #[error("segment [{start}, {end}) does not fit a series of {len} samples")]
    SegmentOutOfBounds { start: usize, end: usize, len: usize },
    #[error("{label} segment has {samples} samples, need at least {min_samples}")]
    InsufficientSamples {
        label: PhaseLabel,
        samples: usize,
        min_samples: usize,
    },
    #[error("{label} lasts {duration_s}s, outside [{min_s}s, {max_s}s]")]
    DurationOutOfBounds {
        label: PhaseLabel,
        duration_s: f64,
        min_s: f64,
        max_s: f64,
    },
    #[error("channel '{channel}' is missing over [{start_index}, {end_index}] ({span_s}s, limit {max_gap_s}s)")]
    MissingValueGap {
        channel: String,
        start_index: usize,
        end_index: usize,
        span_s: f64,
        max_gap_s: f64,
    },
    #[error("{label} altitude reverses by {excursion} ft at index {index} (tolerance {tolerance} ft)")]
    NonMonotonicAltitude {
        label: PhaseLabel,
        index: usize,
        excursion: f64,
        tolerance: f64,
    },
}

impl ExtractionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractionError::SegmentOutOfBounds { .. } => "extraction.segment_out_of_bounds",
            ExtractionError::InsufficientSamples { .. } => "extraction.insufficient_samples",
            ExtractionError::DurationOutOfBounds { .. } => "extraction.duration_out_of_bounds",
            ExtractionError::MissingValueGap { .. } => "extraction.missing_value_gap",
            ExtractionError::NonMonotonicAltitude { .. } => "extraction.non_monotonic_altitude",
        }
    }
}

/// Borrowed view of one segment of a validated series.
#[derive(Clone, Copy, Debug)]
pub struct PhaseSlice<'a> {
    series: &'a TimeSeries,
    segment: Segment,
}

impl<'a> PhaseSlice<'a> {
    /// Callers guarantee `segment` lies within `series`.
    pub(crate) fn new(series: ValidatedSeries<'a>, segment: Segment) -> Self {
        Self {
            series: series.series(),
            segment,
        }
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn label(&self) -> PhaseLabel {
        self.segment.label
    }

    pub fn flight_id(&self) -> &'a str {
        &self.series.flight_id
    }

    pub fn len(&self) -> usize {
        self.segment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }

    pub fn times(&self) -> &'a [f64] {
        &self.series.times[self.segment.start..self.segment.end]
    }

    pub fn channel(&self, name: &str) -> Option<&'a [f64]> {
        self.series
            .channels
            .get(name)
            .map(|values| &values[self.segment.start..self.segment.end])
    }

    pub fn duration_s(&self) -> f64 {
        let times = self.times();
        match (times.first(), times.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

pub fn extract<'a>(
    series: &ValidatedSeries<'a>,
    segment: Segment,
    config: &Config,
) -> Result<PhaseSlice<'a>, ExtractionError> {
    let len = series.len();
    if segment.is_empty() || segment.end > len {
        return Err(ExtractionError::SegmentOutOfBounds {
            start: segment.start,
            end: segment.end,
            len,
        });
    }
    let slice = PhaseSlice::new(*series, segment);
    let label = segment.label;

    if slice.len() < config.min_phase_samples {
        return Err(ExtractionError::InsufficientSamples {
            label,
            samples: slice.len(),
            min_samples: config.min_phase_samples,
        });
    }

    if let Some(bounds) = config.duration_bounds(label) {
        let duration_s = slice.duration_s();
        if !bounds.contains(duration_s) {
            return Err(ExtractionError::DurationOutOfBounds {
                label,
                duration_s,
                min_s: bounds.min_s,
                max_s: bounds.max_s,
            });
        }
    }

    check_local_gaps(&slice, config)?;

    if let Some(altitude) = slice.channel(channels::ALTITUDE) {
        check_monotonic(altitude, &slice, config.altitude_tolerance)?;
    }

    Ok(slice)
}

fn check_local_gaps(slice: &PhaseSlice<'_>, config: &Config) -> Result<(), ExtractionError> {
    let times = slice.times();
    let offset = slice.segment.start;
    for name in &config.required_channels {
        let Some(values) = slice.channel(name) else {
            continue;
        };
        for (start, end) in missing_runs(values) {
            let span = missing_span_s(times, start, end);
            if span > config.max_timestamp_gap_s || end + 1 - start == values.len() {
                return Err(ExtractionError::MissingValueGap {
                    channel: name.clone(),
                    start_index: offset + start,
                    end_index: offset + end,
                    span_s: span,
                    max_gap_s: config.max_timestamp_gap_s,
                });
            }
        }
    }
    Ok(())
}

/// Climbs may not lose more than `tolerance` below their running peak,
/// descents may not regain more than `tolerance` above their running trough.
fn check_monotonic(
    altitude: &[f64],
    slice: &PhaseSlice<'_>,
    tolerance: f64,
) -> Result<(), ExtractionError> {
    let sign = match slice.label() {
        PhaseLabel::Climb => 1.0,
        PhaseLabel::Descent => -1.0,
        _ => return Ok(()),
    };
    let mut extreme = f64::NEG_INFINITY;
    for (i, &raw) in altitude.iter().enumerate() {
        if raw.is_nan() {
            continue;
        }
        let value = sign * raw;
        if value > extreme {
            extreme = value;
        } else if extreme - value > tolerance {
            return Err(ExtractionError::NonMonotonicAltitude {
                label: slice.label(),
                index: slice.segment.start + i,
                excursion: extreme - value,
                tolerance,
            });
        }
    }
    Ok(())
}
