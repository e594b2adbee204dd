//! Well-formedness checks on a raw flight series.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::series::{missing_runs, missing_span_s, TimeSeries};
use crate::Config;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("series has no samples")]
    Empty,
    #[error("required channel '{channel}' is missing")]
    MissingChannel { channel: String },
    #[error("channel '{channel}' has {found} samples, expected {expected}")]
    LengthMismatch {
        channel: String,
        expected: usize,
        found: usize,
    },
    #[error("timestamp at index {index} is not finite")]
    NonFiniteTimestamp { index: usize },
    #[error("timestamp at index {index} ({current_s}s) does not follow {previous_s}s")]
    NonIncreasingTimestamp {
        index: usize,
        previous_s: f64,
        current_s: f64,
    },
    #[error("gap of {gap_s}s before index {index} exceeds {max_gap_s}s")]
    TimestampGap {
        index: usize,
        gap_s: f64,
        max_gap_s: f64,
    },
    #[error("channel '{channel}' is missing over [{start_index}, {end_index}] ({span_s}s > {max_gap_s}s)")]
    MissingValueGap {
        channel: String,
        start_index: usize,
        end_index: usize,
        span_s: f64,
        max_gap_s: f64,
    },
    #[error("channel '{channel}' holds an infinite value at index {index}")]
    NonFiniteValue { channel: String, index: usize },
    #[error("channel '{channel}' value {value} at index {index} outside [{min}, {max}]")]
    OutOfRange {
        channel: String,
        index: usize,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Empty => "validation.empty",
            ValidationError::MissingChannel { .. } => "validation.missing_channel",
            ValidationError::LengthMismatch { .. } => "validation.length_mismatch",
            ValidationError::NonFiniteTimestamp { .. } => "validation.non_finite_timestamp",
            ValidationError::NonIncreasingTimestamp { .. } => "validation.non_increasing_timestamp",
            ValidationError::TimestampGap { .. } => "validation.timestamp_gap",
            ValidationError::MissingValueGap { .. } => "validation.missing_value_gap",
            ValidationError::NonFiniteValue { .. } => "validation.non_finite_value",
            ValidationError::OutOfRange { .. } => "validation.out_of_range",
        }
    }
}

/// A series that passed [`validate`]. Borrows the original, never copies it.
#[derive(Clone, Copy, Debug)]
pub struct ValidatedSeries<'a>(&'a TimeSeries);

impl<'a> ValidatedSeries<'a> {
    pub fn series(&self) -> &'a TimeSeries {
        self.0
    }
}

impl Deref for ValidatedSeries<'_> {
    type Target = TimeSeries;

    fn deref(&self) -> &TimeSeries {
        self.0
    }
}

pub fn validate<'a>(
    series: &'a TimeSeries,
    config: &Config,
) -> Result<ValidatedSeries<'a>, ValidationError> {
    if series.is_empty() {
        return Err(ValidationError::Empty);
    }

    let n = series.len();
    for name in &config.required_channels {
        let values = series
            .channel(name)
            .ok_or_else(|| ValidationError::MissingChannel {
                channel: name.clone(),
            })?;
        if values.len() != n {
            return Err(ValidationError::LengthMismatch {
                channel: name.clone(),
                expected: n,
                found: values.len(),
            });
        }
    }

    let times = &series.times;
    if let Some(index) = times.iter().position(|t| !t.is_finite()) {
        return Err(ValidationError::NonFiniteTimestamp { index });
    }
    for (i, w) in times.windows(2).enumerate() {
        if w[1] <= w[0] {
            return Err(ValidationError::NonIncreasingTimestamp {
                index: i + 1,
                previous_s: w[0],
                current_s: w[1],
            });
        }
    }
    for (i, w) in times.windows(2).enumerate() {
        let gap = w[1] - w[0];
        if gap > config.max_timestamp_gap_s {
            return Err(ValidationError::TimestampGap {
                index: i + 1,
                gap_s: gap,
                max_gap_s: config.max_timestamp_gap_s,
            });
        }
    }

    for name in &config.required_channels {
        let values = series.channel(name).unwrap_or_default();
        for (start, end) in missing_runs(values) {
            let span = missing_span_s(times, start, end);
            if span > config.max_timestamp_gap_s || end + 1 - start == n {
                return Err(ValidationError::MissingValueGap {
                    channel: name.clone(),
                    start_index: start,
                    end_index: end,
                    span_s: span,
                    max_gap_s: config.max_timestamp_gap_s,
                });
            }
        }
    }

    for name in &config.required_channels {
        let values = series.channel(name).unwrap_or_default();
        if let Some(index) = values.iter().position(|v| v.is_infinite()) {
            return Err(ValidationError::NonFiniteValue {
                channel: name.clone(),
                index,
            });
        }
    }

    // values are finite or NaN from here on
    for name in &config.required_channels {
        let Some(range) = config.channel_ranges.get(name) else {
            continue;
        };
        let values = series.channel(name).unwrap_or_default();
        let bad = values
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_nan() && !range.contains(**v));
        if let Some((index, &value)) = bad {
            return Err(ValidationError::OutOfRange {
                channel: name.clone(),
                index,
                value,
                min: range.min,
                max: range.max,
            });
        }
    }

    Ok(ValidatedSeries(series))
}
