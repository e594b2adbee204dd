//! Fixed-length, time-aligned resampling of phase slices.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::PhaseSlice;
use crate::segment::{PhaseLabel, Segment};
use crate::series::TimeSeries;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SequenceError {
    #[error("target length must be at least 1")]
    TargetTooShort,
    #[error("channel '{channel}' is not present in the slice")]
    MissingChannel { channel: String },
    #[error("channel '{channel}' has no valid samples in the slice")]
    NoValidSamples { channel: String },
}

impl SequenceError {
    pub fn code(&self) -> &'static str {
        match self {
            SequenceError::TargetTooShort => "sequence.target_too_short",
            SequenceError::MissingChannel { .. } => "sequence.missing_channel",
            SequenceError::NoValidSamples { .. } => "sequence.no_valid_samples",
        }
    }
}

/// A phase resampled onto `N` evenly spaced instants; every channel holds
/// exactly `N` finite values aligned on `times`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sequence {
    pub flight_id: String,
    pub label: PhaseLabel,
    pub segment: Segment,
    pub start_time_s: f64,
    pub duration_s: f64,
    /// Elapsed seconds since `start_time_s`.
    pub times: Vec<f64>,
    pub channels: BTreeMap<String, Vec<f64>>,
}

impl Sequence {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    /// Channels × samples matrix, rows in channel-name order.
    pub fn to_array2(&self) -> Array2<f64> {
        let rows: Vec<&Vec<f64>> = self.channels.values().collect();
        Array2::from_shape_fn((rows.len(), self.len()), |(r, c)| rows[r][c])
    }

    /// Re-express the sequence as a raw series on absolute time.
    pub fn to_series(&self) -> TimeSeries {
        let times = self.times.iter().map(|t| self.start_time_s + t).collect();
        let mut series = TimeSeries::new(self.flight_id.clone(), times);
        series.channels = self.channels.clone();
        series
    }
}

/// Resample `channels` of `slice` onto `target_length` instants evenly spread
/// over the slice's elapsed time.
pub fn build<I, S>(
    slice: &PhaseSlice<'_>,
    target_length: usize,
    channels: I,
) -> Result<Sequence, SequenceError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if target_length == 0 {
        return Err(SequenceError::TargetTooShort);
    }
    let times = slice.times();
    let start_time_s = times.first().copied().unwrap_or(0.0);
    let duration_s = slice.duration_s();

    let elapsed: Vec<f64> = if target_length == 1 {
        vec![0.0]
    } else {
        let last = (target_length - 1) as f64;
        (0..target_length)
            .map(|k| duration_s * k as f64 / last)
            .collect()
    };
    let targets: Vec<f64> = elapsed.iter().map(|e| start_time_s + e).collect();

    let mut out = BTreeMap::new();
    for name in channels {
        let name = name.as_ref();
        let values = slice
            .channel(name)
            .ok_or_else(|| SequenceError::MissingChannel {
                channel: name.to_string(),
            })?;
        let (xs, ys) = valid_points(times, values);
        if xs.is_empty() {
            return Err(SequenceError::NoValidSamples {
                channel: name.to_string(),
            });
        }
        out.insert(name.to_string(), interpolate_linear(&xs, &ys, &targets));
    }

    Ok(Sequence {
        flight_id: slice.flight_id().to_string(),
        label: slice.label(),
        segment: slice.segment(),
        start_time_s,
        duration_s,
        times: elapsed,
        channels: out,
    })
}

/// Fill `NaN` samples by interpolating the valid ones on time. `None` when
/// nothing is valid.
pub(crate) fn fill_missing(times: &[f64], values: &[f64]) -> Option<Vec<f64>> {
    let (xs, ys) = valid_points(times, values);
    if xs.is_empty() {
        return None;
    }
    if xs.len() == values.len() {
        return Some(values.to_vec());
    }
    Some(interpolate_linear(&xs, &ys, times))
}

fn valid_points(times: &[f64], values: &[f64]) -> (Vec<f64>, Vec<f64>) {
    times
        .iter()
        .zip(values.iter())
        .filter(|(_, v)| !v.is_nan())
        .map(|(&t, &v)| (t, v))
        .unzip()
}

/// Linear interpolation of `(xs, ys)` at ascending `targets`, holding the end
/// values outside `xs`. `xs` must be non-empty and strictly increasing.
fn interpolate_linear(xs: &[f64], ys: &[f64], targets: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(targets.len());
    let mut idx = 0;
    for &target in targets {
        while idx + 1 < xs.len() && xs[idx + 1] <= target {
            idx += 1;
        }
        let (x0, y0) = (xs[idx], ys[idx]);
        if target <= x0 || idx + 1 == xs.len() {
            out.push(y0);
            continue;
        }
        let (x1, y1) = (xs[idx + 1], ys[idx + 1]);
        let frac = ((target - x0) / (x1 - x0)).clamp(0.0, 1.0);
        out.push(y0 + (y1 - y0) * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;
    use crate::series::channels;
    use crate::testutil::ramp_flight;
    use crate::validate::validate;
    use crate::Config;

    fn loose_config() -> Config {
        let mut config = Config::default();
        config.climb_duration_bounds.min_s = 0.0;
        config
    }

    fn irregular() -> TimeSeries {
        let times = vec![0.0, 1.0, 3.0, 7.0, 10.0];
        let n = times.len();
        let altitude = times.iter().map(|t| 2.0 * t).collect();
        let fuel = vec![100.0, f64::NAN, 300.0, 700.0, 1000.0];
        TimeSeries::new("I", times)
            .with_channel(channels::ALTITUDE, altitude)
            .with_channel(channels::AIRSPEED, vec![150.0; n])
            .with_channel(channels::VERTICAL_RATE, vec![120.0; n])
            .with_channel(channels::FUEL_FLOW, fuel)
    }

    #[test]
    fn test_resamples_on_elapsed_time_not_index() {
        let series = irregular();
        let config = loose_config();
        let validated = validate(&series, &config).unwrap();
        let slice = extract(&validated, Segment::new(PhaseLabel::Climb, 0, 5), &config).unwrap();
        let seq = build(&slice, 11, [channels::ALTITUDE]).unwrap();

        assert_eq!(seq.len(), 11);
        assert_eq!(seq.duration_s, 10.0);
        let alt = seq.channel(channels::ALTITUDE).unwrap();
        for (k, v) in alt.iter().enumerate() {
            assert!((v - 2.0 * k as f64).abs() < 1e-9, "k={} v={}", k, v);
        }
    }

    #[test]
    fn test_channels_aligned_and_gaps_bridged() {
        let series = irregular();
        let config = loose_config();
        let validated = validate(&series, &config).unwrap();
        let slice = extract(&validated, Segment::new(PhaseLabel::Climb, 0, 5), &config).unwrap();
        let seq = build(&slice, 6, &config.channels_to_extract).unwrap();

        assert_eq!(seq.channels.len(), 4);
        for values in seq.channels.values() {
            assert_eq!(values.len(), 6);
            assert!(values.iter().all(|v| v.is_finite()));
        }
        // fuel at t=2 lies between the samples at t=0 and t=3
        let fuel = seq.channel(channels::FUEL_FLOW).unwrap();
        assert!((fuel[1] - 233.333_333_333).abs() < 1e-6);
        assert_eq!(seq.to_array2().dim(), (4, 6));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let series = ramp_flight("R", 100, 400, 100, 20000.0);
        let config = Config::default();
        let validated = validate(&series, &config).unwrap();
        let slice =
            extract(&validated, Segment::new(PhaseLabel::Climb, 90, 510), &config).unwrap();
        let first = build(&slice, 64, &config.channels_to_extract).unwrap();

        let again = first.to_series();
        let revalidated = validate(&again, &config).unwrap();
        let whole = Segment::new(PhaseLabel::Climb, 0, again.len());
        let reslice = extract(&revalidated, whole, &config).unwrap();
        let second = build(&reslice, 64, &config.channels_to_extract).unwrap();

        for (name, values) in &first.channels {
            let other = second.channel(name).unwrap();
            for (a, b) in values.iter().zip(other) {
                assert!((a - b).abs() < 1e-6, "{}: {} vs {}", name, a, b);
            }
        }
    }

    #[test]
    fn test_build_is_bit_identical() {
        let series = ramp_flight("B", 30, 200, 30, 9000.0);
        let config = Config::default();
        let validated = validate(&series, &config).unwrap();
        let slice =
            extract(&validated, Segment::new(PhaseLabel::Climb, 20, 240), &config).unwrap();
        let a = build(&slice, 37, &config.channels_to_extract).unwrap();
        let b = build(&slice, 37, &config.channels_to_extract).unwrap();
        for (x, y) in a.channels.values().flatten().zip(b.channels.values().flatten()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_errors() {
        let series = irregular();
        let config = loose_config();
        let validated = validate(&series, &config).unwrap();
        let slice = extract(&validated, Segment::new(PhaseLabel::Climb, 0, 5), &config).unwrap();
        assert_eq!(
            build(&slice, 0, [channels::ALTITUDE]).unwrap_err(),
            SequenceError::TargetTooShort
        );
        assert_eq!(
            build(&slice, 8, ["egt"]).unwrap_err(),
            SequenceError::MissingChannel {
                channel: "egt".to_string()
            }
        );
        let short = Segment::new(PhaseLabel::Other, 1, 2);
        let nan_slice = PhaseSlice::new(validated, short);
        assert_eq!(
            build(&nan_slice, 4, [channels::FUEL_FLOW]).unwrap_err(),
            SequenceError::NoValidSamples {
                channel: channels::FUEL_FLOW.to_string()
            }
        );
    }

    #[test]
    fn test_interpolation_holds_ends() {
        let xs = [1.0, 2.0];
        let ys = [10.0, 20.0];
        assert_eq!(
            interpolate_linear(&xs, &ys, &[0.0, 1.0, 1.5, 2.0, 3.0]),
            vec![10.0, 10.0, 15.0, 20.0, 20.0]
        );
        assert_eq!(
            fill_missing(&[0.0, 1.0, 2.0], &[f64::NAN, 4.0, f64::NAN]),
            Some(vec![4.0, 4.0, 4.0])
        );
        assert_eq!(fill_missing(&[0.0], &[f64::NAN]), None);
    }
}
