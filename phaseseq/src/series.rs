use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Channel names of the fixed telemetry schema.
pub mod channels {
    pub const ALTITUDE: &str = "altitude";
    pub const AIRSPEED: &str = "airspeed";
    pub const VERTICAL_RATE: &str = "vertical_rate";
    pub const FUEL_FLOW: &str = "fuel_flow";

    pub const SCHEMA: [&str; 4] = [ALTITUDE, AIRSPEED, VERTICAL_RATE, FUEL_FLOW];
}

/// One flight's raw telemetry. Missing samples are stored as `NaN`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimeSeries {
    pub flight_id: String,
    /// Sample instants in seconds.
    pub times: Vec<f64>,
    pub channels: BTreeMap<String, Vec<f64>>,
}

impl TimeSeries {
    pub fn new(flight_id: impl Into<String>, times: Vec<f64>) -> Self {
        Self {
            flight_id: flight_id.into(),
            times,
            channels: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.channels.insert(name.into(), values);
        self
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    /// Elapsed time between first and last sample.
    pub fn span_s(&self) -> f64 {
        match (self.times.first(), self.times.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

/// Maximal runs of `NaN` in `values` as inclusive `(start, end)` index pairs.
pub(crate) fn missing_runs(values: &[f64]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut open: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        match (v.is_nan(), open) {
            (true, None) => open = Some(i),
            (false, Some(start)) => {
                runs.push((start, i - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        runs.push((start, values.len() - 1));
    }
    runs
}

/// Time spanned by a missing run: from the last valid sample before it to the
/// first valid one after it, clamped to the series ends.
pub(crate) fn missing_span_s(times: &[f64], start: usize, end: usize) -> f64 {
    let before = start.saturating_sub(1);
    let after = (end + 1).min(times.len() - 1);
    times[after] - times[before]
}
