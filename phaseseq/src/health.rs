//! Batch-level health report, independent of the phase pipeline.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::series::{channels, TimeSeries};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// A record never reaching this altitude (ft) holds no real flight.
    pub min_flight_altitude_ft: f64,
    /// Nor does one shorter than this.
    pub min_flight_duration_s: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_flight_altitude_ft: 2000.0,
            min_flight_duration_s: 2000.0,
        }
    }
}

/// Flight ids failing each check, in input order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub checked: usize,
    pub non_continuous: Vec<String>,
    pub missing_values: Vec<String>,
    pub column_mismatch: Vec<String>,
    pub no_flight: Vec<String>,
}

impl HealthReport {
    pub fn problematic(&self) -> BTreeSet<String> {
        self.non_continuous
            .iter()
            .chain(&self.missing_values)
            .chain(&self.column_mismatch)
            .chain(&self.no_flight)
            .cloned()
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.non_continuous.is_empty()
            && self.missing_values.is_empty()
            && self.column_mismatch.is_empty()
            && self.no_flight.is_empty()
    }
}

/// Run every check on every flight. The first flight's channel set is the
/// reference for the column check.
pub fn health_check<'a, I>(flights: I, config: &HealthConfig) -> HealthReport
where
    I: IntoIterator<Item = &'a TimeSeries>,
{
    let mut report = HealthReport::default();
    let mut reference: Option<BTreeSet<&'a str>> = None;

    for series in flights {
        report.checked += 1;
        let id = &series.flight_id;

        if series.times.windows(2).any(|w| !(w[1] > w[0])) {
            report.non_continuous.push(id.clone());
        }

        let has_missing = series.times.iter().any(|t| t.is_nan())
            || series.channels.values().flatten().any(|v| v.is_nan());
        if has_missing {
            report.missing_values.push(id.clone());
        }

        let columns: BTreeSet<&str> = series.channels.keys().map(String::as_str).collect();
        match &reference {
            None => reference = Some(columns),
            Some(expected) if *expected != columns => report.column_mismatch.push(id.clone()),
            Some(_) => {}
        }

        let max_alt = series
            .channel(channels::ALTITUDE)
            .and_then(|alt| alt.iter().copied().filter(|v| !v.is_nan()).reduce(f64::max));
        let flew = max_alt.map_or(false, |a| a >= config.min_flight_altitude_ft)
            && series.span_s() >= config.min_flight_duration_s;
        if !flew {
            report.no_flight.push(id.clone());
        }
    }

    if !report.is_healthy() {
        warn!(
            checked = report.checked,
            non_continuous = report.non_continuous.len(),
            missing_values = report.missing_values.len(),
            column_mismatch = report.column_mismatch.len(),
            no_flight = report.no_flight.len(),
            "health check found problematic flights"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ramp_flight;

    fn long_flight(id: &str) -> TimeSeries {
        ramp_flight(id, 600, 900, 1200, 30000.0)
    }

    #[test]
    fn test_each_check_flags_its_flight() {
        let good = long_flight("GOOD");
        let mut jumbled = long_flight("JUMBLED");
        jumbled.times.swap(10, 11);
        let mut holes = long_flight("HOLES");
        holes.channels.get_mut(channels::FUEL_FLOW).unwrap()[3] = f64::NAN;
        let mut extra = long_flight("EXTRA");
        extra.channels.insert("egt".to_string(), vec![600.0; extra.len()]);
        let ground = ramp_flight("GROUND", 600, 100, 600, 1500.0);

        let flights = vec![good, jumbled, holes, extra, ground];
        let report = health_check(&flights, &HealthConfig::default());

        assert_eq!(report.checked, 5);
        assert_eq!(report.non_continuous, vec!["JUMBLED"]);
        assert_eq!(report.missing_values, vec!["HOLES"]);
        assert_eq!(report.column_mismatch, vec!["EXTRA"]);
        assert_eq!(report.no_flight, vec!["GROUND"]);
        assert!(!report.problematic().contains("GOOD"));
        assert_eq!(report.problematic().len(), 4);
    }

    #[test]
    fn test_healthy_batch() {
        let flights = vec![long_flight("A"), long_flight("B")];
        let report = health_check(&flights, &HealthConfig::default());
        assert!(report.is_healthy());
        assert!(report.problematic().is_empty());
    }
}
