//! Per-sample phase classification and run-length cleanup.

use std::fmt;
use std::str::FromStr;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::sequence::fill_missing;
use crate::series::channels;
use crate::validate::ValidatedSeries;
use crate::PhaseThresholds;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhaseLabel {
    Climb,
    Cruise,
    Descent,
    Taxi,
    Other,
}

impl PhaseLabel {
    pub const ALL: [PhaseLabel; 5] = [
        PhaseLabel::Climb,
        PhaseLabel::Cruise,
        PhaseLabel::Descent,
        PhaseLabel::Taxi,
        PhaseLabel::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseLabel::Climb => "climb",
            PhaseLabel::Cruise => "cruise",
            PhaseLabel::Descent => "descent",
            PhaseLabel::Taxi => "taxi",
            PhaseLabel::Other => "other",
        }
    }

    fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        PhaseLabel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == normalized)
            .ok_or_else(|| format!("unknown phase label '{}'", s))
    }
}

/// A labelled half-open index range `[start, end)` of one flight's series.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub label: PhaseLabel,
    pub start: usize,
    pub end: usize,
}

impl Segment {
    pub fn new(label: PhaseLabel, start: usize, end: usize) -> Self {
        Self { label, start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Maximal run of equal consecutive labels, half-open like [`Segment`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    pub label: PhaseLabel,
    pub start: usize,
    pub end: usize,
}

impl Run {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Partition a validated series into ordered phase segments covering every
/// sample exactly once.
pub fn segment(series: &ValidatedSeries<'_>, thresholds: &PhaseThresholds) -> Vec<Segment> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }
    let times = series.times.as_slice();
    let Some(altitude) = series
        .channel(channels::ALTITUDE)
        .and_then(|alt| fill_missing(times, alt))
    else {
        return vec![Segment::new(PhaseLabel::Other, 0, n)];
    };
    let airspeed = series.channel(channels::AIRSPEED);

    let smoothed = smooth_median(&Array1::from_vec(altitude), thresholds.smoothing_window);
    let derivative = centered_derivative(times, &smoothed, thresholds.derivative_window);

    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let speed = airspeed.map(|a| a[i]).filter(|v| !v.is_nan());
        let label = classify_sample(
            derivative[i],
            smoothed[i],
            speed,
            labels.last().copied(),
            thresholds,
        );
        labels.push(label);
    }

    if let Some(window) = thresholds.label_mode_window {
        labels = relabel_by_mode(&labels, window);
    }

    let runs = extract_runs(&labels);
    clean_runs(&runs, n, thresholds.min_segment_samples)
}

pub(crate) fn classify_sample(
    derivative: f64,
    altitude: f64,
    airspeed: Option<f64>,
    previous: Option<PhaseLabel>,
    thresholds: &PhaseThresholds,
) -> PhaseLabel {
    let threshold = thresholds.derivative_threshold;
    if derivative > threshold {
        return PhaseLabel::Climb;
    }
    if derivative < -threshold {
        return PhaseLabel::Descent;
    }
    if derivative.abs() == threshold {
        if let Some(prev) = previous {
            return prev;
        }
    }
    if matches!(airspeed, Some(v) if v < thresholds.taxi_airspeed_max) {
        PhaseLabel::Taxi
    } else if altitude >= thresholds.cruise_min_altitude {
        PhaseLabel::Cruise
    } else {
        PhaseLabel::Other
    }
}

fn smooth_median(data: &Array1<f64>, window: usize) -> Array1<f64> {
    if window <= 1 {
        return data.clone();
    }
    let radius = window / 2;
    let n = data.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let start = i.saturating_sub(radius);
        let end = (i + radius + 1).min(n);
        let mut slice = data.slice(ndarray::s![start..end]).to_vec();
        slice.sort_by(|a, b| a.total_cmp(b));
        let median = if slice.len() % 2 == 0 {
            let mid = slice.len() / 2;
            (slice[mid - 1] + slice[mid]) / 2.0
        } else {
            slice[slice.len() / 2]
        };
        out.push(median);
    }
    Array1::from_vec(out)
}

/// Centered difference over `window` samples, per second of elapsed time.
fn centered_derivative(times: &[f64], values: &Array1<f64>, window: usize) -> Array1<f64> {
    let n = values.len();
    let radius = (window / 2).max(1);
    Array1::from_shape_fn(n, |i| {
        let lo = i.saturating_sub(radius);
        let hi = (i + radius).min(n - 1);
        let dt = times[hi] - times[lo];
        if hi == lo || dt <= 0.0 {
            0.0
        } else {
            (values[hi] - values[lo]) / dt
        }
    })
}

/// Replace each label by the most frequent one in its centered window. The
/// first and last `window` samples keep their label; ties go to the lowest
/// label.
fn relabel_by_mode(labels: &[PhaseLabel], window: usize) -> Vec<PhaseLabel> {
    let n = labels.len();
    let mut out = labels.to_vec();
    if window <= 1 || 2 * window >= n {
        return out;
    }
    let half = window / 2;
    for i in window..(n - window) {
        let mut counts = [0usize; PhaseLabel::ALL.len()];
        for label in &labels[i - half..i - half + window] {
            counts[label.ordinal()] += 1;
        }
        let mut best = 0;
        for k in 1..counts.len() {
            if counts[k] > counts[best] {
                best = k;
            }
        }
        out[i] = PhaseLabel::ALL[best];
    }
    out
}

/// Group consecutive equal labels into runs.
pub fn extract_runs(labels: &[PhaseLabel]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for (i, &label) in labels.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if run.label == label => run.end = i + 1,
            _ => runs.push(Run {
                label,
                start: i,
                end: i + 1,
            }),
        }
    }
    runs
}

/// Drop runs shorter than `min_len`: each is absorbed by the preceding kept
/// run, or by the first kept run when none precedes it.
pub(crate) fn clean_runs(runs: &[Run], n: usize, min_len: usize) -> Vec<Segment> {
    if n == 0 {
        return Vec::new();
    }
    let kept: Vec<&Run> = runs.iter().filter(|r| r.len() >= min_len).collect();
    if kept.is_empty() {
        let mut longest: Option<&Run> = None;
        for run in runs {
            if longest.map_or(true, |best| run.len() > best.len()) {
                longest = Some(run);
            }
        }
        let label = longest.map(|r| r.label).unwrap_or(PhaseLabel::Other);
        return vec![Segment::new(label, 0, n)];
    }

    let mut out: Vec<Segment> = Vec::with_capacity(kept.len());
    for (k, run) in kept.iter().enumerate() {
        let end = kept.get(k + 1).map(|next| next.start).unwrap_or(n);
        match out.last_mut() {
            Some(last) if last.label == run.label => last.end = end,
            _ => {
                let start = if k == 0 { 0 } else { run.start };
                out.push(Segment::new(run.label, start, end));
            }
        }
    }
    out
}

/// Start indices of the distinct occurrences of `label`, or nothing when the
/// label occurs at most once. An occurrence followed by another within
/// `min_gap_samples` counts as part of that next one.
pub fn find_repeated_phases(
    segments: &[Segment],
    label: PhaseLabel,
    min_gap_samples: usize,
) -> Vec<usize> {
    let occurrences: Vec<&Segment> = segments.iter().filter(|s| s.label == label).collect();
    let mut starts = Vec::new();
    for (k, seg) in occurrences.iter().enumerate() {
        let distinct = occurrences
            .get(k + 1)
            .map_or(true, |next| next.start.saturating_sub(seg.end) >= min_gap_samples);
        if distinct {
            starts.push(seg.start);
        }
    }
    if starts.len() > 1 {
        starts
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeries;
    use crate::testutil::{flight_from_altitude, ramp_flight};
    use crate::validate::validate;
    use crate::Config;
    use proptest::prelude::*;
    use PhaseLabel::*;

    fn labels_of(spec: &[(PhaseLabel, usize)]) -> Vec<PhaseLabel> {
        spec.iter()
            .flat_map(|&(label, count)| std::iter::repeat(label).take(count))
            .collect()
    }

    fn segments_of(series: &TimeSeries) -> Vec<Segment> {
        let config = Config::default();
        let validated = validate(series, &config).unwrap();
        segment(&validated, &config.phase_thresholds)
    }

    #[test]
    fn test_ramp_between_flats_yields_one_climb() {
        let series = ramp_flight("R", 300, 600, 300, 30000.0);
        let segments = segments_of(&series);
        let tol = Config::default().phase_thresholds.min_segment_samples as i64;

        let climbs: Vec<&Segment> = segments.iter().filter(|s| s.label == Climb).collect();
        assert_eq!(climbs.len(), 1);
        let climb = climbs[0];
        assert!((climb.start as i64 - 300).abs() <= tol, "start {}", climb.start);
        assert!((climb.end as i64 - 901).abs() <= tol, "end {}", climb.end);

        let labels: Vec<PhaseLabel> = segments.iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![Other, Climb, Cruise]);
    }

    #[test]
    fn test_slow_level_samples_are_taxi() {
        let mut series = ramp_flight("T", 300, 600, 300, 30000.0);
        let speed = series.channels.get_mut(channels::AIRSPEED).unwrap();
        for v in speed.iter_mut().take(200) {
            *v = 15.0;
        }
        let segments = segments_of(&series);
        assert_eq!(segments[0].label, Taxi);
        assert_eq!(segments[0].start, 0);
        assert!((segments[0].end as i64 - 200).abs() <= 1);
    }

    #[test]
    fn test_threshold_tie_keeps_previous_label() {
        let thresholds = PhaseThresholds::default();
        let thr = thresholds.derivative_threshold;
        assert_eq!(
            classify_sample(thr, 5000.0, Some(250.0), Some(Climb), &thresholds),
            Climb
        );
        assert_eq!(
            classify_sample(-thr, 5000.0, Some(250.0), Some(Descent), &thresholds),
            Descent
        );
        assert_eq!(
            classify_sample(thr, 5000.0, Some(250.0), None, &thresholds),
            Cruise
        );
        assert_eq!(
            classify_sample(thr + 0.1, 500.0, Some(250.0), Some(Cruise), &thresholds),
            Climb
        );
        assert_eq!(classify_sample(0.0, 500.0, None, Some(Climb), &thresholds), Other);
    }

    #[test]
    fn test_short_runs_absorbed_by_predecessor() {
        let labels = labels_of(&[(Other, 40), (Climb, 3), (Other, 40), (Climb, 50)]);
        let segments = clean_runs(&extract_runs(&labels), labels.len(), 30);
        assert_eq!(
            segments,
            vec![Segment::new(Other, 0, 83), Segment::new(Climb, 83, 133)]
        );
    }

    #[test]
    fn test_leading_short_run_joins_first_kept() {
        let labels = labels_of(&[(Taxi, 5), (Climb, 40), (Cruise, 2)]);
        let segments = clean_runs(&extract_runs(&labels), labels.len(), 30);
        assert_eq!(segments, vec![Segment::new(Climb, 0, 47)]);
    }

    #[test]
    fn test_all_short_runs_collapse_to_longest() {
        let labels = labels_of(&[(Taxi, 5), (Climb, 8), (Cruise, 8), (Other, 2)]);
        let segments = clean_runs(&extract_runs(&labels), labels.len(), 30);
        assert_eq!(segments, vec![Segment::new(Climb, 0, 23)]);
    }

    #[test]
    fn test_mode_relabel_removes_flicker() {
        let labels = labels_of(&[(Cruise, 6), (Climb, 1), (Cruise, 6)]);
        let relabelled = relabel_by_mode(&labels, 5);
        assert!(relabelled.iter().all(|&l| l == Cruise));
        let edges = labels_of(&[(Climb, 1), (Cruise, 6)]);
        assert_eq!(relabel_by_mode(&edges, 5)[0], Climb);
    }

    #[test]
    fn test_mode_relabel_keeps_a_full_window_at_each_end() {
        // flickers at 3 and 16 sit inside the protected edges, 10 does not
        let mut labels = vec![Cruise; 20];
        for i in [3, 10, 16] {
            labels[i] = Climb;
        }
        let relabelled = relabel_by_mode(&labels, 5);
        assert_eq!(relabelled[3], Climb);
        assert_eq!(relabelled[16], Climb);
        assert_eq!(relabelled[10], Cruise);
        assert_eq!(relabelled.iter().filter(|&&l| l == Climb).count(), 2);
    }

    #[test]
    fn test_extract_runs() {
        let labels = labels_of(&[(Other, 2), (Climb, 1), (Taxi, 2), (Other, 1)]);
        let runs = extract_runs(&labels);
        let summary: Vec<(PhaseLabel, usize, usize)> =
            runs.iter().map(|r| (r.label, r.start, r.end)).collect();
        assert_eq!(
            summary,
            vec![(Other, 0, 2), (Climb, 2, 3), (Taxi, 3, 5), (Other, 5, 6)]
        );
    }

    #[test]
    fn test_go_around_has_two_descents() {
        // climb, cruise, descent to 1500 ft, missed approach, second descent
        let mut altitude = Vec::new();
        altitude.extend(std::iter::repeat(0.0).take(120));
        altitude.extend((1..=200).map(|i| i as f64 * 50.0));
        altitude.extend(std::iter::repeat(10000.0).take(300));
        altitude.extend((1..=170).map(|i| 10000.0 - i as f64 * 50.0));
        altitude.extend(std::iter::repeat(1500.0).take(120));
        altitude.extend((1..=6).map(|i| 1500.0 + i as f64 * 50.0));
        altitude.extend(std::iter::repeat(1800.0).take(120));
        altitude.extend((1..=36).map(|i| 1800.0 - i as f64 * 50.0));
        altitude.extend(std::iter::repeat(0.0).take(120));
        let times: Vec<f64> = (0..altitude.len()).map(|i| i as f64).collect();
        let series = flight_from_altitude("GA", times, altitude);

        let segments = segments_of(&series);
        let starts = find_repeated_phases(&segments, Descent, 30);
        assert_eq!(starts.len(), 2);
        assert!((starts[0] as i64 - 620).abs() <= 30);
        assert!((starts[1] as i64 - 1036).abs() <= 30);
        assert!(find_repeated_phases(&segments, Cruise, 30).is_empty());
    }

    #[test]
    fn test_close_occurrences_count_once() {
        let segments = vec![
            Segment::new(Descent, 0, 50),
            Segment::new(Other, 50, 55),
            Segment::new(Descent, 55, 100),
            Segment::new(Other, 100, 300),
            Segment::new(Descent, 300, 400),
        ];
        assert_eq!(find_repeated_phases(&segments, Descent, 30), vec![55, 300]);
        assert!(find_repeated_phases(&segments, Descent, 500).is_empty());
    }

    #[test]
    fn test_label_parse() {
        assert_eq!("Climb".parse::<PhaseLabel>(), Ok(Climb));
        assert_eq!(" taxi ".parse::<PhaseLabel>(), Ok(Taxi));
        assert!("hover".parse::<PhaseLabel>().is_err());
    }

    proptest! {
        #[test]
        fn prop_segments_partition_series(
            steps in prop::collection::vec(-60.0f64..60.0, 1..300),
            min_len in 1usize..40,
        ) {
            let mut altitude = vec![20000.0];
            for s in &steps {
                let last = *altitude.last().unwrap();
                altitude.push(last + s);
            }
            let n = altitude.len();
            let times: Vec<f64> = (0..n).map(|i| i as f64).collect();
            let series = flight_from_altitude("P", times, altitude);
            let mut config = Config::default();
            config.phase_thresholds.min_segment_samples = min_len;
            let validated = validate(&series, &config).unwrap();
            let segments = segment(&validated, &config.phase_thresholds);

            prop_assert!(!segments.is_empty());
            prop_assert_eq!(segments[0].start, 0);
            prop_assert_eq!(segments.last().unwrap().end, n);
            for seg in &segments {
                prop_assert!(seg.end > seg.start);
            }
            for pair in segments.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
                prop_assert_ne!(pair[0].label, pair[1].label);
            }
        }
    }
}
