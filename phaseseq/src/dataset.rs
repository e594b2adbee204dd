//! Batch assembly: runs every flight through validate, segment, extract and
//! build, and collects the sequences together with a failure log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::extract::{extract, ExtractionError};
use crate::segment::{segment, PhaseLabel, Segment};
use crate::sequence::{build, Sequence, SequenceError};
use crate::series::TimeSeries;
use crate::validate::{validate, ValidationError};
use crate::{Config, ConfigurationError, SegmentPolicy};

/// Why a flight was left out of the dataset.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("validation failed: {0}")]
    Validation(ValidationError),
    #[error("extraction failed: {0}")]
    Extraction(ExtractionError),
    #[error("sequence build failed: {0}")]
    Sequence(SequenceError),
    #[error("no {label} phase found")]
    NoMatchingPhase { label: PhaseLabel },
    #[error("flight id already processed in this batch")]
    DuplicateFlight,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Validation(e) => e.code(),
            FailureReason::Extraction(e) => e.code(),
            FailureReason::Sequence(e) => e.code(),
            FailureReason::NoMatchingPhase { .. } => "segmentation.no_matching_phase",
            FailureReason::DuplicateFlight => "assembly.duplicate_flight",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub flight_id: String,
    pub reason: FailureReason,
    /// Segment under inspection when the failure happened, if any.
    pub segment: Option<Segment>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FlightResult {
    Success {
        flight_id: String,
        sequences: Vec<Sequence>,
    },
    Failure(FailureRecord),
}

impl FlightResult {
    pub fn flight_id(&self) -> &str {
        match self {
            FlightResult::Success { flight_id, .. } => flight_id,
            FlightResult::Failure(record) => &record.flight_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FlightResult::Success { .. })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_by_reason: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    /// Fingerprint of the configuration the dataset was built with.
    pub config_hash: String,
    pub sequences: BTreeMap<String, Vec<Sequence>>,
    /// In input order.
    pub failures: Vec<FailureRecord>,
    pub summary: Summary,
    /// Set when assembly stopped early; the contents cover only the flights
    /// processed before that.
    pub cancelled: bool,
}

impl Dataset {
    fn empty(config_hash: String) -> Self {
        Self {
            config_hash,
            sequences: BTreeMap::new(),
            failures: Vec::new(),
            summary: Summary::default(),
            cancelled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn failure(&self, flight_id: &str) -> Option<&FailureRecord> {
        self.failures.iter().find(|f| f.flight_id == flight_id)
    }

    /// One row per successful flight (flight-id order) holding `channel` of
    /// its `label` sequence. Flights lacking it are skipped.
    pub fn feature_matrix(&self, label: PhaseLabel, channel: &str) -> (Vec<String>, Array2<f64>) {
        let mut ids = Vec::new();
        let mut rows: Vec<&[f64]> = Vec::new();
        for (id, sequences) in &self.sequences {
            let values = sequences
                .iter()
                .find(|s| s.label == label)
                .and_then(|s| s.channel(channel));
            if let Some(values) = values {
                ids.push(id.clone());
                rows.push(values);
            }
        }
        let width = rows.first().map_or(0, |r| r.len());
        let matrix = Array2::from_shape_fn((rows.len(), width), |(r, c)| rows[r][c]);
        (ids, matrix)
    }
}

/// Fan-in side of assembly. The first occurrence of a flight id wins; later
/// ones are recorded as duplicates.
struct Collector {
    dataset: Dataset,
    seen: BTreeSet<String>,
}

impl Collector {
    fn new(config_hash: String) -> Self {
        Self {
            dataset: Dataset::empty(config_hash),
            seen: BTreeSet::new(),
        }
    }

    fn push(&mut self, result: FlightResult) {
        let result = if self.seen.insert(result.flight_id().to_string()) {
            result
        } else {
            FlightResult::Failure(FailureRecord {
                flight_id: result.flight_id().to_string(),
                reason: FailureReason::DuplicateFlight,
                segment: None,
            })
        };
        let dataset = &mut self.dataset;
        dataset.summary.processed += 1;
        match result {
            FlightResult::Success {
                flight_id,
                sequences,
            } => {
                dataset.summary.succeeded += 1;
                dataset.sequences.insert(flight_id, sequences);
            }
            FlightResult::Failure(record) => {
                dataset.summary.failed += 1;
                *dataset
                    .summary
                    .failed_by_reason
                    .entry(record.reason.code().to_string())
                    .or_insert(0) += 1;
                dataset.failures.push(record);
            }
        }
    }

    fn finish(self, cancelled: bool) -> Dataset {
        let mut dataset = self.dataset;
        dataset.cancelled = cancelled;
        log_summary(&dataset);
        dataset
    }
}

/// Coarse cancellation shared between the caller and the assembler.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-flight pipeline bound to a checked configuration.
#[derive(Clone, Debug)]
pub struct Assembler {
    config: Config,
    config_hash: String,
}

impl Assembler {
    pub fn new(config: Config) -> Result<Self, ConfigurationError> {
        config.check()?;
        let config_hash = config.params_hash();
        Ok(Self {
            config,
            config_hash,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn process(&self, series: &TimeSeries) -> FlightResult {
        match self.run_pipeline(series) {
            Ok(sequences) => FlightResult::Success {
                flight_id: series.flight_id.clone(),
                sequences,
            },
            Err((reason, segment)) => {
                debug!(
                    flight = %series.flight_id,
                    code = reason.code(),
                    "flight rejected: {}",
                    reason
                );
                FlightResult::Failure(FailureRecord {
                    flight_id: series.flight_id.clone(),
                    reason,
                    segment,
                })
            }
        }
    }

    fn run_pipeline(
        &self,
        series: &TimeSeries,
    ) -> Result<Vec<Sequence>, (FailureReason, Option<Segment>)> {
        let config = &self.config;
        let validated =
            validate(series, config).map_err(|e| (FailureReason::Validation(e), None))?;
        let segments = segment(&validated, &config.phase_thresholds);

        let mut sequences = Vec::with_capacity(config.phase_labels.len());
        for &label in &config.phase_labels {
            let chosen = select_segment(&segments, label, config.segment_policy)
                .ok_or((FailureReason::NoMatchingPhase { label }, None))?;
            let slice = extract(&validated, chosen, config)
                .map_err(|e| (FailureReason::Extraction(e), Some(chosen)))?;
            let sequence = build(
                &slice,
                config.target_sequence_length,
                &config.channels_to_extract,
            )
            .map_err(|e| (FailureReason::Sequence(e), Some(chosen)))?;
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    /// Lazily process flights one at a time. The source is consumed as the
    /// iterator advances, so only one flight is resident at a time.
    pub fn stream<'a, I>(&'a self, flights: I) -> impl Iterator<Item = FlightResult> + 'a
    where
        I: IntoIterator<Item = TimeSeries>,
        I::IntoIter: 'a,
    {
        flights.into_iter().map(move |series| self.process(&series))
    }

    pub fn assemble<I>(&self, flights: I) -> Dataset
    where
        I: IntoIterator<Item = TimeSeries>,
    {
        self.assemble_with_cancel(flights, &CancelToken::new())
    }

    pub fn assemble_with_cancel<I>(&self, flights: I, cancel: &CancelToken) -> Dataset
    where
        I: IntoIterator<Item = TimeSeries>,
    {
        let mut collector = Collector::new(self.config_hash.clone());
        for series in flights {
            if cancel.is_cancelled() {
                return collector.finish(true);
            }
            collector.push(self.process(&series));
        }
        collector.finish(false)
    }

    /// Fan flights out over the rayon pool. Results are put back in input
    /// order before aggregation, so the dataset matches [`Assembler::assemble`].
    pub fn assemble_parallel<I>(&self, flights: I, cancel: Option<&CancelToken>) -> Dataset
    where
        I: IntoIterator<Item = TimeSeries>,
        I::IntoIter: Send,
    {
        let is_cancelled = move || cancel.map_or(false, CancelToken::is_cancelled);
        // the source is only advanced while the token is clear
        let mut source = flights.into_iter();
        let pulled = std::iter::from_fn(move || {
            if is_cancelled() {
                None
            } else {
                source.next()
            }
        });
        let mut results: Vec<(usize, FlightResult)> = pulled
            .enumerate()
            .par_bridge()
            .filter_map(|(position, series)| {
                if is_cancelled() {
                    return None;
                }
                Some((position, self.process(&series)))
            })
            .collect();
        results.sort_by_key(|(position, _)| *position);

        let mut collector = Collector::new(self.config_hash.clone());
        for (expected, (position, result)) in results.into_iter().enumerate() {
            if position != expected {
                // a flight was skipped by cancellation; keep the prefix only
                return collector.finish(true);
            }
            collector.push(result);
        }
        collector.finish(is_cancelled())
    }
}

fn select_segment(segments: &[Segment], label: PhaseLabel, policy: SegmentPolicy) -> Option<Segment> {
    let mut candidates = segments.iter().filter(|s| s.label == label).copied();
    match policy {
        SegmentPolicy::First => candidates.next(),
        SegmentPolicy::Longest => candidates.fold(None, |best: Option<Segment>, s| match best {
            Some(b) if b.len() >= s.len() => Some(b),
            _ => Some(s),
        }),
    }
}

fn log_summary(dataset: &Dataset) {
    let s = &dataset.summary;
    info!(
        processed = s.processed,
        succeeded = s.succeeded,
        failed = s.failed,
        cancelled = dataset.cancelled,
        "dataset assembled"
    );
    for (code, count) in &s.failed_by_reason {
        debug!(code = %code, count, "failures by reason");
    }
}

/// Check `config` once, then assemble `flights` sequentially.
pub fn assemble<I>(flights: I, config: &Config) -> Result<Dataset, ConfigurationError>
where
    I: IntoIterator<Item = TimeSeries>,
{
    let assembler = Assembler::new(config.clone())?;
    Ok(assembler.assemble(flights))
}
