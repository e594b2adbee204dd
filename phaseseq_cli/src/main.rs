use std::fs;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use phaseseq::{
    find_repeated_phases, health_check, segment, validate, Assembler, Config, Dataset,
    PhaseLabel, SegmentPolicy, TimeSeries,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flight phase segmentation and sequence extraction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the phase sequence dataset for a batch of flight CSV files
    Assemble(AssembleArgs),
    /// Report continuity, missing values, columns and flight presence per file
    Health(HealthArgs),
    /// List flights where a phase occurs more than once (e.g. go-arounds)
    Repeats(RepeatsArgs),
}

#[derive(Parser, Debug)]
struct AssembleArgs {
    /// Flight CSV files (one flight per file, id = file stem)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// JSON configuration; missing fields take their defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Output dataset JSON path (`-` for stdout)
    #[arg(short, long, default_value = "dataset.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Optional CSV failure log
    #[arg(long, value_hint = ValueHint::FilePath)]
    failures: Option<PathBuf>,

    /// Override target_sequence_length
    #[arg(long)]
    length: Option<usize>,

    /// Override phase_labels (repeatable)
    #[arg(long = "label", value_enum)]
    labels: Vec<LabelOpt>,

    /// Override segment_policy
    #[arg(long, value_enum)]
    policy: Option<PolicyOpt>,

    /// Process flights on the rayon pool
    #[arg(long, action = ArgAction::SetTrue)]
    parallel: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Log stage timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct HealthArgs {
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Output report JSON path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct RepeatsArgs {
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Phase to look for
    #[arg(long, value_enum, default_value_t = LabelOpt::Descent)]
    label: LabelOpt,

    /// Occurrences closer than this many samples count as one
    #[arg(long, default_value_t = 120)]
    min_gap: usize,

    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LabelOpt {
    Climb,
    Cruise,
    Descent,
    Taxi,
    Other,
}

impl From<LabelOpt> for PhaseLabel {
    fn from(value: LabelOpt) -> Self {
        match value {
            LabelOpt::Climb => PhaseLabel::Climb,
            LabelOpt::Cruise => PhaseLabel::Cruise,
            LabelOpt::Descent => PhaseLabel::Descent,
            LabelOpt::Taxi => PhaseLabel::Taxi,
            LabelOpt::Other => PhaseLabel::Other,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PolicyOpt {
    First,
    Longest,
}

impl From<PolicyOpt> for SegmentPolicy {
    fn from(value: PolicyOpt) -> Self {
        match value {
            PolicyOpt::First => SegmentPolicy::First,
            PolicyOpt::Longest => SegmentPolicy::Longest,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Assemble(args) => args.verbose,
        Command::Health(args) => args.verbose,
        Command::Repeats(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Assemble(args) => handle_assemble(args),
        Command::Health(args) => handle_health(args),
        Command::Repeats(args) => handle_repeats(args),
    }
}

fn handle_assemble(args: AssembleArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(length) = args.length {
        config.target_sequence_length = length;
    }
    if !args.labels.is_empty() {
        config.phase_labels = args.labels.iter().map(|&l| l.into()).collect();
    }
    if let Some(policy) = args.policy {
        config.segment_policy = policy.into();
    }
    let assembler = Assembler::new(config).context("invalid configuration")?;

    let unreadable = AtomicUsize::new(0);
    let flights = args.inputs.iter().filter_map(|path| match load_flight(path) {
        Ok(series) => Some(series),
        Err(err) => {
            warn!("Skipping {}: {:#}", path.display(), err);
            unreadable.fetch_add(1, Ordering::Relaxed);
            None
        }
    });

    let t_assemble = Instant::now();
    let dataset = if args.parallel {
        assembler.assemble_parallel(flights, None)
    } else {
        assembler.assemble(flights)
    };
    if args.profile || args.verbose {
        info!(
            "Assemble stage: {:.1} ms ({} flights)",
            t_assemble.elapsed().as_secs_f64() * 1000.0,
            dataset.summary.processed
        );
    }
    let skipped = unreadable.load(Ordering::Relaxed);
    info!(
        "Dataset: {} sequences, {} failures, {} unreadable files",
        dataset.summary.succeeded, dataset.summary.failed, skipped
    );
    for (code, count) in &dataset.summary.failed_by_reason {
        info!("  {}: {}", code, count);
    }

    write_json(&dataset, &args.output)?;
    if args.output.as_os_str() != "-" {
        info!("Wrote dataset: {}", args.output.display());
    }
    if let Some(path) = args.failures.as_ref() {
        write_failures_csv(&dataset, path)?;
        info!("Wrote failure log: {}", path.display());
    }
    Ok(())
}

fn handle_health(args: HealthArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut flights = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        match load_flight(path) {
            Ok(series) => flights.push(series),
            Err(err) => warn!("Skipping {}: {:#}", path.display(), err),
        }
    }
    let report = health_check(&flights, &config.health);
    info!(
        "Health: {} checked, {} problematic",
        report.checked,
        report.problematic().len()
    );
    write_json(&report, &args.output)
}

fn handle_repeats(args: RepeatsArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    config.check().context("invalid configuration")?;
    let label: PhaseLabel = args.label.into();

    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());
    writer.write_record(["flight_id", "occurrences", "start_indices"])?;
    let mut hits = 0usize;
    for path in &args.inputs {
        let series = match load_flight(path) {
            Ok(series) => series,
            Err(err) => {
                warn!("Skipping {}: {:#}", path.display(), err);
                continue;
            }
        };
        let validated = match validate(&series, &config) {
            Ok(v) => v,
            Err(err) => {
                debug!("{} failed validation: {}", series.flight_id, err);
                continue;
            }
        };
        let segments = segment(&validated, &config.phase_thresholds);
        let starts = find_repeated_phases(&segments, label, args.min_gap);
        if starts.is_empty() {
            continue;
        }
        hits += 1;
        let joined = starts
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let count = starts.len().to_string();
        writer.write_record([series.flight_id.as_str(), count.as_str(), joined.as_str()])?;
    }
    writer.flush()?;
    info!("{} of {} flights repeat the {} phase", hits, args.inputs.len(), label);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Config::from_json_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

/// Read one flight from a CSV with a `time` column plus one column per
/// channel. Empty or `nan` cells are missing samples.
fn load_flight(path: &Path) -> Result<TimeSeries> {
    let flight_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("cannot derive a flight id from {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let time_col = headers
        .iter()
        .position(|h| h == "time")
        .ok_or_else(|| anyhow!("{} has no 'time' column", path.display()))?;
    let mut columns: Vec<(usize, String, Vec<f64>)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != time_col)
        .map(|(i, name)| (i, name.to_string(), Vec::new()))
        .collect();

    let mut times = Vec::new();
    let mut base: Option<DateTime<Utc>> = None;
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: bad row {}", path.display(), row + 2))?;
        let cell = record.get(time_col).unwrap_or("");
        let t = parse_time(cell, &mut base)
            .with_context(|| format!("{}: bad time '{}' on row {}", path.display(), cell, row + 2))?;
        times.push(t);
        for (idx, name, values) in columns.iter_mut() {
            let cell = record.get(*idx).unwrap_or("");
            let value = parse_cell(cell).with_context(|| {
                format!("{}: bad {} '{}' on row {}", path.display(), name, cell, row + 2)
            })?;
            values.push(value);
        }
    }

    let mut series = TimeSeries::new(flight_id, times);
    for (_, name, values) in columns {
        series.channels.insert(name, values);
    }
    debug!("Loaded {} ({} samples)", flight_id, series.len());
    Ok(series)
}

/// Seconds as a plain number, or RFC 3339 relative to the first timestamp.
fn parse_time(cell: &str, base: &mut Option<DateTime<Utc>>) -> Result<f64> {
    if let Ok(seconds) = cell.parse::<f64>() {
        return Ok(seconds);
    }
    let utc = DateTime::parse_from_rfc3339(cell)?.with_timezone(&Utc);
    let origin = *base.get_or_insert(utc);
    Ok((utc - origin).num_milliseconds() as f64 / 1000.0)
}

fn parse_cell(cell: &str) -> Result<f64> {
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    Ok(cell.parse::<f64>()?)
}

fn write_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, value)?;
        writeln!(handle)?;
        return Ok(());
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn write_failures_csv(dataset: &Dataset, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "flight_id",
        "code",
        "message",
        "segment_label",
        "segment_start",
        "segment_end",
    ])?;
    for failure in &dataset.failures {
        let (label, start, end) = match failure.segment {
            Some(seg) => (
                seg.label.to_string(),
                seg.start.to_string(),
                seg.end.to_string(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        let message = failure.reason.to_string();
        writer.write_record([
            failure.flight_id.as_str(),
            failure.reason.code(),
            message.as_str(),
            label.as_str(),
            start.as_str(),
            end.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_accepts_seconds_and_rfc3339() {
        let mut base = None;
        assert_eq!(parse_time("12.5", &mut base).unwrap(), 12.5);
        assert_eq!(parse_time("2024-03-01T10:00:00Z", &mut base).unwrap(), 0.0);
        assert_eq!(parse_time("2024-03-01T10:01:30.500Z", &mut base).unwrap(), 90.5);
        assert!(parse_time("noon", &mut base).is_err());
    }

    #[test]
    fn test_empty_cells_are_missing() {
        assert!(parse_cell("").unwrap().is_nan());
        assert!(parse_cell("NaN").unwrap().is_nan());
        assert_eq!(parse_cell("3.25").unwrap(), 3.25);
        assert!(parse_cell("abc").is_err());
    }

    #[test]
    fn test_load_flight_from_csv() {
        let dir = std::env::temp_dir().join(format!("phaseseq-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("AB123.csv");
        fs::write(
            &path,
            "time,altitude,airspeed\n0,0,120\n1,,125\n2,60,130\n",
        )
        .unwrap();
        let series = load_flight(&path).unwrap();
        assert_eq!(series.flight_id, "AB123");
        assert_eq!(series.times, vec![0.0, 1.0, 2.0]);
        assert!(series.channel("altitude").unwrap()[1].is_nan());
        assert_eq!(series.channel("airspeed").unwrap(), &[120.0, 125.0, 130.0]);
        let _ = fs::remove_dir_all(&dir);
    }
}
