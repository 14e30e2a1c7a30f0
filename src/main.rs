use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use weekly_ar_report::{PipelineConfig, RunMode, RunRequest, Snapshot, load_config, run};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Acquire extracts, analyse and write the report
    Full,
    /// Analyse local extracts and write the analysis artifacts
    Analyze,
    /// Write the report from an earlier analysis
    Report,
}

impl From<Mode> for RunMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Full => RunMode::Full,
            Mode::Analyze => RunMode::AnalyzeOnly,
            Mode::Report => RunMode::ReportOnly,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "weekly-report",
    version,
    about = "Weekly sales and receivables aging report",
    long_about = "\
Builds the weekly sales / receivables report for every configured entity:\n\
- weeks run Friday to Thursday and receivables are aged as of a Friday snapshot;\n\
- analyze mode works on extracts already in the raw directory;\n\
- report mode re-renders the report from a stored analysis without touching extracts."
)]
struct Args {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Full)]
    mode: Mode,

    /// Snapshot date (a Friday), YYYY-MM-DD; defaults to the latest Friday
    #[arg(long, value_name = "YYYY-MM-DD")]
    snapshot: Option<String>,

    /// Periods of sales history to include (1-24); overrides the config
    #[arg(long, value_name = "N")]
    lookback: Option<u8>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn parse_snapshot(arg: Option<&str>) -> Result<Snapshot> {
    let today = Local::now().date_naive();
    let Some(s) = arg else { return Ok(Snapshot::on_or_before(today)) };
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").with_context(|| format!("cannot parse snapshot date `{s}`"))?;
    if date > today {
        bail!("snapshot {date} is in the future");
    }
    Ok(Snapshot::new(date)?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config: PipelineConfig = match &args.config {
        Some(p) => load_config(p).with_context(|| format!("failed to load config {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    let snapshot = parse_snapshot(args.snapshot.as_deref())?;
    let request = RunRequest {
        mode: args.mode.into(),
        snapshot,
        generated_at: Local::now().naive_local(),
        lookback_periods: args.lookback,
    };

    let summary = run(&config, &request).with_context(|| format!("{:?} run for snapshot {snapshot} failed", args.mode))?;

    for w in &summary.warnings {
        eprintln!("warning: {w}");
    }
    for path in [&summary.analysis_json, &summary.analysis_workbook, &summary.report].into_iter().flatten() {
        println!("{}", path.display());
    }
    Ok(())
}
