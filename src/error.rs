use chrono::NaiveDate;
use std::{fmt, path::PathBuf, time::Duration};
use thiserror::Error;

/// Why a single extract row was rejected by the normalizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("amount `{0}` is not a decimal number")]
    InvalidAmount(String),
    #[error("amount `{0}` is negative")]
    NegativeAmount(String),
    #[error("{field} `{value}` is not a recognised date")]
    InvalidDate { field: &'static str, value: String },
    #[error("entity `{0}` is not one of the configured entities")]
    UnknownEntity(String),
}

/// A rejected row, with its position in the batch handed to the normalizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {position}{}: {reason}", origin_suffix(.origin))]
pub struct RowError {
    pub position: usize,
    pub origin: Option<PathBuf>,
    pub reason: RowValidationError,
}

fn origin_suffix(origin: &Option<PathBuf>) -> String {
    match origin {
        Some(p) => format!(" ({})", p.display()),
        None => String::new(),
    }
}

/// A canonical receivable the aging analyzer could not place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("invoice {invoice_id}: entity `{entity}` is not analysed for receivables")]
    UnknownEntity { entity: String, invoice_id: String },
    #[error("invoice {invoice_id} ({entity}): due date is missing")]
    MissingDueDate { entity: String, invoice_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionFailure {
    TimedOut(Duration),
    Failed(String),
    WorkerLost,
}

impl fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionFailure::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
            AcquisitionFailure::Failed(msg) => write!(f, "{msg}"),
            AcquisitionFailure::WorkerLost => write!(f, "worker exited without a result"),
        }
    }
}

/// Acquisition for one entity failed; that entity contributes no data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("acquisition for entity `{entity}` failed: {failure}")]
pub struct AcquisitionError {
    pub entity: String,
    pub failure: AcquisitionFailure,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("cannot open {path}: {message}")]
    Open { path: PathBuf, message: String },
    #[error("{path} has no readable worksheet")]
    NoWorksheet { path: PathBuf },
    #[error("{path} has no header row")]
    NoHeader { path: PathBuf },
    #[error("unsupported extract type: {0}")]
    Unsupported(PathBuf),
    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("config JSON is invalid: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot date {0} is not a Friday")]
    NotFriday(NaiveDate),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("totals for {scope} at {date} are already recorded")]
    AlreadyRecorded { scope: String, date: NaiveDate },
    #[error("history file {path} line {line} is corrupt: {source}")]
    Corrupt { path: PathBuf, line: usize, source: serde_json::Error },
    #[error("history serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Template and mapping disagree, or the template itself is malformed.
/// Always raised before the first cell is written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateSchemaError {
    #[error("mapping targets template version {expected}, loaded template is {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("region `{0}` does not exist in the template")]
    MissingRegion(String),
    #[error("region `{0}` is read-only")]
    ReadOnlyTarget(String),
    #[error("region `{0}` is defined more than once")]
    DuplicateRegion(String),
    #[error("bad cell reference `{0}`")]
    BadReference(String),
    #[error("sheet `{sheet}`: merged ranges {first} and {second} overlap")]
    OverlappingMerge { sheet: String, first: String, second: String },
    #[error("region `{region}` spans {range} which is not a merged range of sheet `{sheet}`")]
    UnmergedSpan { sheet: String, region: String, range: String },
    #[error("region `{region}` at {cell} collides with structural content")]
    RegionOverlapsStructure { region: String, cell: String },
    #[error("style `{0}` is not defined")]
    UnknownStyle(String),
    #[error("mapping refers to unknown aging bucket `{0}`")]
    UnknownBucket(String),
    #[error("template JSON is invalid: {0}")]
    Parse(String),
    #[error("cannot read {path}: {message}")]
    Read { path: PathBuf, message: String },
}

/// Failure during the write phase. The scratch copy is discarded and the
/// existing target (if any) is left untouched.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("region `{0}` is not a writable region")]
    UnknownRegion(String),
    #[error("region `{0}` is read-only")]
    ReadOnlyRegion(String),
    #[error("workbook error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scratch verification failed: {0}")]
    Verification(String),
    #[error("promoting scratch file to {path} failed: {message}")]
    Promote { path: PathBuf, message: String },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Schema(#[from] TemplateSchemaError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("no analysis recorded for snapshot {date} at {path}")]
    MissingAnalysis { date: NaiveDate, path: PathBuf },
    #[error("analysis document {path} is invalid: {source}")]
    InvalidAnalysis { path: PathBuf, source: serde_json::Error },
}

impl From<TemplateSchemaError> for PipelineError {
    fn from(e: TemplateSchemaError) -> Self { PipelineError::Report(ReportError::Schema(e)) }
}

impl From<WriteError> for PipelineError {
    fn from(e: WriteError) -> Self { PipelineError::Report(ReportError::Write(e)) }
}

/// Recoverable problem collected during a run and shown to the operator at
/// the end. None of these abort the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunWarning {
    Acquisition(AcquisitionError),
    RowValidation(RowError),
    Classification(ClassificationError),
    Sanitized { region: String, note: String },
    History(String),
    /// Problem found while rebuilding last week's totals from its extracts.
    Baseline(Box<RunWarning>),
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::Acquisition(e) => write!(f, "acquisition: {e}"),
            RunWarning::RowValidation(e) => write!(f, "row validation: {e}"),
            RunWarning::Classification(e) => write!(f, "classification: {e}"),
            RunWarning::Sanitized { region, note } => write!(f, "sanitized {region}: {note}"),
            RunWarning::History(msg) => write!(f, "history: {msg}"),
            RunWarning::Baseline(inner) => write!(f, "baseline {inner}"),
        }
    }
}
