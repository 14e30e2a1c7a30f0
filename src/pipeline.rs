//! Run orchestration for the three operating modes.

use crate::acquire::{
    AcquisitionRequest, DirectorySource, ExtractSource, acquire_all, current_receivables_window, latest_receivables,
};
use crate::aggregate::{aggregate, within_window};
use crate::aging::{AgingPolicy, AgingResult, PriorTotals, analyze};
use crate::artifact::{AnalysisDocument, read_analysis_json, write_analysis_json, write_analysis_workbook};
use crate::config::{MAX_LOOKBACK_PERIODS, PipelineConfig};
use crate::error::{AcquisitionError, AcquisitionFailure, ConfigError, HistoryError, PipelineError, RunWarning};
use crate::history::{HistoryStore, JsonlHistoryStore};
use crate::mapping::{FieldMapping, ReportContext};
use crate::model::{ExtractKind, SourceRow};
use crate::normalize::{NormalizeRules, normalize};
use crate::period::{Granularity, Snapshot};
use crate::synth::{ReportInstance, synthesize};
use crate::template::ReportTemplate;
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Acquire, analyse, persist and report.
    Full,
    /// Analyse local extracts and write the analysis artifacts only.
    AnalyzeOnly,
    /// Report from a previously written analysis document.
    ReportOnly,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    pub snapshot: Snapshot,
    pub generated_at: NaiveDateTime,
    /// Overrides the configured lookback when set.
    pub lookback_periods: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: RunMode,
    pub snapshot: Snapshot,
    pub report: Option<PathBuf>,
    pub analysis_json: Option<PathBuf>,
    pub analysis_workbook: Option<PathBuf>,
    pub warnings: Vec<RunWarning>,
}

impl RunSummary {
    fn new(request: &RunRequest) -> Self {
        Self {
            mode: request.mode,
            snapshot: request.snapshot,
            report: None,
            analysis_json: None,
            analysis_workbook: None,
            warnings: Vec::new(),
        }
    }
}

fn lookback(config: &PipelineConfig, request: &RunRequest) -> Result<u8, ConfigError> {
    let n = request.lookback_periods.unwrap_or(config.lookback_periods);
    if !(1..=MAX_LOOKBACK_PERIODS).contains(&n) {
        return Err(ConfigError::Invalid(format!("lookback must be 1..={MAX_LOOKBACK_PERIODS} periods, got {n}")));
    }
    Ok(n)
}

/// Run with the configured directory sources and the JSON Lines history.
pub fn run(config: &PipelineConfig, request: &RunRequest) -> Result<RunSummary, PipelineError> {
    let sources = match request.mode {
        RunMode::Full => DirectorySource::for_config(config, config.paths.acquisition_dir.clone()),
        RunMode::AnalyzeOnly => DirectorySource::for_config(config, config.paths.raw_dir.clone()),
        RunMode::ReportOnly => Vec::new(),
    };
    let mut history = JsonlHistoryStore::open(&config.paths.history)?;
    run_with(config, request, sources, &mut history)
}

/// Same as [`run`] with the sources and history supplied by the caller.
pub fn run_with(
    config: &PipelineConfig,
    request: &RunRequest,
    sources: Vec<Box<dyn ExtractSource>>,
    history: &mut dyn HistoryStore,
) -> Result<RunSummary, PipelineError> {
    config.validate()?;
    let lookback = lookback(config, request)?;
    let mut summary = RunSummary::new(request);
    info!(mode = ?request.mode, snapshot = %request.snapshot, lookback, "run started");

    match request.mode {
        RunMode::ReportOnly => {
            let doc = read_analysis_json(&config.paths.processed_dir, request.snapshot)?;
            for w in &doc.warnings {
                info!(warning = %w, "carried over from analysis");
            }
            let report = report(config, &doc, request.generated_at)?;
            summary.warnings.extend(report.warnings);
            summary.report = Some(report.path);
        }
        RunMode::Full | RunMode::AnalyzeOnly => {
            let acq_request = AcquisitionRequest::for_snapshot(request.snapshot, lookback);
            let (sales, receivables) = if request.mode == RunMode::Full {
                let timeout = Duration::from_secs(config.acquisition_timeout_secs);
                let acquired = acquire_all(sources, acq_request, timeout);
                summary.warnings.extend(acquired.failures.iter().cloned().map(RunWarning::Acquisition));
                (acquired.rows(ExtractKind::Sales), acquired.rows(ExtractKind::Receivables))
            } else {
                load_sequentially(sources, &acq_request, &mut summary.warnings)
            };

            let doc = analyse(config, request, lookback, sales, receivables, history, &mut summary.warnings)?;
            summary.analysis_json = Some(write_analysis_json(&config.paths.processed_dir, &doc)?);

            if request.mode == RunMode::Full {
                let report = report(config, &doc, request.generated_at)?;
                summary.warnings.extend(report.warnings);
                summary.report = Some(report.path);
            } else {
                let path = write_analysis_workbook(&config.paths.processed_dir, &config.report.analysis_prefix, &doc)?;
                summary.analysis_workbook = Some(path);
            }
        }
    }

    info!(warnings = summary.warnings.len(), "run finished");
    Ok(summary)
}

/// Analyse-only runs read local files; no deadline applies.
fn load_sequentially(
    sources: Vec<Box<dyn ExtractSource>>,
    request: &AcquisitionRequest,
    warnings: &mut Vec<RunWarning>,
) -> (Vec<SourceRow>, Vec<SourceRow>) {
    let mut sales = Vec::new();
    let mut receivables = Vec::new();
    for source in sources {
        match source.fetch(request) {
            Ok(x) => {
                sales.extend(x.sales);
                receivables.extend(x.receivables);
            }
            Err(msg) => {
                warn!(entity = %source.entity(), error = %msg, "local extracts unreadable");
                warnings.push(RunWarning::Acquisition(AcquisitionError {
                    entity: source.entity().to_string(),
                    failure: AcquisitionFailure::Failed(msg),
                }));
            }
        }
    }
    for (i, r) in sales.iter_mut().enumerate() {
        r.position = i;
    }
    for (i, r) in receivables.iter_mut().enumerate() {
        r.position = i;
    }
    (sales, receivables)
}

/// Rebuild last week's totals from receivable extracts dated on the prior
/// snapshot, for when history has no record of it. Rows the rebuild rejects
/// come back as baseline warnings.
fn backfill_baseline(
    receivables: &[SourceRow],
    snapshot: Snapshot,
    rules: &NormalizeRules,
    policy: &AgingPolicy,
    warnings: &mut Vec<RunWarning>,
) -> Option<PriorTotals> {
    let prev = snapshot.previous();
    let rows = latest_receivables(receivables, (prev.date(), prev.date()));
    if rows.is_empty() {
        return None;
    }
    let normalized = normalize(rows, rules);
    let baseline = |w: RunWarning| RunWarning::Baseline(Box::new(w));
    warnings.extend(normalized.errors.into_iter().map(RunWarning::RowValidation).map(baseline));
    let result = analyze(&normalized.valid, prev, None, policy);
    warnings.extend(result.rejected.into_iter().map(RunWarning::Classification).map(baseline));
    info!(baseline = %prev, records = normalized.valid.len(), "baseline rebuilt from prior-week extracts");
    Some(result.totals)
}

fn analyse(
    config: &PipelineConfig,
    request: &RunRequest,
    lookback: u8,
    sales: Vec<SourceRow>,
    receivables: Vec<SourceRow>,
    history: &mut dyn HistoryStore,
    warnings: &mut Vec<RunWarning>,
) -> Result<AnalysisDocument, PipelineError> {
    let snapshot = request.snapshot;
    let rules = NormalizeRules::from_config(config, snapshot.date());
    let policy = AgingPolicy::from_config(config);

    let sales = normalize(sales, &rules);
    warnings.extend(sales.errors.into_iter().map(RunWarning::RowValidation));
    let window = snapshot.lookback_window(lookback);
    let sales = within_window(sales.valid, window);
    let aggregates = [Granularity::Weekly, Granularity::Monthly]
        .into_iter()
        .map(|g| aggregate(&sales, g).with_window(window))
        .collect();

    let current = latest_receivables(&receivables, current_receivables_window(snapshot));
    let current = normalize(current, &rules);
    warnings.extend(current.errors.into_iter().map(RunWarning::RowValidation));

    let prior = match history.prior_totals(snapshot.previous().date(), &policy.scopes())? {
        Some(p) => Some(p),
        None => backfill_baseline(&receivables, snapshot, &rules, &policy, warnings),
    };
    let aging: AgingResult = analyze(&current.valid, snapshot, prior.as_ref(), &policy);
    warnings.extend(aging.rejected.iter().cloned().map(RunWarning::Classification));

    match history.append_all(snapshot.date(), &aging.totals) {
        Ok(()) => {}
        Err(e @ HistoryError::AlreadyRecorded { .. }) => {
            warn!(error = %e, "history left unchanged");
            warnings.push(RunWarning::History(e.to_string()));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(AnalysisDocument {
        snapshot,
        generated_at: request.generated_at,
        aggregates,
        aging,
        warnings: warnings.iter().map(ToString::to_string).collect(),
    })
}

fn report(
    config: &PipelineConfig,
    doc: &AnalysisDocument,
    generated_at: NaiveDateTime,
) -> Result<ReportInstance, PipelineError> {
    let template = ReportTemplate::load(&config.paths.template)?;
    let mapping = FieldMapping::load(&config.paths.mapping)?;
    let ctx = ReportContext { snapshot: doc.snapshot, generated_at, file_prefix: config.report.file_prefix.clone() };
    Ok(synthesize(&template, &mapping, &doc.aggregates, &doc.aging, &ctx, &config.paths.report_dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::EntityExtracts;
    use crate::history::MemoryHistoryStore;
    use crate::model::{EntityId, EntityScope};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    struct Canned(EntityId, EntityExtracts);

    impl ExtractSource for Canned {
        fn entity(&self) -> &EntityId { &self.0 }
        fn fetch(&self, _: &AcquisitionRequest) -> Result<EntityExtracts, String> { Ok(self.1.clone()) }
    }

    fn d(m: u32, day: u32) -> NaiveDate { NaiveDate::from_ymd_opt(2025, m, day).unwrap() }

    fn receivable(extracted: NaiveDate, invoice: &str, amount: &str, due: &str) -> SourceRow {
        SourceRow {
            extracted_on: Some(extracted),
            entity: Some("DND".into()),
            invoice_id: Some(invoice.into()),
            customer_id: Some("C-1".into()),
            amount: Some(amount.into()),
            document_date: Some("2024-10-01".into()),
            due_date: Some(due.into()),
            ..SourceRow::default()
        }
    }

    fn config(dir: &std::path::Path) -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.paths.processed_dir = dir.join("processed");
        cfg.paths.report_dir = dir.join("report");
        cfg.paths.history = dir.join("processed/history.jsonl");
        cfg
    }

    fn request(mode: RunMode) -> RunRequest {
        RunRequest {
            mode,
            snapshot: Snapshot::new(d(1, 10)).unwrap(),
            generated_at: d(1, 10).and_hms_opt(9, 0, 0).unwrap(),
            lookback_periods: Some(4),
        }
    }

    #[test]
    fn analyze_only_backfills_baseline_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let extracts = EntityExtracts {
            sales: vec![SourceRow {
                entity: Some("DND".into()),
                invoice_id: Some("S-1".into()),
                customer_id: Some("C-1".into()),
                amount: Some("oops".into()),
                document_date: Some("2025-01-06".into()),
                ..SourceRow::default()
            }],
            receivables: vec![
                receivable(d(1, 3), "R-1", "100", "2024-11-01"),
                receivable(d(1, 10), "R-1", "150", "2024-11-01"),
            ],
        };
        let sources: Vec<Box<dyn ExtractSource>> = vec![Box::new(Canned(EntityId::new("DND"), extracts))];
        let mut history = MemoryHistoryStore::default();

        let summary = run_with(&cfg, &request(RunMode::AnalyzeOnly), sources, &mut history).unwrap();
        assert!(summary.analysis_workbook.unwrap().exists());
        assert_eq!(summary.warnings.len(), 1);
        assert!(matches!(summary.warnings[0], RunWarning::RowValidation(_)));

        let doc = read_analysis_json(&cfg.paths.processed_dir, request(RunMode::ReportOnly).snapshot).unwrap();
        let cmp = &doc.aging.comparisons[&EntityScope::Consolidated];
        assert!(matches!(
            cmp.outstanding,
            crate::aging::Comparison::Against { delta, .. } if delta == dec!(50)
        ));
        let recorded = history.get(&EntityScope::Consolidated, d(1, 10)).unwrap().unwrap();
        assert_eq!(recorded.outstanding.amount, dec!(150));
    }

    #[test]
    fn rejected_prior_week_rows_surface_as_baseline_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let extracts = EntityExtracts {
            sales: vec![],
            receivables: vec![
                receivable(d(1, 3), "R-1", "100", "2024-11-01"),
                receivable(d(1, 3), "R-BAD", "oops", "2024-11-01"),
                receivable(d(1, 3), "R-3", "40", ""),
                receivable(d(1, 10), "R-1", "150", "2024-11-01"),
            ],
        };
        let sources: Vec<Box<dyn ExtractSource>> = vec![Box::new(Canned(EntityId::new("DND"), extracts))];

        let summary =
            run_with(&cfg, &request(RunMode::AnalyzeOnly), sources, &mut MemoryHistoryStore::default()).unwrap();

        let baseline: Vec<_> = summary
            .warnings
            .iter()
            .filter_map(|w| match w {
                RunWarning::Baseline(inner) => Some(inner.as_ref()),
                _ => None,
            })
            .collect();
        assert_eq!(baseline.len(), 2, "{:?}", summary.warnings);
        assert!(matches!(baseline[0], RunWarning::RowValidation(e) if e.reason == crate::error::RowValidationError::InvalidAmount("oops".into())));
        assert!(matches!(baseline[1], RunWarning::Classification(crate::error::ClassificationError::MissingDueDate { .. })));
        assert!(summary.warnings.iter().any(|w| w.to_string().starts_with("baseline row validation:")));
    }

    #[test]
    fn second_run_for_the_same_snapshot_warns_about_history() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut history = MemoryHistoryStore::default();
        let src = || -> Vec<Box<dyn ExtractSource>> {
            vec![Box::new(Canned(
                EntityId::new("DND"),
                EntityExtracts { sales: vec![], receivables: vec![receivable(d(1, 10), "R-1", "10", "2025-01-01")] },
            ))]
        };
        run_with(&cfg, &request(RunMode::AnalyzeOnly), src(), &mut history).unwrap();
        let again = run_with(&cfg, &request(RunMode::AnalyzeOnly), src(), &mut history).unwrap();
        assert!(again.warnings.iter().any(|w| matches!(w, RunWarning::History(_))));
    }

    #[test]
    fn report_only_needs_a_prior_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let err = run_with(&cfg, &request(RunMode::ReportOnly), Vec::new(), &mut MemoryHistoryStore::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingAnalysis { .. }));
    }

    #[test]
    fn lookback_out_of_range_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(RunMode::AnalyzeOnly);
        req.lookback_periods = Some(30);
        let err = run_with(&config(dir.path()), &req, Vec::new(), &mut MemoryHistoryStore::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Invalid(_))));
    }
}
