//! Analysis artifacts: the JSON document report-only runs start from, and a
//! standalone receivables-analysis workbook for reviewers.

use crate::aggregate::AggregateResult;
use crate::aging::{AgingResult, Comparison};
use crate::error::{PipelineError, WriteError};
use crate::period::{Granularity, PeriodKey, Snapshot};
use crate::synth::sanitize_text;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_xlsxwriter::{Format, FormatBorder, Workbook, Worksheet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDocument {
    pub snapshot: Snapshot,
    pub generated_at: NaiveDateTime,
    pub aggregates: Vec<AggregateResult>,
    pub aging: AgingResult,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub fn analysis_json_path(dir: &Path, snapshot: Snapshot) -> PathBuf {
    dir.join(format!("analysis_{}.json", snapshot.date().format("%Y%m%d")))
}

pub fn analysis_workbook_path(dir: &Path, prefix: &str, snapshot: Snapshot) -> PathBuf {
    dir.join(format!("{prefix}_{}.xlsx", snapshot.date().format("%Y%m%d")))
}

/// Create a scratch file next to `target`, let `fill` write it, then rename
/// it over `target`.
fn write_atomically(target: &Path, fill: impl FnOnce(&Path) -> Result<(), WriteError>) -> Result<(), WriteError> {
    let dir = target.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let scratch = tempfile::Builder::new().prefix(".artifact-").suffix(".tmp").tempfile_in(dir)?;
    fill(scratch.path())?;
    scratch
        .persist(target)
        .map_err(|e| WriteError::Promote { path: target.to_path_buf(), message: e.error.to_string() })?;
    Ok(())
}

pub fn write_analysis_json(dir: &Path, doc: &AnalysisDocument) -> Result<PathBuf, WriteError> {
    let path = analysis_json_path(dir, doc.snapshot);
    let bytes = serde_json::to_vec_pretty(doc)?;
    write_atomically(&path, |scratch| {
        let mut f = fs::File::create(scratch)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        Ok(())
    })?;
    info!(path = %path.display(), "analysis document written");
    Ok(path)
}

pub fn read_analysis_json(dir: &Path, snapshot: Snapshot) -> Result<AnalysisDocument, PipelineError> {
    let path = analysis_json_path(dir, snapshot);
    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::MissingAnalysis { date: snapshot.date(), path });
        }
        Err(e) => return Err(PipelineError::Report(WriteError::Io(e).into())),
    };
    serde_json::from_str(&text).map_err(|source| PipelineError::InvalidAnalysis { path, source })
}

struct Formats {
    header: Format,
    money: Format,
    percent: Format,
    text: Format,
}

impl Formats {
    fn new() -> Self {
        Self {
            header: Format::new().set_bold().set_border(FormatBorder::Thin).set_background_color(0xD9E1F2),
            money: Format::new().set_num_format("#,##0").set_border(FormatBorder::Thin),
            percent: Format::new().set_num_format("0.0%").set_border(FormatBorder::Thin),
            text: Format::new().set_border(FormatBorder::Thin),
        }
    }
}

fn num(d: Decimal) -> f64 { d.to_f64().unwrap_or(0.0) }

fn write_header(ws: &mut Worksheet, headers: &[String], f: &Formats) -> Result<(), WriteError> {
    for (c, h) in headers.iter().enumerate() {
        ws.write_string_with_format(0, c as u16, h, &f.header)?;
        ws.set_column_width(c as u16, (h.chars().count() as f64 + 4.0).max(12.0))?;
    }
    Ok(())
}

fn write_summary(ws: &mut Worksheet, aging: &AgingResult, f: &Formats) -> Result<(), WriteError> {
    let mut headers = vec!["Scope".to_string()];
    headers.extend(aging.bucket_labels.iter().cloned());
    headers.extend(["Not yet due", "Outstanding", "Term exceeded", "Last bucket share", "Change vs prior"].map(String::from));
    write_header(ws, &headers, f)?;

    let last_label = aging.bucket_labels.last();
    for (i, (scope, totals)) in aging.totals.iter().enumerate() {
        let row = (i + 1) as u32;
        ws.write_string_with_format(row, 0, scope.to_string(), &f.text)?;
        let mut col = 1u16;
        for label in &aging.bucket_labels {
            let amount = totals.buckets.get(label).map_or(Decimal::ZERO, |b| b.amount);
            ws.write_number_with_format(row, col, num(amount), &f.money)?;
            col += 1;
        }
        let nyd = aging.not_yet_due.get(scope).map_or(Decimal::ZERO, |t| t.amount);
        ws.write_number_with_format(row, col, num(nyd), &f.money)?;
        ws.write_number_with_format(row, col + 1, num(totals.outstanding.amount), &f.money)?;
        ws.write_number_with_format(row, col + 2, num(totals.term_exceeded.amount), &f.money)?;

        let last = last_label.and_then(|l| totals.buckets.get(l)).map_or(Decimal::ZERO, |b| b.amount);
        match last.checked_div(totals.outstanding.amount).filter(|_| !totals.outstanding.amount.is_zero()) {
            Some(share) => ws.write_number_with_format(row, col + 3, num(share), &f.percent)?,
            None => ws.write_string_with_format(row, col + 3, "n/a", &f.text)?,
        };
        match aging.comparisons.get(scope).map(|c| c.outstanding) {
            Some(Comparison::Against { delta, .. }) => ws.write_number_with_format(row, col + 4, num(delta), &f.money)?,
            _ => ws.write_string_with_format(row, col + 4, "-", &f.text)?,
        };
    }
    Ok(())
}

fn write_top_accounts(ws: &mut Worksheet, aging: &AgingResult, f: &Formats) -> Result<(), WriteError> {
    write_header(ws, &["Rank", "Customer", "Name", "Term exceeded"].map(String::from), f)?;
    for (i, acct) in aging.top_accounts.iter().enumerate() {
        let row = (i + 1) as u32;
        ws.write_number_with_format(row, 0, acct.rank as f64, &f.text)?;
        ws.write_string_with_format(row, 1, sanitize_text(&acct.customer_id).0, &f.text)?;
        ws.write_string_with_format(row, 2, sanitize_text(acct.customer_name.as_deref().unwrap_or("")).0, &f.text)?;
        ws.write_number_with_format(row, 3, num(acct.amount), &f.money)?;
    }
    Ok(())
}

fn write_warnings(ws: &mut Worksheet, warnings: &[String], f: &Formats) -> Result<(), WriteError> {
    write_header(ws, &["#", "Warning"].map(String::from), f)?;
    ws.set_column_width(1, 100)?;
    for (i, w) in warnings.iter().enumerate() {
        let row = (i + 1) as u32;
        ws.write_number(row, 0, row as f64)?;
        ws.write_string(row, 1, sanitize_text(w).0)?;
    }
    Ok(())
}

/// Customer by period grid with a total column. Periods the lookback cut
/// short are left out.
fn write_customer_sales(ws: &mut Worksheet, agg: &AggregateResult, f: &Formats) -> Result<(), WriteError> {
    let periods: BTreeSet<PeriodKey> =
        agg.per_customer.values().flat_map(|s| s.keys().copied()).filter(|k| agg.covers(k)).collect();
    let mut headers = vec!["Customer".to_string()];
    headers.extend(periods.iter().map(PeriodKey::label));
    headers.push("Total".into());
    write_header(ws, &headers, f)?;

    for (i, (customer, series)) in agg.per_customer.iter().enumerate() {
        let row = (i + 1) as u32;
        ws.write_string_with_format(row, 0, sanitize_text(customer).0, &f.text)?;
        let mut total = Decimal::ZERO;
        for (j, key) in periods.iter().enumerate() {
            let amount = series.get(key).map_or(Decimal::ZERO, |t| t.amount);
            total += amount;
            ws.write_number_with_format(row, (j + 1) as u16, num(amount), &f.money)?;
        }
        ws.write_number_with_format(row, (periods.len() + 1) as u16, num(total), &f.money)?;
    }
    Ok(())
}

/// Summary, top accounts, monthly customer sales and warnings, one sheet
/// each.
pub fn write_analysis_workbook(dir: &Path, prefix: &str, doc: &AnalysisDocument) -> Result<PathBuf, WriteError> {
    let path = analysis_workbook_path(dir, prefix, doc.snapshot);
    let f = Formats::new();
    let mut wb = Workbook::new();

    write_summary(wb.add_worksheet().set_name("Summary")?, &doc.aging, &f)?;
    write_top_accounts(wb.add_worksheet().set_name("Top accounts")?, &doc.aging, &f)?;
    if let Some(monthly) = doc.aggregates.iter().find(|a| a.granularity == Granularity::Monthly) {
        write_customer_sales(wb.add_worksheet().set_name("Customer sales")?, monthly, &f)?;
    }
    write_warnings(wb.add_worksheet().set_name("Warnings")?, &doc.warnings, &f)?;

    write_atomically(&path, |scratch| {
        wb.save(scratch)?;
        Ok(())
    })?;
    info!(path = %path.display(), "analysis workbook written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::aging::{AgingPolicy, analyze};
    use crate::config::PipelineConfig;
    use crate::model::{CanonicalRecord, EntityId};
    use crate::period::Granularity;
    use calamine::{Data, Reader, open_workbook_auto};
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    fn doc() -> AnalysisDocument {
        let snapshot = Snapshot::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()).unwrap();
        let s = snapshot.date();
        let rec = CanonicalRecord {
            entity: EntityId::new("DND"),
            invoice_id: "I-1".into(),
            extracted_on: s,
            customer_id: "C-1".into(),
            customer_name: Some("Acme".into()),
            amount: dec!(5000),
            document_date: s - Duration::days(3),
            due_date: Some(s - Duration::days(95)),
            payment_date: None,
            category: Some("무역".into()),
        };
        // dated before the twelve-week window, so its month is not reported
        let older = CanonicalRecord {
            invoice_id: "I-0".into(),
            customer_id: "C-2".into(),
            document_date: NaiveDate::from_ymd_opt(2024, 10, 2).unwrap(),
            ..rec.clone()
        };
        let aging = analyze(std::slice::from_ref(&rec), snapshot, None, &AgingPolicy::from_config(&PipelineConfig::default()));
        AnalysisDocument {
            snapshot,
            generated_at: s.and_hms_opt(7, 0, 0).unwrap(),
            aggregates: vec![
                aggregate(std::slice::from_ref(&rec), Granularity::Weekly),
                aggregate(&[rec.clone(), older], Granularity::Monthly).with_window(snapshot.lookback_window(12)),
            ],
            aging,
            warnings: vec!["row validation: row 3: missing required field `amount`".into()],
        }
    }

    #[test]
    fn json_document_survives_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let d = doc();
        let path = write_analysis_json(dir.path(), &d).unwrap();
        assert!(path.ends_with("analysis_20250110.json"));
        let back = read_analysis_json(dir.path(), d.snapshot).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn missing_document_is_reported_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_analysis_json(dir.path(), doc().snapshot).unwrap_err();
        assert!(matches!(err, PipelineError::MissingAnalysis { .. }));
    }

    #[test]
    fn workbook_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_analysis_workbook(dir.path(), "receivables_analysis", &doc()).unwrap();
        assert!(path.ends_with("receivables_analysis_20250110.xlsx"));

        let mut wb = open_workbook_auto(&path).unwrap();
        assert_eq!(wb.sheet_names(), vec!["Summary", "Top accounts", "Customer sales", "Warnings"]);

        let customers = wb.worksheet_range("Customer sales").unwrap();
        assert_eq!(customers.get_value((0, 1)), Some(&Data::String("2025-01".into())));
        assert_eq!(customers.get_value((0, 2)), Some(&Data::String("Total".into())));
        assert_eq!(customers.get_value((1, 0)), Some(&Data::String("C-1".into())));
        assert_eq!(customers.get_value((1, 1)), Some(&Data::Float(5000.0)));
        assert_eq!(customers.get_value((2, 0)), Some(&Data::String("C-2".into())));
        assert_eq!(customers.get_value((2, 2)), Some(&Data::Float(0.0)));
        let top = wb.worksheet_range("Top accounts").unwrap();
        assert_eq!(top.get_value((1, 2)), Some(&Data::String("Acme".into())));
        assert_eq!(top.get_value((1, 3)), Some(&Data::Float(5000.0)));
    }
}
