//! Template-safe report synthesis.
//!
//! Values only ever reach the workbook through a [`RegionWriter`], which
//! knows nothing but region ids. The workbook is rendered to a scratch file
//! beside the target, read back and checked, and only then renamed into
//! place. A failure anywhere leaves the previous target as it was.

use crate::aggregate::AggregateResult;
use crate::aging::AgingResult;
use crate::error::{ReportError, RunWarning, WriteError};
use crate::mapping::{CellValue, FieldMapping, ReportContext};
use crate::period::Snapshot;
use crate::template::{CellRef, ReportTemplate, ResolvedRegion, StructuralContent};
use calamine::{Data, Reader, open_workbook_auto};
use chrono::NaiveDateTime;
use rust_xlsxwriter::{Format, Workbook};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Most characters a single Excel cell holds.
pub const MAX_CELL_CHARS: usize = 32_767;

/// Strip what a cell must not contain. Returns the cleaned text and, when
/// anything changed, a note saying what.
pub fn sanitize_text(s: &str) -> (String, Option<String>) {
    let mut out = String::with_capacity(s.len());
    let mut replaced = 0usize;
    let mut dropped_cr = 0usize;
    for c in s.chars() {
        match c {
            '\r' => dropped_cr += 1,
            '\t' | '\n' => out.push(c),
            c if c.is_control() => {
                replaced += 1;
                out.push(' ');
            }
            c => out.push(c),
        }
    }
    let mut notes = Vec::new();
    if replaced > 0 {
        notes.push(format!("replaced {replaced} control character(s)"));
    }
    if dropped_cr > 0 {
        notes.push(format!("dropped {dropped_cr} carriage return(s)"));
    }
    let len = out.chars().count();
    if len > MAX_CELL_CHARS {
        out = out.chars().take(MAX_CELL_CHARS).collect();
        notes.push(format!("truncated {len} characters to {MAX_CELL_CHARS}"));
    }
    let note = (!notes.is_empty()).then(|| notes.join("; "));
    (out, note)
}

/// What a region write actually put where.
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    pub region: String,
    pub sheet: String,
    pub anchor: CellRef,
    pub value: CellValue,
    pub sanitized: Option<String>,
}

/// The only way report values get into a workbook.
pub trait RegionWriter {
    fn resolve_region(&self, id: &str) -> Result<ResolvedRegion, WriteError>;

    /// Stage `value` for the region's anchor cell.
    fn write_region(&mut self, id: &str, value: CellValue) -> Result<Written, WriteError>;

    /// Render the full workbook to `scratch`.
    fn commit(self, scratch: &Path) -> Result<(), WriteError>;
}

/// Renders the template skeleton with `rust_xlsxwriter` and lays staged
/// values over the writable regions.
pub struct XlsxRegionWriter<'t> {
    template: &'t ReportTemplate,
    staged: BTreeMap<String, (ResolvedRegion, CellValue)>,
}

impl<'t> XlsxRegionWriter<'t> {
    pub fn new(template: &'t ReportTemplate) -> Self {
        Self { template, staged: BTreeMap::new() }
    }
}

impl RegionWriter for XlsxRegionWriter<'_> {
    fn resolve_region(&self, id: &str) -> Result<ResolvedRegion, WriteError> {
        self.template.region(id).ok_or_else(|| WriteError::UnknownRegion(id.to_string()))
    }

    fn write_region(&mut self, id: &str, value: CellValue) -> Result<Written, WriteError> {
        let region = self.resolve_region(id)?;
        if !region.writable {
            return Err(WriteError::ReadOnlyRegion(id.to_string()));
        }
        let (value, sanitized) = match value {
            CellValue::Text(s) => {
                let (clean, note) = sanitize_text(&s);
                (CellValue::Text(clean), note)
            }
            CellValue::Number(n) if !n.is_finite() => (CellValue::Blank, Some(format!("non-finite number {n}"))),
            other => (other, None),
        };
        let written = Written {
            region: id.to_string(),
            sheet: region.sheet.clone(),
            anchor: region.anchor,
            value: value.clone(),
            sanitized,
        };
        self.staged.insert(id.to_string(), (region, value));
        Ok(written)
    }

    fn commit(self, scratch: &Path) -> Result<(), WriteError> {
        let formats = self.template.formats();
        let plain = Format::new();
        let style = |name: &Option<String>| pick_format(&formats, &plain, name);

        let mut wb = Workbook::new();
        for sheet in &self.template.sheets {
            let ws = wb.add_worksheet();
            ws.set_name(&sheet.name)?;
            for (col, width) in &sheet.column_widths {
                let at: CellRef = format!("{col}1").parse().map_err(|_| WriteError::UnknownRegion(col.clone()))?;
                ws.set_column_width(at.col, *width)?;
            }
            for m in &sheet.merges {
                let r: crate::template::CellRange =
                    m.range.parse().map_err(|_| WriteError::Verification(format!("bad merge {}", m.range)))?;
                ws.merge_range(r.first.row, r.first.col, r.last.row, r.last.col, "", style(&m.style))?;
            }
            for c in &sheet.cells {
                let at: CellRef = c.cell.parse().map_err(|_| WriteError::Verification(format!("bad cell {}", c.cell)))?;
                match &c.content {
                    StructuralContent::Text(t) => {
                        ws.write_string_with_format(at.row, at.col, t, style(&c.style))?;
                    }
                    StructuralContent::Formula(f) => {
                        ws.write_formula_with_format(at.row, at.col, f.as_str(), style(&c.style))?;
                    }
                }
            }
            for (region, value) in self.staged.values().filter(|(r, _)| r.sheet == sheet.name) {
                let fmt = style(&region.style);
                let a = region.anchor;
                match value {
                    CellValue::Number(n) => {
                        ws.write_number_with_format(a.row, a.col, *n, fmt)?;
                    }
                    CellValue::Text(t) => {
                        ws.write_string_with_format(a.row, a.col, t, fmt)?;
                    }
                    CellValue::Blank => {
                        ws.write_blank(a.row, a.col, fmt)?;
                    }
                }
            }
        }
        wb.save(scratch)?;
        Ok(())
    }
}

fn pick_format<'a>(formats: &'a BTreeMap<String, Format>, plain: &'a Format, name: &Option<String>) -> &'a Format {
    name.as_ref().and_then(|n| formats.get(n)).unwrap_or(plain)
}

/// A report that made it to disk.
#[derive(Debug, Clone)]
pub struct ReportInstance {
    pub path: PathBuf,
    pub snapshot: Snapshot,
    pub generated_at: NaiveDateTime,
    pub regions_written: usize,
    pub warnings: Vec<RunWarning>,
}

/// `<prefix>_<snapshot YYYYMMDD>_<generated YYYYMMDD_HHMM>.xlsx`
pub fn report_file_name(prefix: &str, snapshot: Snapshot, generated_at: NaiveDateTime) -> String {
    format!(
        "{prefix}_{}_{}.xlsx",
        snapshot.date().format("%Y%m%d"),
        generated_at.format("%Y%m%d_%H%M")
    )
}

fn cell_matches(found: Option<&Data>, expected: &CellValue) -> bool {
    match (expected, found) {
        (CellValue::Number(n), Some(Data::Float(f))) => (n - f).abs() <= 1e-9 * n.abs().max(1.0),
        (CellValue::Number(n), Some(Data::Int(i))) => (n - *i as f64).abs() <= 1e-9,
        (CellValue::Text(t), Some(Data::String(s))) => s == t,
        (CellValue::Text(t), None | Some(Data::Empty)) => t.is_empty(),
        (CellValue::Blank, None | Some(Data::Empty)) => true,
        (CellValue::Blank, Some(Data::String(s))) => s.is_empty(),
        _ => false,
    }
}

/// Read the scratch back and confirm structure and written values survived.
fn verify(template: &ReportTemplate, written: &[Written], scratch: &Path) -> Result<(), WriteError> {
    let mut wb = open_workbook_auto(scratch).map_err(|e| WriteError::Verification(e.to_string()))?;
    let names = wb.sheet_names();
    for sheet in &template.sheets {
        if !names.iter().any(|n| n == &sheet.name) {
            return Err(WriteError::Verification(format!("sheet `{}` missing", sheet.name)));
        }
        let range = wb
            .worksheet_range(&sheet.name)
            .map_err(|e| WriteError::Verification(format!("sheet `{}`: {e}", sheet.name)))?;
        for c in &sheet.cells {
            let StructuralContent::Text(expected) = &c.content else { continue };
            let at: CellRef = c.cell.parse().map_err(|_| WriteError::Verification(format!("bad cell {}", c.cell)))?;
            if !cell_matches(range.get_value((at.row, at.col as u32)), &CellValue::Text(expected.clone())) {
                return Err(WriteError::Verification(format!("{}!{} lost its text", sheet.name, c.cell)));
            }
        }
        for w in written.iter().filter(|w| w.sheet == sheet.name) {
            if !cell_matches(range.get_value((w.anchor.row, w.anchor.col as u32)), &w.value) {
                return Err(WriteError::Verification(format!(
                    "region `{}` at {}!{} does not hold the written value",
                    w.region, sheet.name, w.anchor
                )));
            }
        }
    }
    Ok(())
}

/// Write the report to `target` through `writer`.
pub fn synthesize_with<W: RegionWriter>(
    template: &ReportTemplate,
    mapping: &FieldMapping,
    aggregates: &[AggregateResult],
    aging: &AgingResult,
    ctx: &ReportContext,
    target: &Path,
    mut writer: W,
) -> Result<ReportInstance, ReportError> {
    mapping.validate(template, &aging.bucket_labels)?;

    let mut written = Vec::with_capacity(mapping.fields.len());
    let mut warnings = Vec::new();
    for binding in &mapping.fields {
        let value = mapping.resolve(&binding.field, aging, aggregates, ctx);
        let w = writer.write_region(&binding.region, value)?;
        if let Some(note) = &w.sanitized {
            warn!(region = %w.region, %note, "value sanitized");
            warnings.push(RunWarning::Sanitized { region: w.region.clone(), note: note.clone() });
        }
        written.push(w);
    }

    let dir = target.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(WriteError::from)?;
    // dropped (and deleted) on every early return below
    let scratch = tempfile::Builder::new()
        .prefix(".report-")
        .suffix(".xlsx.tmp")
        .tempfile_in(dir)
        .map_err(WriteError::from)?;
    debug!(scratch = %scratch.path().display(), "rendering report");

    writer.commit(scratch.path())?;
    verify(template, &written, scratch.path())?;
    scratch
        .persist(target)
        .map_err(|e| WriteError::Promote { path: target.to_path_buf(), message: e.error.to_string() })?;

    info!(path = %target.display(), regions = written.len(), "report written");
    Ok(ReportInstance {
        path: target.to_path_buf(),
        snapshot: ctx.snapshot,
        generated_at: ctx.generated_at,
        regions_written: written.len(),
        warnings,
    })
}

/// Fill `template` per `mapping` and place the report in `out_dir` under
/// the conventional name.
pub fn synthesize(
    template: &ReportTemplate,
    mapping: &FieldMapping,
    aggregates: &[AggregateResult],
    aging: &AgingResult,
    ctx: &ReportContext,
    out_dir: &Path,
) -> Result<ReportInstance, ReportError> {
    let target = out_dir.join(report_file_name(&ctx.file_prefix, ctx.snapshot, ctx.generated_at));
    synthesize_with(template, mapping, aggregates, aging, ctx, &target, XlsxRegionWriter::new(template))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aging::{AgingPolicy, analyze};
    use crate::error::TemplateSchemaError;
    use crate::model::{CanonicalRecord, EntityId};
    use crate::template::tests::SMALL_TEMPLATE;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    fn snap() -> Snapshot { Snapshot::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()).unwrap() }

    fn ctx() -> ReportContext {
        ReportContext {
            snapshot: snap(),
            generated_at: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap().and_hms_opt(8, 5, 0).unwrap(),
            file_prefix: "weekly".into(),
        }
    }

    fn aging() -> AgingResult {
        let s = snap().date();
        let rec = CanonicalRecord {
            entity: EntityId::new("DND"),
            invoice_id: "I-1".into(),
            extracted_on: s,
            customer_id: "C\u{7}1".into(),
            customer_name: None,
            amount: dec!(1234),
            document_date: s - Duration::days(100),
            due_date: Some(s - Duration::days(70)),
            payment_date: None,
            category: None,
        };
        let mut policy = AgingPolicy::from_config(&crate::config::PipelineConfig::default());
        policy.entities = [EntityId::new("DND")].into_iter().collect();
        analyze(&[rec], snap(), None, &policy)
    }

    fn template() -> ReportTemplate { ReportTemplate::from_json(SMALL_TEMPLATE).unwrap() }

    fn mapping() -> FieldMapping {
        FieldMapping::from_json(
            r#"{ "version": "1", "template_version": "2", "fields": [
                { "region": "total", "field": { "kind": "amount", "scope": "*", "measure": "outstanding" } },
                { "region": "week", "field": { "kind": "top_account", "rank": 1, "column": "customer_id" } }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn sanitizes_control_characters_and_long_text() {
        assert_eq!(sanitize_text("plain\ttext\n"), ("plain\ttext\n".to_string(), None));
        let (s, note) = sanitize_text("a\u{0}b\r\nc");
        assert_eq!(s, "a b\nc");
        assert_eq!(note.as_deref(), Some("replaced 1 control character(s); dropped 1 carriage return(s)"));

        let long = "가".repeat(MAX_CELL_CHARS + 5);
        let (s, note) = sanitize_text(&long);
        assert_eq!(s.chars().count(), MAX_CELL_CHARS);
        assert!(note.unwrap().starts_with("truncated"));
    }

    #[test]
    fn file_name_carries_snapshot_and_generation_time() {
        assert_eq!(report_file_name("weekly", snap(), ctx().generated_at), "weekly_20250110_20250110_0805.xlsx");
    }

    #[test]
    fn writes_verifies_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let report = synthesize(&template(), &mapping(), &[], &aging(), &ctx(), dir.path()).unwrap();

        assert_eq!(report.path, dir.path().join("weekly_20250110_20250110_0805.xlsx"));
        assert_eq!(report.regions_written, 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(matches!(&report.warnings[0], RunWarning::Sanitized { region, .. } if region == "week"));

        let mut wb = open_workbook_auto(&report.path).unwrap();
        let range = wb.worksheet_range("Summary").unwrap();
        assert_eq!(range.get_value((0, 0)), Some(&Data::String("Weekly report".into())));
        assert_eq!(range.get_value((2, 1)), Some(&Data::Float(1234.0)));
        assert_eq!(range.get_value((1, 1)), Some(&Data::String("C 1".into())));
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn schema_errors_stop_before_any_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = mapping();
        m.template_version = "9".into();
        let err = synthesize(&template(), &m, &[], &aging(), &ctx(), dir.path()).unwrap_err();
        assert!(matches!(err, ReportError::Schema(TemplateSchemaError::VersionMismatch { .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Stages normally, then dies halfway through rendering.
    struct CrashingWriter<'t>(XlsxRegionWriter<'t>);

    impl RegionWriter for CrashingWriter<'_> {
        fn resolve_region(&self, id: &str) -> Result<ResolvedRegion, WriteError> { self.0.resolve_region(id) }
        fn write_region(&mut self, id: &str, value: CellValue) -> Result<Written, WriteError> {
            self.0.write_region(id, value)
        }
        fn commit(self, scratch: &Path) -> Result<(), WriteError> {
            fs::write(scratch, b"PK\x03\x04 half a zip")?;
            Err(WriteError::Io(std::io::Error::other("disk full")))
        }
    }

    /// Produces a well-formed workbook that lost the template's structure.
    struct ForgetfulWriter;

    impl RegionWriter for ForgetfulWriter {
        fn resolve_region(&self, id: &str) -> Result<ResolvedRegion, WriteError> {
            Err(WriteError::UnknownRegion(id.into()))
        }
        fn write_region(&mut self, id: &str, value: CellValue) -> Result<Written, WriteError> {
            Ok(Written { region: id.into(), sheet: "Summary".into(), anchor: CellRef { row: 2, col: 1 }, value, sanitized: None })
        }
        fn commit(self, scratch: &Path) -> Result<(), WriteError> {
            let mut wb = Workbook::new();
            wb.add_worksheet().set_name("Summary")?;
            wb.save(scratch)?;
            Ok(())
        }
    }

    #[test]
    fn failed_write_leaves_previous_report_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("weekly.xlsx");
        fs::write(&target, b"last week's report").unwrap();
        let t = template();

        let err = synthesize_with(&t, &mapping(), &[], &aging(), &ctx(), &target, CrashingWriter(XlsxRegionWriter::new(&t)))
            .unwrap_err();
        assert!(matches!(err, ReportError::Write(WriteError::Io(_))));
        assert_eq!(fs::read(&target).unwrap(), b"last week's report");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let err = synthesize_with(&t, &mapping(), &[], &aging(), &ctx(), &target, ForgetfulWriter).unwrap_err();
        assert!(matches!(err, ReportError::Write(WriteError::Verification(_))));
        assert_eq!(fs::read(&target).unwrap(), b"last week's report");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn read_only_regions_are_refused_by_the_writer() {
        let t = template();
        let mut w = XlsxRegionWriter::new(&t);
        assert!(matches!(w.write_region("check", CellValue::Number(1.0)), Err(WriteError::ReadOnlyRegion(_))));
        assert!(matches!(w.write_region("ghost", CellValue::Blank), Err(WriteError::UnknownRegion(_))));
    }
}
