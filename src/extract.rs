//! Raw extract files: naming convention, loading and column detection.

use crate::config::ExtractNaming;
use crate::error::ExtractError;
use crate::model::{ExtractKind, SourceRow};
use calamine::{open_workbook_auto, Reader};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use rust_decimal::Decimal;
use std::{collections::HashMap, fs::{self, File}, path::{Path, PathBuf}, str::FromStr};
use tracing::{debug, warn};

/// Header row plus one header->text map per non-blank data row.
#[derive(Debug, Clone)]
pub struct ExtractTable {
    pub headers: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
}

/// Parsed `<ENTITY>_<prefix><YYYYMMDD>.<ext>` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractName {
    pub entity: String,
    pub kind: ExtractKind,
    pub date: NaiveDate,
}

impl ExtractName {
    pub fn parse(file_name: &str, naming: &ExtractNaming) -> Option<Self> {
        if file_name.starts_with("~$") {
            return None;
        }
        let (stem, ext) = file_name.rsplit_once('.')?;
        if !matches!(ext.to_ascii_lowercase().as_str(), "xlsx" | "xlsm" | "xls" | "csv") {
            return None;
        }
        let (entity, rest) = stem.split_once('_')?;
        if entity.trim().is_empty() {
            return None;
        }
        let (kind, date_part) = if let Some(d) = rest.strip_prefix(naming.receivables_prefix.as_str()) {
            (ExtractKind::Receivables, d)
        } else if let Some(d) = rest.strip_prefix(naming.sales_prefix.as_str()) {
            (ExtractKind::Sales, d)
        } else {
            return None;
        };
        if date_part.len() != 8 || !date_part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
        Some(Self { entity: entity.trim().to_string(), kind, date })
    }
}

fn normalize_header(h: &str) -> String { h.trim().to_string() }

fn xlsx_to_string<T: calamine::DataType>(cell: &T) -> String {
    // Only cells typed as dates render as dates; plain numbers stay amounts.
    if cell.is_datetime() || cell.is_datetime_iso() {
        if let Some(dt) = cell.as_date() { return dt.format("%Y-%m-%d").to_string(); }
    }
    if let Some(s) = cell.as_string() { return s; }
    if let Some(i) = cell.as_i64() { return i.to_string(); }
    if let Some(f) = cell.as_f64() {
        if f.fract().abs() < f64::EPSILON { return format!("{}", f as i64); }
        return f.to_string();
    }
    if let Some(b) = cell.get_bool() { return b.to_string(); }
    String::new()
}

fn load_excel(path: &Path) -> Result<ExtractTable, ExtractError> {
    let mut wb = open_workbook_auto(path)
        .map_err(|e| ExtractError::Open { path: path.to_path_buf(), message: e.to_string() })?;
    let name = wb
        .sheet_names()
        .into_iter()
        .next()
        .ok_or_else(|| ExtractError::NoWorksheet { path: path.to_path_buf() })?;
    let range = wb
        .worksheet_range(&name)
        .map_err(|e| ExtractError::Open { path: path.to_path_buf(), message: e.to_string() })?;

    let mut rows_iter = range.rows();
    let headers_row = rows_iter.next().ok_or_else(|| ExtractError::NoHeader { path: path.to_path_buf() })?;
    let headers: Vec<String> = headers_row.iter().map(xlsx_to_string).map(|s| normalize_header(&s)).collect();

    let mut rows = Vec::new();
    for r in rows_iter {
        let mut map = HashMap::new();
        for (i, cell) in r.iter().enumerate() {
            if let Some(h) = headers.get(i) {
                map.insert(h.clone(), xlsx_to_string(cell));
            }
        }
        if map.values().all(|v| v.trim().is_empty()) { continue; }
        rows.push(map);
    }
    Ok(ExtractTable { headers, rows })
}

fn load_csv(path: &Path) -> Result<ExtractTable, ExtractError> {
    let file = File::open(path).map_err(|e| ExtractError::Open { path: path.to_path_buf(), message: e.to_string() })?;
    let csv_err = |source| ExtractError::Csv { path: path.to_path_buf(), source };
    let mut rdr = ReaderBuilder::new().flexible(true).has_headers(true).from_reader(file);
    let headers = rdr.headers().map_err(csv_err)?.iter().map(normalize_header).collect::<Vec<_>>();
    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec.map_err(csv_err)?;
        let mut map = HashMap::new();
        for (i, v) in rec.iter().enumerate() {
            if let Some(h) = headers.get(i) { map.insert(h.clone(), v.trim().to_string()); }
        }
        if map.values().all(|v| v.trim().is_empty()) { continue; }
        rows.push(map);
    }
    Ok(ExtractTable { headers, rows })
}

pub fn load_extract(path: &Path) -> Result<ExtractTable, ExtractError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" => load_excel(path),
        "csv" => load_csv(path),
        _ => Err(ExtractError::Unsupported(path.to_path_buf())),
    }
}

const ENTITY_COLS: &[&str] = &["entity", "company", "회사", "법인"];
const INVOICE_COLS: &[&str] = &["invoice", "invoice_id", "전표번호", "문서번호"];
const CUSTOMER_COLS: &[&str] = &["customer", "customer_id", "거래처코드"];
const CUSTOMER_NAME_COLS: &[&str] = &["customer_name", "거래처명"];
const AMOUNT_COLS: &[&str] = &["amount", "공급가액합계", "채권금액", "잔액", "총채권"];
const DOCUMENT_DATE_COLS: &[&str] = &["date", "document_date", "일자", "전표일자"];
const DUE_DATE_COLS: &[&str] = &["due_date", "결제예정일", "만기일"];
const PAYMENT_DATE_COLS: &[&str] = &["payment_date", "입금일", "결제일"];
const CATEGORY_COLS: &[&str] = &["category", "구분"];

/// Exact, case-insensitive header match. Substring matching would let
/// `date` claim `due_date`.
pub fn find_col(headers: &[String], candidates: &[&str]) -> Option<String> {
    headers
        .iter()
        .find(|h| {
            let l = h.trim().to_lowercase();
            candidates.iter().any(|c| l == c.to_lowercase())
        })
        .cloned()
}

/// Map a loaded table onto [`SourceRow`]s. Positions continue from
/// `first_position` so rows from several files stay distinguishable.
pub fn to_source_rows(
    table: &ExtractTable,
    name: Option<&ExtractName>,
    origin: Option<&Path>,
    first_position: usize,
) -> Vec<SourceRow> {
    let cols = [
        find_col(&table.headers, ENTITY_COLS),
        find_col(&table.headers, INVOICE_COLS),
        find_col(&table.headers, CUSTOMER_COLS),
        find_col(&table.headers, CUSTOMER_NAME_COLS),
        find_col(&table.headers, AMOUNT_COLS),
        find_col(&table.headers, DOCUMENT_DATE_COLS),
        find_col(&table.headers, DUE_DATE_COLS),
        find_col(&table.headers, PAYMENT_DATE_COLS),
        find_col(&table.headers, CATEGORY_COLS),
    ];
    debug!(headers = ?table.headers, detected = ?cols, "extract columns");
    let get = |row: &HashMap<String, String>, col: &Option<String>| -> Option<String> {
        col.as_ref()
            .and_then(|c| row.get(c))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| SourceRow {
            position: first_position + i,
            origin: origin.map(Path::to_path_buf),
            extracted_on: name.map(|n| n.date),
            entity: get(row, &cols[0]).or_else(|| name.map(|n| n.entity.clone())),
            invoice_id: get(row, &cols[1]),
            customer_id: get(row, &cols[2]),
            customer_name: get(row, &cols[3]),
            amount: get(row, &cols[4]),
            document_date: get(row, &cols[5]),
            due_date: get(row, &cols[6]),
            payment_date: get(row, &cols[7]),
            category: get(row, &cols[8]),
        })
        .collect()
}

/// Every extract in `dir` of `kind` dated within `window` (inclusive),
/// optionally limited to one entity. Files are read in name order.
pub fn list_extracts(
    dir: &Path,
    naming: &ExtractNaming,
    kind: ExtractKind,
    window: (NaiveDate, NaiveDate),
    entity: Option<&str>,
) -> Result<Vec<(PathBuf, ExtractName)>, ExtractError> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "extract directory missing");
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else { continue };
        let Some(name) = ExtractName::parse(file_name, naming) else { continue };
        if name.kind != kind || name.date < window.0 || name.date > window.1 {
            continue;
        }
        if entity.is_some_and(|e| e != name.entity) {
            continue;
        }
        found.push((path, name));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Load all matching extracts into source rows.
pub fn load_directory(
    dir: &Path,
    naming: &ExtractNaming,
    kind: ExtractKind,
    window: (NaiveDate, NaiveDate),
    entity: Option<&str>,
) -> Result<Vec<SourceRow>, ExtractError> {
    let mut out = Vec::new();
    for (path, name) in list_extracts(dir, naming, kind, window, entity)? {
        let table = load_extract(&path)?;
        debug!(file = %path.display(), rows = table.rows.len(), "loaded extract");
        let rows = to_source_rows(&table, Some(&name), Some(&path), out.len());
        out.extend(rows);
    }
    Ok(out)
}

/// Parse money text: thousands separators and currency symbols are ignored,
/// `(1,000)` means minus one thousand.
pub fn parse_amount(s: &str) -> Option<Decimal> {
    let mut t = s.trim().replace(',', "");
    let has_paren = (t.starts_with('(') && t.ends_with(')')) || (t.starts_with('（') && t.ends_with('）'));
    if has_paren {
        t = t.trim_matches(|c: char| c == '(' || c == ')' || c == '（' || c == '）').to_string();
    }
    let t = t.trim_start_matches(['₩', '￦', '¥', '￥', '$']).trim_end_matches('원').trim();
    if t.is_empty() {
        return None;
    }
    let v = Decimal::from_str(t).or_else(|_| Decimal::from_scientific(t)).ok()?;
    Some(if has_paren { -v } else { v })
}

pub fn parse_date_flex(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() { return None; }
    const FORMATS: &[&str] = &[
        "%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d",
        "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f",
        "%Y년%m월%d일", "%Y년 %m월 %d일",
    ];
    for f in FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, f) { return Some(d); }
    }
    // Portal exports append a sequence to the date: `2025/01/03 -1`.
    let head = s.split_whitespace().next()?;
    if head != s {
        return parse_date_flex(head);
    }
    None
}
