//! Versioned report template: the immutable workbook skeleton (sheets,
//! named styles, merged ranges, structural cells) plus the named regions a
//! report may fill in.

use crate::error::TemplateSchemaError;
use rust_xlsxwriter::{Format, FormatAlign, FormatBorder};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const MAX_ROWS: u32 = 1_048_576;
const MAX_COLS: u16 = 16_384;
const MAX_SHEET_NAME_CHARS: usize = 31;

/// Zero-based cell position, written `B3` in template files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellRef {
    pub row: u32,
    pub col: u16,
}

impl FromStr for CellRef {
    type Err = TemplateSchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || TemplateSchemaError::BadReference(s.to_string());
        let t = s.trim().to_ascii_uppercase();
        let split = t.find(|c: char| c.is_ascii_digit()).ok_or_else(bad)?;
        let (letters, digits) = t.split_at(split);
        if letters.is_empty() || letters.len() > 3 || !letters.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(bad());
        }
        let col = letters.bytes().fold(0u32, |acc, b| acc * 26 + (b - b'A' + 1) as u32);
        let row: u32 = digits.parse().map_err(|_| bad())?;
        if row == 0 || row > MAX_ROWS || col == 0 || col > MAX_COLS as u32 {
            return Err(bad());
        }
        Ok(CellRef { row: row - 1, col: (col - 1) as u16 })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut n = self.col as u32 + 1;
        let mut letters = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        let col: String = letters.into_iter().rev().collect();
        write!(f, "{col}{}", self.row + 1)
    }
}

/// Inclusive rectangle, `A1:C2` or a single `A1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellRange {
    pub first: CellRef,
    pub last: CellRef,
}

impl CellRange {
    pub fn is_single(&self) -> bool { self.first == self.last }

    pub fn contains(&self, c: CellRef) -> bool {
        (self.first.row..=self.last.row).contains(&c.row) && (self.first.col..=self.last.col).contains(&c.col)
    }

    pub fn overlaps(&self, other: &CellRange) -> bool {
        self.first.row <= other.last.row
            && other.first.row <= self.last.row
            && self.first.col <= other.last.col
            && other.first.col <= self.last.col
    }
}

impl FromStr for CellRange {
    type Err = TemplateSchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s.split_once(':').unwrap_or((s, s));
        let first: CellRef = a.parse()?;
        let last: CellRef = b.parse()?;
        if last.row < first.row || last.col < first.col {
            return Err(TemplateSchemaError::BadReference(s.to_string()));
        }
        Ok(CellRange { first, last })
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}:{}", self.first, self.last)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StyleSpec {
    pub bold: bool,
    pub border: bool,
    pub wrap: bool,
    pub align: Option<Align>,
    pub num_format: Option<String>,
    pub font_size: Option<f64>,
    /// `#RRGGBB`
    pub font_color: Option<String>,
    pub background: Option<String>,
}

fn parse_color(hex: &str) -> Option<u32> {
    let h = hex.trim().trim_start_matches('#');
    if h.len() != 6 {
        return None;
    }
    u32::from_str_radix(h, 16).ok()
}

impl StyleSpec {
    pub fn to_format(&self) -> Format {
        let mut f = Format::new();
        if self.bold {
            f = f.set_bold();
        }
        if self.border {
            f = f.set_border(FormatBorder::Thin);
        }
        if self.wrap {
            f = f.set_text_wrap();
        }
        if let Some(a) = self.align {
            f = f.set_align(match a {
                Align::Left => FormatAlign::Left,
                Align::Center => FormatAlign::Center,
                Align::Right => FormatAlign::Right,
            });
        }
        if let Some(nf) = &self.num_format {
            f = f.set_num_format(nf);
        }
        if let Some(sz) = self.font_size {
            f = f.set_font_size(sz);
        }
        if let Some(c) = self.font_color.as_deref().and_then(parse_color) {
            f = f.set_font_color(c);
        }
        if let Some(c) = self.background.as_deref().and_then(parse_color) {
            f = f.set_background_color(c);
        }
        f
    }

    fn colors_valid(&self) -> bool {
        [&self.font_color, &self.background].into_iter().flatten().all(|c| parse_color(c).is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralContent {
    Text(String),
    Formula(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StructuralCell {
    pub cell: String,
    #[serde(flatten)]
    pub content: StructuralContent,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MergeSpec {
    pub range: String,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegionSpec {
    pub id: String,
    /// A single cell or exactly one of the sheet's merged ranges.
    pub range: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool { true }

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SheetSpec {
    pub name: String,
    /// Column letter to width in character units.
    #[serde(default)]
    pub column_widths: BTreeMap<String, f64>,
    #[serde(default)]
    pub merges: Vec<MergeSpec>,
    #[serde(default)]
    pub cells: Vec<StructuralCell>,
    #[serde(default)]
    pub regions: Vec<RegionSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportTemplate {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub styles: BTreeMap<String, StyleSpec>,
    pub sheets: Vec<SheetSpec>,
}

/// Where a region lands: its sheet and the top-left cell of its range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRegion {
    pub id: String,
    pub sheet: String,
    pub range: CellRange,
    pub anchor: CellRef,
    pub style: Option<String>,
    pub writable: bool,
}

fn check_sheet_name(name: &str) -> Result<(), TemplateSchemaError> {
    let illegal = |c: char| matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\');
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.chars().count() > MAX_SHEET_NAME_CHARS
        || name.chars().any(illegal)
        || name.starts_with('\'')
    {
        return Err(TemplateSchemaError::BadReference(format!("sheet name `{name}`")));
    }
    Ok(())
}

impl ReportTemplate {
    pub fn from_json(text: &str) -> Result<Self, TemplateSchemaError> {
        let t: ReportTemplate = serde_json::from_str(text).map_err(|e| TemplateSchemaError::Parse(e.to_string()))?;
        t.validate()?;
        Ok(t)
    }

    pub fn load(path: &Path) -> Result<Self, TemplateSchemaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TemplateSchemaError::Read { path: path.to_path_buf(), message: e.to_string() })?;
        Self::from_json(&text)
    }

    fn check_style(&self, style: &Option<String>) -> Result<(), TemplateSchemaError> {
        match style {
            Some(s) if !self.styles.contains_key(s) => Err(TemplateSchemaError::UnknownStyle(s.clone())),
            _ => Ok(()),
        }
    }

    /// Structural sanity of the skeleton itself, independent of any mapping.
    pub fn validate(&self) -> Result<(), TemplateSchemaError> {
        if let Some((name, _)) = self.styles.iter().find(|(_, s)| !s.colors_valid()) {
            return Err(TemplateSchemaError::Parse(format!("style `{name}` has an invalid colour")));
        }
        let mut sheet_names = BTreeSet::new();
        let mut region_ids = BTreeSet::new();
        for sheet in &self.sheets {
            check_sheet_name(&sheet.name)?;
            if !sheet_names.insert(sheet.name.to_lowercase()) {
                return Err(TemplateSchemaError::BadReference(format!("duplicate sheet `{}`", sheet.name)));
            }
            for col in sheet.column_widths.keys() {
                format!("{col}1").parse::<CellRef>()?;
            }

            let mut merges: Vec<CellRange> = Vec::with_capacity(sheet.merges.len());
            for m in &sheet.merges {
                self.check_style(&m.style)?;
                let r: CellRange = m.range.parse()?;
                if r.is_single() {
                    return Err(TemplateSchemaError::BadReference(format!("merge `{}` spans one cell", m.range)));
                }
                if let Some(prev) = merges.iter().find(|p| p.overlaps(&r)) {
                    return Err(TemplateSchemaError::OverlappingMerge {
                        sheet: sheet.name.clone(),
                        first: prev.to_string(),
                        second: r.to_string(),
                    });
                }
                merges.push(r);
            }

            let mut structural = Vec::with_capacity(sheet.cells.len());
            for c in &sheet.cells {
                self.check_style(&c.style)?;
                let at: CellRef = c.cell.parse()?;
                // content inside a merge must sit on its anchor
                if merges.iter().any(|m| m.contains(at) && m.first != at) {
                    return Err(TemplateSchemaError::BadReference(format!("{} is inside a merged range", c.cell)));
                }
                structural.push(at);
            }

            for region in &sheet.regions {
                self.check_style(&region.style)?;
                if !region_ids.insert(region.id.clone()) {
                    return Err(TemplateSchemaError::DuplicateRegion(region.id.clone()));
                }
                let r: CellRange = region.range.parse()?;
                let covering = merges.iter().find(|m| m.overlaps(&r));
                match covering {
                    Some(m) if *m != r => {
                        return Err(TemplateSchemaError::UnmergedSpan {
                            sheet: sheet.name.clone(),
                            region: region.id.clone(),
                            range: region.range.clone(),
                        });
                    }
                    None if !r.is_single() => {
                        return Err(TemplateSchemaError::UnmergedSpan {
                            sheet: sheet.name.clone(),
                            region: region.id.clone(),
                            range: region.range.clone(),
                        });
                    }
                    _ => {}
                }
                if region.writable {
                    if let Some(cell) = structural.iter().find(|c| r.contains(**c)) {
                        return Err(TemplateSchemaError::RegionOverlapsStructure {
                            region: region.id.clone(),
                            cell: cell.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn region(&self, id: &str) -> Option<ResolvedRegion> {
        self.sheets.iter().find_map(|sheet| {
            sheet.regions.iter().find(|r| r.id == id).and_then(|r| {
                let range: CellRange = r.range.parse().ok()?;
                Some(ResolvedRegion {
                    id: r.id.clone(),
                    sheet: sheet.name.clone(),
                    range,
                    anchor: range.first,
                    style: r.style.clone(),
                    writable: r.writable,
                })
            })
        })
    }

    pub fn formats(&self) -> BTreeMap<String, Format> {
        self.styles.iter().map(|(k, s)| (k.clone(), s.to_format())).collect()
    }
}
