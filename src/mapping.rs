//! Field mapping: which computed figure goes into which template region,
//! and how each figure is turned into a cell value.

use crate::aggregate::AggregateResult;
use crate::aging::{AgingResult, BucketTotal, BucketTotals, Comparison, PercentChange, ScopeComparison};
use crate::error::TemplateSchemaError;
use crate::model::{EntityId, EntityScope};
use crate::period::{Granularity, PeriodKey, Snapshot};
use crate::template::ReportTemplate;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Outstanding,
    Bucket(String),
    TermExceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Current,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountColumn {
    CustomerId,
    CustomerName,
    Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesScope {
    Entity(EntityId),
    Category(String),
    /// A customer id.
    Customer(String),
    Consolidated,
}

/// A figure the report can show.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportField {
    SnapshotDate,
    ReportingWeek,
    GeneratedAt,
    Amount { scope: EntityScope, measure: Measure, #[serde(default)] side: Side },
    Count { scope: EntityScope, measure: Measure },
    Delta { scope: EntityScope, measure: Measure },
    DeltaPct { scope: EntityScope, measure: Measure },
    /// Measure as a fraction of the scope's outstanding total.
    Share { scope: EntityScope, measure: Measure, #[serde(default)] side: Side },
    /// Change of the share in percentage points.
    ShareChange { scope: EntityScope, measure: Measure },
    TopAccount { rank: usize, column: AccountColumn },
    /// Sales of the period `offset` periods before the reporting week's.
    PeriodSales { granularity: Granularity, scope: SalesScope, #[serde(default)] offset: u32 },
    PeriodLabel { granularity: Granularity, #[serde(default)] offset: u32 },
}

impl ReportField {
    fn measure(&self) -> Option<&Measure> {
        match self {
            ReportField::Amount { measure, .. }
            | ReportField::Count { measure, .. }
            | ReportField::Delta { measure, .. }
            | ReportField::DeltaPct { measure, .. }
            | ReportField::Share { measure, .. }
            | ReportField::ShareChange { measure, .. } => Some(measure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldBinding {
    pub region: String,
    pub field: ReportField,
}

fn default_unit() -> Decimal { Decimal::ONE }
fn default_undefined() -> String { "n/a".into() }
fn default_no_baseline() -> String { "-".into() }

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldMapping {
    pub version: String,
    /// Must equal the loaded template's version.
    pub template_version: String,
    /// Amounts are divided by this before writing (1 000 000 for millions).
    #[serde(default = "default_unit")]
    pub amount_unit: Decimal,
    #[serde(default)]
    pub amount_decimals: u32,
    #[serde(default = "default_undefined")]
    pub undefined_text: String,
    #[serde(default = "default_no_baseline")]
    pub no_baseline_text: String,
    pub fields: Vec<FieldBinding>,
}

/// Value headed for a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Blank,
}

/// Per-run facts the report needs besides the analytics.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub snapshot: Snapshot,
    pub generated_at: NaiveDateTime,
    pub file_prefix: String,
}

impl FieldMapping {
    pub fn from_json(text: &str) -> Result<Self, TemplateSchemaError> {
        serde_json::from_str(text).map_err(|e| TemplateSchemaError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, TemplateSchemaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TemplateSchemaError::Read { path: path.to_path_buf(), message: e.to_string() })?;
        Self::from_json(&text)
    }

    /// Check the mapping against the template and the run's bucket labels.
    /// Nothing may be written unless this passes.
    pub fn validate(&self, template: &ReportTemplate, bucket_labels: &[String]) -> Result<(), TemplateSchemaError> {
        if self.template_version != template.version {
            return Err(TemplateSchemaError::VersionMismatch {
                expected: self.template_version.clone(),
                found: template.version.clone(),
            });
        }
        if self.amount_unit <= Decimal::ZERO {
            return Err(TemplateSchemaError::Parse("amount_unit must be positive".into()));
        }
        let mut seen = BTreeSet::new();
        for binding in &self.fields {
            let region = template
                .region(&binding.region)
                .ok_or_else(|| TemplateSchemaError::MissingRegion(binding.region.clone()))?;
            if !region.writable {
                return Err(TemplateSchemaError::ReadOnlyTarget(binding.region.clone()));
            }
            if !seen.insert(binding.region.as_str()) {
                return Err(TemplateSchemaError::DuplicateRegion(binding.region.clone()));
            }
            if let Some(Measure::Bucket(label)) = binding.field.measure() {
                if !bucket_labels.iter().any(|l| l == label) {
                    return Err(TemplateSchemaError::UnknownBucket(label.clone()));
                }
            }
        }
        Ok(())
    }

    fn money(&self, amount: Decimal) -> CellValue {
        amount
            .checked_div(self.amount_unit)
            .and_then(|scaled| scaled.round_dp(self.amount_decimals).to_f64())
            .map_or(CellValue::Blank, CellValue::Number)
    }

    fn text(&self, s: &str) -> CellValue { CellValue::Text(s.to_string()) }

    pub fn resolve(
        &self,
        field: &ReportField,
        aging: &AgingResult,
        aggregates: &[AggregateResult],
        ctx: &ReportContext,
    ) -> CellValue {
        match field {
            ReportField::SnapshotDate => CellValue::Text(ctx.snapshot.date().format("%Y-%m-%d").to_string()),
            ReportField::ReportingWeek => {
                let (from, to) = ctx.snapshot.reporting_week();
                CellValue::Text(format!("{} ~ {}", from.format("%Y-%m-%d"), to.format("%Y-%m-%d")))
            }
            ReportField::GeneratedAt => CellValue::Text(ctx.generated_at.format("%Y-%m-%d %H:%M").to_string()),
            ReportField::Amount { scope, measure, side } => match side {
                Side::Current => aging
                    .totals
                    .get(scope)
                    .and_then(|t| measure_total(t, measure))
                    .map_or(CellValue::Blank, |t| self.money(t.amount)),
                Side::Previous => match comparison(aging, scope, measure) {
                    Some(Comparison::Against { previous, .. }) => self.money(previous),
                    Some(Comparison::NoBaseline { .. }) => self.text(&self.no_baseline_text),
                    None => CellValue::Blank,
                },
            },
            ReportField::Count { scope, measure } => aging
                .totals
                .get(scope)
                .and_then(|t| measure_total(t, measure))
                .map_or(CellValue::Blank, |t| CellValue::Number(t.count as f64)),
            ReportField::Delta { scope, measure } => match comparison(aging, scope, measure) {
                Some(Comparison::Against { delta, .. }) => self.money(delta),
                Some(Comparison::NoBaseline { .. }) => self.text(&self.no_baseline_text),
                None => CellValue::Blank,
            },
            ReportField::DeltaPct { scope, measure } => match comparison(aging, scope, measure) {
                Some(Comparison::Against { pct: PercentChange::Defined(p), .. }) => ratio(p),
                Some(Comparison::Against { pct: PercentChange::Undefined, .. }) => self.text(&self.undefined_text),
                Some(Comparison::NoBaseline { .. }) => self.text(&self.no_baseline_text),
                None => CellValue::Blank,
            },
            ReportField::Share { scope, measure, side } => {
                let Some(cmp) = aging.comparisons.get(scope) else { return CellValue::Blank };
                let Some(m) = comparison(aging, scope, measure) else { return CellValue::Blank };
                let pair = match side {
                    Side::Current => Some((m.current(), cmp.outstanding.current())),
                    Side::Previous => previous_of(&m).zip(previous_of(&cmp.outstanding)),
                };
                match pair {
                    None => self.text(&self.no_baseline_text),
                    Some((part, whole)) => share(part, whole).map_or_else(|| self.text(&self.undefined_text), ratio),
                }
            }
            ReportField::ShareChange { scope, measure } => {
                let Some(cmp) = aging.comparisons.get(scope) else { return CellValue::Blank };
                let Some(m) = comparison(aging, scope, measure) else { return CellValue::Blank };
                let (Some(prev_part), Some(prev_whole)) = (previous_of(&m), previous_of(&cmp.outstanding)) else {
                    return self.text(&self.no_baseline_text);
                };
                match (share(m.current(), cmp.outstanding.current()), share(prev_part, prev_whole)) {
                    (Some(now), Some(before)) => {
                        let points = ((now - before) * Decimal::ONE_HUNDRED).round_dp(2);
                        points.to_f64().map_or(CellValue::Blank, CellValue::Number)
                    }
                    _ => self.text(&self.undefined_text),
                }
            }
            ReportField::TopAccount { rank, column } => {
                let Some(acct) = aging.top_accounts.iter().find(|a| a.rank == *rank) else { return CellValue::Blank };
                match column {
                    AccountColumn::CustomerId => CellValue::Text(acct.customer_id.clone()),
                    AccountColumn::CustomerName => {
                        acct.customer_name.clone().map_or(CellValue::Blank, CellValue::Text)
                    }
                    AccountColumn::Amount => self.money(acct.amount),
                }
            }
            ReportField::PeriodSales { granularity, scope, offset } => {
                let Some(agg) = aggregates.iter().find(|a| a.granularity == *granularity) else {
                    return CellValue::Blank;
                };
                let key = period_key(ctx.snapshot, *granularity, *offset);
                if !agg.covers(&key) {
                    return CellValue::Blank;
                }
                let series = match scope {
                    SalesScope::Entity(id) => agg.per_entity.get(id),
                    SalesScope::Category(c) => agg.per_category.get(c),
                    SalesScope::Customer(c) => agg.per_customer.get(c),
                    SalesScope::Consolidated => Some(&agg.consolidated),
                };
                match series {
                    // scope never appeared in the window at all
                    None => CellValue::Blank,
                    Some(s) => self.money(s.get(&key).map_or(Decimal::ZERO, |t| t.amount)),
                }
            }
            ReportField::PeriodLabel { granularity, offset } => {
                CellValue::Text(period_key(ctx.snapshot, *granularity, *offset).label())
            }
        }
    }
}

fn period_key(snapshot: Snapshot, granularity: Granularity, offset: u32) -> PeriodKey {
    PeriodKey::of(snapshot.reporting_week().1, granularity).preceding(offset)
}

fn measure_total<'a>(t: &'a BucketTotals, m: &Measure) -> Option<&'a BucketTotal> {
    match m {
        Measure::Outstanding => Some(&t.outstanding),
        Measure::TermExceeded => Some(&t.term_exceeded),
        Measure::Bucket(label) => t.buckets.get(label),
    }
}

fn measure_comparison(c: &ScopeComparison, m: &Measure) -> Option<Comparison> {
    match m {
        Measure::Outstanding => Some(c.outstanding),
        Measure::TermExceeded => Some(c.term_exceeded),
        Measure::Bucket(label) => c.buckets.get(label).copied(),
    }
}

fn comparison(aging: &AgingResult, scope: &EntityScope, m: &Measure) -> Option<Comparison> {
    aging.comparisons.get(scope).and_then(|c| measure_comparison(c, m))
}

fn previous_of(c: &Comparison) -> Option<Decimal> {
    match c {
        Comparison::Against { previous, .. } => Some(*previous),
        Comparison::NoBaseline { .. } => None,
    }
}

fn share(part: Decimal, whole: Decimal) -> Option<Decimal> {
    if whole.is_zero() { None } else { part.checked_div(whole) }
}

fn ratio(r: Decimal) -> CellValue {
    r.round_dp(6).to_f64().map_or(CellValue::Blank, CellValue::Number)
}
