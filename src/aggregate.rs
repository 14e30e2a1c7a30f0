//! Period roll-ups of canonical sales records.

use crate::model::{CanonicalRecord, EntityId};
use crate::period::{Granularity, PeriodKey};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTotal {
    pub amount: Decimal,
    pub count: u64,
}

impl PeriodTotal {
    fn add(&mut self, amount: Decimal) {
        self.amount += amount;
        self.count += 1;
    }
}

pub type PeriodSeries = BTreeMap<PeriodKey, PeriodTotal>;

/// Sorted maps throughout, so equal inputs serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub granularity: Granularity,
    pub per_entity: BTreeMap<EntityId, PeriodSeries>,
    /// Records without a category are left out here but still counted
    /// under their entity and the consolidated series.
    pub per_category: BTreeMap<String, PeriodSeries>,
    /// Keyed by customer id.
    #[serde(default)]
    pub per_customer: BTreeMap<String, PeriodSeries>,
    pub consolidated: PeriodSeries,
    /// Document-date window the records were limited to, if any.
    #[serde(default)]
    pub window: Option<(NaiveDate, NaiveDate)>,
}

impl AggregateResult {
    pub fn with_window(mut self, window: (NaiveDate, NaiveDate)) -> Self {
        self.window = Some(window);
        self
    }

    /// False for periods that begin before the window: their records were
    /// cut, so a missing or partial total says nothing about real sales.
    pub fn covers(&self, key: &PeriodKey) -> bool {
        self.window.is_none_or(|(from, _)| key.first_day() >= from)
    }
}

/// Collapse repeated (entity, invoice) pairs to a single record: the one
/// from the latest extract, with the full record ordering as tie-break.
pub fn dedupe_latest<'a>(records: impl IntoIterator<Item = &'a CanonicalRecord>) -> Vec<&'a CanonicalRecord> {
    let mut latest: BTreeMap<(&EntityId, &str), &CanonicalRecord> = BTreeMap::new();
    for rec in records {
        latest
            .entry((&rec.entity, rec.invoice_id.as_str()))
            .and_modify(|kept| {
                if (rec.extracted_on, rec) > (kept.extracted_on, *kept) {
                    *kept = rec;
                }
            })
            .or_insert(rec);
    }
    latest.into_values().collect()
}

pub fn aggregate(records: &[CanonicalRecord], granularity: Granularity) -> AggregateResult {
    let unique = dedupe_latest(records);
    debug!(input = records.len(), unique = unique.len(), ?granularity, "aggregating sales");

    let mut out = AggregateResult {
        granularity,
        per_entity: BTreeMap::new(),
        per_category: BTreeMap::new(),
        per_customer: BTreeMap::new(),
        consolidated: BTreeMap::new(),
        window: None,
    };
    for rec in unique {
        let key = PeriodKey::of(rec.document_date, granularity);
        out.per_entity.entry(rec.entity.clone()).or_default().entry(key).or_default().add(rec.amount);
        if let Some(cat) = &rec.category {
            out.per_category.entry(cat.clone()).or_default().entry(key).or_default().add(rec.amount);
        }
        out.per_customer.entry(rec.customer_id.clone()).or_default().entry(key).or_default().add(rec.amount);
        out.consolidated.entry(key).or_default().add(rec.amount);
    }
    out
}

/// Records whose document date lies in the inclusive window.
pub fn within_window(records: Vec<CanonicalRecord>, window: (NaiveDate, NaiveDate)) -> Vec<CanonicalRecord> {
    let (from, to) = window;
    records.into_iter().filter(|r| r.document_date >= from && r.document_date <= to).collect()
}
