//! Record Normalizer: untrusted [`SourceRow`]s in, [`CanonicalRecord`]s and
//! [`RowError`]s out. One bad row never sinks the batch.

use crate::config::PipelineConfig;
use crate::error::{RowError, RowValidationError};
use crate::extract::{parse_amount, parse_date_flex};
use crate::model::{CanonicalRecord, EntityId, SourceRow};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Everything the normalizer needs from configuration.
#[derive(Debug, Clone)]
pub struct NormalizeRules {
    pub known_entities: BTreeSet<EntityId>,
    pub default_categories: BTreeMap<EntityId, String>,
    pub category_mappings: BTreeMap<String, String>,
    /// Used when a row carries no extraction date of its own.
    pub fallback_extracted_on: NaiveDate,
}

impl NormalizeRules {
    pub fn from_config(config: &PipelineConfig, fallback_extracted_on: NaiveDate) -> Self {
        Self {
            known_entities: config.entity_ids().into_iter().collect(),
            default_categories: config
                .entities
                .iter()
                .filter_map(|e| e.default_category.clone().map(|c| (EntityId::new(e.id.trim()), c)))
                .collect(),
            category_mappings: config.category_mappings.clone(),
            fallback_extracted_on,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub valid: Vec<CanonicalRecord>,
    pub errors: Vec<RowError>,
}

pub fn normalize(rows: impl IntoIterator<Item = SourceRow>, rules: &NormalizeRules) -> Normalized {
    let mut out = Normalized::default();
    for row in rows {
        match normalize_row(&row, rules) {
            Ok(rec) => out.valid.push(rec),
            Err(reason) => {
                debug!(position = row.position, %reason, "row rejected");
                out.errors.push(RowError { position: row.position, origin: row.origin.clone(), reason });
            }
        }
    }
    info!(valid = out.valid.len(), rejected = out.errors.len(), "normalized extract rows");
    out
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, RowValidationError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(RowValidationError::MissingField(field))
}

fn optional_date(value: &Option<String>, field: &'static str) -> Result<Option<NaiveDate>, RowValidationError> {
    match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => parse_date_flex(v)
            .map(Some)
            .ok_or_else(|| RowValidationError::InvalidDate { field, value: v.to_string() }),
    }
}

fn normalize_row(row: &SourceRow, rules: &NormalizeRules) -> Result<CanonicalRecord, RowValidationError> {
    let entity = EntityId::new(required(&row.entity, "entity")?);
    if !rules.known_entities.contains(&entity) {
        return Err(RowValidationError::UnknownEntity(entity.as_str().to_string()));
    }
    let invoice_id = required(&row.invoice_id, "invoice_id")?.to_string();
    let customer_id = required(&row.customer_id, "customer_id")?.to_string();

    let amount_text = required(&row.amount, "amount")?;
    let amount = parse_amount(amount_text).ok_or_else(|| RowValidationError::InvalidAmount(amount_text.to_string()))?;
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(RowValidationError::NegativeAmount(amount_text.to_string()));
    }

    let doc_text = required(&row.document_date, "document_date")?;
    let document_date = parse_date_flex(doc_text)
        .ok_or_else(|| RowValidationError::InvalidDate { field: "document_date", value: doc_text.to_string() })?;
    let due_date = optional_date(&row.due_date, "due_date")?;
    let payment_date = optional_date(&row.payment_date, "payment_date")?;

    let category = row
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .or_else(|| rules.default_categories.get(&entity).cloned())
        .map(|c| rules.category_mappings.get(&c).cloned().unwrap_or(c));

    Ok(CanonicalRecord {
        entity,
        invoice_id,
        extracted_on: row.extracted_on.unwrap_or(rules.fallback_extracted_on),
        customer_id,
        customer_name: row.customer_name.as_deref().map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
        amount: amount.abs(),
        document_date,
        due_date,
        payment_date,
        category,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> NormalizeRules {
        NormalizeRules {
            known_entities: [EntityId::new("DND"), EntityId::new("DNI")].into_iter().collect(),
            default_categories: BTreeMap::from([(EntityId::new("DNI"), "수출".to_string())]),
            category_mappings: BTreeMap::from([("수출".to_string(), "무역".to_string())]),
            fallback_extracted_on: NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
        }
    }

    fn row(position: usize, entity: &str, invoice: &str, amount: &str) -> SourceRow {
        SourceRow {
            position,
            entity: Some(entity.into()),
            invoice_id: Some(invoice.into()),
            customer_id: Some("C-1".into()),
            amount: Some(amount.into()),
            document_date: Some("2024-12-01".into()),
            due_date: Some("2024/12/31".into()),
            ..SourceRow::default()
        }
    }

    #[test]
    fn keeps_valid_rows_in_order_and_collects_errors() {
        let mut bad_date = row(3, "DND", "I-4", "10");
        bad_date.due_date = Some("someday".into());
        let mut missing_customer = row(4, "DNI", "I-5", "10");
        missing_customer.customer_id = Some("  ".into());
        let rows = vec![
            row(0, "DND", "I-1", "1,000"),
            row(1, "XXX", "I-2", "5"),
            row(2, "DNI", "I-3", "-5"),
            bad_date,
            missing_customer,
            row(5, "DNI", "I-6", "0"),
            row(6, "DND", "I-7", "n/a"),
        ];
        let out = normalize(rows, &rules());

        let ids: Vec<_> = out.valid.iter().map(|r| r.invoice_id.as_str()).collect();
        assert_eq!(ids, vec!["I-1", "I-6"]);
        assert_eq!(out.valid[0].amount, dec!(1000));
        assert_eq!(out.valid[0].due_date, NaiveDate::from_ymd_opt(2024, 12, 31));
        assert_eq!(out.valid[0].extracted_on, NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());

        let reasons: Vec<_> = out.errors.iter().map(|e| (e.position, e.reason.clone())).collect();
        assert_eq!(
            reasons,
            vec![
                (1, RowValidationError::UnknownEntity("XXX".into())),
                (2, RowValidationError::NegativeAmount("-5".into())),
                (3, RowValidationError::InvalidDate { field: "due_date", value: "someday".into() }),
                (4, RowValidationError::MissingField("customer_id")),
                (6, RowValidationError::InvalidAmount("n/a".into())),
            ]
        );
    }

    #[test]
    fn default_category_is_mapped() {
        let out = normalize(vec![row(0, "DNI", "I-1", "1"), row(1, "DND", "I-2", "1")], &rules());
        assert_eq!(out.valid[0].category.as_deref(), Some("무역"));
        assert_eq!(out.valid[1].category, None);
    }

    #[test]
    fn missing_due_date_is_not_a_row_error() {
        let mut r = row(0, "DND", "I-1", "1");
        r.due_date = None;
        let out = normalize(vec![r], &rules());
        assert!(out.errors.is_empty());
        assert_eq!(out.valid[0].due_date, None);
    }
}
