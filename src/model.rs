use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Serialized form of [`EntityScope::Consolidated`]; never a valid entity id.
pub const CONSOLIDATED_TOKEN: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// One legal entity, or all of them together. Entities sort before the
/// consolidated scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityScope {
    Entity(EntityId),
    Consolidated,
}

impl From<EntityScope> for String {
    fn from(s: EntityScope) -> Self {
        match s {
            EntityScope::Entity(id) => id.0,
            EntityScope::Consolidated => CONSOLIDATED_TOKEN.to_string(),
        }
    }
}

impl TryFrom<String> for EntityScope {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        let t = s.trim();
        if t.is_empty() {
            return Err("empty entity scope".into());
        }
        if t == CONSOLIDATED_TOKEN {
            return Ok(EntityScope::Consolidated);
        }
        Ok(EntityScope::Entity(EntityId::new(t)))
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityScope::Entity(id) => write!(f, "{id}"),
            EntityScope::Consolidated => f.write_str("consolidated"),
        }
    }
}

/// Which extract family a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractKind {
    Sales,
    Receivables,
}

/// A raw extract row before validation. Every field is untrusted text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRow {
    pub position: usize,
    pub origin: Option<PathBuf>,
    pub extracted_on: Option<NaiveDate>,
    pub entity: Option<String>,
    pub invoice_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub amount: Option<String>,
    pub document_date: Option<String>,
    pub due_date: Option<String>,
    pub payment_date: Option<String>,
    pub category: Option<String>,
}

/// A validated record. Field order drives the derived ordering, which the
/// aggregation engine relies on to break deduplication ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity: EntityId,
    pub invoice_id: String,
    pub extracted_on: NaiveDate,
    pub customer_id: String,
    pub customer_name: Option<String>,
    pub amount: Decimal,
    pub document_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub category: Option<String>,
}

impl CanonicalRecord {
    /// Still owed as of `date`: unpaid, or paid only afterwards.
    pub fn outstanding_on(&self, date: NaiveDate) -> bool {
        match self.payment_date {
            None => true,
            Some(paid) => paid > date,
        }
    }
}
