//! Snapshot history: bucket totals of earlier runs, keyed by scope and
//! snapshot date. Entries are only ever appended.

use crate::aging::{BucketTotals, PriorTotals};
use crate::error::HistoryError;
use crate::model::EntityScope;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub trait HistoryStore {
    fn get(&self, scope: &EntityScope, date: NaiveDate) -> Result<Option<BucketTotals>, HistoryError>;

    /// Record every scope of one snapshot at once. Fails without writing
    /// anything if any (scope, date) key already exists.
    fn append_all(&mut self, date: NaiveDate, totals: &PriorTotals) -> Result<(), HistoryError>;

    fn append(&mut self, scope: &EntityScope, date: NaiveDate, totals: &BucketTotals) -> Result<(), HistoryError> {
        self.append_all(date, &PriorTotals::from([(scope.clone(), totals.clone())]))
    }

    /// Totals recorded for `date` across `scopes`; `None` when none are.
    fn prior_totals(&self, date: NaiveDate, scopes: &[EntityScope]) -> Result<Option<PriorTotals>, HistoryError> {
        let mut found = PriorTotals::new();
        for scope in scopes {
            if let Some(t) = self.get(scope, date)? {
                found.insert(scope.clone(), t);
            }
        }
        Ok((!found.is_empty()).then_some(found))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryLine {
    scope: EntityScope,
    snapshot: NaiveDate,
    totals: BucketTotals,
}

type Entries = BTreeMap<(EntityScope, NaiveDate), BucketTotals>;

fn refuse_existing(entries: &Entries, date: NaiveDate, totals: &PriorTotals) -> Result<(), HistoryError> {
    match totals.keys().find(|scope| entries.contains_key(&((*scope).clone(), date))) {
        Some(scope) => Err(HistoryError::AlreadyRecorded { scope: String::from(scope.clone()), date }),
        None => Ok(()),
    }
}

/// JSON Lines file, one `{scope, snapshot, totals}` object per line.
#[derive(Debug)]
pub struct JsonlHistoryStore {
    path: PathBuf,
    entries: Entries,
}

impl JsonlHistoryStore {
    /// Load the file; a missing file is an empty history.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let mut entries = Entries::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let rec: HistoryLine = serde_json::from_str(&line)
                    .map_err(|source| HistoryError::Corrupt { path: path.to_path_buf(), line: idx + 1, source })?;
                entries.insert((rec.scope, rec.snapshot), rec.totals);
            }
        }
        debug!(path = %path.display(), entries = entries.len(), "history loaded");
        Ok(Self { path: path.to_path_buf(), entries })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

impl HistoryStore for JsonlHistoryStore {
    fn get(&self, scope: &EntityScope, date: NaiveDate) -> Result<Option<BucketTotals>, HistoryError> {
        Ok(self.entries.get(&(scope.clone(), date)).cloned())
    }

    fn append_all(&mut self, date: NaiveDate, totals: &PriorTotals) -> Result<(), HistoryError> {
        refuse_existing(&self.entries, date, totals)?;
        let mut buf = Vec::new();
        for (scope, t) in totals {
            let line = HistoryLine { scope: scope.clone(), snapshot: date, totals: t.clone() };
            serde_json::to_writer(&mut buf, &line)?;
            buf.push(b'\n');
        }
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        for (scope, t) in totals {
            self.entries.insert((scope.clone(), date), t.clone());
        }
        info!(%date, scopes = totals.len(), path = %self.path.display(), "history appended");
        Ok(())
    }
}

/// Non-persistent store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: Entries,
}

impl HistoryStore for MemoryHistoryStore {
    fn get(&self, scope: &EntityScope, date: NaiveDate) -> Result<Option<BucketTotals>, HistoryError> {
        Ok(self.entries.get(&(scope.clone(), date)).cloned())
    }

    fn append_all(&mut self, date: NaiveDate, totals: &PriorTotals) -> Result<(), HistoryError> {
        refuse_existing(&self.entries, date, totals)?;
        for (scope, t) in totals {
            self.entries.insert((scope.clone(), date), t.clone());
        }
        Ok(())
    }
}
