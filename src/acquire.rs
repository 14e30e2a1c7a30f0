//! Per-entity extract acquisition.
//!
//! Each entity's source runs on its own thread. Results come back over one
//! channel against a shared deadline; an entity that fails or runs out the
//! clock contributes no rows and becomes a warning.

use crate::config::{ExtractNaming, PipelineConfig};
use crate::error::{AcquisitionError, AcquisitionFailure};
use crate::extract::load_directory;
use crate::model::{EntityId, ExtractKind, SourceRow};
use crate::period::Snapshot;
use chrono::{Duration as Days, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Date windows of the extract files a run wants, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub sales: (NaiveDate, NaiveDate),
    /// Reaches one week back so a missing baseline can be rebuilt.
    pub receivables: (NaiveDate, NaiveDate),
}

impl AcquisitionRequest {
    pub fn for_snapshot(snapshot: Snapshot, lookback_periods: u8) -> Self {
        let (from, _) = snapshot.lookback_window(lookback_periods);
        Self {
            sales: (from, snapshot.date()),
            receivables: (snapshot.previous().date(), snapshot.date()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityExtracts {
    pub sales: Vec<SourceRow>,
    pub receivables: Vec<SourceRow>,
}

/// Where one entity's extracts come from.
pub trait ExtractSource: Send + 'static {
    fn entity(&self) -> &EntityId;
    fn fetch(&self, request: &AcquisitionRequest) -> Result<EntityExtracts, String>;
}

/// Reads extracts dropped into a directory under the usual naming scheme.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    pub entity: EntityId,
    pub dir: PathBuf,
    pub naming: ExtractNaming,
    pub collect_receivables: bool,
}

impl DirectorySource {
    /// One source per configured entity, all reading `dir`.
    pub fn for_config(config: &PipelineConfig, dir: PathBuf) -> Vec<Box<dyn ExtractSource>> {
        config
            .entities
            .iter()
            .map(|e| {
                Box::new(DirectorySource {
                    entity: EntityId::new(e.id.trim()),
                    dir: dir.clone(),
                    naming: config.extracts.clone(),
                    collect_receivables: e.collect_receivables,
                }) as Box<dyn ExtractSource>
            })
            .collect()
    }
}

impl ExtractSource for DirectorySource {
    fn entity(&self) -> &EntityId { &self.entity }

    fn fetch(&self, request: &AcquisitionRequest) -> Result<EntityExtracts, String> {
        let id = Some(self.entity.as_str());
        let sales = load_directory(&self.dir, &self.naming, ExtractKind::Sales, request.sales, id)
            .map_err(|e| e.to_string())?;
        let receivables = if self.collect_receivables {
            load_directory(&self.dir, &self.naming, ExtractKind::Receivables, request.receivables, id)
                .map_err(|e| e.to_string())?
        } else {
            Vec::new()
        };
        Ok(EntityExtracts { sales, receivables })
    }
}

#[derive(Debug, Default)]
pub struct Acquired {
    pub per_entity: BTreeMap<EntityId, EntityExtracts>,
    pub failures: Vec<AcquisitionError>,
}

impl Acquired {
    /// All rows of one kind, entities in id order, positions renumbered.
    pub fn rows(&self, kind: ExtractKind) -> Vec<SourceRow> {
        let mut out = Vec::new();
        for extracts in self.per_entity.values() {
            let rows = match kind {
                ExtractKind::Sales => &extracts.sales,
                ExtractKind::Receivables => &extracts.receivables,
            };
            out.extend(rows.iter().cloned());
        }
        for (i, row) in out.iter_mut().enumerate() {
            row.position = i;
        }
        out
    }
}

/// Run every source concurrently and wait at most `timeout` overall.
pub fn acquire_all(sources: Vec<Box<dyn ExtractSource>>, request: AcquisitionRequest, timeout: Duration) -> Acquired {
    let (tx, rx) = mpsc::channel();
    let mut pending = BTreeSet::new();

    for source in sources {
        let entity = source.entity().clone();
        pending.insert(entity.clone());
        let tx = tx.clone();
        let spawned = thread::Builder::new().name(format!("acquire-{entity}")).spawn(move || {
            let result = source.fetch(&request);
            // receiver may already have given up on us
            let _ = tx.send((entity, result));
        });
        if let Err(e) = spawned {
            warn!(error = %e, "could not start acquisition worker");
        }
    }
    drop(tx);

    // None: too far out to represent, so wait without a deadline
    let deadline = Instant::now().checked_add(timeout);
    let mut out = Acquired::default();
    while !pending.is_empty() {
        let left = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
        match rx.recv_timeout(left) {
            Ok((entity, result)) => {
                pending.remove(&entity);
                match result {
                    Ok(extracts) => {
                        info!(%entity, sales = extracts.sales.len(), receivables = extracts.receivables.len(), "acquired");
                        out.per_entity.insert(entity, extracts);
                    }
                    Err(msg) => {
                        warn!(%entity, error = %msg, "acquisition failed");
                        out.failures.push(AcquisitionError { entity: entity.to_string(), failure: AcquisitionFailure::Failed(msg) });
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for entity in std::mem::take(&mut pending) {
                    warn!(%entity, "acquisition timed out");
                    out.failures.push(AcquisitionError { entity: entity.to_string(), failure: AcquisitionFailure::TimedOut(timeout) });
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                for entity in std::mem::take(&mut pending) {
                    out.failures.push(AcquisitionError { entity: entity.to_string(), failure: AcquisitionFailure::WorkerLost });
                }
            }
        }
    }
    out
}

/// Receivable rows from each entity's latest extract dated in `window`.
pub fn latest_receivables(rows: &[SourceRow], window: (NaiveDate, NaiveDate)) -> Vec<SourceRow> {
    let mut latest: BTreeMap<&str, NaiveDate> = BTreeMap::new();
    for r in rows {
        let (Some(entity), Some(date)) = (r.entity.as_deref(), r.extracted_on) else { continue };
        if date < window.0 || date > window.1 {
            continue;
        }
        let e = latest.entry(entity).or_insert(date);
        if date > *e {
            *e = date;
        }
    }
    rows.iter()
        .filter(|r| match (r.entity.as_deref(), r.extracted_on) {
            (Some(entity), Some(date)) => latest.get(entity) == Some(&date),
            _ => false,
        })
        .cloned()
        .collect()
}

/// Receivables window for the snapshot's own analysis: the week ending on it.
pub fn current_receivables_window(snapshot: Snapshot) -> (NaiveDate, NaiveDate) {
    (snapshot.date() - Days::days(6), snapshot.date())
}
