//! Weekly sales and receivables reporting.
//!
//! Raw per-entity extracts are normalized into canonical records, rolled up
//! into weekly and monthly sales totals, and aged as of a Friday snapshot.
//! The results are written into a versioned report template through a
//! narrow region writer that renders to a scratch file, verifies it, and
//! only then replaces the target.
//!
//! Stages, leaves first: [`extract`] → [`normalize`] → [`aggregate`] /
//! [`aging`] (with [`history`] for last week's totals) → [`synth`] (driven
//! by [`template`] and [`mapping`]). [`pipeline`] sequences them.

pub mod acquire;
pub mod aggregate;
pub mod aging;
pub mod artifact;
pub mod config;
pub mod error;
pub mod extract;
pub mod history;
pub mod mapping;
pub mod model;
pub mod normalize;
pub mod period;
pub mod pipeline;
pub mod synth;
pub mod template;

pub use aging::{AgingPolicy, AgingResult, BucketSet, Comparison, PercentChange, analyze};
pub use config::{PipelineConfig, load_config};
pub use error::{PipelineError, RunWarning};
pub use model::{CanonicalRecord, EntityId, EntityScope, SourceRow};
pub use period::{Granularity, Snapshot};
pub use pipeline::{RunMode, RunRequest, RunSummary, run, run_with};
