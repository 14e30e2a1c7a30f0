use crate::error::ConfigError;
use crate::model::EntityId;
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::{Path, PathBuf}};

pub const MAX_LOOKBACK_PERIODS: u8 = 24;
/// One day.
pub const MAX_ACQUISITION_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub collect_receivables: bool,
    #[serde(default)]
    pub default_category: Option<String>, // None => category comes from the extract
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local raw extracts read by analyze-only runs.
    pub raw_dir: PathBuf,
    /// Drop directory acquisition workers read from in full runs.
    pub acquisition_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub report_dir: PathBuf,
    pub template: PathBuf,
    pub mapping: PathBuf,
    pub history: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: "data/raw".into(),
            acquisition_dir: "data/inbox".into(),
            processed_dir: "data/processed".into(),
            report_dir: "data/report".into(),
            template: "templates/weekly_report.template.json".into(),
            mapping: "templates/weekly_report.mapping.json".into(),
            history: "data/processed/aging_history.jsonl".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractNaming {
    pub sales_prefix: String,
    pub receivables_prefix: String,
}

impl Default for ExtractNaming {
    fn default() -> Self {
        Self { sales_prefix: "sales_".into(), receivables_prefix: "receivables_".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgingConfig {
    /// Inclusive upper bounds of the closed buckets; one open bucket follows.
    pub bucket_upper_bounds: Vec<u32>,
    pub default_term_days: u32,
    pub customer_terms: BTreeMap<String, u32>,
    pub top_k: usize,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            bucket_upper_bounds: vec![30, 60, 90],
            default_term_days: 60,
            customer_terms: BTreeMap::new(),
            top_k: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub file_prefix: String,
    pub analysis_prefix: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { file_prefix: "weekly_report".into(), analysis_prefix: "receivables_analysis".into() }
    }
}

/// The single configuration value threaded through a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub entities: Vec<EntityConfig>,
    pub paths: PathsConfig,
    pub extracts: ExtractNaming,
    pub aging: AgingConfig,
    pub report: ReportConfig,
    pub category_mappings: BTreeMap<String, String>,
    pub lookback_periods: u8,
    pub acquisition_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entities: vec![
                EntityConfig { id: "DND".into(), collect_receivables: true, default_category: None },
                EntityConfig { id: "DNI".into(), collect_receivables: true, default_category: Some("구동기".into()) },
                EntityConfig { id: "FLK".into(), collect_receivables: false, default_category: Some("무역".into()) },
            ],
            paths: PathsConfig::default(),
            extracts: ExtractNaming::default(),
            aging: AgingConfig::default(),
            report: ReportConfig::default(),
            category_mappings: BTreeMap::from([("수출".to_string(), "무역".to_string())]),
            lookback_periods: 12,
            acquisition_timeout_secs: 120,
        }
    }
}

fn default_true() -> bool { true }

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::Invalid("at least one entity is required".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for e in &self.entities {
            let id = e.id.trim();
            if id.is_empty() || id == crate::model::CONSOLIDATED_TOKEN {
                return Err(ConfigError::Invalid(format!("entity id `{}` is reserved or empty", e.id)));
            }
            if !seen.insert(id.to_string()) {
                return Err(ConfigError::Invalid(format!("entity `{id}` is listed twice")));
            }
        }
        if !(1..=MAX_LOOKBACK_PERIODS).contains(&self.lookback_periods) {
            return Err(ConfigError::Invalid(format!(
                "lookback_periods must be 1..={MAX_LOOKBACK_PERIODS}, got {}",
                self.lookback_periods
            )));
        }
        let bounds = &self.aging.bucket_upper_bounds;
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid("bucket_upper_bounds must be strictly increasing".into()));
        }
        if self.aging.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be positive".into()));
        }
        if !(1..=MAX_ACQUISITION_TIMEOUT_SECS).contains(&self.acquisition_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "acquisition_timeout_secs must be 1..={MAX_ACQUISITION_TIMEOUT_SECS}, got {}",
                self.acquisition_timeout_secs
            )));
        }
        if self.extracts.sales_prefix == self.extracts.receivables_prefix {
            return Err(ConfigError::Invalid("sales and receivables prefixes must differ".into()));
        }
        Ok(())
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| EntityId::new(e.id.trim())).collect()
    }

    /// Entities whose receivables are analysed.
    pub fn receivable_entity_ids(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|e| e.collect_receivables)
            .map(|e| EntityId::new(e.id.trim()))
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let cfg: PipelineConfig = serde_json::from_str(&text)?;
    cfg.validate()?;
    Ok(cfg)
}
