//! Configuration for the ranking pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::features::FeatureSchema;
use crate::inference::DEFAULT_CANDIDATE_THRESHOLD;
use crate::model::LabelKind;
use crate::types::{
    DistanceRange, FilterSpec, RaceClassFilter, Surface, VenueFilter, YearRange,
};

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/keiba.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Output and definition file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,
    #[serde(default = "default_model_definitions")]
    pub model_definitions: String,
    #[serde(default = "default_progress_file")]
    pub progress_file: String,
}

fn default_models_dir() -> String {
    "models".to_string()
}

fn default_reports_dir() -> String {
    "reports".to_string()
}

fn default_model_definitions() -> String {
    "model_configs.json".to_string()
}

fn default_progress_file() -> String {
    "reports/walk_forward_progress.json".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            reports_dir: default_reports_dir(),
            model_definitions: default_model_definitions(),
            progress_file: default_progress_file(),
        }
    }
}

impl PathsConfig {
    pub fn model_path(&self, model_filename: &str) -> PathBuf {
        Path::new(&self.models_dir).join(model_filename)
    }
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_trials")]
    pub trials: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_ndcg_at")]
    pub ndcg_at: usize,
    #[serde(default = "default_early_stopping_rounds")]
    pub early_stopping_rounds: u32,
    /// Falls back to `LIGHTGBM_BIN`, then `lightgbm` on `PATH`
    #[serde(default)]
    pub lightgbm_executable: Option<String>,
    #[serde(default = "default_longshot_min_popularity")]
    pub longshot_min_popularity: u8,
    /// Probability at which a long-shot model flags a candidate
    #[serde(default = "default_longshot_threshold")]
    pub longshot_threshold: f64,
    #[serde(default = "default_year_start")]
    pub year_start: i32,
    #[serde(default = "default_year_end")]
    pub year_end: i32,
}

fn default_trials() -> usize {
    50
}

fn default_seed() -> u64 {
    42
}

fn default_validation_fraction() -> f64 {
    0.25
}

fn default_ndcg_at() -> usize {
    10
}

fn default_early_stopping_rounds() -> u32 {
    30
}

fn default_longshot_min_popularity() -> u8 {
    7
}

fn default_longshot_threshold() -> f64 {
    DEFAULT_CANDIDATE_THRESHOLD
}

fn default_year_start() -> i32 {
    2013
}

fn default_year_end() -> i32 {
    2022
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            seed: default_seed(),
            validation_fraction: default_validation_fraction(),
            ndcg_at: default_ndcg_at(),
            early_stopping_rounds: default_early_stopping_rounds(),
            lightgbm_executable: None,
            longshot_min_popularity: default_longshot_min_popularity(),
            longshot_threshold: default_longshot_threshold(),
            year_start: default_year_start(),
            year_end: default_year_end(),
        }
    }
}

impl TrainingConfig {
    pub fn years(&self) -> Result<YearRange> {
        YearRange::new(self.year_start, self.year_end)
    }
}

/// Walk-forward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    #[serde(default = "default_train_years")]
    pub train_years: i32,
    #[serde(default = "default_test_years")]
    pub test_years: Vec<i32>,
}

fn default_train_years() -> i32 {
    3
}

fn default_test_years() -> Vec<i32> {
    vec![2022, 2023, 2024]
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_years: default_train_years(),
            test_years: default_test_years(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub walk_forward: WalkForwardConfig,
}

impl AppConfig {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("keiba").required(false))
            // Override with environment variables (KEIBA_TRAINING__SEED, etc.)
            .add_source(
                config::Environment::with_prefix("KEIBA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// One named model: which races it is trained on and where it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(alias = "track_code")]
    pub venue: String,
    #[serde(alias = "kyoso_shubetsu_code", default)]
    pub race_class: String,
    #[serde(alias = "surface_type")]
    pub surface: String,
    pub min_distance: i64,
    pub max_distance: i64,
    pub model_filename: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub exclude_features: Vec<String>,
}

impl ModelDefinition {
    /// Artifact name without extension
    pub fn name(&self) -> &str {
        self.model_filename
            .rsplit_once('.')
            .map_or(self.model_filename.as_str(), |(stem, _)| stem)
    }

    /// Artifact file for a label. Long-shot classifiers get a `_longshot`
    /// suffix so they never overwrite the ranker.
    pub fn artifact_filename(&self, label: LabelKind) -> String {
        match label {
            LabelKind::Relevance => self.model_filename.clone(),
            LabelKind::LongShotTopThree { .. } => match self.model_filename.rsplit_once('.') {
                Some((stem, ext)) => format!("{}_longshot.{}", stem, ext),
                None => format!("{}_longshot", self.model_filename),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.filter(YearRange::single(2000), false)?;
        self.schema()?;
        Ok(())
    }

    /// Feature schema with this model's exclusions applied
    pub fn schema(&self) -> Result<FeatureSchema> {
        FeatureSchema::standard().without(&self.exclude_features)
    }

    /// Filter specification for the given years
    pub fn filter(&self, years: YearRange, include_payouts: bool) -> Result<FilterSpec> {
        if self.min_distance < 0 || self.max_distance < 0 {
            return Err(PipelineError::InvalidFilter(format!(
                "{}: distances must be non-negative",
                self.model_filename
            )));
        }
        let to_u32 = |d: i64| {
            u32::try_from(d).map_err(|_| {
                PipelineError::InvalidFilter(format!("{}: distance {} out of range", self.model_filename, d))
            })
        };
        Ok(FilterSpec {
            venue: self.venue.parse::<VenueFilter>()?,
            years,
            surface: self.surface.parse::<Surface>()?,
            distance: DistanceRange::new(to_u32(self.min_distance)?, to_u32(self.max_distance)?)?,
            race_class: self.race_class.parse::<RaceClassFilter>()?,
            include_payouts,
        })
    }
}

/// Contents of the model definition file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDefinitions {
    #[serde(default)]
    pub standard_models: Vec<ModelDefinition>,
    #[serde(default)]
    pub custom_models: Vec<ModelDefinition>,
}

impl ModelDefinitions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let defs: ModelDefinitions = serde_json::from_slice(&bytes)?;
        for def in defs.standard_models.iter().chain(&defs.custom_models) {
            def.validate()?;
        }
        Ok(defs)
    }

    /// Standard or custom definitions, optionally restricted to `only`
    /// (matched against the artifact name or file name).
    pub fn select(&self, custom: bool, only: &[String]) -> Vec<&ModelDefinition> {
        let pool = if custom {
            &self.custom_models
        } else {
            &self.standard_models
        };
        pool.iter()
            .filter(|d| {
                only.is_empty()
                    || only
                        .iter()
                        .any(|o| o == d.name() || *o == d.model_filename)
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&ModelDefinition> {
        self.standard_models
            .iter()
            .chain(&self.custom_models)
            .find(|d| d.name() == name || d.model_filename == name)
    }
}
