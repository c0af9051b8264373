//! Model artifacts: the trained booster persisted together with the exact
//! feature columns it was trained on.

pub mod booster;
pub mod lightgbm;
pub mod metrics;
pub mod search;
pub mod trainer;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;
use crate::types::YearRange;

pub use booster::Booster;
pub use lightgbm::{LightGbmCli, RankerBackend};
pub use search::{BoosterParams, RandomSearch};
pub use trainer::{LabelKind, Trainer, TrainerSettings};

/// Serialized model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub label: LabelKind,
    /// Model input columns, in order
    pub feature_columns: Vec<String>,
    /// LightGBM text model
    pub booster: String,
    pub params: BoosterParams,
    pub validation_score: f64,
    pub train_from: NaiveDate,
    pub train_to: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl ModelArtifact {
    /// Write atomically: a reader never sees a half-written artifact.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Artifact with its booster parsed and ready to score
#[derive(Debug, Clone)]
pub struct LoadedModel {
    artifact: ModelArtifact,
    booster: Booster,
}

impl LoadedModel {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
        Self::from_artifact(artifact)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        let booster = Booster::parse(&artifact.booster)?;
        if booster.num_features() != artifact.feature_columns.len() {
            return Err(PipelineError::ArtifactIncompatible {
                model: artifact.name.clone(),
                detail: format!(
                    "booster has {} features but {} column names are recorded",
                    booster.num_features(),
                    artifact.feature_columns.len()
                ),
            });
        }
        debug!(
            model = %artifact.name,
            objective = booster.objective(),
            trees = booster.num_trees(),
            trained_through = %artifact.train_to,
            "model loaded"
        );
        Ok(Self { artifact, booster })
    }

    pub fn name(&self) -> &str {
        &self.artifact.name
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.artifact.feature_columns
    }

    pub fn label(&self) -> LabelKind {
        self.artifact.label
    }

    /// Calendar years spanned by the training rows
    pub fn trained_years(&self) -> YearRange {
        YearRange {
            start: self.artifact.train_from.year(),
            end: self.artifact.train_to.year(),
        }
    }

    /// Columns must match the recorded list exactly, names and order.
    pub fn ensure_compatible(&self, columns: &[String]) -> Result<()> {
        let expected = &self.artifact.feature_columns;
        if expected.as_slice() == columns {
            return Ok(());
        }

        let missing: Vec<&str> = expected
            .iter()
            .filter(|c| !columns.contains(c))
            .map(String::as_str)
            .collect();
        let unexpected: Vec<&str> = columns
            .iter()
            .filter(|c| !expected.contains(c))
            .map(String::as_str)
            .collect();

        let detail = if !missing.is_empty() || !unexpected.is_empty() {
            format!("missing {:?}, unexpected {:?}", missing, unexpected)
        } else {
            let (pos, (want, got)) = expected
                .iter()
                .zip(columns)
                .enumerate()
                .find(|(_, (a, b))| a != b)
                .map(|(i, (a, b))| (i, (a.as_str(), b.as_str())))
                .unwrap_or((expected.len().min(columns.len()), ("", "")));
            format!(
                "column order differs at position {}: expected '{}', got '{}'",
                pos, want, got
            )
        };

        Err(PipelineError::ArtifactIncompatible {
            model: self.artifact.name.clone(),
            detail,
        })
    }

    /// Raw scores for every row, after the column check
    pub fn score(&self, table: &FeatureTable) -> Result<Vec<f64>> {
        self.ensure_compatible(&table.columns)?;
        self.booster.predict(&table.matrix()?)
    }
}
