//! Error taxonomy for the feature pipeline.
//!
//! Batch runners treat [`PipelineError::SelectionEmpty`] as a skip and every
//! other variant as a failure of the unit of work that raised it.

use thiserror::Error;

use crate::types::YearRange;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no rows selected for {0}")]
    SelectionEmpty(String),

    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("model '{model}' cannot score these features: {detail}")]
    ArtifactIncompatible { model: String, detail: String },

    #[error("rows of race {race} are not contiguous (seen again at row {row})")]
    NonContiguousGroups { race: String, row: usize },

    #[error("train years {train} overlap test years {test}")]
    OverlappingRanges { train: YearRange, test: YearRange },

    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("row {row} ({horse}) has no finishing position to label")]
    MissingLabel { row: usize, horse: String },

    #[error("LightGBM failed: {0}")]
    ExternalLibrary(String),

    #[error("malformed LightGBM model: {0}")]
    ModelFormat(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Report writer error: {0}")]
    Report(#[from] polars::prelude::PolarsError),
}

impl PipelineError {
    /// Whether a batch should record this as "skipped" rather than "failed".
    pub fn is_skip(&self) -> bool {
        matches!(self, PipelineError::SelectionEmpty(_))
    }
}
