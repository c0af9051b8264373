//! Model trainer: labels, group checks and the search loop.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use super::booster::Booster;
use super::lightgbm::{FitRequest, Objective, RankerBackend, TrainingSet};
use super::metrics::{auc, ndcg_at};
use super::search::ParamSearch;
use super::ModelArtifact;
use crate::error::{PipelineError, Result};
use crate::features::{FeatureRow, FeatureTable};
use crate::split::{split, SplitPolicy};

/// Largest field size; relevance is `19 - finish`, floored at zero
const MAX_RELEVANCE: i32 = 18;

/// What the model learns to predict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelKind {
    /// Graded relevance from finishing position, ranked within each race
    Relevance,
    /// 1 when a runner at or beyond `min_popularity` finishes in the top three
    LongShotTopThree { min_popularity: u8 },
}

impl LabelKind {
    pub fn objective(&self) -> Objective {
        match self {
            LabelKind::Relevance => Objective::Ranking,
            LabelKind::LongShotTopThree { .. } => Objective::Binary,
        }
    }

    /// Target value for a runner that finished in `finish`
    pub fn target(&self, finish: u8, popularity: Option<u8>) -> f64 {
        let finish = finish as i32;
        match self {
            LabelKind::Relevance => (MAX_RELEVANCE + 1 - finish).clamp(0, MAX_RELEVANCE) as f64,
            LabelKind::LongShotTopThree { min_popularity } => {
                let long_shot = popularity.map_or(false, |p| p >= *min_popularity);
                if long_shot && finish <= 3 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn label(&self, row: &FeatureRow, index: usize) -> Result<f64> {
        let finish = row.finish_position.ok_or_else(|| PipelineError::MissingLabel {
            row: index,
            horse: row.horse_id.clone(),
        })?;
        Ok(self.target(finish, row.popularity))
    }
}

/// Sizes of consecutive race groups; fails if a race reappears after
/// another race has started.
pub fn check_contiguous_groups(table: &FeatureTable) -> Result<Vec<usize>> {
    let runs = table.race_runs();
    let mut seen = HashSet::with_capacity(runs.len());
    for run in &runs {
        let key = &table.rows[run.start].key;
        if !seen.insert(key) {
            return Err(PipelineError::NonContiguousGroups {
                race: key.to_string(),
                row: run.start,
            });
        }
    }
    Ok(runs.iter().map(|r| r.len()).collect())
}

fn training_set(table: &FeatureTable, label: LabelKind) -> Result<TrainingSet> {
    let groups = check_contiguous_groups(table)?;
    let labels = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| label.label(row, i))
        .collect::<Result<Vec<_>>>()?;
    Ok(TrainingSet {
        features: table.matrix()?,
        labels,
        groups,
    })
}

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    /// Share of the latest dates held out for the search objective
    pub validation_fraction: f64,
    pub eval_at: usize,
    pub early_stopping_rounds: u32,
    pub seed: u64,
}

pub struct Trainer<B, S> {
    backend: B,
    search: S,
    settings: TrainerSettings,
}

impl<B: RankerBackend, S: ParamSearch> Trainer<B, S> {
    pub fn new(backend: B, search: S, settings: TrainerSettings) -> Self {
        Self {
            backend,
            search,
            settings,
        }
    }

    /// Run the search on `table` and keep the best-scoring trial.
    ///
    /// Runners without a result (scratched, did not finish) are left out.
    /// Trials are scored on the latest dates of `table`; ties keep the
    /// earlier trial, so the result depends only on the data and the seed.
    pub fn train(&self, name: &str, table: &FeatureTable, label: LabelKind) -> Result<ModelArtifact> {
        let finished: Vec<FeatureRow> = table
            .rows
            .iter()
            .filter(|r| r.finish_position.is_some())
            .cloned()
            .collect();
        let without_result = table.len() - finished.len();
        if without_result > 0 {
            debug!(model = name, without_result, "runners without a result left out");
        }
        let table = &table.with_rows(finished);
        if table.is_empty() {
            return Err(PipelineError::SelectionEmpty(name.to_string()));
        }
        check_contiguous_groups(table)?;

        let parts = split(
            table,
            SplitPolicy::DateFraction(1.0 - self.settings.validation_fraction),
        )?;
        let train = training_set(&parts.train, label)?;
        let valid = training_set(&parts.test, label)?;
        let valid_matrix = &valid.features;

        let objective = label.objective();
        let candidates = self.search.candidates();
        info!(
            model = name,
            train_rows = train.labels.len(),
            valid_rows = valid.labels.len(),
            trials = candidates.len(),
            "starting hyperparameter search"
        );

        let mut best: Option<(f64, usize, String)> = None;
        for (trial, params) in candidates.iter().enumerate() {
            let text = self.backend.fit(&FitRequest {
                objective,
                params,
                train: &train,
                valid: &valid,
                seed: self.settings.seed,
                eval_at: self.settings.eval_at,
                early_stopping_rounds: self.settings.early_stopping_rounds,
            })?;
            let scores = Booster::parse(&text)?.predict(valid_matrix)?;
            let score = match objective {
                Objective::Ranking => {
                    ndcg_at(&scores, &valid.labels, &valid.groups, self.settings.eval_at)
                }
                Objective::Binary => auc(&scores, &valid.labels),
            };
            info!(model = name, trial, score, "trial complete");

            if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                best = Some((score, trial, text));
            }
        }

        let (score, trial, booster) = best.ok_or_else(|| {
            PipelineError::ExternalLibrary("search produced no candidate parameters".to_string())
        })?;
        let dates = table.dates();
        info!(model = name, trial, score, "best trial selected");

        Ok(ModelArtifact {
            name: name.to_string(),
            label,
            feature_columns: table.columns.clone(),
            booster,
            params: candidates[trial].clone(),
            validation_score: score,
            train_from: dates[0],
            train_to: dates[dates.len() - 1],
            created_at: Utc::now(),
        })
    }
}
