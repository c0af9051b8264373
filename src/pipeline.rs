//! Per-model units of work: assemble, train, evaluate, predict.
//!
//! Every entry point goes through the same builder and assembler, so a
//! model is always scored on columns computed exactly as in training.

use chrono::Datelike;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{AppConfig, ModelDefinition};
use crate::error::{PipelineError, Result};
use crate::features::{FeatureAssembler, FeatureTable};
use crate::inference::{EvaluationSummary, InferenceAdapter};
use crate::model::{
    LabelKind, LoadedModel, ModelArtifact, RandomSearch, RankerBackend, Trainer, TrainerSettings,
};
use crate::query::QueryBuilder;
use crate::report::{report_path, write_report};
use crate::split::{split, SplitPolicy};
use crate::storage::RaceRepository;
use crate::types::{Source, YearRange};

pub struct Pipeline<'a> {
    config: &'a AppConfig,
    repo: RaceRepository,
    builder: QueryBuilder,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a AppConfig, repo: RaceRepository) -> Self {
        Self {
            config,
            repo,
            builder: QueryBuilder::default(),
        }
    }

    pub fn label(&self, longshot: bool) -> LabelKind {
        if longshot {
            LabelKind::LongShotTopThree {
                min_popularity: self.config.training.longshot_min_popularity,
            }
        } else {
            LabelKind::Relevance
        }
    }

    /// Feature table for one model over `years`. An empty selection is
    /// returned as [`PipelineError::SelectionEmpty`] so batches can skip it.
    pub fn assemble(
        &self,
        def: &ModelDefinition,
        years: YearRange,
        source: Source,
        include_payouts: bool,
    ) -> Result<FeatureTable> {
        let filter = def.filter(years, include_payouts)?;
        let query = self.builder.build(&filter, source)?;
        let rows = self.repo.fetch(&query)?;
        info!(
            model = def.name(),
            source = source.as_str(),
            %filter,
            rows = rows.len(),
            "query complete"
        );
        if rows.is_empty() {
            return Err(PipelineError::SelectionEmpty(format!(
                "{} ({}, {})",
                def.name(),
                source.as_str(),
                filter
            )));
        }
        FeatureAssembler::new(def.schema()?).assemble(&rows, &filter, source)
    }

    /// Train on `years` and write the artifact to `artifact_path`.
    pub fn train<B: RankerBackend>(
        &self,
        backend: &B,
        def: &ModelDefinition,
        years: YearRange,
        label: LabelKind,
        artifact_path: &Path,
    ) -> Result<ModelArtifact> {
        let table = self.assemble(def, years, Source::Historical, false)?;
        let training = &self.config.training;
        let trainer = Trainer::new(
            backend,
            RandomSearch {
                trials: training.trials,
                seed: training.seed,
            },
            TrainerSettings {
                validation_fraction: training.validation_fraction,
                eval_at: training.ndcg_at,
                early_stopping_rounds: training.early_stopping_rounds,
                seed: training.seed,
            },
        );
        let artifact = trainer.train(def.name(), &table, label)?;
        artifact.save(artifact_path)?;
        info!(
            model = def.name(),
            path = %artifact_path.display(),
            score = artifact.validation_score,
            "model saved"
        );
        Ok(artifact)
    }

    fn adapter<'m>(&self, model: &'m LoadedModel) -> InferenceAdapter<'m> {
        InferenceAdapter::new(model).with_candidate_threshold(self.config.training.longshot_threshold)
    }

    /// Score held-out historical races and write the ranking report.
    /// `years` must not overlap the years the model was trained on.
    pub fn evaluate(
        &self,
        def: &ModelDefinition,
        model: &LoadedModel,
        years: YearRange,
        report: &Path,
    ) -> Result<EvaluationSummary> {
        let table = self.assemble(def, years, Source::Historical, true)?;
        let held_out = split(
            &table,
            SplitPolicy::YearRanges {
                train: model.trained_years(),
                test: years,
            },
        )?
        .test;
        let ranked = self.adapter(model).rank(&held_out)?;
        write_report(report, &ranked)?;
        Ok(EvaluationSummary::from_ranked(
            &ranked,
            model.label(),
            self.config.training.ndcg_at,
        ))
    }

    /// Rank every speculative race the model covers and write the report.
    /// Returns the report path and the number of races ranked.
    pub fn predict(&self, def: &ModelDefinition, model: &LoadedModel) -> Result<(PathBuf, usize)> {
        let (first, last) = self
            .repo
            .date_span(Source::Speculative)?
            .ok_or_else(|| PipelineError::SelectionEmpty("speculative races".to_string()))?;
        let years = YearRange::new(first.year(), last.year())?;
        let table = self.assemble(def, years, Source::Speculative, false)?;
        let ranked = self.adapter(model).rank(&table)?;

        let path = report_path(
            Path::new(&self.config.paths.reports_dir),
            &def.artifact_filename(model.label()),
            "predict",
            &last.format("%Y%m%d").to_string(),
        );
        write_report(&path, &ranked)?;
        Ok((path, table.race_groups().len()))
    }
}
