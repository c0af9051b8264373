//! Batch runs over many models: per-unit outcomes, summaries and
//! walk-forward progress.
//!
//! A failing unit never aborts its siblings. Empty selections are recorded
//! as skips, everything else that goes wrong as a failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::{AppConfig, ModelDefinition};
use crate::error::{PipelineError, Result};
use crate::model::{LabelKind, LoadedModel, RankerBackend};
use crate::pipeline::Pipeline;
use crate::report::report_path;
use crate::types::YearRange;

/// Result of one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded { detail: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl UnitOutcome {
    pub fn from_result(result: Result<String>) -> Self {
        match result {
            Ok(detail) => UnitOutcome::Succeeded { detail },
            Err(e) if e.is_skip() => UnitOutcome::Skipped {
                reason: format!("no data: {}", e),
            },
            Err(e) => UnitOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Succeeded { .. } => "ok",
            UnitOutcome::Skipped { .. } => "skipped",
            UnitOutcome::Failed { .. } => "FAILED",
        }
    }

    fn message(&self) -> &str {
        match self {
            UnitOutcome::Succeeded { detail } => detail,
            UnitOutcome::Skipped { reason } => reason,
            UnitOutcome::Failed { error } => error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Succeeded => "succeeded",
            BatchStatus::PartiallyFailed => "partially failed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == BatchStatus::Succeeded
    }
}

/// Every unit of a batch with its outcome, in execution order
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    units: Vec<(String, UnitOutcome)>,
}

impl BatchSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, unit: impl Into<String>, outcome: UnitOutcome) {
        let unit = unit.into();
        match &outcome {
            UnitOutcome::Succeeded { detail } => info!(unit = %unit, %detail, "unit succeeded"),
            UnitOutcome::Skipped { reason } => warn!(unit = %unit, %reason, "unit skipped"),
            UnitOutcome::Failed { error } => error!(unit = %unit, %error, "unit failed"),
        }
        self.units.push((unit, outcome));
    }

    /// Run `work` as a unit and record how it ended.
    pub fn run<F>(&mut self, unit: &str, work: F) -> &UnitOutcome
    where
        F: FnOnce() -> Result<String>,
    {
        info!(unit, "unit started");
        self.record(unit, UnitOutcome::from_result(work()));
        &self.units[self.units.len() - 1].1
    }

    pub fn count(&self, label: &str) -> usize {
        self.units.iter().filter(|(_, o)| o.label() == label).count()
    }

    /// Skips never fail a batch; any failure does.
    pub fn status(&self) -> BatchStatus {
        let failed = self.count("FAILED");
        if failed == 0 {
            BatchStatus::Succeeded
        } else if failed == self.units.len() {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyFailed
        }
    }

    pub fn print(&self, title: &str) {
        println!("=== {} ===", title);
        println!();
        println!("  {:40} {:>8}  {}", "Unit", "Outcome", "Detail");
        println!("  {}", "-".repeat(78));
        for (unit, outcome) in &self.units {
            println!("  {:40} {:>8}  {}", unit, outcome.label(), outcome.message());
        }
        println!();
        println!(
            "  Succeeded: {}  Skipped: {}  Failed: {}  Status: {}",
            self.count("ok"),
            self.count("skipped"),
            self.count("FAILED"),
            self.status().as_str()
        );
    }
}

/// Completed walk-forward units, persisted between runs
#[derive(Debug)]
pub struct ProgressFile {
    path: PathBuf,
    completed: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct ProgressState {
    completed: BTreeSet<String>,
}

impl ProgressFile {
    /// Load existing progress; a missing file means nothing is done yet.
    pub fn load(path: &Path) -> Result<Self> {
        let completed = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<ProgressState>(&bytes)?.completed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            completed,
        })
    }

    /// Empty progress that will overwrite whatever is at `path`
    pub fn fresh(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            completed: BTreeSet::new(),
        }
    }

    pub fn is_done(&self, unit: &str) -> bool {
        self.completed.contains(unit)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    /// Record `unit` and rewrite the file (temp file + rename).
    pub fn mark_done(&mut self, unit: &str) -> Result<()> {
        self.completed.insert(unit.to_string());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let state = ProgressState {
            completed: self.completed.clone(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// One model trained on the years before `test` and evaluated on `test`
#[derive(Debug, Clone)]
pub struct WalkForwardUnit<'d> {
    pub def: &'d ModelDefinition,
    pub train: YearRange,
    pub test: YearRange,
}

impl WalkForwardUnit<'_> {
    pub fn id(&self) -> String {
        format!("{}:{}", self.def.name(), self.test)
    }
}

/// Units for every definition and test year: train on
/// `[year - train_years, year - 1]`, test on `[year, year]`.
pub fn walk_forward_units<'d>(
    defs: &[&'d ModelDefinition],
    test_years: &[i32],
    train_years: i32,
) -> Result<Vec<WalkForwardUnit<'d>>> {
    if train_years < 1 {
        return Err(PipelineError::InvalidSplit(format!(
            "walk-forward needs at least one training year, got {}",
            train_years
        )));
    }
    let mut units = Vec::with_capacity(defs.len() * test_years.len());
    for &def in defs {
        for &year in test_years {
            units.push(WalkForwardUnit {
                def,
                train: YearRange::new(year - train_years, year - 1)?,
                test: YearRange::single(year),
            });
        }
    }
    Ok(units)
}

/// Run walk-forward units in order, skipping those already in `progress`.
pub fn run_walk_forward<B: RankerBackend>(
    pipeline: &Pipeline<'_>,
    backend: &B,
    config: &AppConfig,
    units: &[WalkForwardUnit<'_>],
    progress: &mut ProgressFile,
    label: LabelKind,
) -> BatchSummary {
    let mut summary = BatchSummary::new();
    let models_dir = Path::new(&config.paths.models_dir).join("walk_forward");
    let reports_dir = Path::new(&config.paths.reports_dir);

    for unit in units {
        let id = unit.id();
        if progress.is_done(&id) {
            summary.record(
                id,
                UnitOutcome::Skipped {
                    reason: "completed in an earlier run".to_string(),
                },
            );
            continue;
        }

        let outcome = summary.run(&id, || {
            let filename = unit.def.artifact_filename(label);
            let artifact_path = models_dir.join(unit.test.start.to_string()).join(&filename);
            let artifact = pipeline.train(backend, unit.def, unit.train, label, &artifact_path)?;
            let model = LoadedModel::from_artifact(artifact)?;
            let report = report_path(
                reports_dir,
                &filename,
                "walkforward",
                &unit.test.start.to_string(),
            );
            let eval = pipeline.evaluate(unit.def, &model, unit.test, &report)?;
            Ok(format!("train {} test {}: {}", unit.train, unit.test, eval))
        });

        if !matches!(outcome, UnitOutcome::Failed { .. }) {
            if let Err(e) = progress.mark_done(&id) {
                warn!(unit = %id, error = %e, "could not save walk-forward progress");
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::trainer::tests::StubBackend;
    use crate::storage::fixtures::{race, seed_payout, seed_race};
    use crate::storage::RaceRepository;
    use crate::types::{Source, Surface};

    fn skipped() -> UnitOutcome {
        UnitOutcome::Skipped {
            reason: "no data".to_string(),
        }
    }

    fn failed() -> UnitOutcome {
        UnitOutcome::Failed {
            error: "boom".to_string(),
        }
    }

    fn ok() -> UnitOutcome {
        UnitOutcome::Succeeded {
            detail: "done".to_string(),
        }
    }

    #[test]
    fn test_outcome_mapping() {
        let skip = UnitOutcome::from_result(Err(PipelineError::SelectionEmpty("m".into())));
        assert!(matches!(skip, UnitOutcome::Skipped { ref reason } if reason.starts_with("no data")));

        let fail = UnitOutcome::from_result(Err(PipelineError::ExternalLibrary("x".into())));
        assert!(matches!(fail, UnitOutcome::Failed { .. }));

        assert_eq!(UnitOutcome::from_result(Ok("fine".into())), UnitOutcome::Succeeded {
            detail: "fine".into()
        });
    }

    #[test]
    fn test_batch_status() {
        let mut summary = BatchSummary::new();
        assert_eq!(summary.status(), BatchStatus::Succeeded);

        summary.record("a", ok());
        summary.record("b", skipped());
        assert_eq!(summary.status(), BatchStatus::Succeeded);

        summary.record("c", failed());
        assert_eq!(summary.status(), BatchStatus::PartiallyFailed);
        assert_eq!(summary.count("skipped"), 1);

        let mut all_failed = BatchSummary::new();
        all_failed.record("a", failed());
        all_failed.record("b", failed());
        assert_eq!(all_failed.status(), BatchStatus::Failed);
    }

    #[test]
    fn test_failure_does_not_stop_later_units() {
        let mut summary = BatchSummary::new();
        summary.run("first", || Err(PipelineError::ExternalLibrary("crash".into())));
        summary.run("second", || Ok("trained".into()));
        assert_eq!(summary.units.len(), 2);
        assert_eq!(summary.units[1].1, UnitOutcome::Succeeded {
            detail: "trained".into()
        });
        assert_eq!(summary.status(), BatchStatus::PartiallyFailed);
    }

    #[test]
    fn test_progress_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("progress.json");

        let mut progress = ProgressFile::load(&path).unwrap();
        assert_eq!(progress.len(), 0);
        progress.mark_done("a:2022").unwrap();
        progress.mark_done("b:2022").unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = ProgressFile::load(&path).unwrap();
        assert!(reloaded.is_done("a:2022"));
        assert!(reloaded.is_done("b:2022"));
        assert!(!reloaded.is_done("a:2023"));

        assert_eq!(ProgressFile::fresh(&path).len(), 0);
    }

    #[test]
    fn test_walk_forward_units() {
        let def = ModelDefinition {
            venue: "05".to_string(),
            race_class: "any".to_string(),
            surface: "turf".to_string(),
            min_distance: 1400,
            max_distance: 1800,
            model_filename: "tokyo_turf_mile.json".to_string(),
            description: None,
            exclude_features: Vec::new(),
        };
        let units = walk_forward_units(&[&def], &[2022, 2023], 3).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].train, YearRange::new(2019, 2021).unwrap());
        assert_eq!(units[1].test, YearRange::single(2023));
        assert!(units.iter().all(|u| !u.train.overlaps(&u.test)));
        assert_eq!(units[0].id(), "tokyo_turf_mile:2022");

        assert!(walk_forward_units(&[&def], &[2022], 0).is_err());
    }

    fn walk_forward_config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.models_dir = dir.join("models").display().to_string();
        config.paths.reports_dir = dir.join("reports").display().to_string();
        config.training.trials = 2;
        config
    }

    fn two_seasons() -> RaceRepository {
        let repo = RaceRepository::in_memory().unwrap();
        for year in [2021, 2022] {
            for month in 1..=4 {
                let r = seed_race(
                    &repo,
                    race("05", &format!("{}-{:02}-10", year, month), 11, Surface::Turf, 1600),
                    &[("A", 1), ("B", 2), ("C", 3)],
                    Source::Historical,
                );
                seed_payout(&repo, &r.key);
            }
        }
        repo
    }

    fn mile() -> ModelDefinition {
        ModelDefinition {
            venue: "05".to_string(),
            race_class: "any".to_string(),
            surface: "turf".to_string(),
            min_distance: 1400,
            max_distance: 1800,
            model_filename: "tokyo_turf_mile.json".to_string(),
            description: None,
            exclude_features: Vec::new(),
        }
    }

    #[test]
    fn test_run_walk_forward_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let config = walk_forward_config(dir.path());
        let pipeline = Pipeline::new(&config, two_seasons());
        let backend = StubBackend::new(24);
        let def = mile();
        // 2021 has no earlier data to train on
        let units = walk_forward_units(&[&def], &[2021, 2022], 1).unwrap();
        let progress_path = dir.path().join("progress.json");

        let mut progress = ProgressFile::load(&progress_path).unwrap();
        let summary = run_walk_forward(
            &pipeline,
            &backend,
            &config,
            &units,
            &mut progress,
            LabelKind::Relevance,
        );
        assert_eq!(summary.count("skipped"), 1);
        assert_eq!(summary.count("ok"), 1);
        assert_eq!(summary.status(), BatchStatus::Succeeded);
        assert!(dir
            .path()
            .join("reports")
            .join("tokyo_turf_mile_walkforward_2022.tsv")
            .exists());

        let mut progress = ProgressFile::load(&progress_path).unwrap();
        assert_eq!(progress.len(), 2);
        let rerun = run_walk_forward(
            &pipeline,
            &backend,
            &config,
            &units,
            &mut progress,
            LabelKind::Relevance,
        );
        assert!(rerun
            .units
            .iter()
            .all(|(_, o)| *o == UnitOutcome::Skipped {
                reason: "completed in an earlier run".to_string()
            }));
    }

    #[test]
    fn test_longshot_walk_forward_keeps_ranker_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = walk_forward_config(dir.path());
        let pipeline = Pipeline::new(&config, two_seasons());
        let def = mile();
        let units = walk_forward_units(&[&def], &[2022], 1).unwrap();
        let mut progress = ProgressFile::load(&dir.path().join("progress.json")).unwrap();

        let summary = run_walk_forward(
            &pipeline,
            &StubBackend::new(24),
            &config,
            &units,
            &mut progress,
            LabelKind::LongShotTopThree { min_popularity: 2 },
        );
        assert_eq!(summary.count("ok"), 1);
        let (_, outcome) = &summary.units[0];
        assert!(outcome.message().contains("auc"));

        let artifacts = dir.path().join("models").join("walk_forward").join("2022");
        assert!(artifacts.join("tokyo_turf_mile_longshot.json").exists());
        assert!(!artifacts.join("tokyo_turf_mile.json").exists());
        assert!(dir
            .path()
            .join("reports")
            .join("tokyo_turf_mile_longshot_walkforward_2022.tsv")
            .exists());
    }
}
