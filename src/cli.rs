//! CLI commands for keiba-rank.
//!
//! Every command loads [`AppConfig`] once and passes it down explicitly.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::batch::{run_walk_forward, walk_forward_units, BatchSummary, ProgressFile, UnitOutcome};
use crate::config::{AppConfig, ModelDefinition, ModelDefinitions};
use crate::features::FeatureSchema;
use crate::model::{LabelKind, LightGbmCli, LoadedModel};
use crate::pipeline::Pipeline;
use crate::query::QueryBuilder;
use crate::report::report_path;
use crate::storage::{RaceRepository, RecordBatch};
use crate::types::{Source, YearRange};

#[derive(Parser)]
#[command(name = "keiba-rank")]
#[command(version, about = "Keiba ranking: leakage-free race features, LightGBM ranking models and reports", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database schema and show table sizes
    InitDb,

    /// Load race, runner and payout records from a JSON batch file
    Import {
        /// JSON file with `races`, `runners` and `payouts` arrays
        file: PathBuf,

        /// Load into the pre-result tables
        #[arg(long)]
        speculative: bool,
    },

    /// List feature columns and their fill values
    Features {
        /// Apply this model's exclusions
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Print the feature query built for a model definition
    Query {
        /// Model name or file name
        #[arg(short, long)]
        model: String,

        /// Build the pre-result variant
        #[arg(long)]
        speculative: bool,

        /// Single year to select (defaults to the configured training years)
        #[arg(long)]
        year: Option<i32>,
    },

    /// Train models over the configured training years
    Train {
        /// Use the custom model definitions
        #[arg(long)]
        custom: bool,

        /// Restrict to these models
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Train the long-shot top-three classifier instead of the ranker
        #[arg(long)]
        longshot: bool,
    },

    /// Evaluate trained models on a held-out year and write reports
    Test {
        /// Year to evaluate
        #[arg(short, long)]
        year: i32,

        #[arg(long)]
        custom: bool,

        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Evaluate the long-shot classifiers
        #[arg(long)]
        longshot: bool,
    },

    /// Rank speculative (pre-result) races with every trained model
    Predict {
        #[arg(long)]
        custom: bool,

        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Score with the long-shot classifiers
        #[arg(long)]
        longshot: bool,
    },

    /// Retrain and evaluate year by year
    WalkForward {
        /// Skip units completed by an earlier run
        #[arg(long)]
        resume: bool,

        #[arg(long)]
        custom: bool,

        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        #[arg(long)]
        longshot: bool,
    },

    /// List model definitions
    Models {
        #[arg(long)]
        custom: bool,
    },
}

fn open_repository(config: &AppConfig) -> anyhow::Result<RaceRepository> {
    RaceRepository::new(Path::new(&config.database.path))
        .with_context(|| format!("opening database {}", config.database.path))
}

fn load_definitions(config: &AppConfig) -> anyhow::Result<ModelDefinitions> {
    ModelDefinitions::load(&config.paths.model_definitions)
        .with_context(|| format!("loading model definitions {}", config.paths.model_definitions))
}

fn finish(summary: &BatchSummary, title: &str) -> anyhow::Result<()> {
    summary.print(title);
    let status = summary.status();
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("{} {}", title, status.as_str())
    }
}

/// Create the schema (idempotent) and print row counts.
pub fn run_init_db() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let repo = open_repository(&config)?;
    eprintln!("Database ready: {}", config.database.path);

    println!("  {:24} {:>10}", "Table", "Rows");
    println!("  {}", "-".repeat(35));
    for (table, count) in repo.table_counts()? {
        println!("  {:24} {:>10}", table, count);
    }
    Ok(())
}

/// Upsert one batch file in a single transaction.
pub fn run_import(file: PathBuf, speculative: bool) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let repo = open_repository(&config)?;

    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let batch: RecordBatch = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", file.display()))?;
    let source = if speculative {
        Source::Speculative
    } else {
        Source::Historical
    };
    repo.import(&batch, source)
        .with_context(|| format!("importing {}", file.display()))?;

    eprintln!(
        "Imported {} races, {} runners, {} payouts ({})",
        batch.races.len(),
        batch.runners.len(),
        batch.payouts.len(),
        source.as_str()
    );
    Ok(())
}

/// Print the feature columns in model input order.
pub fn run_features(model: Option<String>) -> anyhow::Result<()> {
    let schema = match model {
        Some(name) => {
            let config = AppConfig::load()?;
            let defs = load_definitions(&config)?;
            let def = defs
                .find(&name)
                .with_context(|| format!("no model definition named '{}'", name))?;
            def.schema()?
        }
        None => FeatureSchema::standard(),
    };

    println!("  {:>3} {:28} {:10} {:>8}", "#", "Feature", "Kind", "Missing");
    println!("  {}", "-".repeat(52));
    for (i, spec) in schema.specs().iter().enumerate() {
        println!(
            "  {:>3} {:28} {:10} {:>8.2}",
            i,
            spec.name,
            spec.kind.label(),
            spec.kind.default_value()
        );
    }
    Ok(())
}

/// Print the SQL and bound parameters for one model.
pub fn run_query(model: String, speculative: bool, year: Option<i32>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let defs = load_definitions(&config)?;
    let def = defs
        .find(&model)
        .with_context(|| format!("no model definition named '{}'", model))?;

    let years = match year {
        Some(y) => YearRange::single(y),
        None => config.training.years()?,
    };
    let source = if speculative {
        Source::Speculative
    } else {
        Source::Historical
    };
    let query = QueryBuilder::default().build(&def.filter(years, false)?, source)?;

    println!("{}", query.sql);
    println!();
    for (name, value) in &query.params {
        println!("-- {} = {:?}", name, value);
    }
    Ok(())
}

/// Train every selected model on the configured years.
pub fn run_train(custom: bool, only: Vec<String>, longshot: bool) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let defs = load_definitions(&config)?;
    let years = config.training.years()?;
    let backend = LightGbmCli::resolve(config.training.lightgbm_executable.as_deref())?;
    let pipeline = Pipeline::new(&config, open_repository(&config)?);
    let label = pipeline.label(longshot);

    let selected = defs.select(custom, &only);
    eprintln!("Training {} models on {} ({:?})", selected.len(), years, label);

    let mut summary = BatchSummary::new();
    for def in selected {
        let path = config.paths.model_path(&def.artifact_filename(label));
        summary.run(def.name(), || {
            let artifact = pipeline.train(&backend, def, years, label, &path)?;
            Ok(format!(
                "score {:.4}, {} features, {}..{}",
                artifact.validation_score,
                artifact.feature_columns.len(),
                artifact.train_from,
                artifact.train_to
            ))
        });
    }
    finish(&summary, "Training")
}

/// Skip definitions whose artifact has not been trained yet.
fn with_artifact(
    config: &AppConfig,
    summary: &mut BatchSummary,
    def: &ModelDefinition,
    label: LabelKind,
) -> Option<PathBuf> {
    let path = config.paths.model_path(&def.artifact_filename(label));
    if path.exists() {
        Some(path)
    } else {
        summary.record(
            def.name(),
            UnitOutcome::Skipped {
                reason: format!("no model artifact at {}", path.display()),
            },
        );
        None
    }
}

/// Evaluate trained models on `year`.
pub fn run_test(year: i32, custom: bool, only: Vec<String>, longshot: bool) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let defs = load_definitions(&config)?;
    let pipeline = Pipeline::new(&config, open_repository(&config)?);
    let label = pipeline.label(longshot);
    let reports_dir = Path::new(&config.paths.reports_dir);

    let mut summary = BatchSummary::new();
    for def in defs.select(custom, &only) {
        let Some(path) = with_artifact(&config, &mut summary, def, label) else {
            continue;
        };
        summary.run(def.name(), || {
            let model = LoadedModel::load(&path)?;
            let report = report_path(
                reports_dir,
                &def.artifact_filename(label),
                "test",
                &year.to_string(),
            );
            let eval = pipeline.evaluate(def, &model, YearRange::single(year), &report)?;
            Ok(eval.to_string())
        });
    }
    finish(&summary, &format!("Test {}", year))
}

/// Rank speculative races with every trained model.
pub fn run_predict(custom: bool, only: Vec<String>, longshot: bool) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let defs = load_definitions(&config)?;
    let pipeline = Pipeline::new(&config, open_repository(&config)?);
    let label = pipeline.label(longshot);

    let mut summary = BatchSummary::new();
    for def in defs.select(custom, &only) {
        let Some(path) = with_artifact(&config, &mut summary, def, label) else {
            continue;
        };
        summary.run(def.name(), || {
            let model = LoadedModel::load(&path)?;
            let (report, races) = pipeline.predict(def, &model)?;
            Ok(format!("{} races -> {}", races, report.display()))
        });
    }
    finish(&summary, "Predict")
}

/// Walk-forward retraining over the configured test years.
pub fn run_walk_forward_cmd(
    resume: bool,
    custom: bool,
    only: Vec<String>,
    longshot: bool,
) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let defs = load_definitions(&config)?;
    let backend = LightGbmCli::resolve(config.training.lightgbm_executable.as_deref())?;
    let pipeline = Pipeline::new(&config, open_repository(&config)?);
    let label = pipeline.label(longshot);

    let selected = defs.select(custom, &only);
    let units = walk_forward_units(
        &selected,
        &config.walk_forward.test_years,
        config.walk_forward.train_years,
    )?;

    let progress_path = Path::new(&config.paths.progress_file);
    let mut progress = if resume {
        ProgressFile::load(progress_path)?
    } else {
        ProgressFile::fresh(progress_path)
    };
    eprintln!(
        "Walk-forward: {} units ({} already complete)",
        units.len(),
        progress.len()
    );

    let summary = run_walk_forward(&pipeline, &backend, &config, &units, &mut progress, label);
    finish(&summary, "Walk-forward")
}

/// Print the selected definition list.
pub fn run_models(custom: bool) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let defs = load_definitions(&config)?;

    println!(
        "  {:36} {:>6} {:>6} {:>6} {:>12}  {}",
        "Model", "Venue", "Class", "Track", "Distance", "Description"
    );
    println!("  {}", "-".repeat(90));
    for def in defs.select(custom, &[]) {
        let filter = def.filter(config.training.years()?, false)?;
        println!(
            "  {:36} {:>6} {:>6} {:>6} {:>12}  {}",
            def.name(),
            filter.venue.to_string(),
            filter.race_class.to_string(),
            filter.surface.as_str(),
            filter.distance.to_string(),
            def.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
