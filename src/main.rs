//! Keiba ranking pipeline
//!
//! Leakage-free feature extraction, LightGBM ranking models and race
//! reports over a JRA race database.

mod batch;
mod cli;
mod config;
mod error;
mod features;
mod inference;
mod model;
mod pipeline;
mod query;
mod report;
mod split;
mod storage;
mod types;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keiba_rank=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => cli::run_init_db(),
        Commands::Import { file, speculative } => cli::run_import(file, speculative),
        Commands::Features { model } => cli::run_features(model),
        Commands::Query {
            model,
            speculative,
            year,
        } => cli::run_query(model, speculative, year),
        Commands::Train {
            custom,
            only,
            longshot,
        } => cli::run_train(custom, only, longshot),
        Commands::Test {
            year,
            custom,
            only,
            longshot,
        } => cli::run_test(year, custom, only, longshot),
        Commands::Predict {
            custom,
            only,
            longshot,
        } => cli::run_predict(custom, only, longshot),
        Commands::WalkForward {
            resume,
            custom,
            only,
            longshot,
        } => cli::run_walk_forward_cmd(resume, custom, only, longshot),
        Commands::Models { custom } => cli::run_models(custom),
    }
}
