//! Tab-separated ranking reports.
//!
//! Column names and order are fixed; downstream profit analysis reads these
//! files by header. Unknown values are written as empty cells.

use polars::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::inference::RankedRunner;

pub const REPORT_COLUMNS: [&str; 16] = [
    "venue",
    "race_date",
    "race_number",
    "horse_id",
    "horse_name",
    "post_position",
    "win_odds",
    "popularity",
    "predicted_rank",
    "score",
    "top_two_gap",
    "insufficient_history",
    "finish_position",
    "place_payout",
    "win_payout",
    "long_shot_candidate",
];

/// `<reports_dir>/<model>_<mode>_<label>.tsv`
pub fn report_path(reports_dir: &Path, model: &str, mode: &str, label: &str) -> PathBuf {
    let stem = model.trim_end_matches(".json");
    reports_dir.join(format!("{}_{}_{}.tsv", stem, mode, label))
}

fn to_frame(ranked: &[RankedRunner]) -> PolarsResult<DataFrame> {
    let col = |i: usize| PlSmallStr::from_static(REPORT_COLUMNS[i]);
    DataFrame::new(vec![
        Column::new(
            col(0),
            ranked.iter().map(|r| r.key.venue_code.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            col(1),
            ranked
                .iter()
                .map(|r| r.race_date().format("%Y-%m-%d").to_string())
                .collect::<Vec<_>>(),
        ),
        Column::new(
            col(2),
            ranked.iter().map(|r| r.key.race_number as u32).collect::<Vec<_>>(),
        ),
        Column::new(
            col(3),
            ranked.iter().map(|r| r.horse_id.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            col(4),
            ranked.iter().map(|r| r.horse_name.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            col(5),
            ranked.iter().map(|r| r.post_position as u32).collect::<Vec<_>>(),
        ),
        Column::new(col(6), ranked.iter().map(|r| r.win_odds).collect::<Vec<_>>()),
        Column::new(
            col(7),
            ranked
                .iter()
                .map(|r| r.popularity.map(u32::from))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            col(8),
            ranked.iter().map(|r| r.predicted_rank as u32).collect::<Vec<_>>(),
        ),
        Column::new(col(9), ranked.iter().map(|r| r.score).collect::<Vec<_>>()),
        Column::new(col(10), ranked.iter().map(|r| r.top_two_gap).collect::<Vec<_>>()),
        Column::new(
            col(11),
            ranked.iter().map(|r| r.insufficient_history).collect::<Vec<_>>(),
        ),
        Column::new(
            col(12),
            ranked
                .iter()
                .map(|r| r.finish_position.map(u32::from))
                .collect::<Vec<_>>(),
        ),
        Column::new(col(13), ranked.iter().map(|r| r.place_payout).collect::<Vec<_>>()),
        Column::new(col(14), ranked.iter().map(|r| r.win_payout).collect::<Vec<_>>()),
        Column::new(
            col(15),
            ranked.iter().map(|r| r.long_shot_candidate).collect::<Vec<_>>(),
        ),
    ])
}

/// Write a report, replacing any existing file at `path`.
pub fn write_report(path: &Path, ranked: &[RankedRunner]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut df = to_frame(ranked)?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(&mut df)?;
    info!(path = %path.display(), rows = ranked.len(), "report written");
    Ok(())
}
