//! Inference adapter: scores an assembled table and ranks each race.

use chrono::NaiveDate;
use std::fmt;
use tracing::debug;

use crate::error::Result;
use crate::features::FeatureTable;
use crate::model::metrics::{auc, ndcg_at, rank_order};
use crate::model::{LabelKind, LoadedModel};
use crate::types::{RaceKey, Source};

/// Long-shot probability at which a runner is flagged as a candidate
pub const DEFAULT_CANDIDATE_THRESHOLD: f64 = 0.3;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// One runner's prediction within its race
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRunner {
    pub key: RaceKey,
    pub horse_id: String,
    pub horse_name: String,
    pub post_position: u8,
    pub win_odds: Option<f64>,
    pub popularity: Option<u8>,
    /// 1 = highest score
    pub predicted_rank: usize,
    /// Raw ranking score, or the top-three probability for long-shot models
    pub score: f64,
    /// Race-level: top score minus second score
    pub top_two_gap: Option<f64>,
    pub insufficient_history: bool,
    pub finish_position: Option<u8>,
    pub place_payout: Option<u32>,
    pub win_payout: Option<u32>,
    /// Long-shot models only: probability at or above the threshold
    pub long_shot_candidate: Option<bool>,
}

impl RankedRunner {
    pub fn race_date(&self) -> NaiveDate {
        self.key.date
    }
}

pub struct InferenceAdapter<'a> {
    model: &'a LoadedModel,
    candidate_threshold: f64,
}

impl<'a> InferenceAdapter<'a> {
    pub fn new(model: &'a LoadedModel) -> Self {
        Self {
            model,
            candidate_threshold: DEFAULT_CANDIDATE_THRESHOLD,
        }
    }

    pub fn with_candidate_threshold(mut self, threshold: f64) -> Self {
        self.candidate_threshold = threshold;
        self
    }

    /// Score every row and rank runners per race, races in order of first
    /// appearance. Fails before scoring if the columns differ from the
    /// model's.
    pub fn rank(&self, table: &FeatureTable) -> Result<Vec<RankedRunner>> {
        let raw = self.model.score(table)?;
        let long_shot = matches!(self.model.label(), LabelKind::LongShotTopThree { .. });
        let scores: Vec<f64> = if long_shot {
            raw.into_iter().map(sigmoid).collect()
        } else {
            raw
        };
        let with_outcome = table.source == Source::Historical;
        let groups = table.race_groups();
        debug!(
            model = self.model.name(),
            races = groups.len(),
            rows = table.len(),
            "ranking"
        );

        let mut ranked = Vec::with_capacity(table.len());
        for (_, members) in groups {
            let group_scores: Vec<f64> = members.iter().map(|&i| scores[i]).collect();
            let order = rank_order(&group_scores);
            let top_two_gap = match order.as_slice() {
                [first, second, ..] => Some(group_scores[*first] - group_scores[*second]),
                _ => None,
            };

            for (rank, &local) in order.iter().enumerate() {
                let row = &table.rows[members[local]];
                let score = group_scores[local];
                ranked.push(RankedRunner {
                    key: row.key.clone(),
                    horse_id: row.horse_id.clone(),
                    horse_name: row.horse_name.clone(),
                    post_position: row.post_position,
                    win_odds: row.win_odds,
                    popularity: row.popularity,
                    predicted_rank: rank + 1,
                    score,
                    top_two_gap,
                    insufficient_history: row.insufficient_history,
                    finish_position: if with_outcome { row.finish_position } else { None },
                    place_payout: if with_outcome { row.place_payout() } else { None },
                    win_payout: if with_outcome { row.win_payout() } else { None },
                    long_shot_candidate: long_shot.then(|| score >= self.candidate_threshold),
                });
            }
        }
        Ok(ranked)
    }
}

/// Hit rates of the top-ranked runner over races with known outcomes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationSummary {
    pub races: usize,
    pub top_pick_wins: usize,
    pub top_pick_places: usize,
    /// Payouts collected by backing every top pick (per 100 yen)
    pub top_pick_win_return: u64,
    pub top_pick_place_return: u64,
    /// Ranking models: NDCG@k over finishing order
    pub ndcg: Option<f64>,
    /// Long-shot models: AUC of the probability against the label
    pub auc: Option<f64>,
    pub candidates: usize,
    /// Candidates whose label came true
    pub candidate_hits: usize,
}

impl EvaluationSummary {
    /// Summarise ranked output. Runners without a finish (scratched, did
    /// not finish) are left out; a race counts when anyone finished.
    pub fn from_ranked(ranked: &[RankedRunner], label: LabelKind, eval_at: usize) -> Self {
        let mut summary = Self::default();
        let mut scores = Vec::new();
        let mut targets = Vec::new();
        let mut groups = Vec::new();

        for race in ranked.chunk_by(|a, b| a.key == b.key) {
            let finished: Vec<(&RankedRunner, u8)> = race
                .iter()
                .filter_map(|r| r.finish_position.map(|f| (r, f)))
                .collect();
            let Some(&(top, top_finish)) = finished.iter().min_by_key(|(r, _)| r.predicted_rank)
            else {
                continue;
            };

            summary.races += 1;
            if top_finish == 1 {
                summary.top_pick_wins += 1;
            }
            if top_finish <= 3 {
                summary.top_pick_places += 1;
            }
            summary.top_pick_win_return += top.win_payout.unwrap_or(0) as u64;
            summary.top_pick_place_return += top.place_payout.unwrap_or(0) as u64;

            for &(runner, finish) in &finished {
                let target = label.target(finish, runner.popularity);
                if runner.long_shot_candidate == Some(true) {
                    summary.candidates += 1;
                    if target > 0.5 {
                        summary.candidate_hits += 1;
                    }
                }
                scores.push(runner.score);
                targets.push(target);
            }
            groups.push(finished.len());
        }

        if summary.races == 0 {
            return summary;
        }
        match label {
            LabelKind::Relevance => {
                summary.ndcg = Some(ndcg_at(&scores, &targets, &groups, eval_at));
            }
            LabelKind::LongShotTopThree { .. } => {
                summary.auc = Some(auc(&scores, &targets));
            }
        }
        summary
    }

    pub fn win_rate(&self) -> f64 {
        if self.races > 0 {
            self.top_pick_wins as f64 / self.races as f64
        } else {
            0.0
        }
    }

    pub fn place_rate(&self) -> f64 {
        if self.races > 0 {
            self.top_pick_places as f64 / self.races as f64
        } else {
            0.0
        }
    }

    /// Return per 100 yen staked on each top pick
    pub fn win_recovery(&self) -> f64 {
        self.recovery(self.top_pick_win_return)
    }

    pub fn place_recovery(&self) -> f64 {
        self.recovery(self.top_pick_place_return)
    }

    fn recovery(&self, returned: u64) -> f64 {
        if self.races > 0 {
            returned as f64 / (self.races as f64 * 100.0)
        } else {
            0.0
        }
    }
}

impl fmt::Display for EvaluationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} races, win {:.1}% ({:.1}% recovery), place {:.1}% ({:.1}% recovery)",
            self.races,
            self.win_rate() * 100.0,
            self.win_recovery() * 100.0,
            self.place_rate() * 100.0,
            self.place_recovery() * 100.0
        )?;
        if let Some(ndcg) = self.ndcg {
            write!(f, ", ndcg {:.3}", ndcg)?;
        }
        if let Some(area) = self.auc {
            write!(
                f,
                ", auc {:.3}, {} candidates ({} hit)",
                area, self.candidates, self.candidate_hits
            )?;
        }
        Ok(())
    }
}
