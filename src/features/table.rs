//! Assembled feature table.

use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::HashMap;
use std::ops::Range;

use crate::error::{PipelineError, Result};
use crate::query::Payout;
use crate::types::{FilterSpec, RaceKey, Source};

/// One runner-in-race with its completed feature vector
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub key: RaceKey,
    pub horse_id: String,
    pub horse_name: String,
    pub post_position: u8,
    pub win_odds: Option<f64>,
    pub popularity: Option<u8>,
    /// Realized finish; always `None` for speculative rows
    pub finish_position: Option<u8>,
    pub payout: Option<Payout>,
    pub insufficient_history: bool,
    pub values: Vec<f64>,
}

impl FeatureRow {
    pub fn date(&self) -> NaiveDate {
        self.key.date
    }

    /// Win payout when this runner is the settled winner
    pub fn win_payout(&self) -> Option<u32> {
        let payout = self.payout.as_ref()?;
        if payout.win_post == Some(self.post_position) {
            payout.win_payout
        } else {
            None
        }
    }

    pub fn place_payout(&self) -> Option<u32> {
        self.payout
            .as_ref()
            .and_then(|p| p.place_payout(self.post_position))
    }
}

#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub source: Source,
    pub filter: FilterSpec,
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Same rows, different row set; columns and provenance are kept
    pub fn with_rows(&self, rows: Vec<FeatureRow>) -> Self {
        Self {
            source: self.source,
            filter: self.filter.clone(),
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Row-major feature matrix of shape (rows, columns)
    pub fn matrix(&self) -> Result<Array2<f64>> {
        let width = self.columns.len();
        let mut data = Vec::with_capacity(self.rows.len() * width);
        for row in &self.rows {
            data.extend_from_slice(&row.values);
        }
        Array2::from_shape_vec((self.rows.len(), width), data)
            .map_err(|e| PipelineError::SchemaMismatch(format!("ragged feature rows: {}", e)))
    }

    /// Row ranges of consecutive rows sharing a race
    pub fn race_runs(&self) -> Vec<Range<usize>> {
        let mut runs = Vec::new();
        let mut start = 0;
        for i in 1..=self.rows.len() {
            if i == self.rows.len() || self.rows[i].key != self.rows[start].key {
                if i > start {
                    runs.push(start..i);
                }
                start = i;
            }
        }
        runs
    }

    /// Race groups in order of first appearance, contiguous or not
    pub fn race_groups(&self) -> Vec<(RaceKey, Vec<usize>)> {
        let mut index: HashMap<&RaceKey, usize> = HashMap::new();
        let mut groups: Vec<(RaceKey, Vec<usize>)> = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            match index.get(&row.key) {
                Some(&g) => groups[g].1.push(i),
                None => {
                    index.insert(&row.key, groups.len());
                    groups.push((row.key.clone(), vec![i]));
                }
            }
        }
        groups
    }

    /// Distinct dates in ascending order
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.rows.iter().map(|r| r.date()).collect();
        dates.sort();
        dates.dedup();
        dates
    }
}
