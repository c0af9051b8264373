//! Chronological train/evaluation splits.

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::features::{FeatureRow, FeatureTable};
use crate::types::YearRange;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitPolicy {
    /// Earliest `fraction` of distinct dates train, the rest evaluate
    DateFraction(f64),
    /// Caller-supplied disjoint year ranges (walk-forward)
    YearRanges { train: YearRange, test: YearRange },
}

#[derive(Debug, Clone)]
pub struct Split {
    pub train: FeatureTable,
    pub test: FeatureTable,
}

/// Sort rows by (date, venue, race number), keeping input order within a
/// race. Never shuffles.
pub fn chronological(mut rows: Vec<FeatureRow>) -> Vec<FeatureRow> {
    rows.sort_by(|a, b| {
        (a.key.date, &a.key.venue_code, a.key.race_number).cmp(&(
            b.key.date,
            &b.key.venue_code,
            b.key.race_number,
        ))
    });
    rows
}

pub fn split(table: &FeatureTable, policy: SplitPolicy) -> Result<Split> {
    let rows = chronological(table.rows.clone());

    let (train, test): (Vec<FeatureRow>, Vec<FeatureRow>) = match policy {
        SplitPolicy::DateFraction(fraction) => {
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(PipelineError::InvalidSplit(format!(
                    "train fraction must be in (0, 1), got {}",
                    fraction
                )));
            }
            let dates = table.dates();
            if dates.len() < 2 {
                return Err(PipelineError::InvalidSplit(format!(
                    "need at least two race dates to split, have {}",
                    dates.len()
                )));
            }
            let cut = ((dates.len() as f64) * fraction).round() as usize;
            let cut = cut.clamp(1, dates.len() - 1);
            let boundary = dates[cut];
            debug!(%boundary, train_dates = cut, test_dates = dates.len() - cut, "date split");
            rows.into_iter().partition(|r| r.date() < boundary)
        }
        SplitPolicy::YearRanges { train, test } => {
            if train.overlaps(&test) {
                return Err(PipelineError::OverlappingRanges { train, test });
            }
            if train.start > test.end {
                warn!(%train, %test, "training years come after test years");
            }
            let (train_rows, rest): (Vec<FeatureRow>, Vec<FeatureRow>) =
                rows.into_iter().partition(|r| train.contains(r.date()));
            let test_rows = rest
                .into_iter()
                .filter(|r| test.contains(r.date()))
                .collect();
            (train_rows, test_rows)
        }
    };

    Ok(Split {
        train: table.with_rows(train),
        test: table.with_rows(test),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixtures::date;
    use crate::types::{
        DistanceRange, FilterSpec, RaceClassFilter, RaceKey, Source, Surface, VenueFilter,
    };

    fn row(day: &str, race: u8, horse: &str) -> FeatureRow {
        FeatureRow {
            key: RaceKey::new("05", date(day), race),
            horse_id: horse.to_string(),
            horse_name: horse.to_string(),
            post_position: 1,
            win_odds: None,
            popularity: None,
            finish_position: Some(1),
            payout: None,
            insufficient_history: false,
            values: vec![0.0],
        }
    }

    fn table(rows: Vec<FeatureRow>) -> FeatureTable {
        FeatureTable {
            source: Source::Historical,
            filter: FilterSpec {
                venue: VenueFilter::All,
                years: YearRange::new(2020, 2023).unwrap(),
                surface: Surface::Turf,
                distance: DistanceRange::new(1000, 9999).unwrap(),
                race_class: RaceClassFilter::Any,
                include_payouts: false,
            },
            columns: vec!["x".to_string()],
            rows,
        }
    }

    #[test]
    fn test_fraction_split_is_strictly_temporal() {
        let days = [
            "2021-01-05", "2021-02-01", "2021-03-01", "2021-04-01",
            "2021-05-01", "2021-06-01", "2021-07-01", "2021-08-01",
        ];
        // Shuffled input, two runners per race
        let mut rows = Vec::new();
        for day in days.iter().rev() {
            rows.push(row(day, 1, "B"));
            rows.push(row(day, 1, "A"));
        }
        let split = split(&table(rows), SplitPolicy::DateFraction(0.75)).unwrap();

        assert_eq!(split.train.len(), 12);
        assert_eq!(split.test.len(), 4);
        let last_train = split.train.rows.iter().map(|r| r.date()).max().unwrap();
        let first_test = split.test.rows.iter().map(|r| r.date()).min().unwrap();
        assert!(last_train < first_test);

        // Chronological, input order kept within a race
        assert_eq!(split.train.rows[0].date(), date("2021-01-05"));
        assert_eq!(split.train.rows[0].horse_id, "B");
        assert_eq!(split.train.rows[1].horse_id, "A");
    }

    #[test]
    fn test_fraction_split_keeps_each_side_non_empty() {
        let rows = vec![row("2021-01-05", 1, "A"), row("2021-01-06", 1, "A")];
        let split = split(&table(rows), SplitPolicy::DateFraction(0.99)).unwrap();
        assert_eq!(split.train.len(), 1);
        assert_eq!(split.test.len(), 1);
    }

    #[test]
    fn test_fraction_split_rejects_bad_input() {
        let rows = vec![row("2021-01-05", 1, "A"), row("2021-01-05", 2, "B")];
        assert!(matches!(
            split(&table(rows.clone()), SplitPolicy::DateFraction(0.5)),
            Err(PipelineError::InvalidSplit(_))
        ));
        assert!(matches!(
            split(&table(rows), SplitPolicy::DateFraction(1.0)),
            Err(PipelineError::InvalidSplit(_))
        ));
    }

    #[test]
    fn test_year_ranges() {
        let rows = vec![
            row("2020-06-01", 1, "A"),
            row("2021-06-01", 1, "A"),
            row("2022-06-01", 1, "A"),
            row("2023-06-01", 1, "A"),
        ];
        let policy = SplitPolicy::YearRanges {
            train: YearRange::new(2020, 2021).unwrap(),
            test: YearRange::single(2023),
        };
        let split = split(&table(rows), policy).unwrap();
        assert_eq!(split.train.len(), 2);
        assert_eq!(split.test.len(), 1);
        assert_eq!(split.test.rows[0].date(), date("2023-06-01"));
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let policy = SplitPolicy::YearRanges {
            train: YearRange::new(2020, 2022).unwrap(),
            test: YearRange::new(2022, 2023).unwrap(),
        };
        let err = split(&table(vec![row("2021-06-01", 1, "A")]), policy).unwrap_err();
        assert!(matches!(err, PipelineError::OverlappingRanges { .. }));
    }
}
