//! Feature assembler: completes query rows into model-ready vectors.
//!
//! Interpolations that are awkward in SQL live here, along with the single
//! fill policy declared by [`FeatureKind`]. Training, offline tests and
//! speculative scoring all call [`FeatureAssembler::assemble`].

use tracing::debug;

use super::schema::{standard_index, FeatureSchema, NEUTRAL_SCORE, STANDARD_FEATURES};
use super::table::{FeatureRow, FeatureTable};
use crate::error::{PipelineError, Result};
use crate::query::QueryRow;
use crate::types::{DistanceBand, FilterSpec, Source, Surface, TrackDirection};

/// Distance over which a band's influence halves
const APTITUDE_HALF_DISTANCE: f64 = 200.0;

/// Minimum rides in the look-back before a connection score is trusted
const MIN_CONNECTION_RIDES: i64 = 3;

/// Standard deviations below this are treated as a flat field
const MIN_SPREAD: f64 = 1e-9;

pub struct FeatureAssembler {
    schema: FeatureSchema,
    /// Position of each schema column within [`STANDARD_FEATURES`]
    indices: Vec<usize>,
}

impl FeatureAssembler {
    pub fn new(schema: FeatureSchema) -> Self {
        let indices = schema
            .specs()
            .iter()
            .filter_map(|s| standard_index(s.name))
            .collect();
        Self { schema, indices }
    }

    pub fn assemble(
        &self,
        rows: &[QueryRow],
        filter: &FilterSpec,
        source: Source,
    ) -> Result<FeatureTable> {
        let specs = self.schema.specs();
        let mut out = Vec::with_capacity(rows.len());

        for row in rows {
            if row.surface != filter.surface || !filter.distance.contains(row.distance) {
                return Err(PipelineError::InvalidFilter(format!(
                    "row {} ({}m {}) lies outside filter {}",
                    row.key,
                    row.distance,
                    row.surface.as_str(),
                    filter
                )));
            }

            let raw = standard_values(row);
            let values: Vec<f64> = self
                .indices
                .iter()
                .zip(specs)
                .map(|(&idx, spec)| raw[idx].unwrap_or_else(|| spec.kind.default_value()))
                .collect();

            out.push(FeatureRow {
                key: row.key.clone(),
                horse_id: row.horse_id.clone(),
                horse_name: row.horse_name.clone(),
                post_position: row.post_position,
                win_odds: row.win_odds,
                popularity: row.popularity,
                finish_position: match source {
                    Source::Historical => row.finish_position,
                    Source::Speculative => None,
                },
                payout: row.payout.clone(),
                insufficient_history: row.insufficient_history(),
                values,
            });
        }

        let table = FeatureTable {
            source,
            filter: filter.clone(),
            columns: self.schema.columns(),
            rows: out,
        };
        self.validate(&table)?;

        debug!(
            rows = table.len(),
            columns = table.columns.len(),
            source = source.as_str(),
            "assembled features"
        );
        Ok(table)
    }

    /// Column list must equal the schema's and every value must be finite.
    fn validate(&self, table: &FeatureTable) -> Result<()> {
        let expected = self.schema.columns();
        if table.columns != expected || self.indices.len() != expected.len() {
            return Err(PipelineError::SchemaMismatch(format!(
                "assembled columns {:?} differ from schema {:?}",
                table.columns, expected
            )));
        }
        for row in &table.rows {
            if row.values.len() != expected.len() {
                return Err(PipelineError::SchemaMismatch(format!(
                    "{} {} has {} values for {} columns",
                    row.key,
                    row.horse_id,
                    row.values.len(),
                    expected.len()
                )));
            }
            if let Some(i) = row.values.iter().position(|v| !v.is_finite()) {
                return Err(PipelineError::SchemaMismatch(format!(
                    "{} {} has non-finite {}",
                    row.key, row.horse_id, expected[i]
                )));
            }
        }
        Ok(())
    }
}

/// Every standard feature for one row; `None` means "use the declared default".
fn standard_values(row: &QueryRow) -> [Option<f64>; STANDARD_FEATURES.len()] {
    let field = row.field_size.max(row.entered.clamp(0, u8::MAX as i64) as u8);
    let post_ratio = (field > 1)
        .then(|| (row.post_position as f64 - 1.0) / (field as f64 - 1.0))
        .map(|r| r.clamp(0.0, 1.0));

    let recent_std_5 = match (row.recent_rel_finish_5, row.recent_rel_finish_sq_5) {
        (Some(mean), Some(sq)) if row.history_5 >= 2 => Some(spread(mean, sq)),
        _ => None,
    };

    let rest_days = row
        .prev_race_date
        .map(|prev| (row.key.date - prev).num_days() as f64);

    let surface_aptitude = match row.surface {
        Surface::Turf => row.surface_turf,
        Surface::Dirt => row.surface_dirt,
    };

    [
        Some(row.distance as f64),
        Some(field as f64),
        row.going_code.map(f64::from),
        Some(row.class_weight),
        post_ratio,
        row.age.map(f64::from),
        Some(row.weight_carried),
        zscore(row.weight_carried, row.field_weight_mean, row.field_weight_sq),
        row.age.map(|age| row.weight_carried - expected_weight(age)),
        Some(row.career_starts as f64),
        rest_days,
        row.past_score,
        row.recent_rel_finish_3,
        row.recent_rel_finish_5,
        recent_std_5,
        row.last3f_index,
        row.prev_distance
            .map(|prev| row.distance as f64 - prev as f64),
        row.prev_class_weight.map(|prev| row.class_weight - prev),
        distance_aptitude(row.distance, &row.band_scores),
        surface_aptitude,
        direction_aptitude(row.direction, row.direction_left, row.direction_right),
        same_race_zscore(row),
        (row.jockey_rides >= MIN_CONNECTION_RIDES)
            .then_some(row.jockey_recent_score)
            .flatten(),
        (row.trainer_rides >= MIN_CONNECTION_RIDES)
            .then_some(row.trainer_recent_score)
            .flatten(),
    ]
}

fn spread(mean: f64, mean_sq: f64) -> f64 {
    (mean_sq - mean * mean).max(0.0).sqrt()
}

fn zscore(x: f64, mean: f64, mean_sq: f64) -> Option<f64> {
    let std = spread(mean, mean_sq);
    (std > MIN_SPREAD).then(|| (x - mean) / std)
}

/// Typical carried weight by age
fn expected_weight(age: u8) -> f64 {
    match age {
        0..=2 => 48.0,
        3 => 52.0,
        4 => 55.0,
        5 | 6 => 57.0,
        7 => 56.0,
        _ => 55.0,
    }
}

/// Blend of per-band trailing scores, weighted by how close today's
/// distance is to each band center. Bands without history drop out and the
/// remaining weights are renormalized.
pub(crate) fn distance_aptitude(distance: u32, band_scores: &[Option<f64>; 4]) -> Option<f64> {
    let (weighted, total) = DistanceBand::ALL
        .iter()
        .zip(band_scores)
        .filter_map(|(band, score)| score.map(|s| (band, s)))
        .fold((0.0, 0.0), |(weighted, total), (band, score)| {
            let gap = (distance as f64 - band.center()).abs();
            let weight = 0.5_f64.powf(gap / APTITUDE_HALF_DISTANCE);
            (weighted + weight * score, total + weight)
        });
    (total > 0.0).then(|| weighted / total)
}

pub(crate) fn direction_aptitude(
    direction: TrackDirection,
    left: Option<f64>,
    right: Option<f64>,
) -> Option<f64> {
    match direction {
        TrackDirection::Left => left,
        TrackDirection::Right => right,
        TrackDirection::Straight => Some(NEUTRAL_SCORE),
    }
}

/// Runner's 3-start score against today's field. No history means no
/// evidence, so the runner gets the default rather than a computed z-score.
fn same_race_zscore(row: &QueryRow) -> Option<f64> {
    let own = row.recent_rel_finish_3?;
    zscore(own, row.field_mean_3, row.field_sq_3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::schema::FeatureKind;
    use crate::query::QueryBuilder;
    use crate::storage::fixtures::{date, race, seed_race};
    use crate::storage::RaceRepository;
    use crate::types::{DistanceRange, RaceClassFilter, RaceKey, VenueFilter, YearRange};

    fn filter() -> FilterSpec {
        FilterSpec {
            venue: VenueFilter::All,
            years: YearRange::single(2023),
            surface: Surface::Turf,
            distance: DistanceRange::new(1000, 9999).unwrap(),
            race_class: RaceClassFilter::Any,
            include_payouts: false,
        }
    }

    /// Debut runner in a 12-runner turf 1800 race
    fn debut_row() -> QueryRow {
        QueryRow {
            key: RaceKey::new("05", date("2023-05-01"), 11),
            surface: Surface::Turf,
            distance: 1800,
            direction: TrackDirection::Left,
            going_code: Some(1),
            race_class: "13".to_string(),
            field_size: 12,
            horse_id: "H".to_string(),
            horse_name: "Debut".to_string(),
            post_position: 6,
            age: Some(3),
            weight_carried: 56.0,
            win_odds: Some(12.5),
            popularity: Some(5),
            finish_position: Some(4),
            class_weight: 1.0,
            career_starts: 0,
            recent_rel_finish_3: None,
            history_3: 0,
            recent_rel_finish_5: None,
            recent_rel_finish_sq_5: None,
            history_5: 0,
            past_score: None,
            last3f_index: None,
            band_scores: [None; 4],
            surface_turf: None,
            surface_dirt: None,
            direction_left: None,
            direction_right: None,
            prev_race_date: None,
            prev_distance: None,
            prev_class_weight: None,
            jockey_recent_score: None,
            jockey_rides: 0,
            trainer_recent_score: None,
            trainer_rides: 0,
            // Rest of the field has history with real spread
            field_mean_3: 0.45,
            field_sq_3: 0.45 * 0.45 + 0.01,
            field_weight_mean: 56.0,
            field_weight_sq: 56.0 * 56.0,
            entered: 12,
            payout: None,
        }
    }

    fn value(table: &FeatureTable, row: usize, name: &str) -> f64 {
        let idx = table.columns.iter().position(|c| c == name).unwrap();
        table.rows[row].values[idx]
    }

    #[test]
    fn test_zero_history_scenario() {
        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let table = assembler
            .assemble(&[debut_row()], &filter(), Source::Historical)
            .unwrap();

        assert_eq!(value(&table, 0, "distance_aptitude"), 0.5);
        assert_eq!(value(&table, 0, "class_score_change"), 0.0);
        assert_eq!(value(&table, 0, "same_race_zscore"), 0.0);
        assert!(table.rows[0].insufficient_history);
    }

    #[test]
    fn test_missing_history_gets_declared_defaults() {
        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let table = assembler
            .assemble(&[debut_row()], &filter(), Source::Historical)
            .unwrap();

        let history_features = [
            "career_starts",
            "rest_days",
            "past_score",
            "recent_rel_finish_3",
            "recent_rel_finish_5",
            "recent_rel_finish_std_5",
            "last3f_index",
            "distance_change",
            "class_score_change",
            "distance_aptitude",
            "surface_aptitude",
            "direction_aptitude",
            "same_race_zscore",
            "jockey_recent_score",
            "trainer_recent_score",
        ];
        for name in history_features {
            let spec = STANDARD_FEATURES.iter().find(|s| s.name == name).unwrap();
            let expected = match spec.kind {
                FeatureKind::Ratio { lo, hi } => (lo + hi) / 2.0,
                FeatureKind::Count | FeatureKind::Relative => 0.0,
                FeatureKind::Measure { default } => default,
            };
            assert_eq!(value(&table, 0, name), expected, "{}", name);
        }
        assert!(table.rows[0].values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_distance_aptitude_midpoint_symmetry() {
        // Mile and middle centers are 1600 and 2000; 1800 is equidistant
        let same = [None, Some(0.4), Some(0.4), None];
        assert!((distance_aptitude(1800, &same).unwrap() - 0.4).abs() < 1e-12);

        let different = [None, Some(0.3), Some(0.7), None];
        assert!((distance_aptitude(1800, &different).unwrap() - 0.5).abs() < 1e-12);

        assert_eq!(distance_aptitude(1800, &[None; 4]), None);
    }

    #[test]
    fn test_distance_aptitude_decays_with_distance() {
        // At 1600 the mile band weighs 1.0, middle 0.25
        let scores = [None, Some(0.8), Some(0.0), None];
        let blended = distance_aptitude(1600, &scores).unwrap();
        assert!((blended - 0.8 / 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_direction_aptitude() {
        assert_eq!(
            direction_aptitude(TrackDirection::Straight, Some(0.9), Some(0.1)),
            Some(NEUTRAL_SCORE)
        );
        assert_eq!(direction_aptitude(TrackDirection::Left, Some(0.9), Some(0.1)), Some(0.9));
        assert_eq!(direction_aptitude(TrackDirection::Right, Some(0.9), None), None);
    }

    #[test]
    fn test_same_race_zscore_with_history() {
        let mut row = debut_row();
        row.recent_rel_finish_3 = Some(0.75);
        row.history_3 = 3;
        row.field_mean_3 = 0.5;
        row.field_sq_3 = 0.25 + 0.01;
        assert!((same_race_zscore(&row).unwrap() - 2.5).abs() < 1e-9);

        // Flat field carries no evidence
        row.field_sq_3 = 0.25;
        assert_eq!(same_race_zscore(&row), None);
    }

    #[test]
    fn test_class_change_and_rest() {
        let mut row = debut_row();
        row.prev_race_date = Some(date("2023-04-03"));
        row.prev_class_weight = Some(0.6);
        row.prev_distance = Some(2000);
        row.class_weight = 1.5;

        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let table = assembler
            .assemble(&[row], &filter(), Source::Historical)
            .unwrap();
        assert!((value(&table, 0, "class_score_change") - 0.9).abs() < 1e-12);
        assert_eq!(value(&table, 0, "rest_days"), 28.0);
        assert_eq!(value(&table, 0, "distance_change"), -200.0);
        assert_eq!(value(&table, 0, "weight_deviation"), 4.0);
    }

    #[test]
    fn test_connection_scores_need_enough_rides() {
        let mut row = debut_row();
        row.jockey_recent_score = Some(0.8);
        row.jockey_rides = 2;
        row.trainer_recent_score = Some(0.2);
        row.trainer_rides = 3;

        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let table = assembler
            .assemble(&[row], &filter(), Source::Historical)
            .unwrap();
        assert_eq!(value(&table, 0, "jockey_recent_score"), NEUTRAL_SCORE);
        assert_eq!(value(&table, 0, "trainer_recent_score"), 0.2);
    }

    #[test]
    fn test_speculative_rows_carry_no_outcome() {
        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let table = assembler
            .assemble(&[debut_row()], &filter(), Source::Speculative)
            .unwrap();
        assert_eq!(table.rows[0].finish_position, None);
    }

    #[test]
    fn test_rows_outside_filter_rejected() {
        let mut row = debut_row();
        row.surface = Surface::Dirt;
        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let err = assembler
            .assemble(&[row], &filter(), Source::Historical)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFilter(_)));
    }

    #[test]
    fn test_excluded_columns_are_not_emitted() {
        let schema = FeatureSchema::standard()
            .without(&["post_ratio".to_string()])
            .unwrap();
        let assembler = FeatureAssembler::new(schema);
        let table = assembler
            .assemble(&[debut_row()], &filter(), Source::Historical)
            .unwrap();
        assert_eq!(table.columns.len(), STANDARD_FEATURES.len() - 1);
        assert!(!table.columns.contains(&"post_ratio".to_string()));
        assert_eq!(table.rows[0].values.len(), table.columns.len());
    }

    #[test]
    fn test_historical_and_speculative_tables_match() {
        let history = |repo: &RaceRepository| {
            seed_race(repo, race("05", "2023-02-01", 1, Surface::Turf, 1600), &[("A", 1), ("B", 2), ("C", 3)], Source::Historical);
            seed_race(repo, race("06", "2023-03-05", 2, Surface::Turf, 2000), &[("B", 1), ("A", 2)], Source::Historical);
        };
        let card = race("05", "2023-04-09", 11, Surface::Turf, 1800);
        let entries = [("A", 2), ("B", 1), ("C", 3), ("N", 4)];

        let confirmed = RaceRepository::in_memory().unwrap();
        history(&confirmed);
        seed_race(&confirmed, card.clone(), &entries, Source::Historical);

        let pending = RaceRepository::in_memory().unwrap();
        history(&pending);
        seed_race(&pending, card.clone(), &entries, Source::Speculative);

        let assembler = FeatureAssembler::new(FeatureSchema::standard());
        let builder = QueryBuilder::default();
        let run = |repo: &RaceRepository, source: Source| {
            let query = builder.build(&filter(), source).unwrap();
            let rows = repo.fetch(&query).unwrap();
            assembler.assemble(&rows, &filter(), source).unwrap()
        };

        let historical = run(&confirmed, Source::Historical);
        let speculative = run(&pending, Source::Speculative);
        assert_eq!(historical.columns, speculative.columns);

        let targets: Vec<&FeatureRow> = historical
            .rows
            .iter()
            .filter(|r| r.key == card.key)
            .collect();
        assert_eq!(targets.len(), speculative.len());
        for (h, s) in targets.iter().zip(&speculative.rows) {
            assert_eq!(h.horse_id, s.horse_id);
            assert_eq!(h.values, s.values);
            assert!(h.finish_position.is_some());
            assert!(s.finish_position.is_none());
        }
    }
}
