//! Query builder for per-runner trailing-window aggregates.
//!
//! Training, offline testing and pre-result scoring all go through
//! [`QueryBuilder::build`]. The two sources differ only in the `base` CTE;
//! every aggregate after it is the same SQL text. Horse-history frames end
//! at `1 PRECEDING` and connection frames end one day before the race, so
//! no aggregate can see the current row or anything after it.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::Row;

use crate::error::{PipelineError, Result};
use crate::types::{
    FilterSpec, RaceClassFilter, RaceKey, Source, Surface, TrackDirection,
    VenueFilter,
};

/// Prior starts needed before trailing aggregates are considered complete
pub const HISTORY_WINDOW: i64 = 5;

/// Look-back for jockey and trainer form, in days
pub const CONNECTION_WINDOW_DAYS: i64 = 90;

/// Built SQL plus its named parameters
#[derive(Debug, Clone)]
pub struct RaceQuery {
    pub sql: String,
    pub params: Vec<(String, Value)>,
    pub source: Source,
}

/// Win and place settlements joined for profit/loss reporting
#[derive(Debug, Clone, PartialEq)]
pub struct Payout {
    pub win_post: Option<u8>,
    pub win_payout: Option<u32>,
    pub places: Vec<(u8, u32)>,
}

impl Payout {
    pub fn place_payout(&self, post: u8) -> Option<u32> {
        self.places
            .iter()
            .find(|(p, _)| *p == post)
            .map(|(_, amount)| *amount)
    }
}

/// One runner-in-race with its trailing aggregates.
///
/// Aggregates are `None` when the horse has no qualifying prior start; the
/// feature assembler owns the fill policy.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub key: RaceKey,
    pub surface: Surface,
    pub distance: u32,
    pub direction: TrackDirection,
    pub going_code: Option<u8>,
    pub race_class: String,
    pub field_size: u8,

    pub horse_id: String,
    pub horse_name: String,
    pub post_position: u8,
    pub age: Option<u8>,
    pub weight_carried: f64,
    pub win_odds: Option<f64>,
    pub popularity: Option<u8>,
    pub finish_position: Option<u8>,

    pub class_weight: f64,
    pub career_starts: i64,
    pub recent_rel_finish_3: Option<f64>,
    pub history_3: i64,
    pub recent_rel_finish_5: Option<f64>,
    pub recent_rel_finish_sq_5: Option<f64>,
    pub history_5: i64,
    pub past_score: Option<f64>,
    pub last3f_index: Option<f64>,
    /// Trailing performance per distance band, indexed like [`crate::types::DistanceBand::ALL`]
    pub band_scores: [Option<f64>; 4],
    pub surface_turf: Option<f64>,
    pub surface_dirt: Option<f64>,
    pub direction_left: Option<f64>,
    pub direction_right: Option<f64>,
    pub prev_race_date: Option<NaiveDate>,
    pub prev_distance: Option<u32>,
    pub prev_class_weight: Option<f64>,
    pub jockey_recent_score: Option<f64>,
    pub jockey_rides: i64,
    pub trainer_recent_score: Option<f64>,
    pub trainer_rides: i64,

    /// Same-race field statistics of the 3-start trailing score
    pub field_mean_3: f64,
    pub field_sq_3: f64,
    pub field_weight_mean: f64,
    pub field_weight_sq: f64,
    pub entered: i64,

    pub payout: Option<Payout>,
}

impl QueryRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let win_post: Option<u8> = row.get("win_post")?;
        let payout = if win_post.is_some() {
            let mut places = Vec::with_capacity(3);
            for i in 1..=3 {
                let post: Option<u8> = row.get(format!("place_post_{}", i).as_str())?;
                let amount: Option<u32> = row.get(format!("place_payout_{}", i).as_str())?;
                if let (Some(post), Some(amount)) = (post, amount) {
                    places.push((post, amount));
                }
            }
            Some(Payout {
                win_post,
                win_payout: row.get("win_payout")?,
                places,
            })
        } else {
            None
        };

        Ok(Self {
            key: RaceKey::new(
                row.get::<_, String>("venue_code")?,
                row.get("race_date")?,
                row.get("race_number")?,
            ),
            surface: row.get("surface")?,
            distance: row.get("distance")?,
            direction: row.get("direction")?,
            going_code: row.get("going_code")?,
            race_class: row.get("race_class")?,
            field_size: row.get("field_size")?,
            horse_id: row.get("horse_id")?,
            horse_name: row.get("horse_name")?,
            post_position: row.get("post_position")?,
            age: row.get("age")?,
            weight_carried: row.get("weight_carried")?,
            win_odds: row.get("win_odds")?,
            popularity: row.get("popularity")?,
            finish_position: row.get("finish_position")?,
            class_weight: row.get("class_weight")?,
            career_starts: row.get("career_starts")?,
            recent_rel_finish_3: row.get("recent_rel_finish_3")?,
            history_3: row.get("history_3")?,
            recent_rel_finish_5: row.get("recent_rel_finish_5")?,
            recent_rel_finish_sq_5: row.get("recent_rel_finish_sq_5")?,
            history_5: row.get("history_5")?,
            past_score: row.get("past_score")?,
            last3f_index: row.get("last3f_index")?,
            band_scores: [
                row.get("band_sprint")?,
                row.get("band_mile")?,
                row.get("band_middle")?,
                row.get("band_long")?,
            ],
            surface_turf: row.get("surface_turf")?,
            surface_dirt: row.get("surface_dirt")?,
            direction_left: row.get("direction_left")?,
            direction_right: row.get("direction_right")?,
            prev_race_date: row.get("prev_race_date")?,
            prev_distance: row.get("prev_distance")?,
            prev_class_weight: row.get("prev_class_weight")?,
            jockey_recent_score: row.get("jockey_recent_score")?,
            jockey_rides: row.get("jockey_rides")?,
            trainer_recent_score: row.get("trainer_recent_score")?,
            trainer_rides: row.get("trainer_rides")?,
            field_mean_3: row.get("field_mean_3")?,
            field_sq_3: row.get("field_sq_3")?,
            field_weight_mean: row.get("field_weight_mean")?,
            field_weight_sq: row.get("field_weight_sq")?,
            entered: row.get("entered")?,
            payout,
        })
    }

    /// Fewer prior starts than the widest trailing window
    pub fn insufficient_history(&self) -> bool {
        self.history_5 < HISTORY_WINDOW
    }
}

const RACE_COLUMNS: &str = "r.venue_code, r.race_date, r.race_number, r.surface, r.distance, \
     r.direction, r.going_code, r.grade_code, r.condition_code, r.race_class, r.field_size";

const ENTRY_COLUMNS: &str = "e.horse_id, e.horse_name, e.post_position, e.age, e.jockey_id, \
     e.trainer_id, e.weight_carried, e.win_odds, e.popularity";

const RACE_JOIN: &str =
    "e.venue_code = r.venue_code AND e.race_date = r.race_date AND e.race_number = r.race_number";

/// Per-start scores. `rel_finish` discounts the beaten-field share by the
/// margin behind the winner; `class_weight` is the class-weight score.
const SCORED_CTE: &str = r#"
scored AS (
    SELECT b.*,
           julianday(b.race_date) AS day_number,
           CASE
               WHEN b.finish_position IS NULL OR b.field_size <= 0 THEN NULL
               ELSE (1.0 - CAST(b.finish_position AS REAL) / b.field_size) *
                    CASE
                        WHEN b.finish_position = 1 THEN 1.00
                        WHEN b.time_behind <= 0.5 THEN 0.85
                        WHEN b.time_behind <= 1.0 THEN 0.70
                        WHEN b.time_behind <= 2.0 THEN 0.50
                        WHEN b.time_behind <= 3.0 THEN 0.30
                        ELSE 0.20
                    END
           END AS rel_finish,
           CASE b.grade_code
               WHEN 'A' THEN 3.00
               WHEN 'B' THEN 2.00
               WHEN 'C' THEN 1.50
               ELSE CASE b.condition_code
                   WHEN '999' THEN 1.00
                   WHEN '016' THEN 0.80
                   WHEN '010' THEN 0.60
                   WHEN '005' THEN 0.40
                   ELSE 0.20
               END
           END AS class_weight,
           CASE
               WHEN b.finish_position IS NULL THEN NULL
               WHEN b.finish_position = 1 THEN 100
               WHEN b.finish_position = 2 THEN 80
               WHEN b.finish_position = 3 THEN 60
               WHEN b.finish_position = 4 THEN 40
               WHEN b.finish_position = 5 THEN 30
               WHEN b.finish_position = 6 THEN 20
               WHEN b.finish_position = 7 THEN 10
               ELSE 5
           END AS finish_points,
           CASE
               WHEN b.last_3f IS NULL OR b.last_3f <= 0 THEN NULL
               ELSE b.last_3f - CASE
                   WHEN b.distance <= 1600 THEN 33.5
                   WHEN b.distance <= 2000 THEN 35.0
                   WHEN b.distance <= 2400 THEN 36.0
                   ELSE 37.0
               END
           END AS last3f_gap,
           CASE
               WHEN b.distance <= 1400 THEN 'sprint'
               WHEN b.distance <= 1800 THEN 'mile'
               WHEN b.distance <= 2200 THEN 'middle'
               ELSE 'long'
           END AS band
    FROM base b
)"#;

const WINDOWED_CTE: &str = r#"
windowed AS (
    SELECT s.*,
           COUNT(s.rel_finish) OVER horse_all AS career_starts,
           AVG(s.rel_finish) OVER horse_3 AS recent_rel_finish_3,
           COUNT(s.rel_finish) OVER horse_3 AS history_3,
           AVG(s.rel_finish) OVER horse_5 AS recent_rel_finish_5,
           AVG(s.rel_finish * s.rel_finish) OVER horse_5 AS recent_rel_finish_sq_5,
           COUNT(s.rel_finish) OVER horse_5 AS history_5,
           SUM(s.finish_points * s.class_weight) OVER horse_3 AS past_score,
           AVG(s.last3f_gap) OVER horse_3 AS last3f_index,
           AVG(CASE WHEN s.band = 'sprint' THEN s.rel_finish END) OVER horse_10 AS band_sprint,
           AVG(CASE WHEN s.band = 'mile' THEN s.rel_finish END) OVER horse_10 AS band_mile,
           AVG(CASE WHEN s.band = 'middle' THEN s.rel_finish END) OVER horse_10 AS band_middle,
           AVG(CASE WHEN s.band = 'long' THEN s.rel_finish END) OVER horse_10 AS band_long,
           AVG(CASE WHEN s.surface = 'turf' THEN s.rel_finish END) OVER horse_10 AS surface_turf,
           AVG(CASE WHEN s.surface = 'dirt' THEN s.rel_finish END) OVER horse_10 AS surface_dirt,
           AVG(CASE WHEN s.direction = 'left' THEN s.rel_finish END) OVER horse_10 AS direction_left,
           AVG(CASE WHEN s.direction = 'right' THEN s.rel_finish END) OVER horse_10 AS direction_right,
           LAG(s.race_date) OVER horse_order AS prev_race_date,
           LAG(s.distance) OVER horse_order AS prev_distance,
           LAG(s.class_weight) OVER horse_order AS prev_class_weight,
           CASE WHEN s.jockey_id IS NULL THEN NULL
                ELSE AVG(s.rel_finish) OVER jockey_recent END AS jockey_recent_score,
           CASE WHEN s.jockey_id IS NULL THEN 0
                ELSE COUNT(s.rel_finish) OVER jockey_recent END AS jockey_rides,
           CASE WHEN s.trainer_id IS NULL THEN NULL
                ELSE AVG(s.rel_finish) OVER trainer_recent END AS trainer_recent_score,
           CASE WHEN s.trainer_id IS NULL THEN 0
                ELSE COUNT(s.rel_finish) OVER trainer_recent END AS trainer_rides
    FROM scored s
    WINDOW horse_order AS (PARTITION BY s.horse_id ORDER BY s.race_date, s.race_number),
           horse_all AS (horse_order ROWS BETWEEN UNBOUNDED PRECEDING AND 1 PRECEDING),
           horse_3 AS (horse_order ROWS BETWEEN 3 PRECEDING AND 1 PRECEDING),
           horse_5 AS (horse_order ROWS BETWEEN 5 PRECEDING AND 1 PRECEDING),
           horse_10 AS (horse_order ROWS BETWEEN 10 PRECEDING AND 1 PRECEDING),
           jockey_recent AS (PARTITION BY s.jockey_id ORDER BY s.day_number
                             RANGE BETWEEN {days} PRECEDING AND 1 PRECEDING),
           trainer_recent AS (PARTITION BY s.trainer_id ORDER BY s.day_number
                              RANGE BETWEEN {days} PRECEDING AND 1 PRECEDING)
)"#;

const OUTPUT_COLUMNS: &str = r#"
       f.venue_code, f.race_date, f.race_number, f.surface, f.distance, f.direction,
       f.going_code, f.race_class, f.field_size,
       f.horse_id, f.horse_name, f.post_position, f.age, f.weight_carried,
       f.win_odds, f.popularity, f.finish_position,
       f.class_weight, f.career_starts, f.recent_rel_finish_3, f.history_3,
       f.recent_rel_finish_5, f.recent_rel_finish_sq_5, f.history_5,
       f.past_score, f.last3f_index,
       f.band_sprint, f.band_mile, f.band_middle, f.band_long,
       f.surface_turf, f.surface_dirt, f.direction_left, f.direction_right,
       f.prev_race_date, f.prev_distance, f.prev_class_weight,
       f.jockey_recent_score, f.jockey_rides, f.trainer_recent_score, f.trainer_rides,
       f.field_mean_3, f.field_sq_3, f.field_weight_mean, f.field_weight_sq, f.entered"#;

const PAYOUT_COLUMNS: &str = "p.win_post, p.win_payout, p.place_post_1, p.place_payout_1, \
     p.place_post_2, p.place_payout_2, p.place_post_3, p.place_payout_3";

const NO_PAYOUT_COLUMNS: &str = "NULL AS win_post, NULL AS win_payout, \
     NULL AS place_post_1, NULL AS place_payout_1, NULL AS place_post_2, \
     NULL AS place_payout_2, NULL AS place_post_3, NULL AS place_payout_3";

/// Builds [`RaceQuery`] values from a [`FilterSpec`]
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    /// Trailing score used for history-less runners in same-race statistics
    neutral_score: f64,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new(crate::features::NEUTRAL_SCORE)
    }
}

impl QueryBuilder {
    pub fn new(neutral_score: f64) -> Self {
        Self { neutral_score }
    }

    pub fn build(&self, filter: &FilterSpec, source: Source) -> Result<RaceQuery> {
        if source == Source::Speculative && filter.include_payouts {
            return Err(PipelineError::InvalidFilter(
                "payouts are not available for speculative races".to_string(),
            ));
        }
        let (first_day, last_day) = filter
            .years
            .first_day()
            .zip(filter.years.last_day())
            .ok_or_else(|| {
                PipelineError::InvalidFilter(format!("year range {} out of range", filter.years))
            })?;

        let mut params: Vec<(String, Value)> = vec![
            (":history_end".into(), Value::Text(last_day.to_string())),
            (":date_from".into(), Value::Text(first_day.to_string())),
            (":date_to".into(), Value::Text(last_day.to_string())),
            (":surface".into(), Value::Text(filter.surface.as_str().into())),
            (":min_distance".into(), Value::Integer(filter.distance.min.into())),
            (":neutral_score".into(), Value::Real(self.neutral_score)),
        ];

        let mut conditions = vec![
            "w.is_target = 1".to_string(),
            "w.race_date BETWEEN :date_from AND :date_to".to_string(),
            "w.surface = :surface".to_string(),
            "w.distance >= :min_distance".to_string(),
        ];
        if let VenueFilter::Only(venue) = filter.venue {
            conditions.push("w.venue_code = :venue".to_string());
            params.push((":venue".into(), Value::Text(venue.code().into())));
        }
        if let Some(max) = filter.distance.max {
            conditions.push("w.distance <= :max_distance".to_string());
            params.push((":max_distance".into(), Value::Integer(max.into())));
        }
        match filter.race_class {
            RaceClassFilter::Any => {}
            RaceClassFilter::ThreeYearOld => conditions.push("w.race_class = '12'".to_string()),
            RaceClassFilter::ThreeYearOldAndUp => {
                conditions.push("CAST(w.race_class AS INTEGER) >= 13".to_string())
            }
        }

        let (payout_columns, payout_join) = if filter.include_payouts {
            (
                PAYOUT_COLUMNS,
                "LEFT JOIN payouts p ON p.venue_code = f.venue_code \
                 AND p.race_date = f.race_date AND p.race_number = f.race_number",
            )
        } else {
            (NO_PAYOUT_COLUMNS, "")
        };

        let sql = format!(
            "WITH\n{base},{scored},{windowed},\n{fielded}\nSELECT {columns},\n       {payout_columns}\nFROM fielded f\n{payout_join}\nORDER BY f.race_date, f.venue_code, f.race_number, f.post_position",
            base = base_cte(source),
            scored = SCORED_CTE,
            windowed = WINDOWED_CTE.replace("{days}", &CONNECTION_WINDOW_DAYS.to_string()),
            fielded = fielded_cte(&conditions),
            columns = OUTPUT_COLUMNS,
            payout_columns = payout_columns,
            payout_join = payout_join,
        );

        tracing::debug!(source = source.as_str(), filter = %filter, "built race query");

        Ok(RaceQuery {
            sql,
            params,
            source,
        })
    }
}

/// Rows every aggregate is computed over. Speculative cards are appended to
/// confirmed history with result columns NULL and are the only targets.
fn base_cte(source: Source) -> String {
    let history = |is_target: u8| {
        format!(
            "SELECT {RACE_COLUMNS}, {ENTRY_COLUMNS}, \
             e.finish_position, e.time_behind, e.last_3f, {is_target} AS is_target \
             FROM races r JOIN runners e ON {RACE_JOIN} \
             WHERE r.race_date <= :history_end"
        )
    };
    let body = match source {
        Source::Historical => history(1),
        Source::Speculative => format!(
            "{} AND NOT EXISTS (SELECT 1 FROM speculative_races x \
             WHERE x.venue_code = r.venue_code AND x.race_date = r.race_date \
             AND x.race_number = r.race_number)\n    UNION ALL\n    \
             SELECT {RACE_COLUMNS}, {ENTRY_COLUMNS}, \
             NULL AS finish_position, NULL AS time_behind, NULL AS last_3f, 1 AS is_target \
             FROM speculative_races r JOIN speculative_runners e ON {RACE_JOIN}",
            history(0)
        ),
    };
    format!("base AS (\n    {}\n)", body)
}

/// Target rows with same-race field statistics. Filters are race-level, so
/// every runner of a selected race lands in the same partition.
fn fielded_cte(conditions: &[String]) -> String {
    format!(
        r#"fielded AS (
    SELECT w.*,
           AVG(COALESCE(w.recent_rel_finish_3, :neutral_score)) OVER race_field AS field_mean_3,
           AVG(COALESCE(w.recent_rel_finish_3, :neutral_score)
               * COALESCE(w.recent_rel_finish_3, :neutral_score)) OVER race_field AS field_sq_3,
           AVG(w.weight_carried) OVER race_field AS field_weight_mean,
           AVG(w.weight_carried * w.weight_carried) OVER race_field AS field_weight_sq,
           COUNT(*) OVER race_field AS entered
    FROM windowed w
    WHERE {}
    WINDOW race_field AS (PARTITION BY w.venue_code, w.race_date, w.race_number)
)"#,
        conditions.join("\n      AND ")
    )
}
