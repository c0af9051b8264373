//! SQLite repository for the historical record store

use chrono::NaiveDate;
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::schema::create_tables;
use crate::error::{PipelineError, Result};
use crate::query::{QueryRow, RaceQuery};
use crate::types::{RaceKey, Source, Surface, TrackDirection};

/// Race-level attributes, identical for confirmed and speculative races
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceRecord {
    #[serde(flatten)]
    pub key: RaceKey,
    pub surface: Surface,
    pub distance: u32,
    pub direction: TrackDirection,
    pub going_code: Option<u8>,
    #[serde(default)]
    pub grade_code: String,
    pub condition_code: String,
    pub race_class: String,
    pub field_size: u8,
}

/// Result fields attached once a race has run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerResult {
    pub finish_position: u8,
    #[serde(default)]
    pub finish_time: Option<f64>,
    /// Seconds behind the winner
    #[serde(default)]
    pub time_behind: Option<f64>,
    #[serde(default)]
    pub last_3f: Option<f64>,
    #[serde(default)]
    pub corners: [Option<u8>; 4],
}

/// Runner-in-race record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRecord {
    #[serde(flatten)]
    pub key: RaceKey,
    pub horse_id: String,
    pub horse_name: String,
    pub post_position: u8,
    pub age: Option<u8>,
    pub sex: Option<String>,
    pub jockey_id: Option<String>,
    pub trainer_id: Option<String>,
    pub weight_carried: f64,
    pub win_odds: Option<f64>,
    pub popularity: Option<u8>,
    #[serde(default)]
    pub result: Option<RunnerResult>,
}

/// Win and place settlement of a confirmed race
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    #[serde(flatten)]
    pub key: RaceKey,
    pub win_post: u8,
    pub win_payout: u32,
    /// Up to three (post, payout) pairs
    pub places: Vec<(u8, u32)>,
}

/// Records delivered by an external ingestion process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordBatch {
    #[serde(default)]
    pub races: Vec<RaceRecord>,
    #[serde(default)]
    pub runners: Vec<RunnerRecord>,
    #[serde(default)]
    pub payouts: Vec<PayoutRecord>,
}

/// Repository for historical and speculative race data
pub struct RaceRepository {
    conn: Connection,
}

impl RaceRepository {
    /// Open the database, creating it and its tables if needed
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;

        Ok(Self { conn })
    }

    /// Create an in-memory repository (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        Ok(Self { conn })
    }

    // ==================== Insert Operations ====================

    /// Insert a race (upsert) into the table for `source`
    pub fn insert_race(&self, race: &RaceRecord, source: Source) -> Result<()> {
        let table = match source {
            Source::Historical => "races",
            Source::Speculative => "speculative_races",
        };
        self.conn.execute(
            &format!(
                r#"
            INSERT OR REPLACE INTO {}
            (venue_code, race_date, race_number, surface, distance, direction,
             going_code, grade_code, condition_code, race_class, field_size)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
                table
            ),
            params![
                race.key.venue_code,
                race.key.date,
                race.key.race_number,
                race.surface,
                race.distance,
                race.direction,
                race.going_code,
                race.grade_code,
                race.condition_code,
                race.race_class,
                race.field_size,
            ],
        )?;
        Ok(())
    }

    /// Insert a confirmed runner (upsert), results included
    pub fn insert_runner(&self, runner: &RunnerRecord) -> Result<()> {
        let result = runner.result.clone().unwrap_or_default();
        let finish_position = runner.result.as_ref().map(|r| r.finish_position);
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO runners
            (venue_code, race_date, race_number, horse_id, horse_name, post_position,
             age, sex, jockey_id, trainer_id, weight_carried, win_odds, popularity,
             finish_position, finish_time, time_behind, last_3f,
             corner_1, corner_2, corner_3, corner_4)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
            params![
                runner.key.venue_code,
                runner.key.date,
                runner.key.race_number,
                runner.horse_id,
                runner.horse_name,
                runner.post_position,
                runner.age,
                runner.sex,
                runner.jockey_id,
                runner.trainer_id,
                runner.weight_carried,
                runner.win_odds,
                runner.popularity,
                finish_position,
                result.finish_time,
                result.time_behind,
                result.last_3f,
                result.corners[0],
                result.corners[1],
                result.corners[2],
                result.corners[3],
            ],
        )?;
        Ok(())
    }

    /// Insert a pre-result runner (upsert); any result fields are not stored
    pub fn insert_speculative_runner(&self, runner: &RunnerRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO speculative_runners
            (venue_code, race_date, race_number, horse_id, horse_name, post_position,
             age, sex, jockey_id, trainer_id, weight_carried, win_odds, popularity)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                runner.key.venue_code,
                runner.key.date,
                runner.key.race_number,
                runner.horse_id,
                runner.horse_name,
                runner.post_position,
                runner.age,
                runner.sex,
                runner.jockey_id,
                runner.trainer_id,
                runner.weight_carried,
                runner.win_odds,
                runner.popularity,
            ],
        )?;
        Ok(())
    }

    /// Insert win/place settlements (upsert)
    pub fn insert_payout(&self, payout: &PayoutRecord) -> Result<()> {
        let place = |i: usize| payout.places.get(i).copied().unzip();
        let (post_1, pay_1) = place(0);
        let (post_2, pay_2) = place(1);
        let (post_3, pay_3) = place(2);
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO payouts
            (venue_code, race_date, race_number, win_post, win_payout,
             place_post_1, place_payout_1, place_post_2, place_payout_2,
             place_post_3, place_payout_3)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                payout.key.venue_code,
                payout.key.date,
                payout.key.race_number,
                payout.win_post,
                payout.win_payout,
                post_1,
                pay_1,
                post_2,
                pay_2,
                post_3,
                pay_3,
            ],
        )?;
        Ok(())
    }

    /// Upsert a whole batch in one transaction; nothing is kept if any
    /// record fails. Speculative batches cannot carry payouts.
    pub fn import(&self, batch: &RecordBatch, source: Source) -> Result<()> {
        if source == Source::Speculative && !batch.payouts.is_empty() {
            return Err(PipelineError::InvalidFilter(
                "payouts cannot be imported for speculative races".to_string(),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;
        for race in &batch.races {
            self.insert_race(race, source)?;
        }
        for runner in &batch.runners {
            match source {
                Source::Historical => self.insert_runner(runner)?,
                Source::Speculative => self.insert_speculative_runner(runner)?,
            }
        }
        for payout in &batch.payouts {
            self.insert_payout(payout)?;
        }
        tx.commit()?;

        info!(
            source = source.as_str(),
            races = batch.races.len(),
            runners = batch.runners.len(),
            payouts = batch.payouts.len(),
            "records imported"
        );
        Ok(())
    }

    // ==================== Query Operations ====================

    /// Row counts per table, in schema order
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::new();
        for table in [
            "races",
            "runners",
            "speculative_races",
            "speculative_runners",
            "payouts",
        ] {
            let count: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
            counts.push((table, count));
        }
        Ok(counts)
    }

    /// First and last race date held for `source`
    pub fn date_span(&self, source: Source) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let table = match source {
            Source::Historical => "races",
            Source::Speculative => "speculative_races",
        };
        let span: (Option<NaiveDate>, Option<NaiveDate>) = self.conn.query_row(
            &format!("SELECT MIN(race_date), MAX(race_date) FROM {}", table),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(span.0.zip(span.1))
    }

    /// Execute a built query, materializing every selected row
    pub fn fetch(&self, query: &RaceQuery) -> Result<Vec<QueryRow>> {
        let mut stmt = self.conn.prepare(&query.sql)?;
        let bound: Vec<(&str, &dyn ToSql)> = query
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        let rows = stmt
            .query_map(bound.as_slice(), QueryRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixtures::{date, race, runner};

    #[test]
    fn test_insert_and_count() {
        let repo = RaceRepository::in_memory().unwrap();
        let r = race("05", "2023-05-28", 11, Surface::Turf, 2400);
        repo.insert_race(&r, Source::Historical).unwrap();
        repo.insert_runner(&runner(&r.key, "H1", 1, Some(1))).unwrap();
        repo.insert_runner(&runner(&r.key, "H2", 2, Some(2))).unwrap();

        let counts = repo.table_counts().unwrap();
        assert_eq!(counts[0], ("races", 1));
        assert_eq!(counts[1], ("runners", 2));
        assert_eq!(counts[3], ("speculative_runners", 0));
    }

    #[test]
    fn test_upsert_replaces_runner() {
        let repo = RaceRepository::in_memory().unwrap();
        let r = race("05", "2023-05-28", 11, Surface::Turf, 2400);
        repo.insert_race(&r, Source::Historical).unwrap();
        repo.insert_runner(&runner(&r.key, "H1", 1, None)).unwrap();
        repo.insert_runner(&runner(&r.key, "H1", 1, Some(3))).unwrap();

        let counts = repo.table_counts().unwrap();
        assert_eq!(counts[1], ("runners", 1));
    }

    #[test]
    fn test_date_span() {
        let repo = RaceRepository::in_memory().unwrap();
        assert!(repo.date_span(Source::Speculative).unwrap().is_none());

        for d in ["2024-06-01", "2024-06-02"] {
            let r = race("06", d, 1, Surface::Dirt, 1200);
            repo.insert_race(&r, Source::Speculative).unwrap();
        }
        let span = repo.date_span(Source::Speculative).unwrap().unwrap();
        assert_eq!(span, (date("2024-06-01"), date("2024-06-02")));
    }

    const BATCH: &str = r#"{
        "races": [{
            "venue_code": "09", "date": "2024-04-07", "race_number": 11,
            "surface": "turf", "distance": 1600, "direction": "right",
            "going_code": 1, "grade_code": "A", "condition_code": "999",
            "race_class": "13", "field_size": 2
        }],
        "runners": [
            {
                "venue_code": "09", "date": "2024-04-07", "race_number": 11,
                "horse_id": "2021105001", "horse_name": "First", "post_position": 1,
                "age": 3, "sex": "F", "jockey_id": "J1", "trainer_id": "T1",
                "weight_carried": 55.0, "win_odds": 2.4, "popularity": 1,
                "result": {"finish_position": 1, "time_behind": 0.0, "last_3f": 33.8}
            },
            {
                "venue_code": "09", "date": "2024-04-07", "race_number": 11,
                "horse_id": "2021105002", "horse_name": "Second", "post_position": 2,
                "age": 3, "sex": "F", "jockey_id": "J2", "trainer_id": "T2",
                "weight_carried": 55.0, "win_odds": null, "popularity": null
            }
        ],
        "payouts": [{
            "venue_code": "09", "date": "2024-04-07", "race_number": 11,
            "win_post": 1, "win_payout": 240, "places": [[1, 110], [2, 180]]
        }]
    }"#;

    #[test]
    fn test_import_batch() {
        let repo = RaceRepository::in_memory().unwrap();
        let batch: RecordBatch = serde_json::from_str(BATCH).unwrap();
        repo.import(&batch, Source::Historical).unwrap();

        let counts = repo.table_counts().unwrap();
        assert_eq!(counts[0], ("races", 1));
        assert_eq!(counts[1], ("runners", 2));
        assert_eq!(counts[4], ("payouts", 1));
    }

    #[test]
    fn test_failed_import_keeps_nothing() {
        let repo = RaceRepository::in_memory().unwrap();
        let mut batch: RecordBatch = serde_json::from_str(BATCH).unwrap();
        // runner for a race that is not in the batch
        batch.runners[1].key = RaceKey::new("09", date("2024-04-08"), 11);
        assert!(repo.import(&batch, Source::Historical).is_err());
        assert_eq!(repo.table_counts().unwrap()[0], ("races", 0));
    }

    #[test]
    fn test_speculative_import_rejects_payouts() {
        let repo = RaceRepository::in_memory().unwrap();
        let mut batch: RecordBatch = serde_json::from_str(BATCH).unwrap();
        assert!(repo.import(&batch, Source::Speculative).is_err());

        batch.payouts.clear();
        repo.import(&batch, Source::Speculative).unwrap();
        let counts = repo.table_counts().unwrap();
        assert_eq!(counts[2], ("speculative_races", 1));
        assert_eq!(counts[3], ("speculative_runners", 2));
        assert_eq!(counts[1], ("runners", 0));
    }

    #[test]
    fn test_runner_requires_race() {
        let repo = RaceRepository::in_memory().unwrap();
        let key = RaceKey::new("05", date("2023-05-28"), 11);
        assert!(repo.insert_runner(&runner(&key, "H1", 1, Some(1))).is_err());
    }
}
