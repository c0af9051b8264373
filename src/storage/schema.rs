//! SQLite schema for the historical record store
//!
//! Tables:
//! - races / runners: confirmed races and their runners with results
//! - speculative_races / speculative_runners: pre-result cards, same
//!   attributes but no result columns
//! - payouts: win and place settlements for confirmed races

use rusqlite::{Connection, Result};

/// Race attributes shared by `races` and `speculative_races`.
const RACE_COLUMNS: &str = r#"
            venue_code TEXT NOT NULL,
            race_date TEXT NOT NULL,
            race_number INTEGER NOT NULL,
            surface TEXT NOT NULL CHECK (surface IN ('turf', 'dirt')),
            distance INTEGER NOT NULL,
            direction TEXT NOT NULL CHECK (direction IN ('left', 'right', 'straight')),
            going_code INTEGER,
            grade_code TEXT NOT NULL DEFAULT '',
            condition_code TEXT NOT NULL DEFAULT '',
            race_class TEXT NOT NULL,
            field_size INTEGER NOT NULL,
            PRIMARY KEY (venue_code, race_date, race_number)
"#;

/// Pre-race runner attributes shared by `runners` and `speculative_runners`.
const ENTRY_COLUMNS: &str = r#"
            venue_code TEXT NOT NULL,
            race_date TEXT NOT NULL,
            race_number INTEGER NOT NULL,
            horse_id TEXT NOT NULL,
            horse_name TEXT NOT NULL,
            post_position INTEGER NOT NULL,
            age INTEGER,
            sex TEXT,
            jockey_id TEXT,
            trainer_id TEXT,
            weight_carried REAL NOT NULL,
            win_odds REAL,
            popularity INTEGER,
"#;

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    for table in ["races", "speculative_races"] {
        conn.execute(
            &format!("CREATE TABLE IF NOT EXISTS {} ({})", table, RACE_COLUMNS),
            [],
        )?;
    }

    // Confirmed runners carry results
    conn.execute(
        &format!(
            r#"
        CREATE TABLE IF NOT EXISTS runners (
            {}
            finish_position INTEGER,
            finish_time REAL,
            time_behind REAL,
            last_3f REAL,
            corner_1 INTEGER,
            corner_2 INTEGER,
            corner_3 INTEGER,
            corner_4 INTEGER,
            PRIMARY KEY (venue_code, race_date, race_number, horse_id),
            FOREIGN KEY (venue_code, race_date, race_number)
                REFERENCES races(venue_code, race_date, race_number)
        )
        "#,
            ENTRY_COLUMNS
        ),
        [],
    )?;

    conn.execute(
        &format!(
            r#"
        CREATE TABLE IF NOT EXISTS speculative_runners (
            {}
            PRIMARY KEY (venue_code, race_date, race_number, horse_id),
            FOREIGN KEY (venue_code, race_date, race_number)
                REFERENCES speculative_races(venue_code, race_date, race_number)
        )
        "#,
            ENTRY_COLUMNS
        ),
        [],
    )?;

    // Settlement data, only joined for profit/loss reporting
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS payouts (
            venue_code TEXT NOT NULL,
            race_date TEXT NOT NULL,
            race_number INTEGER NOT NULL,
            win_post INTEGER,
            win_payout INTEGER,
            place_post_1 INTEGER,
            place_payout_1 INTEGER,
            place_post_2 INTEGER,
            place_payout_2 INTEGER,
            place_post_3 INTEGER,
            place_payout_3 INTEGER,
            PRIMARY KEY (venue_code, race_date, race_number),
            FOREIGN KEY (venue_code, race_date, race_number)
                REFERENCES races(venue_code, race_date, race_number)
        )
        "#,
        [],
    )?;

    // Trailing windows partition by horse, jockey and trainer
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runners_horse ON runners(horse_id, race_date, race_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runners_jockey ON runners(jockey_id, race_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runners_trainer ON runners(trainer_id, race_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_races_date ON races(race_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_speculative_races_date ON speculative_races(race_date)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM pragma_table_info('{}')", table))
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('races', 'runners', 'speculative_races', 'speculative_runners', 'payouts')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
    }

    #[test]
    fn test_speculative_tables_mirror_pre_race_columns() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        assert_eq!(
            column_names(&conn, "races"),
            column_names(&conn, "speculative_races")
        );

        let runners = column_names(&conn, "runners");
        let speculative = column_names(&conn, "speculative_runners");
        assert!(speculative.iter().all(|c| runners.contains(c)));
        assert!(!speculative.contains(&"finish_position".to_string()));
        assert!(!speculative.contains(&"last_3f".to_string()));
    }
}
