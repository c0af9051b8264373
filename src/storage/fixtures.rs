//! Synthetic history for tests.

use chrono::NaiveDate;

use super::repository::{PayoutRecord, RaceRecord, RaceRepository, RunnerRecord, RunnerResult};
use crate::types::{RaceKey, Source, Surface, TrackDirection};

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Left-handed, good going, open-class race of 16 runners
pub fn race(venue: &str, day: &str, number: u8, surface: Surface, distance: u32) -> RaceRecord {
    RaceRecord {
        key: RaceKey::new(venue, date(day), number),
        surface,
        distance,
        direction: TrackDirection::Left,
        going_code: Some(1),
        grade_code: String::new(),
        condition_code: "999".to_string(),
        race_class: "13".to_string(),
        field_size: 16,
    }
}

/// Runner with jockey/trainer derived from the post; `finish` of `None`
/// leaves results unset.
pub fn runner(key: &RaceKey, horse_id: &str, post: u8, finish: Option<u8>) -> RunnerRecord {
    RunnerRecord {
        key: key.clone(),
        horse_id: horse_id.to_string(),
        horse_name: format!("Horse {}", horse_id),
        post_position: post,
        age: Some(4),
        sex: Some("M".to_string()),
        jockey_id: Some(format!("J{:02}", post)),
        trainer_id: Some(format!("T{:02}", post)),
        weight_carried: 56.0,
        win_odds: Some(2.0 + post as f64),
        popularity: Some(post),
        result: finish.map(|pos| RunnerResult {
            finish_position: pos,
            finish_time: Some(120.0 + 0.2 * (pos - 1) as f64),
            time_behind: Some(0.2 * (pos - 1) as f64),
            last_3f: Some(34.5),
            corners: [Some(pos), Some(pos), Some(pos), Some(pos)],
        }),
    }
}

/// Insert `race` with one runner per `(horse_id, finish)` entry, posts
/// assigned in order. `field_size` is set to the number of entries.
pub fn seed_race(
    repo: &RaceRepository,
    mut race: RaceRecord,
    entries: &[(&str, u8)],
    source: Source,
) -> RaceRecord {
    race.field_size = entries.len() as u8;
    repo.insert_race(&race, source).unwrap();
    for (i, (horse, finish)) in entries.iter().enumerate() {
        let post = (i + 1) as u8;
        match source {
            Source::Historical => repo
                .insert_runner(&runner(&race.key, horse, post, Some(*finish)))
                .unwrap(),
            Source::Speculative => repo
                .insert_speculative_runner(&runner(&race.key, horse, post, None))
                .unwrap(),
        }
    }
    race
}

/// Win payout to post 1, place payouts to posts 1..=3
pub fn seed_payout(repo: &RaceRepository, key: &RaceKey) {
    repo.insert_payout(&PayoutRecord {
        key: key.clone(),
        win_post: 1,
        win_payout: 350,
        places: vec![(1, 150), (2, 210), (3, 330)],
    })
    .unwrap();
}
