//! Domain vocabulary shared by the query, feature and model layers.

use chrono::{Datelike, NaiveDate};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};

/// JRA racecourse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Sapporo,
    Hakodate,
    Fukushima,
    Niigata,
    Tokyo,
    Nakayama,
    Chukyo,
    Kyoto,
    Hanshin,
    Kokura,
}

impl Venue {
    pub const ALL: [Venue; 10] = [
        Venue::Sapporo,
        Venue::Hakodate,
        Venue::Fukushima,
        Venue::Niigata,
        Venue::Tokyo,
        Venue::Nakayama,
        Venue::Chukyo,
        Venue::Kyoto,
        Venue::Hanshin,
        Venue::Kokura,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Venue::Sapporo => "01",
            Venue::Hakodate => "02",
            Venue::Fukushima => "03",
            Venue::Niigata => "04",
            Venue::Tokyo => "05",
            Venue::Nakayama => "06",
            Venue::Chukyo => "07",
            Venue::Kyoto => "08",
            Venue::Hanshin => "09",
            Venue::Kokura => "10",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.code() == code.trim())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Venue::Sapporo => "Sapporo",
            Venue::Hakodate => "Hakodate",
            Venue::Fukushima => "Fukushima",
            Venue::Niigata => "Niigata",
            Venue::Tokyo => "Tokyo",
            Venue::Nakayama => "Nakayama",
            Venue::Chukyo => "Chukyo",
            Venue::Kyoto => "Kyoto",
            Venue::Hanshin => "Hanshin",
            Venue::Kokura => "Kokura",
        }
    }
}

/// Venue selection for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueFilter {
    All,
    Only(Venue),
}

impl FromStr for VenueFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(VenueFilter::All);
        }
        Venue::from_code(s)
            .map(VenueFilter::Only)
            .ok_or_else(|| PipelineError::InvalidFilter(format!("unknown venue code '{}'", s)))
    }
}

impl fmt::Display for VenueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueFilter::All => write!(f, "all"),
            VenueFilter::Only(v) => write!(f, "{}", v.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Turf,
    Dirt,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Turf => "turf",
            Surface::Dirt => "dirt",
        }
    }
}

impl FromStr for Surface {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "turf" => Ok(Surface::Turf),
            "dirt" => Ok(Surface::Dirt),
            other => Err(PipelineError::InvalidFilter(format!(
                "surface must be turf or dirt, got '{}'",
                other
            ))),
        }
    }
}

/// Direction of travel around the course
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackDirection {
    Left,
    Right,
    Straight,
}

impl TrackDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackDirection::Left => "left",
            TrackDirection::Right => "right",
            TrackDirection::Straight => "straight",
        }
    }
}

impl FromStr for TrackDirection {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "left" => Ok(TrackDirection::Left),
            "right" => Ok(TrackDirection::Right),
            "straight" => Ok(TrackDirection::Straight),
            other => Err(PipelineError::InvalidFilter(format!(
                "unknown track direction '{}'",
                other
            ))),
        }
    }
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: PipelineError| FromSqlError::Other(e.to_string().into()))
            }
        }
    };
}

sql_text_enum!(Surface);
sql_text_enum!(TrackDirection);

/// Distance category with its interpolation center
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistanceBand {
    Sprint,
    Mile,
    Middle,
    Long,
}

impl DistanceBand {
    pub const ALL: [DistanceBand; 4] = [
        DistanceBand::Sprint,
        DistanceBand::Mile,
        DistanceBand::Middle,
        DistanceBand::Long,
    ];

    pub fn center(&self) -> f64 {
        match self {
            DistanceBand::Sprint => 1200.0,
            DistanceBand::Mile => 1600.0,
            DistanceBand::Middle => 2000.0,
            DistanceBand::Long => 2400.0,
        }
    }
}

/// Race-class category used to select model populations.
///
/// Class codes follow the JRA race-type table: `12` is three-year-olds only,
/// `13` and above are races open to three-year-olds and up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceClassFilter {
    Any,
    ThreeYearOld,
    ThreeYearOldAndUp,
}

impl FromStr for RaceClassFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "any" | "all" => Ok(RaceClassFilter::Any),
            "12" => Ok(RaceClassFilter::ThreeYearOld),
            "13" => Ok(RaceClassFilter::ThreeYearOldAndUp),
            other => Err(PipelineError::InvalidFilter(format!(
                "race class must be 12, 13 or any, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RaceClassFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceClassFilter::Any => write!(f, "any"),
            RaceClassFilter::ThreeYearOld => write!(f, "3yo"),
            RaceClassFilter::ThreeYearOldAndUp => write!(f, "3yo+"),
        }
    }
}

/// Inclusive range of calendar years
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> Result<Self> {
        if start > end {
            return Err(PipelineError::InvalidFilter(format!(
                "year range {}-{} is inverted",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(year: i32) -> Self {
        Self {
            start: year,
            end: year,
        }
    }

    pub fn overlaps(&self, other: &YearRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.start..=self.end).contains(&date.year())
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.start, 1, 1)
    }

    pub fn last_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.end, 12, 31)
    }
}

impl fmt::Display for YearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Upper bound value meaning "no upper bound" in model definitions
pub const OPEN_DISTANCE: u32 = 9999;

/// Inclusive distance range; `max == None` is open-ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistanceRange {
    pub min: u32,
    pub max: Option<u32>,
}

impl DistanceRange {
    pub fn new(min: u32, max: u32) -> Result<Self> {
        let max = (max != OPEN_DISTANCE).then_some(max);
        if let Some(max) = max {
            if min > max {
                return Err(PipelineError::InvalidFilter(format!(
                    "distance range {}-{} is inverted",
                    min, max
                )));
            }
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, distance: u32) -> bool {
        distance >= self.min && self.max.map_or(true, |max| distance <= max)
    }
}

impl fmt::Display for DistanceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}-{}m", self.min, max),
            None => write!(f, "{}m+", self.min),
        }
    }
}

/// Race identity: (venue, date, race number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaceKey {
    pub date: NaiveDate,
    pub venue_code: String,
    pub race_number: u8,
}

impl RaceKey {
    pub fn new(venue_code: impl Into<String>, date: NaiveDate, race_number: u8) -> Self {
        Self {
            date,
            venue_code: venue_code.into(),
            race_number,
        }
    }

    pub fn venue_name(&self) -> &str {
        Venue::from_code(&self.venue_code).map_or(self.venue_code.as_str(), |v| v.name())
    }
}

impl fmt::Display for RaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} R{}", self.date, self.venue_name(), self.race_number)
    }
}

/// Which fact tables a query reads its target rows from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Historical,
    Speculative,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Historical => "historical",
            Source::Speculative => "speculative",
        }
    }
}

/// Race selection handed to the query builder
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub venue: VenueFilter,
    pub years: YearRange,
    pub surface: Surface,
    pub distance: DistanceRange,
    pub race_class: RaceClassFilter,
    /// Attach settlement columns; only meaningful for historical rows.
    pub include_payouts: bool,
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} class={}",
            self.venue,
            self.years,
            self.surface.as_str(),
            self.distance,
            self.race_class
        )
    }
}
