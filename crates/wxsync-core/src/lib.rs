//! Core domain model for daily temperature measurements.

use std::fmt;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wxsync-core";

/// Fixed time-of-day buckets used to aggregate raw samples into one daily record.
///
/// Intervals are half-open: a sample at 12:00 belongs to `Afternoon`, never `Morning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPart {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl DayPart {
    pub const ALL: [DayPart; 4] = [
        DayPart::Morning,
        DayPart::Afternoon,
        DayPart::Evening,
        DayPart::Night,
    ];

    pub fn start(self) -> NaiveTime {
        match self {
            DayPart::Night => NaiveTime::MIN,
            DayPart::Morning => hour(6),
            DayPart::Afternoon => hour(12),
            DayPart::Evening => hour(18),
        }
    }

    /// Exclusive end of the interval. `None` means the end of the day (24:00).
    pub fn end(self) -> Option<NaiveTime> {
        match self {
            DayPart::Night => Some(hour(6)),
            DayPart::Morning => Some(hour(12)),
            DayPart::Afternoon => Some(hour(18)),
            DayPart::Evening => None,
        }
    }

    pub fn contains(self, time: NaiveTime) -> bool {
        time >= self.start() && self.end().map_or(true, |end| time < end)
    }

    pub fn of(time: NaiveTime) -> DayPart {
        match time.hour() {
            0..=5 => DayPart::Night,
            6..=11 => DayPart::Morning,
            12..=17 => DayPart::Afternoon,
            _ => DayPart::Evening,
        }
    }
}

fn hour(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// One scraped reading: a time of day and an integer temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSample {
    pub time: NaiveTime,
    pub temperature: i32,
}

impl RawSample {
    pub fn new(time: NaiveTime, temperature: i32) -> Self {
        Self { time, temperature }
    }
}

/// Everything an extractor returns for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMeasurementSet {
    pub date: NaiveDate,
    pub samples: Vec<RawSample>,
}

impl RawMeasurementSet {
    pub fn new(date: NaiveDate, samples: Vec<RawSample>) -> Self {
        Self { date, samples }
    }

    /// Mean temperature of the samples falling inside `part`, rounded to two
    /// decimals with halves away from zero, or `0.0` when none do.
    pub fn average_for(&self, part: DayPart) -> f64 {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|s| part.contains(s.time))
            .fold((0i64, 0u32), |(sum, count), s| {
                (sum + i64::from(s.temperature), count + 1)
            });
        if count == 0 {
            0.0
        } else {
            (sum as f64 * 100.0 / f64::from(count)).round() / 100.0
        }
    }

    pub fn aggregate(&self) -> DailyMeasurement {
        DailyMeasurement {
            date: self.date,
            morning: self.average_for(DayPart::Morning),
            afternoon: self.average_for(DayPart::Afternoon),
            evening: self.average_for(DayPart::Evening),
            night: self.average_for(DayPart::Night),
        }
    }
}

/// Canonical daily record: one date, four day-part averages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyMeasurement {
    pub date: NaiveDate,
    pub morning: f64,
    pub afternoon: f64,
    pub evening: f64,
    pub night: f64,
}

impl DailyMeasurement {
    pub fn value(&self, part: DayPart) -> f64 {
        match part {
            DayPart::Morning => self.morning,
            DayPart::Afternoon => self.afternoon,
            DayPart::Evening => self.evening,
            DayPart::Night => self.night,
        }
    }

    /// All four samples exactly zero; such records are placeholders left by empty pages.
    pub fn is_placeholder(&self) -> bool {
        DayPart::ALL.iter().all(|p| self.value(*p) == 0.0)
    }

    pub fn min(&self) -> f64 {
        DayPart::ALL
            .iter()
            .map(|p| self.value(*p))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        DayPart::ALL
            .iter()
            .map(|p| self.value(*p))
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Deterministic identity for the canonical record of a date.
pub fn canonical_record_id(date: NaiveDate) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("wxsync:{date}").as_bytes())
}

/// Persisted form of a measurement. Stores may hold a timestamp with a non-midnight
/// time of day and may hold more than one record per date until correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRecord {
    pub id: Uuid,
    pub recorded_at: NaiveDateTime,
    pub morning: f64,
    pub afternoon: f64,
    pub evening: f64,
    pub night: f64,
}

impl TemperatureRecord {
    pub fn canonical(measurement: &DailyMeasurement) -> Self {
        Self {
            id: canonical_record_id(measurement.date),
            recorded_at: measurement.date.and_time(NaiveTime::MIN),
            morning: measurement.morning,
            afternoon: measurement.afternoon,
            evening: measurement.evening,
            night: measurement.night,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.recorded_at.date()
    }

    pub fn is_midnight(&self) -> bool {
        self.recorded_at.time() == NaiveTime::MIN
    }

    /// Same record with the timestamp moved to midnight of its calendar date.
    pub fn at_midnight(&self) -> Self {
        Self {
            recorded_at: self.date().and_time(NaiveTime::MIN),
            ..self.clone()
        }
    }

    pub fn measurement(&self) -> DailyMeasurement {
        DailyMeasurement {
            date: self.date(),
            morning: self.morning,
            afternoon: self.afternoon,
            evening: self.evening,
            night: self.night,
        }
    }
}

/// Inclusive, non-empty range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }

    /// Date `offset` days after `start`; `None` past the end of the range.
    pub fn nth(&self, offset: usize) -> Option<NaiveDate> {
        self.start
            .checked_add_days(Days::new(offset as u64))
            .filter(|d| *d <= self.end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Contiguous sub-range of dates assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatePartition {
    pub index: usize,
    pub range: DateRange,
}

/// City the archive tracks. `keyword` is the slug used by the sinoptik site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub code: u32,
    pub keyword: String,
    #[serde(default)]
    pub meteopost_station: Option<String>,
}

impl City {
    pub fn odessa() -> Self {
        Self {
            name: "odessa".to_string(),
            code: 111,
            keyword: "погода-одеса".to_string(),
            meteopost_station: Some("UKOO".to_string()),
        }
    }
}

impl fmt::Display for City {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
}

impl Season {
    pub fn of(date: NaiveDate) -> Season {
        match date.month() {
            12 | 1 | 2 => Season::Winter,
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            _ => Season::Autumn,
        }
    }

    /// Plausible (min, max) day-part temperature for the season.
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Season::Winter => (-30.0, 12.0),
            Season::Spring => (-10.0, 29.0),
            Season::Summer => (10.0, 40.0),
            Season::Autumn => (-5.0, 29.0),
        }
    }
}
