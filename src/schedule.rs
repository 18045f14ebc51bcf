use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};

use crate::config::{ScheduleConfig, WindowConfig};
use crate::ephemeris::{self, Location};

/// A start or end time-of-day: fixed, or anchored to dawn/dusk with an
/// offset in minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeSpec {
    Clock(NaiveTime),
    Dawn(i64),
    Dusk(i64),
}

impl TimeSpec {
    /// Parse "HH:MM", "dawn", "dusk", or "dawn+HH:MM" / "dusk-HH:MM".
    pub fn parse(text: &str) -> Result<Self> {
        let lower = text.trim().to_ascii_lowercase();
        for (anchor, make) in [("dawn", TimeSpec::Dawn as fn(i64) -> TimeSpec),
                               ("dusk", TimeSpec::Dusk as fn(i64) -> TimeSpec)] {
            if let Some(rest) = lower.strip_prefix(anchor) {
                if rest.is_empty() {
                    return Ok(make(0));
                }
                let (sign, body) = match rest.split_at(1) {
                    ("+", body) => (1, body),
                    ("-", body) => (-1, body),
                    _ => bail!("invalid {anchor} offset '{text}': use {anchor}+HH:MM"),
                };
                let t = NaiveTime::parse_from_str(body, "%H:%M")
                    .with_context(|| format!("invalid {anchor} offset '{text}'"))?;
                let mins = i64::from(t.hour()) * 60 + i64::from(t.minute());
                return Ok(make(sign * mins));
            }
        }
        let t = NaiveTime::parse_from_str(&lower, "%H:%M")
            .with_context(|| format!("invalid time '{text}': use HH:MM, dawn or dusk"))?;
        Ok(TimeSpec::Clock(t))
    }

    fn resolve(&self, location: &Location, date: NaiveDate) -> Option<NaiveTime> {
        match self {
            TimeSpec::Clock(t) => Some(*t),
            TimeSpec::Dawn(offset) => {
                let (dawn, _) = ephemeris::dawn_dusk(location, date)?;
                Some(shift(dawn, *offset))
            }
            TimeSpec::Dusk(offset) => {
                let (_, dusk) = ephemeris::dawn_dusk(location, date)?;
                Some(shift(dusk, *offset))
            }
        }
    }
}

fn shift(t: NaiveTime, minutes: i64) -> NaiveTime {
    t.overflowing_add_signed(Duration::minutes(minutes)).0
}

/// Days-of-week membership as a bitmask, Monday = bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayMask(u8);

impl DayMask {
    pub const ALL: DayMask = DayMask(0x7f);

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::ALL);
        }
        let mut mask = 0u8;
        for part in text.split(',') {
            let bit = match part.trim() {
                "Mon" => 0,
                "Tue" => 1,
                "Wed" => 2,
                "Thu" => 3,
                "Fri" => 4,
                "Sat" => 5,
                "Sun" => 6,
                other => bail!("invalid day '{other}' in '{text}'"),
            };
            mask |= 1 << bit;
        }
        Ok(Self(mask))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }
}

#[derive(Debug, Clone)]
pub struct Window {
    pub start: TimeSpec,
    pub end: TimeSpec,
    pub days: DayMask,
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub name: String,
    pub windows: Vec<Window>,
}

/// All named time-of-week schedules, with the location used to resolve
/// dawn/dusk symbols.
pub struct ScheduleBook {
    schedules: Vec<Schedule>,
    location: Location,
    default_price: f64,
}

impl ScheduleBook {
    pub fn build(configs: &[ScheduleConfig], location: Location, default_price: f64) -> Result<Self> {
        let mut schedules = Vec::with_capacity(configs.len());
        for cfg in configs {
            if cfg.windows.is_empty() {
                bail!("schedule '{}' has no windows", cfg.name);
            }
            let windows = cfg
                .windows
                .iter()
                .map(|w| build_window(w).with_context(|| format!("schedule '{}'", cfg.name)))
                .collect::<Result<Vec<_>>>()?;
            schedules.push(Schedule {
                name: cfg.name.clone(),
                windows,
            });
        }
        Ok(Self {
            schedules,
            location,
            default_price,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.name == name)
    }

    pub fn default_price(&self) -> f64 {
        self.default_price
    }

    /// Whether `instant` lies in any window of `schedule`, and the nominal
    /// price for it. Overlapping windows resolve to the lowest price.
    ///
    /// A window whose end is not after its start wraps past midnight and is
    /// anchored to the weekday of its start.
    pub fn in_window(&self, schedule: &Schedule, instant: DateTime<Utc>) -> (bool, Option<f64>) {
        let local = instant.with_timezone(&self.location.tz);
        let mut best: Option<f64> = None;
        let mut hit = false;

        // A wrapped window that started yesterday can still cover this
        // instant, so test both anchor dates.
        for anchor in [local.date_naive(), local.date_naive() - Duration::days(1)] {
            for window in &schedule.windows {
                if !window.days.contains(anchor.weekday()) {
                    continue;
                }
                let Some(start_t) = window.start.resolve(&self.location, anchor) else {
                    continue;
                };
                let Some(end_t) = window.end.resolve(&self.location, anchor) else {
                    continue;
                };
                let start = match self.location.tz.from_local_datetime(&anchor.and_time(start_t)).earliest() {
                    Some(dt) => dt.with_timezone(&Utc),
                    None => continue,
                };
                let mut end = match self.location.tz.from_local_datetime(&anchor.and_time(end_t)).earliest() {
                    Some(dt) => dt.with_timezone(&Utc),
                    None => continue,
                };
                if end <= start {
                    end += Duration::days(1);
                }
                if start <= instant && instant < end {
                    hit = true;
                    let price = window.price.unwrap_or(self.default_price);
                    best = Some(match best {
                        Some(b) => b.min(price),
                        None => price,
                    });
                }
            }
        }
        (hit, best)
    }

    /// The nominal price at `instant`: the window price when inside a
    /// window, the default price otherwise.
    pub fn price_at(&self, schedule: &Schedule, instant: DateTime<Utc>) -> f64 {
        match self.in_window(schedule, instant) {
            (true, Some(price)) => price,
            _ => self.default_price,
        }
    }
}

fn build_window(cfg: &WindowConfig) -> Result<Window> {
    Ok(Window {
        start: TimeSpec::parse(&cfg.start)?,
        end: TimeSpec::parse(&cfg.end)?,
        days: DayMask::parse(&cfg.days)?,
        price: cfg.price,
    })
}
