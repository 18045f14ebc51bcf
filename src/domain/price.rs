use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Length of one price slot on the wall-clock half-hour grid.
pub const SLOT_MINUTES: i64 = 30;

/// Tariff channel a price applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "general")]
    General,
    #[serde(rename = "controlledLoad")]
    ControlledLoad,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::General
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::General => write!(f, "general"),
            Channel::ControlledLoad => write!(f, "controlledLoad"),
        }
    }
}

/// Provenance of a price figure. The ordering matters: a cache merge must
/// never replace a point with one of lower quality for the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceQuality {
    Default,
    FallbackSchedule,
    Forecast,
    CachedStale,
    Current,
    Actual,
}

/// One half-hour spot price for a channel, in cents per kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub start: DateTime<Utc>,
    pub duration_mins: i64,
    pub channel: Channel,
    pub price: f64,
    pub quality: PriceQuality,
}

impl PricePoint {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(self.duration_mins)
    }

    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end()
    }
}

/// Floor an instant onto the UTC half-hour grid.
pub fn floor_to_slot(instant: DateTime<Utc>) -> DateTime<Utc> {
    let secs = instant.timestamp();
    let slot = SLOT_MINUTES * 60;
    DateTime::from_timestamp(secs - secs.rem_euclid(slot), 0).expect("valid slot timestamp")
}

/// One hourly usage/cost row as reported by the price source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub start: DateTime<Utc>,
    pub channel: Channel,
    pub energy_kwh: f64,
    pub cost_cents: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_ordering_matches_merge_policy() {
        assert!(PriceQuality::Actual > PriceQuality::Current);
        assert!(PriceQuality::Current > PriceQuality::CachedStale);
        assert!(PriceQuality::CachedStale > PriceQuality::Forecast);
        assert!(PriceQuality::Forecast > PriceQuality::FallbackSchedule);
        assert!(PriceQuality::FallbackSchedule > PriceQuality::Default);
    }

    #[test]
    fn floor_lands_on_half_hour_boundary() {
        let t = DateTime::parse_from_rfc3339("2024-06-01T10:17:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let floored = floor_to_slot(t);
        assert_eq!(floored.to_rfc3339(), "2024-06-01T10:00:00+00:00");

        let t2 = DateTime::parse_from_rfc3339("2024-06-01T10:44:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(floor_to_slot(t2).to_rfc3339(), "2024-06-01T10:30:00+00:00");
    }
}
