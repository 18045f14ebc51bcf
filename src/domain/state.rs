use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Last state the relay was confirmed to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
    /// Never contacted since this state was recorded.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideState {
    On,
    Off,
}

/// A user-pushed forced state, expiring back to plan control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppOverride {
    pub state: OverrideState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AppOverride {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

/// One closed day of accounting for an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub on_seconds: u64,
    pub energy_wh: f64,
    pub cost_cents: f64,
}

/// Everything about one output that must survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputState {
    pub relay: RelayState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_turned_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_turned_off: Option<DateTime<Utc>>,
    /// Accumulated ON-seconds for `accounting_date`. Monotone within the day,
    /// reset at local midnight.
    pub on_seconds_today: u64,
    pub energy_wh_today: f64,
    pub cost_cents_today: f64,
    pub accounting_date: NaiveDate,
    /// Unrun hours carried from prior days, bounded by MaxShortfallHours.
    pub shortfall_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_override: Option<AppOverride>,
    pub days: VecDeque<DayRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_meter_wh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_contact: Option<DateTime<Utc>>,
    /// Fields written by newer versions are preserved across a rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OutputState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            relay: RelayState::Unknown,
            last_changed: None,
            last_turned_on: None,
            last_turned_off: None,
            on_seconds_today: 0,
            energy_wh_today: 0.0,
            cost_cents_today: 0.0,
            accounting_date: today,
            shortfall_hours: 0.0,
            app_override: None,
            days: VecDeque::new(),
            last_meter_wh: None,
            last_contact: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn actual_hours_today(&self) -> f64 {
        self.on_seconds_today as f64 / 3600.0
    }

    /// An expired override is equivalent to no override at all.
    pub fn active_override(&self, now: DateTime<Utc>) -> Option<&AppOverride> {
        self.app_override.as_ref().filter(|o| o.is_active(now))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMeta {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
}

/// The single JSON document held by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub meta: StateMeta,
    pub outputs: BTreeMap<String, OutputState>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PersistedState {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            meta: StateMeta {
                schema_version: STATE_SCHEMA_VERSION,
                written_at: now,
            },
            outputs: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}
