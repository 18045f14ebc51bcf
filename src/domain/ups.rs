use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Charged,
    Discharging,
}

/// One reading as produced on stdout by a UPS probe script.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsReading {
    pub timestamp: DateTime<Utc>,
    pub battery_state: BatteryState,
    pub battery_charge_percent: Option<f64>,
    pub battery_runtime_seconds: Option<i64>,
}

impl UpsReading {
    /// A reading with neither charge nor runtime tells us nothing.
    pub fn is_usable(&self) -> bool {
        self.battery_charge_percent.is_some() || self.battery_runtime_seconds.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsHealth {
    Healthy,
    Unhealthy,
    /// Script failed or produced unusable output; the UPS link is ignored
    /// for this tick.
    Unknown,
}

/// Latest evaluated status of one UPS.
#[derive(Debug, Clone, Serialize)]
pub struct UpsStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<BatteryState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<i64>,
    pub health: UpsHealth,
}

impl UpsStatus {
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_seen: None,
            battery_state: None,
            charge_percent: None,
            runtime_seconds: None,
            health: UpsHealth::Unknown,
        }
    }
}
