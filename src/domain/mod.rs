pub mod plan;
pub mod price;
pub mod state;
pub mod ups;

pub use plan::{PlanSlot, PlanStatus, RunPlan, SlotReason};
pub use price::{Channel, PricePoint, PriceQuality};
pub use state::{
    AppOverride, DayRecord, OutputState, OverrideState, PersistedState, RelayState,
    STATE_SCHEMA_VERSION,
};
pub use ups::{BatteryState, UpsHealth, UpsReading, UpsStatus};

use serde::{Deserialize, Serialize};

/// How an output decides when to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    BestPrice,
    Schedule,
}

/// The physical flavour of an output.
///
/// `Switched` outputs drive a relay. `Meter` outputs only observe a power
/// meter and classify run sessions from its readings. `Imported` outputs
/// ingest externally recorded energy sessions and attribute cost to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Switched,
    Meter,
    Imported,
}

/// What a wired input pin does to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputMode {
    Ignore,
    TurnOn,
    TurnOff,
}

/// What to do with an output when its linked UPS reports unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsAction {
    TurnOff,
    Warn,
}

/// Direction of a temperature probe constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempCondition {
    /// Output may only run while the probe reads above the threshold.
    GreaterThan,
    /// Output may only run while the probe reads below the threshold.
    LessThan,
}
