use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::price::Channel;
use super::RunMode;

/// Why a slot carries the decision it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotReason {
    /// ON: the slot lies inside the output's operating schedule.
    ScheduleHit,
    /// ON: selected because its price is at or below MaxBestPrice.
    PriceBelowCeiling,
    /// ON: lifted in to satisfy MinHours at up to MaxPriorityPrice.
    Priority,
    /// ON: an app override forces the output on.
    AppOverride,
    /// OFF: the parent output's plan is off for this slot.
    ParentGated,
    /// OFF: a constraint schedule, UPS link or probe constraint excludes it.
    ConstrainedOff,
    /// OFF: the slot's date is inside a DatesOff range.
    DateOff,
    /// OFF: an app override forces the output off.
    ForcedOff,
    /// OFF: price above the applicable ceiling.
    PriceAboveCeiling,
    /// OFF: eligible, but the day's budget is already covered.
    NotRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotDecision {
    On,
    Off,
}

/// One half-hour slot of a run plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub decision: SlotDecision,
    pub reason: SlotReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl PlanSlot {
    pub fn is_on(&self) -> bool {
        self.decision == SlotDecision::On
    }

    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Outcome of a planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    /// Nothing left to do today.
    Nothing,
    /// Could not allocate the priority hours.
    Failed,
    /// Priority hours allocated, but the full target was not.
    Partial,
    /// Target fully planned.
    Ready,
}

/// A per-output run plan over the planning horizon.
///
/// The slots partition `[generated_at - lookback, generated_at + horizon]`
/// on the half-hour grid without gaps or overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub source: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    pub status: PlanStatus,
    pub generated_at: DateTime<Utc>,
    pub required_hours: f64,
    pub priority_hours: f64,
    pub planned_hours: f64,
    pub remaining_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stop: Option<DateTime<Utc>>,
    pub forecast_average_price: f64,
    pub forecast_energy_wh: f64,
    pub estimated_cost_cents: f64,
    pub slots: Vec<PlanSlot>,
}

impl RunPlan {
    /// The slot covering `instant`, if any, and whether the plan wants the
    /// output on right now.
    pub fn current_slot(&self, instant: DateTime<Utc>) -> (Option<&PlanSlot>, bool) {
        match self.slots.iter().find(|s| s.covers(instant)) {
            Some(slot) => (Some(slot), slot.is_on()),
            None => (None, false),
        }
    }

    /// Whether the plan says the output should be energised at `instant`.
    pub fn wants_on(&self, instant: DateTime<Utc>) -> bool {
        self.current_slot(instant).1
    }

    /// Recompute the hours still ahead of `now`. Called once per tick so the
    /// web surface shows a live countdown without a replan.
    pub fn refresh_remaining(&mut self, now: DateTime<Utc>) {
        let mut future_mins = 0i64;
        for slot in self.slots.iter().filter(|s| s.is_on()) {
            if slot.end > now {
                let from = slot.start.max(now);
                future_mins += (slot.end - from).num_minutes();
            }
        }
        self.remaining_hours = future_mins as f64 / 60.0;
    }

    /// Start of the next ON slot strictly ahead of `now`, and the end of the
    /// ON run containing `now` when the output is currently planned on.
    pub fn next_transitions(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let next_start = self
            .slots
            .iter()
            .filter(|s| s.is_on() && s.start > now)
            .map(|s| s.start)
            .next();

        let mut next_stop = None;
        if let (Some(slot), true) = self.current_slot(now) {
            // Walk forward over contiguous ON slots to find the real stop.
            let mut end = slot.end;
            for s in self.slots.iter().filter(|s| s.is_on()) {
                if s.start == end {
                    end = s.end;
                }
            }
            next_stop = Some(end);
        }
        (next_start, next_stop)
    }
}
