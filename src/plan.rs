use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, Month, Utc};
use chrono_tz::Tz;

use crate::config::OutputConfig;
use crate::domain::plan::{PlanSlot, PlanStatus, RunPlan, SlotDecision, SlotReason};
use crate::domain::price::{floor_to_slot, SLOT_MINUTES};
use crate::domain::state::AppOverride;
use crate::domain::{OverrideState, PricePoint, RunMode};
use crate::schedule::ScheduleBook;

/// Accounting lookback behind the current tick.
pub const LOOKBACK_HOURS: i64 = 12;
/// Forward planning horizon.
pub const HORIZON_HOURS: i64 = 24;

/// Everything the builder needs for one output. The caller assembles the
/// price forecast (live, cached or fallback) before the call; the builder
/// itself is a pure function and deterministic on identical inputs.
pub struct PlanRequest<'a> {
    pub output: &'a OutputConfig,
    pub now: DateTime<Utc>,
    pub tz: Tz,
    /// Today's accumulated ON-hours.
    pub accumulated_hours: f64,
    /// Shortfall carried from prior days, already bounded.
    pub shortfall_hours: f64,
    pub prices: &'a [PricePoint],
    pub schedules: &'a ScheduleBook,
    /// UPS linked with action TurnOff and currently unhealthy.
    pub ups_forces_off: bool,
    /// A temperature probe constraint is violated at plan time.
    pub probes_force_off: bool,
    pub app_override: Option<&'a AppOverride>,
    /// The parent's already-built plan, when this output has one.
    pub parent_plan: Option<&'a RunPlan>,
    /// Observed average draw while running, for cost forecasting. Zero when
    /// unknown.
    pub hourly_energy_wh: f64,
}

struct Candidate {
    index: usize,
    start: DateTime<Utc>,
    price: f64,
}

pub fn build_plan(req: &PlanRequest) -> RunPlan {
    let grid_start = floor_to_slot(req.now) - Duration::hours(LOOKBACK_HOURS);
    let grid_end = floor_to_slot(req.now) + Duration::hours(HORIZON_HOURS) + Duration::minutes(SLOT_MINUTES);

    let price_index: BTreeMap<DateTime<Utc>, &PricePoint> =
        req.prices.iter().map(|p| (p.start, p)).collect();

    let today = req.now.with_timezone(&req.tz).date_naive();
    let schedule = req.output.schedule.as_deref().and_then(|n| req.schedules.get(n));
    let constraint = req
        .output
        .constraint_schedule
        .as_deref()
        .and_then(|n| req.schedules.get(n));

    // Pass 1: lay down the grid and apply the eligibility mask.
    let mut slots: Vec<PlanSlot> = Vec::new();
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut cursor = grid_start;
    while cursor < grid_end {
        let end = cursor + Duration::minutes(SLOT_MINUTES);
        let price = price_index
            .get(&cursor)
            .map(|p| p.price)
            .unwrap_or_else(|| req.schedules.default_price());
        let slot_date = cursor.with_timezone(&req.tz).date_naive();

        let mut slot = PlanSlot {
            start: cursor,
            end,
            decision: SlotDecision::Off,
            reason: SlotReason::NotRequired,
            price: Some(price),
        };

        let over = req.app_override.filter(|o| o.is_active(cursor));

        if end <= req.now {
            // Lookback slots are accounting context, never actionable.
            slot.reason = SlotReason::NotRequired;
        } else if req.output.is_date_off(slot_date) {
            slot.reason = SlotReason::DateOff;
        } else if req.ups_forces_off {
            slot.reason = SlotReason::ConstrainedOff;
        } else if let Some(over) = over {
            // An active override beats everything except DatesOff and a UPS
            // forced off, which were handled above.
            match over.state {
                OverrideState::On => {
                    slot.decision = SlotDecision::On;
                    slot.reason = SlotReason::AppOverride;
                }
                OverrideState::Off => slot.reason = SlotReason::ForcedOff,
            }
        } else if req.probes_force_off {
            slot.reason = SlotReason::ConstrainedOff;
        } else if constraint.is_some()
            && !req.schedules.in_window(constraint.unwrap(), cursor).0
        {
            slot.reason = SlotReason::ConstrainedOff;
        } else if req.output.mode == RunMode::Schedule
            && !schedule.map(|s| req.schedules.in_window(s, cursor).0).unwrap_or(false)
        {
            slot.reason = SlotReason::ConstrainedOff;
        } else if slot_date != today {
            // Tomorrow is planned when tomorrow's accounting day starts.
            slot.reason = SlotReason::NotRequired;
        } else {
            candidates.push(Candidate {
                index: slots.len(),
                start: cursor,
                price,
            });
        }

        slots.push(slot);
        cursor = end;
    }

    // Pass 2: budget.
    let target = req
        .output
        .target_hours_for(Month::try_from(today.month() as u8).expect("valid month"));

    let (need_mins, priority_mins) = match target {
        None => (0, 0), // all-eligible mode, budgets unused
        Some(target_hours) => {
            let carry = req.shortfall_hours.min(req.output.max_shortfall_hours);
            let mut need = (target_hours - req.accumulated_hours).max(0.0) + carry;
            need = need.min((req.output.max_hours - req.accumulated_hours).max(0.0));
            let priority = (req.output.min_hours - req.accumulated_hours).max(0.0);
            (
                (need * 60.0).round() as i64,
                (priority * 60.0).round() as i64,
            )
        }
    };

    // Pass 3: selection over today's eligible future slots.
    let mut selected_mins = 0i64;
    match req.output.mode {
        RunMode::Schedule => {
            // Candidates are already masked to the schedule's windows.
            // Chronological, capped at the remaining MaxHours budget.
            let cap_mins = ((req.output.max_hours - req.accumulated_hours).max(0.0) * 60.0) as i64;
            for c in &candidates {
                if target.is_some() && selected_mins + SLOT_MINUTES > cap_mins {
                    break;
                }
                slots[c.index].decision = SlotDecision::On;
                slots[c.index].reason = SlotReason::ScheduleHit;
                selected_mins += SLOT_MINUTES;
            }
        }
        RunMode::BestPrice => {
            if target.is_none() {
                // Every eligible slot at or below the ceiling.
                for c in &candidates {
                    if c.price <= req.output.max_best_price {
                        slots[c.index].decision = SlotDecision::On;
                        slots[c.index].reason = SlotReason::PriceBelowCeiling;
                        selected_mins += SLOT_MINUTES;
                    } else {
                        slots[c.index].reason = SlotReason::PriceAboveCeiling;
                    }
                }
            } else {
                // Cheapest first; ties resolved by earlier start. The sort is
                // stable and the keys are total, so replanning on identical
                // inputs yields identical slots.
                let mut ranked: Vec<&Candidate> = candidates.iter().collect();
                ranked.sort_by(|a, b| {
                    a.price
                        .total_cmp(&b.price)
                        .then_with(|| a.start.cmp(&b.start))
                });
                for c in ranked {
                    let slot = &mut slots[c.index];
                    if c.price > req.output.max_priority_price {
                        slot.reason = SlotReason::PriceAboveCeiling;
                        continue;
                    }
                    if selected_mins < need_mins && c.price <= req.output.max_best_price {
                        slot.decision = SlotDecision::On;
                        slot.reason = SlotReason::PriceBelowCeiling;
                        selected_mins += SLOT_MINUTES;
                    } else if selected_mins < priority_mins {
                        slot.decision = SlotDecision::On;
                        slot.reason = if c.price <= req.output.max_best_price {
                            SlotReason::PriceBelowCeiling
                        } else {
                            SlotReason::Priority
                        };
                        selected_mins += SLOT_MINUTES;
                    } else if c.price > req.output.max_best_price {
                        slot.reason = SlotReason::PriceAboveCeiling;
                    } else {
                        slot.reason = SlotReason::NotRequired;
                    }
                }
            }
        }
    }

    // Pass 4: parent gating. An app override is user intent and wins over
    // the gate; plain plan selections do not.
    if let Some(parent) = req.parent_plan {
        for slot in slots.iter_mut() {
            if slot.decision == SlotDecision::On
                && slot.reason != SlotReason::AppOverride
                && !parent.wants_on(slot.start)
            {
                slot.decision = SlotDecision::Off;
                slot.reason = SlotReason::ParentGated;
            }
        }
    }

    finalise(req, slots, target, need_mins, priority_mins)
}

fn finalise(
    req: &PlanRequest,
    slots: Vec<PlanSlot>,
    target: Option<f64>,
    need_mins: i64,
    priority_mins: i64,
) -> RunPlan {
    let mut planned_mins = 0i64;
    let mut future_mins = 0i64;
    let mut weighted_price = 0.0;
    for slot in slots.iter().filter(|s| s.is_on()) {
        let mins = (slot.end - slot.start).num_minutes();
        planned_mins += mins;
        if let Some(price) = slot.price {
            weighted_price += price * mins as f64;
        }
        if slot.end > req.now {
            let from = slot.start.max(req.now);
            future_mins += (slot.end - from).num_minutes();
        }
    }

    let status = if target.is_some() && need_mins == 0 && priority_mins == 0 {
        PlanStatus::Nothing
    } else if planned_mins < priority_mins || planned_mins == 0 {
        PlanStatus::Failed
    } else if target.is_some() && planned_mins < need_mins {
        PlanStatus::Partial
    } else {
        PlanStatus::Ready
    };

    let forecast_average_price = if planned_mins > 0 {
        weighted_price / planned_mins as f64
    } else {
        0.0
    };
    let future_hours = future_mins as f64 / 60.0;
    let forecast_energy_wh = req.hourly_energy_wh * future_hours;
    // hourly_energy_wh / 1000 kWh per hour at c/kWh gives cents per hour.
    let estimated_cost_cents = if req.hourly_energy_wh > 0.0 {
        slots
            .iter()
            .filter(|s| s.is_on() && s.end > req.now)
            .map(|s| {
                let from = s.start.max(req.now);
                let hours = (s.end - from).num_minutes() as f64 / 60.0;
                (req.hourly_energy_wh / 1000.0) * hours * s.price.unwrap_or(0.0)
            })
            .sum()
    } else {
        0.0
    };

    let mut plan = RunPlan {
        source: req.output.mode,
        channel: (req.output.mode == RunMode::BestPrice).then_some(req.output.channel),
        status,
        generated_at: req.now,
        required_hours: need_mins as f64 / 60.0,
        priority_hours: priority_mins as f64 / 60.0,
        planned_hours: planned_mins as f64 / 60.0,
        remaining_hours: future_hours,
        next_start: None,
        next_stop: None,
        forecast_average_price,
        forecast_energy_wh,
        estimated_cost_cents,
        slots,
    };
    let (next_start, next_stop) = plan.next_transitions(req.now);
    plan.next_start = next_start;
    plan.next_stop = next_stop;
    plan
}
