use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::domain::plan::RunPlan;
use crate::domain::{InputMode, OutputKind, OutputState, OverrideState, RelayState, UpsAction, UpsHealth};

/// Controller phase for one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Off,
    On,
    TurningOn,
    TurningOff,
    LockedOn,
    LockedOff,
    Fault,
}

/// What the state machine wants done this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    StartTurnOn,
    StartTurnOff,
}

/// Why the machine most recently chose its state; surfaced to the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriveReason {
    Plan,
    AppOverride,
    InputPin,
    MaxOffExercise,
    MinOnLock,
    MinOffLock,
    ParentOff,
    UpsUnhealthy,
    ProbeConstraint,
    DeviceOffline,
    Fault,
    StopOnExit,
}

/// Gate readings the control loop assembles for one output each tick.
#[derive(Debug, Clone, Copy)]
pub struct GateInputs {
    pub now: DateTime<Utc>,
    pub device_online: bool,
    /// Live input pin level, when the output has one configured.
    pub input_high: Option<bool>,
    /// Observed relay state of the parent output, when there is one.
    pub parent_on: Option<bool>,
    pub ups_health: Option<UpsHealth>,
    /// A temperature probe constraint currently blocks running.
    pub probes_block: bool,
}

/// Per-output controller: drives the relay toward the plan under the
/// anti-chatter and safety gates. Owned exclusively by the control loop.
pub struct OutputRuntime {
    pub cfg: OutputConfig,
    pub phase: Phase,
    pub state: OutputState,
    pub plan: Option<RunPlan>,
    pub plan_invalidated: bool,
    pub next_plan_check: DateTime<Utc>,
    /// Price of the slot that was current when the plan was built; a ≥10%
    /// rise while running triggers a replan.
    pub price_at_selection: Option<f64>,
    /// Invariant: at most one in-flight command per output.
    pub sequence_in_flight: bool,
    pub last_reason: DriveReason,
    /// Off-time anchor when the state file held no last-off instant.
    pub started_at: DateTime<Utc>,
    // Meter-kind session tracking
    pub meter_running: bool,
    session_on_seconds: u64,
    session_energy_wh: f64,
    session_cost_cents: f64,
}

impl OutputRuntime {
    pub fn new(cfg: OutputConfig, state: OutputState, now: DateTime<Utc>) -> Self {
        let phase = match state.relay {
            RelayState::On => Phase::On,
            RelayState::Off | RelayState::Unknown => Phase::Off,
        };
        Self {
            cfg,
            phase,
            state,
            plan: None,
            plan_invalidated: true,
            next_plan_check: now,
            price_at_selection: None,
            sequence_in_flight: false,
            last_reason: DriveReason::Plan,
            started_at: now,
            meter_running: false,
            session_on_seconds: 0,
            session_energy_wh: 0.0,
            session_cost_cents: 0.0,
        }
    }

    pub fn is_switched(&self) -> bool {
        self.cfg.kind == OutputKind::Switched
    }

    /// The state the output should be driven toward right now, with the
    /// reason. Overrides and pins are consulted live; the plan already
    /// carries date-off, schedule, price and UPS eligibility.
    fn desired_state(&self, gates: &GateInputs) -> (bool, DriveReason) {
        // A linked, unhealthy UPS with action TurnOff wins over everything.
        if let Some(link) = &self.cfg.ups {
            if link.action_if_unhealthy == UpsAction::TurnOff
                && gates.ups_health == Some(UpsHealth::Unhealthy)
            {
                return (false, DriveReason::UpsUnhealthy);
            }
        }

        if let Some(over) = self.state.active_override(gates.now) {
            return match over.state {
                OverrideState::On => (true, DriveReason::AppOverride),
                OverrideState::Off => (false, DriveReason::AppOverride),
            };
        }

        // Wired pin: TurnOn forces the output on while the pin is low;
        // TurnOff is the inverse and forces off while the pin is high.
        if let Some(input_high) = gates.input_high {
            match self.cfg.input_mode {
                InputMode::TurnOn if !input_high => return (true, DriveReason::InputPin),
                InputMode::TurnOff if input_high => return (false, DriveReason::InputPin),
                _ => {}
            }
        }

        let plan_on = self
            .plan
            .as_ref()
            .map(|p| p.wants_on(gates.now))
            .unwrap_or(false);

        // Forced periodic exercise: continuous OFF beyond maxOff turns the
        // output on even against the plan.
        if !plan_on && self.phase_is_off() {
            if let Some(max_off) = self.cfg.max_off_minutes {
                if max_off > 0 {
                    let off_since = self.state.last_turned_off.unwrap_or(self.started_at);
                    if gates.now - off_since >= Duration::minutes(max_off as i64) {
                        return (true, DriveReason::MaxOffExercise);
                    }
                }
            }
        }

        if plan_on {
            if gates.parent_on == Some(false) {
                return (false, DriveReason::ParentOff);
            }
            if gates.probes_block {
                return (false, DriveReason::ProbeConstraint);
            }
        }
        (plan_on, DriveReason::Plan)
    }

    fn phase_is_off(&self) -> bool {
        matches!(self.phase, Phase::Off | Phase::LockedOff)
    }

    fn min_on_elapsed(&self, now: DateTime<Utc>) -> bool {
        if self.cfg.min_on_minutes == 0 {
            return true;
        }
        match self.state.last_turned_on {
            Some(at) => now - at >= Duration::minutes(self.cfg.min_on_minutes as i64),
            None => true,
        }
    }

    fn min_off_elapsed(&self, now: DateTime<Utc>) -> bool {
        let Some(min_off) = self.cfg.min_off_minutes else {
            return true;
        };
        if min_off == 0 {
            return true;
        }
        match self.state.last_turned_off {
            Some(at) => now - at >= Duration::minutes(min_off as i64),
            None => true,
        }
    }

    /// Advance the state machine one tick. Returns the actuation to start,
    /// if any; the control loop runs it and reports back through
    /// [`OutputRuntime::sequence_finished`].
    pub fn advance(&mut self, gates: &GateInputs) -> Action {
        if !self.is_switched() {
            return Action::None;
        }
        if self.sequence_in_flight {
            return Action::None;
        }

        let (want_on, reason) = self.desired_state(gates);
        let override_on = matches!(
            self.state.active_override(gates.now).map(|o| o.state),
            Some(OverrideState::On)
        );

        // Leave the timed locks first.
        match self.phase {
            Phase::LockedOn if self.min_on_elapsed(gates.now) => self.phase = Phase::On,
            Phase::LockedOff if self.min_off_elapsed(gates.now) => self.phase = Phase::Off,
            _ => {}
        }

        match self.phase {
            Phase::Off => {
                if want_on {
                    if !gates.device_online {
                        self.last_reason = DriveReason::DeviceOffline;
                        return Action::None;
                    }
                    self.last_reason = reason;
                    self.phase = Phase::TurningOn;
                    return Action::StartTurnOn;
                }
                self.last_reason = reason;
            }
            Phase::LockedOff => {
                // An app-override ON is allowed through min-off immediately.
                if want_on && override_on {
                    if !gates.device_online {
                        self.last_reason = DriveReason::DeviceOffline;
                        return Action::None;
                    }
                    self.last_reason = DriveReason::AppOverride;
                    self.phase = Phase::TurningOn;
                    return Action::StartTurnOn;
                }
                if want_on {
                    self.last_reason = DriveReason::MinOffLock;
                }
            }
            Phase::On => {
                if !want_on {
                    self.last_reason = reason;
                    self.phase = Phase::TurningOff;
                    return Action::StartTurnOff;
                }
                self.last_reason = reason;
            }
            Phase::LockedOn => {
                // An app-override OFF ends the on-lock early.
                let override_off = matches!(
                    self.state.active_override(gates.now).map(|o| o.state),
                    Some(OverrideState::Off)
                );
                if !want_on && override_off {
                    self.last_reason = DriveReason::AppOverride;
                    self.phase = Phase::TurningOff;
                    return Action::StartTurnOff;
                }
                if !want_on {
                    self.last_reason = DriveReason::MinOnLock;
                }
            }
            Phase::Fault => {
                // Recovery: reconcile toward the desired state with the
                // opposing sequence at the next opportunity.
                if !gates.device_online {
                    self.last_reason = DriveReason::Fault;
                    return Action::None;
                }
                self.last_reason = DriveReason::Fault;
                return if want_on {
                    self.phase = Phase::TurningOn;
                    Action::StartTurnOn
                } else {
                    self.phase = Phase::TurningOff;
                    Action::StartTurnOff
                };
            }
            Phase::TurningOn | Phase::TurningOff => {}
        }
        Action::None
    }

    /// Record the outcome of a turn-on/turn-off sequence.
    pub fn sequence_finished(&mut self, turning_on: bool, ok: bool, now: DateTime<Utc>) {
        self.sequence_in_flight = false;
        if !ok {
            warn!(output = %self.cfg.name, turning_on, "actuation sequence failed, output faulted");
            self.phase = Phase::Fault;
            self.state.relay = RelayState::Unknown;
            self.state.last_changed = Some(now);
            return;
        }
        if turning_on {
            self.phase = if self.cfg.min_on_minutes > 0 {
                Phase::LockedOn
            } else {
                Phase::On
            };
            self.state.relay = RelayState::On;
            self.state.last_turned_on = Some(now);
            info!(output = %self.cfg.name, reason = ?self.last_reason, "output ON");
        } else {
            self.phase = if self.cfg.min_off_minutes.unwrap_or(0) > 0 {
                Phase::LockedOff
            } else {
                Phase::Off
            };
            self.state.relay = RelayState::Off;
            self.state.last_turned_off = Some(now);
            info!(output = %self.cfg.name, reason = ?self.last_reason, "output OFF");
        }
        self.state.last_changed = Some(now);
        self.state.last_contact = Some(now);
    }

    /// Set or clear an app override. ON/OFF records the expiry from the
    /// TTL, falling back to the configured cap; a TTL of zero disables
    /// expiry. Returns whether anything changed.
    pub fn set_override(
        &mut self,
        state: Option<OverrideState>,
        ttl_minutes: Option<u64>,
        now: DateTime<Utc>,
    ) -> bool {
        use crate::domain::AppOverride;
        let new = state.map(|s| {
            let cap = match s {
                OverrideState::On => self.cfg.max_app_on_minutes,
                OverrideState::Off => self.cfg.max_app_off_minutes,
            };
            let ttl = ttl_minutes.unwrap_or(cap);
            AppOverride {
                state: s,
                expires_at: (ttl > 0).then(|| now + Duration::minutes(ttl as i64)),
            }
        });
        if new == self.state.app_override {
            return false;
        }
        debug!(output = %self.cfg.name, over = ?new, "app override changed");
        self.state.app_override = new;
        self.plan_invalidated = true;
        true
    }

    /// Expire a lapsed override. The machine then re-evaluates against the
    /// plan and transitions only if the decision differs.
    pub fn expire_override(&mut self, now: DateTime<Utc>) {
        if let Some(over) = &self.state.app_override {
            if !over.is_active(now) {
                info!(output = %self.cfg.name, "app override expired, returning to plan control");
                self.state.app_override = None;
                self.plan_invalidated = true;
            }
        }
    }

    /// Meter-kind classification with hysteresis: running at or above the
    /// on-threshold, stopped at or below the off-threshold, state held in
    /// between. Sessions smaller than MinEnergyToLog are discarded.
    /// Returns whether the output counts as ON this tick.
    pub fn classify_meter(
        &mut self,
        power_w: f64,
        elapsed: Duration,
        price: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if self.meter_running {
            let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
            let energy = power_w.max(0.0) * hours;
            self.session_on_seconds += elapsed.num_seconds().max(0) as u64;
            self.session_energy_wh += energy;
            self.session_cost_cents += (energy / 1000.0) * price;

            if power_w <= self.cfg.power_off_threshold_w {
                self.meter_running = false;
                if self.session_energy_wh >= self.cfg.min_energy_to_log_wh {
                    self.state.on_seconds_today += self.session_on_seconds;
                    self.state.energy_wh_today += self.session_energy_wh;
                    self.state.cost_cents_today += self.session_cost_cents;
                    info!(
                        output = %self.cfg.name,
                        energy_wh = format!("{:.0}", self.session_energy_wh),
                        "metered session closed"
                    );
                } else {
                    debug!(
                        output = %self.cfg.name,
                        energy_wh = format!("{:.1}", self.session_energy_wh),
                        "metered session below logging threshold, discarded"
                    );
                }
                self.session_on_seconds = 0;
                self.session_energy_wh = 0.0;
                self.session_cost_cents = 0.0;
                self.state.last_turned_off = Some(now);
            }
        } else if power_w >= self.cfg.power_on_threshold_w {
            self.meter_running = true;
            self.state.last_turned_on = Some(now);
        }
        self.meter_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpsLinkConfig;
    use crate::domain::plan::{PlanSlot, PlanStatus, SlotDecision, SlotReason};
    use crate::domain::{AppOverride, RunMode};

    fn cfg() -> OutputConfig {
        OutputConfig {
            name: "Pump".to_string(),
            kind: OutputKind::Switched,
            mode: RunMode::BestPrice,
            relay: Some("Pump Relay".to_string()),
            meter: None,
            input: None,
            input_mode: InputMode::Ignore,
            schedule: None,
            constraint_schedule: None,
            channel: crate::domain::Channel::General,
            min_hours: 0.0,
            target_hours: 4.0,
            max_hours: 24.0,
            monthly_target_hours: Default::default(),
            max_shortfall_hours: 0.0,
            max_best_price: 25.0,
            max_priority_price: 35.0,
            min_on_minutes: 0,
            min_off_minutes: None,
            max_off_minutes: None,
            dates_off: Vec::new(),
            stop_on_exit: false,
            parent: None,
            turn_on_sequence: None,
            turn_off_sequence: None,
            max_app_on_minutes: 120,
            max_app_off_minutes: 0,
            temp_constraints: Vec::new(),
            ups: None,
            power_on_threshold_w: 100.0,
            power_off_threshold_w: 20.0,
            min_energy_to_log_wh: 50.0,
        }
    }

    fn t0() -> DateTime<Utc> {
        "2024-06-03T00:00:00Z".parse().unwrap()
    }

    fn plan_always(on: bool, now: DateTime<Utc>) -> RunPlan {
        let slots = (0..96)
            .map(|i| {
                let start = now + Duration::minutes(30 * i - 720);
                PlanSlot {
                    start,
                    end: start + Duration::minutes(30),
                    decision: if on { SlotDecision::On } else { SlotDecision::Off },
                    reason: if on { SlotReason::PriceBelowCeiling } else { SlotReason::NotRequired },
                    price: Some(10.0),
                }
            })
            .collect();
        RunPlan {
            source: RunMode::BestPrice,
            channel: None,
            status: PlanStatus::Ready,
            generated_at: now,
            required_hours: 4.0,
            priority_hours: 0.0,
            planned_hours: 4.0,
            remaining_hours: 4.0,
            next_start: None,
            next_stop: None,
            forecast_average_price: 10.0,
            forecast_energy_wh: 0.0,
            estimated_cost_cents: 0.0,
            slots,
        }
    }

    fn gates(now: DateTime<Utc>) -> GateInputs {
        GateInputs {
            now,
            device_online: true,
            input_high: None,
            parent_on: None,
            ups_health: None,
            probes_block: false,
        }
    }

    fn runtime_with_plan(cfg: OutputConfig, plan_on: bool, now: DateTime<Utc>) -> OutputRuntime {
        let mut rt = OutputRuntime::new(
            cfg,
            OutputState::new(now.date_naive()),
            now,
        );
        rt.plan = Some(plan_always(plan_on, now));
        rt
    }

    #[test]
    fn plan_on_starts_turn_on_and_locks() {
        let mut cfg = cfg();
        cfg.min_on_minutes = 15;
        let now = t0();
        let mut rt = runtime_with_plan(cfg, true, now);

        assert_eq!(rt.advance(&gates(now)), Action::StartTurnOn);
        assert_eq!(rt.phase, Phase::TurningOn);
        rt.sequence_in_flight = true;
        assert_eq!(rt.advance(&gates(now)), Action::None, "one in-flight command max");

        rt.sequence_finished(true, true, now);
        assert_eq!(rt.phase, Phase::LockedOn);
        assert_eq!(rt.state.relay, RelayState::On);

        // Still locked shortly after, even though the plan now says off.
        rt.plan = Some(plan_always(false, now));
        let later = now + Duration::minutes(5);
        assert_eq!(rt.advance(&gates(later)), Action::None);
        assert_eq!(rt.last_reason, DriveReason::MinOnLock);

        // Lock expires, plan-off proceeds.
        let later = now + Duration::minutes(16);
        assert_eq!(rt.advance(&gates(later)), Action::StartTurnOff);
    }

    #[test]
    fn min_off_clamp_delays_turn_on() {
        let mut cfg = cfg();
        cfg.min_off_minutes = Some(10);
        let now = t0();
        let mut rt = runtime_with_plan(cfg, false, now);
        rt.phase = Phase::On;
        rt.state.relay = RelayState::On;

        // Plan says off: turn off at t=0.
        assert_eq!(rt.advance(&gates(now)), Action::StartTurnOff);
        rt.sequence_finished(false, true, now);
        assert_eq!(rt.phase, Phase::LockedOff);

        // Plan flips to on at t=3min: still locked.
        rt.plan = Some(plan_always(true, now));
        let at3 = now + Duration::minutes(3);
        assert_eq!(rt.advance(&gates(at3)), Action::None);
        assert_eq!(rt.last_reason, DriveReason::MinOffLock);

        // At t=10min the lock has elapsed.
        let at10 = now + Duration::minutes(10);
        assert_eq!(rt.advance(&gates(at10)), Action::StartTurnOn);
    }

    #[test]
    fn app_override_on_ignores_min_off_lock() {
        let mut cfg = cfg();
        cfg.min_off_minutes = Some(30);
        let now = t0();
        let mut rt = runtime_with_plan(cfg, false, now);
        rt.phase = Phase::LockedOff;
        rt.state.last_turned_off = Some(now);

        rt.set_override(Some(OverrideState::On), Some(60), now);
        let at1 = now + Duration::minutes(1);
        assert_eq!(rt.advance(&gates(at1)), Action::StartTurnOn);
        assert_eq!(rt.last_reason, DriveReason::AppOverride);
    }

    #[test]
    fn expired_override_reverts_to_plan_without_cycling() {
        let now = t0();
        let mut rt = runtime_with_plan(cfg(), true, now);
        rt.phase = Phase::On;
        rt.state.relay = RelayState::On;
        rt.state.app_override = Some(AppOverride {
            state: OverrideState::On,
            expires_at: Some(now + Duration::minutes(30)),
        });

        // Past expiry, plan still says on: no transition.
        let later = now + Duration::minutes(31);
        rt.expire_override(later);
        assert!(rt.state.app_override.is_none());
        assert_eq!(rt.advance(&gates(later)), Action::None);
        assert_eq!(rt.phase, Phase::On);
    }

    #[test]
    fn ups_unhealthy_turn_off_wins_over_override() {
        let mut cfg = cfg();
        cfg.ups = Some(UpsLinkConfig {
            name: "rack".to_string(),
            action_if_unhealthy: UpsAction::TurnOff,
        });
        let now = t0();
        let mut rt = runtime_with_plan(cfg, true, now);
        rt.phase = Phase::On;
        rt.state.relay = RelayState::On;
        rt.set_override(Some(OverrideState::On), None, now);

        let mut g = gates(now);
        g.ups_health = Some(UpsHealth::Unhealthy);
        assert_eq!(rt.advance(&g), Action::StartTurnOff);
        assert_eq!(rt.last_reason, DriveReason::UpsUnhealthy);
    }

    #[test]
    fn ups_unknown_health_is_ignored() {
        let mut cfg = cfg();
        cfg.ups = Some(UpsLinkConfig {
            name: "rack".to_string(),
            action_if_unhealthy: UpsAction::TurnOff,
        });
        let now = t0();
        let mut rt = runtime_with_plan(cfg, true, now);

        let mut g = gates(now);
        g.ups_health = Some(UpsHealth::Unknown);
        assert_eq!(rt.advance(&g), Action::StartTurnOn);
    }

    #[test]
    fn parent_off_blocks_turn_on() {
        let now = t0();
        let mut rt = runtime_with_plan(cfg(), true, now);
        let mut g = gates(now);
        g.parent_on = Some(false);
        assert_eq!(rt.advance(&g), Action::None);
        assert_eq!(rt.last_reason, DriveReason::ParentOff);

        g.parent_on = Some(true);
        assert_eq!(rt.advance(&g), Action::StartTurnOn);
    }

    #[test]
    fn max_off_forces_periodic_exercise() {
        let mut cfg = cfg();
        cfg.max_off_minutes = Some(60);
        let now = t0();
        let mut rt = runtime_with_plan(cfg, false, now);
        rt.state.last_turned_off = Some(now);

        // Within the window: stays off.
        let at30 = now + Duration::minutes(30);
        assert_eq!(rt.advance(&gates(at30)), Action::None);

        // Beyond maxOff: forced on against the plan.
        let at61 = now + Duration::minutes(61);
        assert_eq!(rt.advance(&gates(at61)), Action::StartTurnOn);
        assert_eq!(rt.last_reason, DriveReason::MaxOffExercise);
    }

    #[test]
    fn input_pin_turn_on_forces_while_low() {
        let mut cfg = cfg();
        cfg.input = Some("Pin".to_string());
        cfg.input_mode = InputMode::TurnOn;
        let now = t0();
        let mut rt = runtime_with_plan(cfg, false, now);

        let mut g = gates(now);
        g.input_high = Some(false);
        assert_eq!(rt.advance(&g), Action::StartTurnOn);
        assert_eq!(rt.last_reason, DriveReason::InputPin);
        rt.sequence_finished(true, true, now);

        // Pin released: plan-driven again, plan says off.
        g.input_high = Some(true);
        assert_eq!(rt.advance(&g), Action::StartTurnOff);
        assert_eq!(rt.last_reason, DriveReason::Plan);
    }

    #[test]
    fn failed_sequence_faults_then_recovers() {
        let now = t0();
        let mut rt = runtime_with_plan(cfg(), true, now);
        assert_eq!(rt.advance(&gates(now)), Action::StartTurnOn);
        rt.sequence_in_flight = true;
        rt.sequence_finished(true, false, now);
        assert_eq!(rt.phase, Phase::Fault);
        assert_eq!(rt.state.relay, RelayState::Unknown);

        // Next opportunity: reconcile toward the plan (still on).
        let later = now + Duration::minutes(1);
        assert_eq!(rt.advance(&gates(later)), Action::StartTurnOn);
        rt.sequence_finished(true, true, later);
        assert_eq!(rt.phase, Phase::On);
    }

    #[test]
    fn device_offline_defers_turn_on() {
        let now = t0();
        let mut rt = runtime_with_plan(cfg(), true, now);
        let mut g = gates(now);
        g.device_online = false;
        assert_eq!(rt.advance(&g), Action::None);
        assert_eq!(rt.last_reason, DriveReason::DeviceOffline);
    }

    #[test]
    fn meter_hysteresis_and_session_logging() {
        let mut cfg = cfg();
        cfg.kind = OutputKind::Meter;
        cfg.relay = None;
        cfg.meter = Some("Oven Meter".to_string());
        let now = t0();
        let mut rt = OutputRuntime::new(cfg, OutputState::new(now.date_naive()), now);

        // Below on-threshold: stays stopped.
        assert!(!rt.classify_meter(50.0, Duration::seconds(30), 20.0, now));
        // Crosses on-threshold.
        assert!(rt.classify_meter(500.0, Duration::seconds(30), 20.0, now));
        // In the hysteresis band: still running.
        assert!(rt.classify_meter(60.0, Duration::minutes(30), 20.0, now));
        // Falls to off-threshold: session ends. 500W*epsilon + 60W*0.5h = 30Wh
        // which is below the 50 Wh logging floor, so it is discarded.
        assert!(!rt.classify_meter(10.0, Duration::seconds(30), 20.0, now));
        assert_eq!(rt.state.on_seconds_today, 0);

        // A long session is kept.
        assert!(rt.classify_meter(500.0, Duration::seconds(30), 20.0, now));
        assert!(rt.classify_meter(500.0, Duration::hours(1), 20.0, now));
        assert!(!rt.classify_meter(0.0, Duration::seconds(30), 20.0, now));
        assert!(rt.state.energy_wh_today > 450.0);
        assert!(rt.state.on_seconds_today >= 3600);
    }

    #[test]
    fn override_ttl_defaults_to_configured_cap() {
        let now = t0();
        let mut rt = runtime_with_plan(cfg(), false, now);
        rt.set_override(Some(OverrideState::On), None, now);
        let over = rt.state.app_override.as_ref().unwrap();
        assert_eq!(over.expires_at, Some(now + Duration::minutes(120)));

        // Explicit zero TTL disables expiry.
        rt.set_override(Some(OverrideState::On), Some(0), now);
        let over = rt.state.app_override.as_ref().unwrap();
        assert_eq!(over.expires_at, None);
    }
}
