pub mod output;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConfigWatcher};
use crate::device::{DeviceEvent, DeviceRegistry, DeviceSnapshot, Sequence};
use crate::domain::plan::PlanStatus;
use crate::domain::{
    AppOverride, OutputKind, OutputState, OverrideState, PersistedState, RelayState, RunMode,
    TempCondition, UpsHealth, UpsStatus,
};
use crate::ephemeris::Location;
use crate::history::{self, TickReadings};
use crate::notify::Notifier;
use crate::plan::{build_plan, PlanRequest, HORIZON_HOURS, LOOKBACK_HOURS};
use crate::prices::{fallback_forecast, PriceCache};
use crate::schedule::ScheduleBook;
use crate::store::{spawn_writer, StateStore, StoreHandle};
use crate::ups::UpsSnapshot;

use output::{Action, DriveReason, OutputRuntime, Phase};

/// Re-check cadence for a healthy plan, and the shorter cadence after a
/// failed or partial one.
const PLAN_CHECK_MINUTES: i64 = 30;
const FAILED_PLAN_CHECK_MINUTES: i64 = 10;
/// Cadence for pulling externally recorded sessions into imported outputs.
const IMPORT_INTERVAL_MINUTES: i64 = 5;
/// A probe reading older than this counts as unknown.
const PROBE_STALE_MINUTES: i64 = 10;

/// One externally recorded energy session for an imported output.
#[derive(Debug, Clone)]
pub struct EnergySession {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_wh: f64,
}

/// Source of sessions for imported outputs; the concrete ingestion lives
/// outside the core.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_sessions(&self, since: DateTime<Utc>) -> Result<Vec<EnergySession>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideRequest {
    On,
    Off,
    Auto,
}

pub enum ControlCommand {
    SetOverride {
        output: String,
        request: OverrideRequest,
        ttl_minutes: Option<u64>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    InputWebhook {
        device: String,
    },
    /// A replacement configuration, already parsed and validated by the
    /// config watcher task.
    ReloadConfig(Box<AppConfig>),
}

/// Completion report from a spawned actuation sequence.
struct SequenceDone {
    output: usize,
    turning_on: bool,
    ok: bool,
    error: Option<String>,
}

/// What the HTTP surface reads and writes. Cloneable; all mutation funnels
/// through the command channel into the control loop.
#[derive(Clone)]
pub struct AppState {
    pub label: String,
    pub access_key: Option<String>,
    pub commands: mpsc::Sender<ControlCommand>,
    pub refresh: mpsc::Sender<()>,
    pub snapshot: watch::Receiver<ControlSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub status: PlanStatus,
    pub required_hours: f64,
    pub planned_hours: f64,
    pub remaining_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stop: Option<DateTime<Utc>>,
    pub forecast_average_price: f64,
    pub estimated_cost_cents: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
    pub name: String,
    pub kind: OutputKind,
    pub phase: Phase,
    pub relay: RelayState,
    pub reason: DriveReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_override: Option<AppOverride>,
    pub actual_hours_today: f64,
    pub energy_wh_today: f64,
    pub cost_cents_today: f64,
    pub shortfall_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub label: String,
    pub generated_at: DateTime<Utc>,
    pub price_source_down: bool,
    pub outputs: Vec<OutputSummary>,
    pub ups: Vec<UpsStatus>,
}

impl ControlSnapshot {
    fn startup(label: &str) -> Self {
        Self {
            label: label.to_string(),
            generated_at: Utc::now(),
            price_source_down: false,
            outputs: Vec::new(),
            ups: Vec::new(),
        }
    }
}

/// Resolved component bindings for one output, built once at startup.
struct Bindings {
    device: Option<String>,
    relay_index: Option<u32>,
    meter_device: Option<String>,
    meter_index: Option<u32>,
    input_device: Option<String>,
    input_index: Option<u32>,
    /// (device, index, condition, threshold)
    probes: Vec<(String, u32, TempCondition, f64)>,
    parent: Option<usize>,
}

/// The control loop: sole owner of all output controller state. Workers
/// communicate with it exclusively through channels; it never blocks on
/// device, network or subprocess I/O.
pub struct Controller {
    cfg: AppConfig,
    tz: Tz,
    outputs: Vec<OutputRuntime>,
    bindings: Vec<Bindings>,
    topo: Vec<usize>,
    sequences: BTreeMap<String, Arc<Sequence>>,
    session_sources: BTreeMap<String, Arc<dyn SessionSource>>,
    last_import: BTreeMap<usize, DateTime<Utc>>,
    registry: Arc<DeviceRegistry>,
    prices: Arc<PriceCache>,
    schedules: ScheduleBook,
    store: StoreHandle,
    state_extra: BTreeMap<String, serde_json::Value>,
    notifier: Arc<Notifier>,
    ups_rx: Option<watch::Receiver<UpsSnapshot>>,
    snapshot_tx: watch::Sender<ControlSnapshot>,
    commands_rx: mpsc::Receiver<ControlCommand>,
    device_events_rx: mpsc::Receiver<DeviceEvent>,
    wake_rx: mpsc::Receiver<()>,
    seq_done_tx: mpsc::Sender<SequenceDone>,
    seq_done_rx: mpsc::Receiver<SequenceDone>,
    last_tick: DateTime<Utc>,
    dirty: bool,
    price_source_reported_down: bool,
}

pub struct ControllerHandles {
    pub app_state: AppState,
    pub commands_tx: mpsc::Sender<ControlCommand>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        registry: Arc<DeviceRegistry>,
        prices: Arc<PriceCache>,
        schedules: ScheduleBook,
        store: StateStore,
        notifier: Arc<Notifier>,
        ups_rx: Option<watch::Receiver<UpsSnapshot>>,
        refresh_tx: mpsc::Sender<()>,
        device_events_rx: mpsc::Receiver<DeviceEvent>,
        wake_rx: mpsc::Receiver<()>,
    ) -> Result<(Self, ControllerHandles)> {
        let tz = cfg.location.tz()?;
        let now = Utc::now();
        let today = crate::ephemeris::local_date(now, tz);

        // The one synchronous read at startup; every later write goes
        // through the writer task.
        let persisted = store.load()?;
        let state_extra = persisted.extra.clone();
        let store = spawn_writer(store);

        // Build runtimes in config order; evaluation uses the topological
        // order so parents resolve before their children.
        let mut outputs = Vec::with_capacity(cfg.outputs.len());
        for output_cfg in &cfg.outputs {
            let state = persisted
                .outputs
                .get(&output_cfg.name)
                .cloned()
                .unwrap_or_else(|| OutputState::new(today));
            outputs.push(OutputRuntime::new(output_cfg.clone(), state, now));
        }
        let topo = cfg.topological_output_order()?;

        let bindings = build_bindings(&cfg, &registry)?;
        let sequences = build_sequences(&cfg)?;

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (seq_done_tx, seq_done_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(ControlSnapshot::startup(&cfg.general.label));

        let app_state = AppState {
            label: cfg.general.label.clone(),
            access_key: cfg.server.access_key.clone(),
            commands: commands_tx.clone(),
            refresh: refresh_tx,
            snapshot: snapshot_rx,
        };

        let controller = Self {
            tz,
            outputs,
            bindings,
            topo,
            sequences,
            session_sources: BTreeMap::new(),
            last_import: BTreeMap::new(),
            registry,
            prices,
            schedules,
            store,
            state_extra,
            notifier,
            ups_rx,
            snapshot_tx,
            commands_rx,
            device_events_rx,
            wake_rx,
            seq_done_tx,
            seq_done_rx,
            last_tick: now,
            dirty: false,
            price_source_reported_down: false,
            cfg,
        };
        let handles = ControllerHandles {
            app_state,
            commands_tx,
        };
        Ok((controller, handles))
    }

    /// Register a session source for an imported output.
    pub fn add_session_source(&mut self, output: &str, source: Arc<dyn SessionSource>) {
        self.session_sources.insert(output.to_string(), source);
    }

    /// Main loop: wakes on the polling interval or on any event, then runs
    /// one reconciliation tick.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let poll = StdDuration::from_secs(self.cfg.general.polling_interval_secs);
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(outputs = self.outputs.len(), "control loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(cmd) = self.commands_rx.recv() => self.apply_command(cmd),
                Some(event) = self.device_events_rx.recv() => self.handle_device_event(event).await,
                Some(done) = self.seq_done_rx.recv() => self.handle_sequence_done(done).await,
                Some(()) = self.wake_rx.recv() => debug!("woken by worker event"),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.tick().await;
        }

        self.shutdown().await;
    }

    async fn tick(&mut self) {
        let now = Utc::now();
        let elapsed = (now - self.last_tick).max(Duration::zero());
        self.last_tick = now;

        // Kick off status refreshes; results land in snapshots for the next
        // pass. The loop itself never waits on device I/O.
        self.registry.request_refresh_all();

        let device_snapshots: BTreeMap<String, DeviceSnapshot> = self
            .registry
            .handles()
            .map(|(name, handle)| (name.clone(), handle.snapshot()))
            .collect();
        let ups_snapshot: UpsSnapshot = self
            .ups_rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();
        let price_down = self.prices.is_down().await;
        self.watch_price_source(price_down).await;

        self.import_sessions(now).await;

        for position in 0..self.topo.len() {
            let index = self.topo[position];
            self.tick_output(index, now, elapsed, &device_snapshots, &ups_snapshot, price_down)
                .await;
        }

        if self.dirty {
            self.flush_store();
        }
        self.publish_snapshot(now, price_down);
    }

    async fn tick_output(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
        elapsed: Duration,
        devices: &BTreeMap<String, DeviceSnapshot>,
        ups: &UpsSnapshot,
        price_down: bool,
    ) {
        let binding = &self.bindings[index];
        let device_snapshot = binding
            .device
            .as_ref()
            .or(binding.meter_device.as_ref())
            .and_then(|d| devices.get(d));
        let device_online = device_snapshot.map(|s| s.online).unwrap_or(false);

        let meter_reading = binding.meter_device.as_ref().and_then(|d| {
            let snap = devices.get(d)?;
            binding.meter_index.and_then(|i| snap.meters.get(&i)).copied()
        });
        let input_high = binding.input_device.as_ref().and_then(|d| {
            let snap = devices.get(d)?;
            binding.input_index.and_then(|i| snap.inputs.get(&i)).copied()
        });
        let probes_block = self.probes_block(index, devices, now);
        let parent_on = binding
            .parent
            .map(|p| self.outputs[p].state.relay == RelayState::On);
        let ups_health = self.outputs[index]
            .cfg
            .ups
            .as_ref()
            .and_then(|link| ups.get(&link.name))
            .map(|status| status.health);

        let current_price = self.current_price(index, now).await;

        // Accounting first, so replanning sees up-to-date hours.
        let rt = &mut self.outputs[index];
        rt.expire_override(now);
        let counted_on = match rt.cfg.kind {
            OutputKind::Switched => rt.state.relay == RelayState::On,
            OutputKind::Meter => {
                let power = meter_reading.map(|m| m.power_w).unwrap_or(0.0);
                rt.classify_meter(power, elapsed, current_price, now)
            }
            OutputKind::Imported => false,
        };
        let power_w = meter_reading.map(|m| m.power_w).unwrap_or(0.0);
        if rt.cfg.kind != OutputKind::Meter {
            let rolled = history::tick(
                &mut rt.state,
                &rt.cfg,
                now,
                self.tz,
                elapsed,
                TickReadings {
                    is_on: counted_on,
                    power_w,
                    price_c_per_kwh: current_price,
                },
            );
            if rolled {
                rt.plan_invalidated = true;
                self.dirty = true;
            }
        } else {
            // Meter sessions do their own accumulation; still roll the day.
            let rolled = history::tick(
                &mut rt.state,
                &rt.cfg,
                now,
                self.tz,
                Duration::zero(),
                TickReadings::default(),
            );
            if rolled {
                rt.plan_invalidated = true;
                self.dirty = true;
            }
        }
        if counted_on {
            self.dirty = true;
        }
        if let Some(reading) = meter_reading {
            self.outputs[index].state.last_meter_wh = Some(reading.energy_wh);
        }

        // Replan when needed.
        if self.needs_replan(index, now, current_price) {
            self.rebuild_plan(index, now, price_down, ups_health, probes_block)
                .await;
        }
        if let Some(plan) = self.outputs[index].plan.as_mut() {
            plan.refresh_remaining(now);
        }

        // Advance the machine and start any actuation.
        let gates = output::GateInputs {
            now,
            device_online,
            input_high,
            parent_on,
            ups_health,
            probes_block,
        };
        let action = self.outputs[index].advance(&gates);
        match action {
            Action::None => {}
            Action::StartTurnOn => self.start_sequence(index, true),
            Action::StartTurnOff => self.start_sequence(index, false),
        }
    }

    /// Evaluate temperature constraints against the latest probe readings.
    /// A stale or missing reading is unknown: it blocks a GreaterThan
    /// constraint and is ignored for LessThan.
    fn probes_block(
        &self,
        index: usize,
        devices: &BTreeMap<String, DeviceSnapshot>,
        now: DateTime<Utc>,
    ) -> bool {
        for (device, probe_index, condition, threshold) in &self.bindings[index].probes {
            let reading = devices
                .get(device)
                .and_then(|snap| snap.probes.get(probe_index))
                .filter(|r| now - r.read_at <= Duration::minutes(PROBE_STALE_MINUTES));
            match (condition, reading) {
                (TempCondition::GreaterThan, None) => return true,
                (TempCondition::GreaterThan, Some(r)) if r.temperature_c < *threshold => {
                    return true;
                }
                (TempCondition::LessThan, Some(r)) if r.temperature_c > *threshold => {
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// Current price for an output: live feed when available, else the
    /// schedule's nominal price, else the default.
    async fn current_price(&self, index: usize, now: DateTime<Utc>) -> f64 {
        let cfg = &self.outputs[index].cfg;
        if cfg.mode == RunMode::BestPrice {
            if let Some(point) = self.prices.price_at(cfg.channel, now).await {
                return point.price;
            }
        }
        cfg.schedule
            .as_deref()
            .and_then(|name| self.schedules.get(name))
            .map(|s| self.schedules.price_at(s, now))
            .unwrap_or_else(|| self.schedules.default_price())
    }

    fn needs_replan(&self, index: usize, now: DateTime<Utc>, current_price: f64) -> bool {
        let rt = &self.outputs[index];
        if rt.cfg.kind == OutputKind::Imported {
            return false;
        }
        if rt.plan.is_none() || rt.plan_invalidated {
            return true;
        }
        if now >= rt.next_plan_check {
            return true;
        }
        // Mid-run price spike: the cheapest-slot choice may no longer hold.
        if rt.cfg.mode == RunMode::BestPrice {
            if let (Some(plan), Some(selected)) = (&rt.plan, rt.price_at_selection) {
                if plan.wants_on(now) && selected > 0.0 && current_price > selected * 1.1 {
                    return true;
                }
            }
        }
        false
    }

    async fn rebuild_plan(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
        price_down: bool,
        ups_health: Option<UpsHealth>,
        probes_block: bool,
    ) {
        let from = now - Duration::hours(LOOKBACK_HOURS);
        let to = now + Duration::hours(HORIZON_HOURS + 1);

        let cfg = self.outputs[index].cfg.clone();
        let schedule = cfg.schedule.as_deref().and_then(|n| self.schedules.get(n));

        // Fallback covers the whole horizon; live points overlay it.
        let mut points = fallback_forecast(&self.schedules, schedule, cfg.channel, from, to);
        if cfg.mode == RunMode::BestPrice && !price_down {
            let live = self.prices.forecast(cfg.channel, from, to).await;
            let by_start: BTreeMap<_, _> = live.into_iter().map(|p| (p.start, p)).collect();
            for point in points.iter_mut() {
                if let Some(live_point) = by_start.get(&point.start) {
                    *point = live_point.clone();
                }
            }
        }

        let ups_forces_off = cfg
            .ups
            .as_ref()
            .map(|link| {
                link.action_if_unhealthy == crate::domain::UpsAction::TurnOff
                    && ups_health == Some(UpsHealth::Unhealthy)
            })
            .unwrap_or(false);

        let parent_plan = self.bindings[index]
            .parent
            .and_then(|p| self.outputs[p].plan.clone());

        let rt = &self.outputs[index];
        let request = PlanRequest {
            output: &cfg,
            now,
            tz: self.tz,
            accumulated_hours: rt.state.actual_hours_today(),
            shortfall_hours: rt.state.shortfall_hours,
            prices: &points,
            schedules: &self.schedules,
            ups_forces_off,
            probes_force_off: probes_block,
            app_override: rt.state.app_override.as_ref(),
            parent_plan: parent_plan.as_ref(),
            hourly_energy_wh: history::hourly_energy_wh(&rt.state),
        };
        let plan = build_plan(&request);

        match plan.status {
            PlanStatus::Failed => {
                let level_is_warn = cfg.target_hours < 0.0;
                if level_is_warn {
                    warn!(output = %cfg.name, "no eligible slots for all-hours plan");
                } else {
                    warn!(
                        output = %cfg.name,
                        required = plan.required_hours,
                        "run plan failed: could not allocate priority hours"
                    );
                }
                self.outputs[index].next_plan_check =
                    now + Duration::minutes(FAILED_PLAN_CHECK_MINUTES);
            }
            PlanStatus::Partial => {
                warn!(
                    output = %cfg.name,
                    planned = plan.planned_hours,
                    required = plan.required_hours,
                    "run plan partial: not enough low-price slots"
                );
                self.outputs[index].next_plan_check =
                    now + Duration::minutes(FAILED_PLAN_CHECK_MINUTES);
            }
            _ => {
                self.outputs[index].next_plan_check = now + Duration::minutes(PLAN_CHECK_MINUTES);
            }
        }
        debug!(output = %cfg.name, status = ?plan.status, planned = plan.planned_hours, "plan rebuilt");

        let shortfall = self.outputs[index].state.shortfall_hours;
        if cfg.max_shortfall_hours > 0.0 && shortfall >= cfg.max_shortfall_hours {
            self.notifier
                .report_issue(
                    &format!("Output {}", cfg.name),
                    "Reached MaxShortfall",
                    &format!(
                        "Accumulated shortfall has reached the configured maximum of {} hours. \
                         Review the configuration to make sure sufficient run hours are possible.",
                        cfg.max_shortfall_hours
                    ),
                )
                .await;
        } else {
            self.notifier
                .clear_issue(&format!("Output {}", cfg.name), "Reached MaxShortfall")
                .await;
        }

        let rt = &mut self.outputs[index];
        rt.price_at_selection = plan
            .current_slot(now)
            .0
            .and_then(|slot| slot.price);
        rt.plan = Some(plan);
        rt.plan_invalidated = false;
    }

    fn start_sequence(&mut self, index: usize, turning_on: bool) {
        let rt = &mut self.outputs[index];
        let seq_name = if turning_on {
            rt.cfg.turn_on_sequence.as_deref()
        } else {
            rt.cfg.turn_off_sequence.as_deref()
        };
        let sequence = match seq_name.and_then(|n| self.sequences.get(n)) {
            Some(seq) => seq.clone(),
            None => {
                let binding = &self.bindings[index];
                let (Some(device), Some(relay_index)) = (&binding.device, binding.relay_index)
                else {
                    error!(output = %rt.cfg.name, "switched output without a relay binding");
                    return;
                };
                let relay_name = rt.cfg.relay.clone().unwrap_or_default();
                Arc::new(Sequence::single_relay_change(
                    &relay_name,
                    crate::device::ComponentRef {
                        device: device.clone(),
                        index: relay_index,
                    },
                    turning_on,
                ))
            }
        };

        rt.sequence_in_flight = true;
        self.dirty = true;
        let registry = self.registry.clone();
        let done_tx = self.seq_done_tx.clone();
        let output_name = rt.cfg.name.clone();
        tokio::spawn(async move {
            let result = sequence.run(&registry).await;
            let done = SequenceDone {
                output: index,
                turning_on,
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            };
            if done_tx.send(done).await.is_err() {
                warn!(output = %output_name, "controller gone before sequence completion");
            }
        });
    }

    async fn handle_sequence_done(&mut self, done: SequenceDone) {
        let now = Utc::now();
        let rt = &mut self.outputs[done.output];
        rt.sequence_finished(done.turning_on, done.ok, now);
        self.dirty = true;
        if !done.ok {
            let message = done.error.unwrap_or_else(|| "unknown failure".to_string());
            self.notifier
                .report_issue(
                    &format!("Output {}", self.outputs[done.output].cfg.name),
                    "Action Request Failed",
                    &message,
                )
                .await;
        } else {
            self.notifier
                .clear_issue(
                    &format!("Output {}", self.outputs[done.output].cfg.name),
                    "Action Request Failed",
                )
                .await;
        }
    }

    fn apply_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::SetOverride {
                output,
                request,
                ttl_minutes,
                reply,
            } => {
                let now = Utc::now();
                let result = match self
                    .outputs
                    .iter_mut()
                    .find(|rt| rt.cfg.name == output)
                {
                    Some(rt) => {
                        let state = match request {
                            OverrideRequest::On => Some(OverrideState::On),
                            OverrideRequest::Off => Some(OverrideState::Off),
                            OverrideRequest::Auto => None,
                        };
                        if rt.set_override(state, ttl_minutes, now) {
                            self.dirty = true;
                        }
                        Ok(())
                    }
                    None => Err(format!("no output named '{output}'")),
                };
                let _ = reply.send(result);
            }
            ControlCommand::InputWebhook { device } => {
                debug!(device = %device, "input webhook, refreshing device status");
                if let Ok(handle) = self.registry.handle(&device) {
                    handle.request_refresh();
                }
            }
            ControlCommand::ReloadConfig(new_cfg) => {
                self.apply_config_reload(*new_cfg, Utc::now());
            }
        }
    }

    async fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Down { device } => {
                warn!(device = %device, "device declared down");
                for (index, binding) in self.bindings.iter().enumerate() {
                    if binding.device.as_deref() == Some(device.as_str()) {
                        let rt = &mut self.outputs[index];
                        if rt.is_switched() && !rt.sequence_in_flight {
                            rt.phase = Phase::Fault;
                            rt.state.relay = RelayState::Unknown;
                        }
                        rt.plan_invalidated = true;
                    }
                }
                self.dirty = true;
                self.notifier
                    .report_issue(
                        &format!("Device {device}"),
                        "Device Offline",
                        "Repeated RPC failures; dependent outputs are faulted.",
                    )
                    .await;
            }
            DeviceEvent::Up { device } => {
                info!(device = %device, "device recovered");
                for (index, binding) in self.bindings.iter().enumerate() {
                    if binding.device.as_deref() == Some(device.as_str()) {
                        self.outputs[index].plan_invalidated = true;
                    }
                }
                self.notifier
                    .clear_issue(&format!("Device {device}"), "Device Offline")
                    .await;
            }
            DeviceEvent::StatusUpdated { .. } => {}
        }
    }

    async fn watch_price_source(&mut self, down: bool) {
        if down
            && !self.price_source_reported_down
            && self.prices.consecutive_errors().await > 0
        {
            self.price_source_reported_down = true;
            warn!("price source down, planning from schedules and default price");
            self.notifier
                .report_issue(
                    "Price API",
                    "Connection Error",
                    "The price API has stopped responding; fallback pricing is in use.",
                )
                .await;
            for rt in self.outputs.iter_mut() {
                rt.plan_invalidated = true;
            }
        } else if !down && self.price_source_reported_down {
            self.price_source_reported_down = false;
            info!("price source recovered");
            self.notifier.clear_issue("Price API", "Connection Error").await;
            for rt in self.outputs.iter_mut() {
                rt.plan_invalidated = true;
            }
        }
    }

    /// Pull externally recorded sessions for imported outputs and attribute
    /// cost at each session's start price.
    async fn import_sessions(&mut self, now: DateTime<Utc>) {
        for index in 0..self.outputs.len() {
            if self.outputs[index].cfg.kind != OutputKind::Imported {
                continue;
            }
            let name = self.outputs[index].cfg.name.clone();
            let Some(source) = self.session_sources.get(&name).cloned() else {
                continue;
            };
            let due = self
                .last_import
                .get(&index)
                .map(|at| now - *at >= Duration::minutes(IMPORT_INTERVAL_MINUTES))
                .unwrap_or(true);
            if !due {
                continue;
            }
            let since = self
                .last_import
                .get(&index)
                .copied()
                .unwrap_or(now - Duration::hours(LOOKBACK_HOURS));
            self.last_import.insert(index, now);

            match source.fetch_sessions(since).await {
                Ok(sessions) => {
                    let channel = self.outputs[index].cfg.channel;
                    for session in sessions {
                        let price = self
                            .prices
                            .price_at(channel, session.start)
                            .await
                            .map(|p| p.price)
                            .unwrap_or_else(|| self.schedules.default_price());
                        let rt = &mut self.outputs[index];
                        rt.state.on_seconds_today +=
                            (session.end - session.start).num_seconds().max(0) as u64;
                        rt.state.energy_wh_today += session.energy_wh;
                        rt.state.cost_cents_today += (session.energy_wh / 1000.0) * price;
                        self.dirty = true;
                    }
                }
                Err(e) => warn!(output = %name, error = %e, "session import failed"),
            }
        }
    }

    /// Apply a replacement configuration pushed in by the watcher task.
    /// Outputs keep their state across a reload; a new config that fails
    /// resolution is rejected and the previous one stays in force. Device
    /// topology changes require a restart because workers are spawned at
    /// startup.
    fn apply_config_reload(&mut self, new_cfg: AppConfig, now: DateTime<Utc>) {
        let old_devices = serde_json::to_value(&self.cfg.devices).ok();
        let new_devices = serde_json::to_value(&new_cfg.devices).ok();
        if old_devices != new_devices {
            warn!("device section changed; a restart is required to apply it");
        }

        let location = match new_cfg.location.tz() {
            Ok(tz) => Location {
                latitude: new_cfg.location.latitude,
                longitude: new_cfg.location.longitude,
                tz,
            },
            Err(e) => {
                error!(error = %e, "config reload rejected: bad timezone");
                return;
            }
        };
        let schedules = match ScheduleBook::build(
            &new_cfg.schedules,
            location,
            new_cfg.general.default_price,
        ) {
            Ok(book) => book,
            Err(e) => {
                error!(error = %e, "config reload rejected: bad schedules");
                return;
            }
        };
        let bindings = match build_bindings(&new_cfg, &self.registry) {
            Ok(bindings) => bindings,
            Err(e) => {
                error!(error = %e, "config reload rejected: unresolved device references");
                return;
            }
        };
        let sequences = match build_sequences(&new_cfg) {
            Ok(sequences) => sequences,
            Err(e) => {
                error!(error = %e, "config reload rejected: bad sequences");
                return;
            }
        };
        let topo = match new_cfg.topological_output_order() {
            Ok(topo) => topo,
            Err(e) => {
                error!(error = %e, "config reload rejected: parent cycle");
                return;
            }
        };

        // Carry runtimes over by name; new outputs start fresh, removed
        // outputs are dropped.
        let today = crate::ephemeris::local_date(now, location.tz);
        let mut old: BTreeMap<String, OutputRuntime> = std::mem::take(&mut self.outputs)
            .into_iter()
            .map(|rt| (rt.cfg.name.clone(), rt))
            .collect();
        for output_cfg in &new_cfg.outputs {
            let rt = match old.remove(&output_cfg.name) {
                Some(mut rt) => {
                    rt.cfg = output_cfg.clone();
                    rt.plan_invalidated = true;
                    rt
                }
                None => OutputRuntime::new(output_cfg.clone(), OutputState::new(today), now),
            };
            self.outputs.push(rt);
        }
        for (name, _) in old {
            info!(output = %name, "output removed by config reload");
        }

        self.tz = location.tz;
        self.schedules = schedules;
        self.bindings = bindings;
        self.sequences = sequences;
        self.topo = topo;
        self.cfg = new_cfg;
        self.dirty = true;
        info!(outputs = self.outputs.len(), "configuration reloaded");
    }

    fn build_persisted(&self) -> PersistedState {
        let mut persisted = PersistedState::empty(Utc::now());
        persisted.extra = self.state_extra.clone();
        for rt in &self.outputs {
            persisted
                .outputs
                .insert(rt.cfg.name.clone(), rt.state.clone());
        }
        persisted
    }

    /// Hand the current document to the store writer. No disk I/O happens
    /// on this thread; if the writer's queue is full the dirty flag stays
    /// set and the next tick retries.
    fn flush_store(&mut self) {
        if self.store.queue_save(self.build_persisted()) {
            self.dirty = false;
        } else {
            debug!("store writer busy, retrying next tick");
        }
    }

    fn publish_snapshot(&self, now: DateTime<Utc>, price_down: bool) {
        let outputs = self
            .outputs
            .iter()
            .map(|rt| OutputSummary {
                name: rt.cfg.name.clone(),
                kind: rt.cfg.kind,
                phase: rt.phase,
                relay: rt.state.relay,
                reason: rt.last_reason,
                app_override: rt.state.active_override(now).cloned(),
                actual_hours_today: rt.state.actual_hours_today(),
                energy_wh_today: rt.state.energy_wh_today,
                cost_cents_today: rt.state.cost_cents_today,
                shortfall_hours: rt.state.shortfall_hours,
                plan: rt.plan.as_ref().map(|p| PlanSummary {
                    status: p.status,
                    required_hours: p.required_hours,
                    planned_hours: p.planned_hours,
                    remaining_hours: p.remaining_hours,
                    next_start: p.next_start,
                    next_stop: p.next_stop,
                    forecast_average_price: p.forecast_average_price,
                    estimated_cost_cents: p.estimated_cost_cents,
                }),
            })
            .collect();
        let ups = self
            .ups_rx
            .as_ref()
            .map(|rx| rx.borrow().values().cloned().collect())
            .unwrap_or_default();
        let _ = self.snapshot_tx.send(ControlSnapshot {
            label: self.cfg.general.label.clone(),
            generated_at: now,
            price_source_down: price_down,
            outputs,
            ups,
        });
    }

    /// Graceful shutdown: stop-on-exit outputs are commanded OFF with a
    /// bounded grace, state is flushed, workers drain.
    async fn shutdown(mut self) {
        info!("control loop shutting down");
        let grace = StdDuration::from_secs(self.cfg.general.shutdown_grace_secs);

        let mut pending = Vec::new();
        for index in 0..self.outputs.len() {
            let rt = &self.outputs[index];
            if rt.cfg.stop_on_exit && rt.is_switched() && rt.state.relay == RelayState::On {
                info!(output = %rt.cfg.name, "stop-on-exit: commanding off");
                self.start_sequence(index, false);
                pending.push(index);
            }
        }
        if !pending.is_empty() {
            let deadline = tokio::time::Instant::now() + grace;
            while !pending.is_empty() {
                let done = tokio::select! {
                    maybe = self.seq_done_rx.recv() => maybe,
                    _ = tokio::time::sleep_until(deadline) => None,
                };
                match done {
                    Some(done) => {
                        let now = Utc::now();
                        self.outputs[done.output].sequence_finished(done.turning_on, done.ok, now);
                        pending.retain(|&i| i != done.output);
                    }
                    None => {
                        warn!("shutdown grace expired with sequences outstanding");
                        break;
                    }
                }
            }
        }

        match tokio::time::timeout(grace, self.store.flush(self.build_persisted())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "final state flush failed"),
            Err(_) => warn!("final state flush timed out"),
        }
        self.registry.shutdown();
        info!("shutdown complete");
    }
}

/// Poll cadence for the configuration file watcher.
const CONFIG_POLL_SECS: u64 = 30;

/// Low-frequency watcher task: checks the config file's mtime and, on a
/// change, parses the replacement on the blocking pool and pushes it into
/// the control loop through the command channel. The loop itself never
/// touches the filesystem for this.
pub async fn watch_config_file(watcher: ConfigWatcher, commands: mpsc::Sender<ControlCommand>) {
    let mut watcher = watcher;
    let mut ticker = tokio::time::interval(StdDuration::from_secs(CONFIG_POLL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let checked = tokio::task::spawn_blocking(move || {
            let mut watcher = watcher;
            let changed = watcher.changed();
            (watcher, changed)
        })
        .await;
        let changed = match checked {
            Ok((returned, changed)) => {
                watcher = returned;
                changed
            }
            Err(e) => {
                error!(error = %e, "config watcher task failed");
                return;
            }
        };
        if !changed {
            continue;
        }

        info!("configuration file changed, reloading");
        let path = watcher.path().to_path_buf();
        match tokio::task::spawn_blocking(move || AppConfig::load(&path)).await {
            Ok(Ok(new_cfg)) => {
                if commands
                    .send(ControlCommand::ReloadConfig(Box::new(new_cfg)))
                    .await
                    .is_err()
                {
                    return; // control loop is gone
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "config reload failed, keeping previous configuration");
            }
            Err(e) => error!(error = %e, "config reload task failed"),
        }
    }
}

fn build_bindings(cfg: &AppConfig, registry: &DeviceRegistry) -> Result<Vec<Bindings>> {
    let index_by_name: BTreeMap<&str, usize> = cfg
        .outputs
        .iter()
        .enumerate()
        .map(|(i, o)| (o.name.as_str(), i))
        .collect();
    let mut bindings = Vec::with_capacity(cfg.outputs.len());
    for output_cfg in &cfg.outputs {
        let relay = output_cfg
            .relay
            .as_deref()
            .map(|name| registry.relay(name).map(|r| (r.device.clone(), r.index)))
            .transpose()?;
        let meter = output_cfg
            .meter
            .as_deref()
            .map(|name| registry.meter(name).map(|r| (r.device.clone(), r.index)))
            .transpose()?;
        let input = output_cfg
            .input
            .as_deref()
            .map(|name| registry.input(name).map(|r| (r.device.clone(), r.index)))
            .transpose()?;
        let mut probes = Vec::new();
        for constraint in &output_cfg.temp_constraints {
            let probe = registry.probe(&constraint.probe)?;
            probes.push((
                probe.device.clone(),
                probe.index,
                constraint.condition,
                constraint.temperature,
            ));
        }
        bindings.push(Bindings {
            device: relay.as_ref().map(|(d, _)| d.clone()),
            relay_index: relay.map(|(_, i)| i),
            meter_device: meter.as_ref().map(|(d, _)| d.clone()),
            meter_index: meter.map(|(_, i)| i),
            input_device: input.as_ref().map(|(d, _)| d.clone()),
            input_index: input.map(|(_, i)| i),
            probes,
            parent: output_cfg.parent.as_deref().map(|p| index_by_name[p]),
        });
    }
    Ok(bindings)
}

fn build_sequences(cfg: &AppConfig) -> Result<BTreeMap<String, Arc<Sequence>>> {
    let mut sequences = BTreeMap::new();
    for seq_cfg in &cfg.sequences {
        let sequence = Sequence::build(seq_cfg, cfg)
            .with_context(|| format!("building sequence '{}'", seq_cfg.name))?;
        sequences.insert(seq_cfg.name.clone(), Arc::new(sequence));
    }
    Ok(sequences)
}
