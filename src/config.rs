use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use validator::Validate;

use crate::domain::{Channel, InputMode, OutputKind, RunMode, TempCondition, UpsAction};

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub general: GeneralConfig,

    #[validate(nested)]
    pub files: FilesConfig,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub price_api: PriceApiConfig,

    #[serde(default)]
    #[validate(nested)]
    pub email: Option<EmailConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub heartbeat: Option<HeartbeatConfig>,

    #[validate(nested)]
    pub location: LocationConfig,

    #[validate(nested)]
    pub devices: DevicesConfig,

    #[validate(nested)]
    pub outputs: Vec<OutputConfig>,

    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,

    #[serde(default)]
    pub sequences: Vec<SequenceConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub ups: Option<UpsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GeneralConfig {
    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default = "default_polling_interval_secs")]
    #[validate(range(min = 1, max = 600))]
    pub polling_interval_secs: u64,

    /// Nominal price (c/kWh) used when neither the price feed nor a schedule
    /// window supplies one.
    #[serde(default = "default_price")]
    #[validate(range(min = 0.0, max = 1000.0))]
    pub default_price: f64,

    /// An issue must persist this long before an email goes out, and no two
    /// emails for the same issue are sent within the window.
    #[serde(default = "default_report_delay_mins")]
    #[validate(range(min = 1, max = 3600))]
    pub report_critical_errors_delay_mins: u64,

    /// Grace given to workers to drain in-flight requests at shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FilesConfig {
    pub state_file: PathBuf,

    #[serde(default = "default_prices_cache_file")]
    pub prices_cache_file: PathBuf,

    #[serde(default = "default_days_of_history")]
    #[validate(range(min = 2, max = 365))]
    pub days_of_history: u32,
}

/// HTTP command surface configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// When set, every request must carry this key as a bearer token.
    #[serde(default)]
    pub access_key: Option<String>,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum PriceApiMode {
    Live,
    Offline,
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PriceApiConfig {
    #[serde(default = "default_price_api_mode")]
    pub mode: PriceApiMode,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Falls back to the AMBER_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_price_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,

    #[serde(default = "default_refresh_interval_mins")]
    #[validate(range(min = 1, max = 60))]
    pub refresh_interval_mins: u64,

    /// Served prices degrade to cached-stale once the last successful
    /// refresh is older than this.
    #[serde(default = "default_stale_after_mins")]
    #[validate(range(min = 1, max = 1440))]
    pub stale_after_mins: u64,

    /// Consecutive refresh failures before the source is declared down.
    #[serde(default = "default_max_concurrent_errors")]
    pub max_concurrent_errors: u32,

    /// Forward horizon requested from the API, in half-hour intervals.
    #[serde(default = "default_forecast_intervals")]
    #[validate(range(min = 48, max = 2048))]
    pub forecast_intervals: u32,

    #[serde(default = "default_usage_max_days")]
    pub usage_max_days: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EmailConfig {
    #[validate(length(min = 1))]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Falls back to the SMTP_USERNAME environment variable.
    #[serde(default)]
    pub username: Option<String>,

    /// Falls back to the SMTP_PASSWORD environment variable.
    #[serde(default)]
    pub password: Option<String>,

    #[validate(email)]
    pub from: String,

    #[validate(email)]
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HeartbeatConfig {
    #[validate(url)]
    pub url: String,

    #[serde(default = "default_heartbeat_frequency_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub frequency_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LocationConfig {
    /// IANA timezone name, e.g. "Australia/Sydney".
    #[validate(length(min = 1))]
    pub timezone: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

impl LocationConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {e}", self.timezone))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DevicesConfig {
    #[serde(default = "default_device_max_errors")]
    pub max_concurrent_errors: u32,

    #[serde(default = "default_response_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub response_timeout_secs: u64,

    #[serde(default = "default_retry_count")]
    #[validate(range(min = 0, max = 10))]
    pub retry_count: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Meter reads within this window of a previous read return the cached
    /// value instead of another RPC.
    #[serde(default = "default_meter_staleness_secs")]
    pub meter_staleness_secs: u64,

    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default)]
    pub relays: Vec<ComponentConfig>,

    #[serde(default)]
    pub meters: Vec<ComponentConfig>,

    #[serde(default)]
    pub inputs: Vec<ComponentConfig>,

    #[serde(default)]
    pub probes: Vec<ComponentConfig>,
}

/// A named relay/meter/input/probe endpoint on a device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComponentConfig {
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DateRange {
    pub start: chrono::NaiveDate,
    pub end: chrono::NaiveDate,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TempConstraintConfig {
    pub probe: String,
    pub condition: TempCondition,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpsLinkConfig {
    pub name: String,
    pub action_if_unhealthy: UpsAction,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_output_config"))]
pub struct OutputConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_output_kind")]
    pub kind: OutputKind,

    pub mode: RunMode,

    #[serde(default)]
    pub relay: Option<String>,

    #[serde(default)]
    pub meter: Option<String>,

    #[serde(default)]
    pub input: Option<String>,

    #[serde(default = "default_input_mode")]
    pub input_mode: InputMode,

    #[serde(default)]
    pub schedule: Option<String>,

    #[serde(default)]
    pub constraint_schedule: Option<String>,

    #[serde(default)]
    pub channel: Channel,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 24.0))]
    pub min_hours: f64,

    /// -1 selects every eligible slot for the rest of the day.
    #[serde(default = "default_target_hours")]
    #[validate(range(min = -1.0, max = 24.0))]
    pub target_hours: f64,

    #[serde(default = "default_max_hours")]
    #[validate(range(min = 0.0, max = 24.0))]
    pub max_hours: f64,

    /// Per-month TargetHours overrides, keyed by English month name.
    #[serde(default)]
    pub monthly_target_hours: BTreeMap<String, f64>,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 24.0))]
    pub max_shortfall_hours: f64,

    #[serde(default = "default_max_best_price")]
    #[validate(range(min = 0.1, max = 1000.0))]
    pub max_best_price: f64,

    #[serde(default = "default_max_priority_price")]
    #[validate(range(min = 0.1, max = 1000.0))]
    pub max_priority_price: f64,

    #[serde(default)]
    #[validate(range(min = 0, max = 1440))]
    pub min_on_minutes: u64,

    #[serde(default)]
    pub min_off_minutes: Option<u64>,

    /// Mutually exclusive with min_off_minutes: force a turn-on once the
    /// output has been continuously off this long.
    #[serde(default)]
    pub max_off_minutes: Option<u64>,

    #[serde(default)]
    pub dates_off: Vec<DateRange>,

    #[serde(default)]
    pub stop_on_exit: bool,

    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub turn_on_sequence: Option<String>,

    #[serde(default)]
    pub turn_off_sequence: Option<String>,

    /// Cap on an app-override ON before it reverts to plan control.
    /// Zero disables the cap.
    #[serde(default)]
    #[validate(range(min = 0, max = 2880))]
    pub max_app_on_minutes: u64,

    #[serde(default)]
    #[validate(range(min = 0, max = 2880))]
    pub max_app_off_minutes: u64,

    #[serde(default)]
    pub temp_constraints: Vec<TempConstraintConfig>,

    #[serde(default)]
    pub ups: Option<UpsLinkConfig>,

    // Meter-kind thresholds
    #[serde(default = "default_power_on_threshold")]
    pub power_on_threshold_w: f64,

    #[serde(default = "default_power_off_threshold")]
    pub power_off_threshold_w: f64,

    /// Sessions that used less than this are not logged.
    #[serde(default)]
    pub min_energy_to_log_wh: f64,
}

impl OutputConfig {
    /// Today's target, honouring the monthly override table. `None` means
    /// "all eligible hours" (target_hours == -1).
    pub fn target_hours_for(&self, month: chrono::Month) -> Option<f64> {
        if self.target_hours < 0.0 {
            return None;
        }
        let target = self
            .monthly_target_hours
            .get(month.name())
            .copied()
            .unwrap_or(self.target_hours);
        Some(target.min(self.max_hours))
    }

    pub fn is_date_off(&self, date: chrono::NaiveDate) -> bool {
        self.dates_off.iter().any(|r| r.start <= date && date <= r.end)
    }
}

fn validate_output_config(cfg: &OutputConfig) -> Result<(), validator::ValidationError> {
    if cfg.min_off_minutes.is_some() && cfg.max_off_minutes.is_some() {
        return Err(validator::ValidationError::new(
            "min_off_minutes and max_off_minutes are mutually exclusive",
        ));
    }
    if cfg.target_hours >= 0.0 {
        if cfg.max_hours < cfg.min_hours {
            return Err(validator::ValidationError::new(
                "max_hours must be at least min_hours",
            ));
        }
        let target = cfg.target_hours;
        if target < cfg.min_hours || target > cfg.max_hours {
            return Err(validator::ValidationError::new(
                "target_hours must lie between min_hours and max_hours",
            ));
        }
    }
    if cfg.power_off_threshold_w > cfg.power_on_threshold_w {
        return Err(validator::ValidationError::new(
            "power_off_threshold_w must not exceed power_on_threshold_w",
        ));
    }
    match cfg.kind {
        OutputKind::Switched => {
            if cfg.relay.is_none() {
                return Err(validator::ValidationError::new(
                    "switched outputs require a relay reference",
                ));
            }
        }
        OutputKind::Meter => {
            if cfg.meter.is_none() {
                return Err(validator::ValidationError::new(
                    "meter outputs require a meter reference",
                ));
            }
            if cfg.relay.is_some() || cfg.input.is_some() {
                return Err(validator::ValidationError::new(
                    "meter outputs cannot reference a relay or input",
                ));
            }
        }
        OutputKind::Imported => {
            if cfg.relay.is_some() || cfg.meter.is_some() || cfg.input.is_some() {
                return Err(validator::ValidationError::new(
                    "imported outputs cannot reference device components",
                ));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub windows: Vec<WindowConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowConfig {
    /// "HH:MM", or "dawn"/"dusk" with an optional +HH:MM / -HH:MM offset.
    pub start: String,
    pub end: String,
    /// "All" or a comma-separated day list such as "Mon,Tue,Fri".
    #[serde(default = "default_days")]
    pub days: String,
    #[serde(default)]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequenceConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_sequence_timeout_secs")]
    pub timeout_secs: u64,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum StepConfig {
    ChangeOutput {
        relay: String,
        state: bool,
        #[serde(default = "default_step_retries")]
        retries: u32,
        #[serde(default = "default_step_backoff_secs")]
        retry_backoff_secs: f64,
    },
    Sleep {
        seconds: f64,
    },
    RefreshStatus,
    GetLocation {
        device: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpsConfig {
    #[serde(default = "default_ups_polling_secs")]
    #[validate(range(min = 5, max = 3600))]
    pub polling_interval_secs: u64,

    #[serde(default = "default_ups_script_timeout_secs")]
    pub script_timeout_secs: u64,

    pub devices: Vec<UpsDeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpsDeviceConfig {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub min_charge_when_charging: f64,
    #[serde(default)]
    pub min_runtime_when_charging: i64,
    #[serde(default)]
    pub min_charge_when_discharging: f64,
    #[serde(default)]
    pub min_runtime_when_discharging: i64,
}

// Default value functions
fn default_label() -> String { "PowerController".to_string() }
fn default_polling_interval_secs() -> u64 { 30 }
fn default_price() -> f64 { 30.0 }
fn default_report_delay_mins() -> u64 { 30 }
fn default_shutdown_grace_secs() -> u64 { 10 }
fn default_prices_cache_file() -> PathBuf { PathBuf::from("latest_prices.json") }
fn default_days_of_history() -> u32 { 14 }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_price_api_mode() -> PriceApiMode { PriceApiMode::Live }
fn default_price_timeout_secs() -> u64 { 10 }
fn default_refresh_interval_mins() -> u64 { 5 }
fn default_stale_after_mins() -> u64 { 90 }
fn default_max_concurrent_errors() -> u32 { 10 }
fn default_forecast_intervals() -> u32 { 96 }
fn default_usage_max_days() -> u32 { 30 }
fn default_smtp_port() -> u16 { 587 }
fn default_heartbeat_frequency_secs() -> u64 { 60 }
fn default_heartbeat_timeout_secs() -> u64 { 10 }
fn default_device_max_errors() -> u32 { 4 }
fn default_response_timeout_secs() -> u64 { 5 }
fn default_retry_count() -> u32 { 2 }
fn default_retry_delay_secs() -> u64 { 1 }
fn default_meter_staleness_secs() -> u64 { 10 }
fn default_output_kind() -> OutputKind { OutputKind::Switched }
fn default_input_mode() -> InputMode { InputMode::Ignore }
fn default_target_hours() -> f64 { 8.0 }
fn default_max_hours() -> f64 { 24.0 }
fn default_max_best_price() -> f64 { 25.0 }
fn default_max_priority_price() -> f64 { 35.0 }
fn default_power_on_threshold() -> f64 { 100.0 }
fn default_power_off_threshold() -> f64 { 20.0 }
fn default_days() -> String { "All".to_string() }
fn default_sequence_timeout_secs() -> u64 { 30 }
fn default_step_retries() -> u32 { 2 }
fn default_step_backoff_secs() -> f64 { 1.0 }
fn default_ups_polling_secs() -> u64 { 60 }
fn default_ups_script_timeout_secs() -> u64 { 5 }

impl AppConfig {
    /// Load configuration from a TOML file plus environment overrides.
    ///
    /// Values can be overridden with POWERCTL__-prefixed environment
    /// variables (POWERCTL__SERVER__PORT -> server.port). Secrets may be
    /// supplied through their dedicated variables (AMBER_API_KEY,
    /// SMTP_USERNAME, SMTP_PASSWORD, WEBAPP_ACCESS_KEY).
    pub fn load(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("POWERCTL__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .context("Failed to parse configuration")?;

        config.apply_secret_env();

        config
            .validate()
            .context("Configuration validation failed")?;
        config.validate_references()?;

        Ok(config)
    }

    fn apply_secret_env(&mut self) {
        if self.price_api.api_key.is_none() {
            self.price_api.api_key = std::env::var("AMBER_API_KEY").ok();
        }
        if let Some(email) = self.email.as_mut() {
            if email.username.is_none() {
                email.username = std::env::var("SMTP_USERNAME").ok();
            }
            if email.password.is_none() {
                email.password = std::env::var("SMTP_PASSWORD").ok();
            }
        }
        if self.server.access_key.is_none() {
            self.server.access_key = std::env::var("WEBAPP_ACCESS_KEY").ok();
        }
    }

    /// Cross-reference validation: every name an output mentions must
    /// resolve to a declared device component, schedule, sequence or UPS,
    /// output names must be unique, no relay may serve two outputs, and the
    /// parent graph must be acyclic.
    pub fn validate_references(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for output in &self.outputs {
            if !names.insert(output.name.as_str()) {
                bail!("output names must be unique: '{}' appears twice", output.name);
            }
        }

        let component_names = |pick: fn(&DeviceConfig) -> &Vec<ComponentConfig>| {
            self.devices
                .devices
                .iter()
                .flat_map(move |d| pick(d).iter().map(|c| c.name.as_str()))
                .collect::<std::collections::BTreeSet<_>>()
        };
        let relays = component_names(|d| &d.relays);
        let meters = component_names(|d| &d.meters);
        let inputs = component_names(|d| &d.inputs);
        let probes = component_names(|d| &d.probes);
        let schedules: std::collections::BTreeSet<_> =
            self.schedules.iter().map(|s| s.name.as_str()).collect();
        let sequences: std::collections::BTreeSet<_> =
            self.sequences.iter().map(|s| s.name.as_str()).collect();
        let ups_names: std::collections::BTreeSet<_> = self
            .ups
            .iter()
            .flat_map(|u| u.devices.iter().map(|d| d.name.as_str()))
            .collect();

        let mut relay_users: BTreeMap<&str, &str> = BTreeMap::new();
        for output in &self.outputs {
            let ctx = &output.name;
            if let Some(relay) = &output.relay {
                if !relays.contains(relay.as_str()) {
                    bail!("output '{ctx}': relay '{relay}' is not declared");
                }
                if let Some(other) = relay_users.insert(relay, ctx) {
                    bail!("relay '{relay}' is used by both '{other}' and '{ctx}'");
                }
            }
            if let Some(meter) = &output.meter {
                if !meters.contains(meter.as_str()) {
                    bail!("output '{ctx}': meter '{meter}' is not declared");
                }
            }
            if let Some(input) = &output.input {
                if !inputs.contains(input.as_str()) {
                    bail!("output '{ctx}': input '{input}' is not declared");
                }
            }
            for constraint in &output.temp_constraints {
                if !probes.contains(constraint.probe.as_str()) {
                    bail!("output '{ctx}': probe '{}' is not declared", constraint.probe);
                }
            }
            if let Some(schedule) = &output.schedule {
                if !schedules.contains(schedule.as_str()) {
                    bail!("output '{ctx}': schedule '{schedule}' is not declared");
                }
            } else if output.mode == RunMode::Schedule {
                bail!("output '{ctx}': schedule mode requires a schedule");
            }
            if let Some(schedule) = &output.constraint_schedule {
                if !schedules.contains(schedule.as_str()) {
                    bail!("output '{ctx}': constraint schedule '{schedule}' is not declared");
                }
            }
            for seq in [&output.turn_on_sequence, &output.turn_off_sequence].into_iter().flatten() {
                if !sequences.contains(seq.as_str()) {
                    bail!("output '{ctx}': sequence '{seq}' is not declared");
                }
            }
            if let Some(ups) = &output.ups {
                if !ups_names.contains(ups.name.as_str()) {
                    bail!("output '{ctx}': UPS '{}' is not declared", ups.name);
                }
            }
            if let Some(parent) = &output.parent {
                if parent == ctx {
                    bail!("output '{ctx}' cannot be its own parent");
                }
                if !names.contains(parent.as_str()) {
                    bail!("output '{ctx}': parent '{parent}' is not declared");
                }
            }
        }

        self.topological_output_order()?;
        Ok(())
    }

    /// Output indices ordered parents-before-children. Fails on a cycle.
    pub fn topological_output_order(&self) -> Result<Vec<usize>> {
        let index: BTreeMap<&str, usize> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(i, o)| (o.name.as_str(), i))
            .collect();

        let mut order = Vec::with_capacity(self.outputs.len());
        // 0 = unvisited, 1 = in progress, 2 = done
        let mut mark = vec![0u8; self.outputs.len()];

        fn visit(
            i: usize,
            outputs: &[OutputConfig],
            index: &BTreeMap<&str, usize>,
            mark: &mut [u8],
            order: &mut Vec<usize>,
        ) -> Result<()> {
            match mark[i] {
                2 => return Ok(()),
                1 => bail!("parent cycle involving output '{}'", outputs[i].name),
                _ => {}
            }
            mark[i] = 1;
            if let Some(parent) = &outputs[i].parent {
                let p = index[parent.as_str()];
                visit(p, outputs, index, mark, order)?;
            }
            mark[i] = 2;
            order.push(i);
            Ok(())
        }

        for i in 0..self.outputs.len() {
            visit(i, &self.outputs, &index, &mut mark, &mut order)?;
        }
        Ok(order)
    }

    /// Device name owning the given relay component, with its index.
    pub fn locate_relay(&self, name: &str) -> Option<(&DeviceConfig, u32)> {
        self.locate(name, |d| &d.relays)
    }

    pub fn locate_meter(&self, name: &str) -> Option<(&DeviceConfig, u32)> {
        self.locate(name, |d| &d.meters)
    }

    pub fn locate_input(&self, name: &str) -> Option<(&DeviceConfig, u32)> {
        self.locate(name, |d| &d.inputs)
    }

    pub fn locate_probe(&self, name: &str) -> Option<(&DeviceConfig, u32)> {
        self.locate(name, |d| &d.probes)
    }

    fn locate(
        &self,
        name: &str,
        pick: fn(&DeviceConfig) -> &Vec<ComponentConfig>,
    ) -> Option<(&DeviceConfig, u32)> {
        for device in &self.devices.devices {
            if let Some(c) = pick(device).iter().find(|c| c.name == name) {
                return Some((device, c.index));
            }
        }
        None
    }
}

/// Watches the config file's modification time so the control loop can
/// reload on change.
pub struct ConfigWatcher {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        let last_seen = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self { path, last_seen }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the file has been modified since the last check.
    pub fn changed(&mut self) -> bool {
        let current = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if current != self.last_seen && current.is_some() {
            self.last_seen = current;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_output(name: &str) -> OutputConfig {
        OutputConfig {
            name: name.to_string(),
            kind: OutputKind::Switched,
            mode: RunMode::BestPrice,
            relay: Some(format!("{name} Relay")),
            meter: None,
            input: None,
            input_mode: InputMode::Ignore,
            schedule: None,
            constraint_schedule: None,
            channel: Channel::General,
            min_hours: 0.0,
            target_hours: 4.0,
            max_hours: 8.0,
            monthly_target_hours: BTreeMap::new(),
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
            max_app_on_minutes: 0,
            max_app_off_minutes: 0,
            temp_constraints: Vec::new(),
            ups: None,
            power_on_threshold_w: 100.0,
            power_off_threshold_w: 20.0,
            min_energy_to_log_wh: 0.0,
        }
    }

    fn minimal_config(outputs: Vec<OutputConfig>) -> AppConfig {
        let devices = outputs
            .iter()
            .filter_map(|o| o.relay.clone())
            .enumerate()
            .map(|(i, relay)| DeviceConfig {
                name: format!("dev{i}"),
                host: "10.0.0.1".to_string(),
                relays: vec![ComponentConfig { name: relay, index: 0 }],
                meters: Vec::new(),
                inputs: Vec::new(),
                probes: Vec::new(),
            })
            .collect();
        AppConfig {
            general: GeneralConfig {
                label: default_label(),
                polling_interval_secs: 30,
                default_price: 30.0,
                report_critical_errors_delay_mins: 30,
                shutdown_grace_secs: 10,
            },
            files: FilesConfig {
                state_file: PathBuf::from("state.json"),
                prices_cache_file: default_prices_cache_file(),
                days_of_history: 14,
            },
            server: ServerConfig {
                host: default_host(),
                port: 8080,
                access_key: None,
            },
            price_api: PriceApiConfig {
                mode: PriceApiMode::Disabled,
                base_url: None,
                api_key: None,
                timeout_secs: 10,
                refresh_interval_mins: 5,
                stale_after_mins: 90,
                max_concurrent_errors: 10,
                forecast_intervals: 96,
                usage_max_days: 30,
            },
            email: None,
            heartbeat: None,
            location: LocationConfig {
                timezone: "Australia/Sydney".to_string(),
                latitude: -33.86,
                longitude: 151.2,
            },
            devices: DevicesConfig {
                max_concurrent_errors: 4,
                response_timeout_secs: 5,
                retry_count: 2,
                retry_delay_secs: 1,
                meter_staleness_secs: 10,
                devices,
            },
            outputs,
            schedules: Vec::new(),
            sequences: Vec::new(),
            ups: None,
        }
    }

    #[test]
    fn min_off_and_max_off_are_mutually_exclusive() {
        let mut output = minimal_output("Pump");
        output.min_off_minutes = Some(10);
        output.max_off_minutes = Some(120);
        assert!(output.validate().is_err());

        output.max_off_minutes = None;
        assert!(output.validate().is_ok());
    }

    #[test]
    fn meter_kind_rejects_relay_reference() {
        let mut output = minimal_output("Oven");
        output.kind = OutputKind::Meter;
        output.meter = Some("Oven Meter".to_string());
        assert!(output.validate().is_err());

        output.relay = None;
        assert!(output.validate().is_ok());
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let mut a = minimal_output("A");
        let mut b = minimal_output("B");
        a.parent = Some("B".to_string());
        b.parent = Some("A".to_string());
        let config = minimal_config(vec![a, b]);
        assert!(config.validate_references().is_err());
    }

    #[test]
    fn topological_order_puts_parents_first() {
        let mut child = minimal_output("Child");
        child.parent = Some("Parent".to_string());
        let parent = minimal_output("Parent");
        let config = minimal_config(vec![child, parent]);
        let order = config.topological_output_order().unwrap();
        let parent_pos = order.iter().position(|&i| config.outputs[i].name == "Parent").unwrap();
        let child_pos = order.iter().position(|&i| config.outputs[i].name == "Child").unwrap();
        assert!(parent_pos < child_pos);
    }

    #[test]
    fn duplicate_relay_use_is_rejected() {
        let mut a = minimal_output("A");
        let b = minimal_output("B");
        a.relay = b.relay.clone();
        let config = minimal_config(vec![a, b]);
        assert!(config.validate_references().is_err());
    }

    #[test]
    fn monthly_override_caps_at_max_hours() {
        let mut output = minimal_output("Heater");
        output.max_hours = 6.0;
        output
            .monthly_target_hours
            .insert("July".to_string(), 10.0);
        assert_eq!(output.target_hours_for(chrono::Month::July), Some(6.0));
        assert_eq!(output.target_hours_for(chrono::Month::January), Some(4.0));
    }

    #[test]
    fn all_hours_mode_has_no_target() {
        let mut output = minimal_output("HotWater");
        output.target_hours = -1.0;
        assert_eq!(output.target_hours_for(chrono::Month::May), None);
    }
}
