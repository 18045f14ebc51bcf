use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{UpsConfig, UpsDeviceConfig};
use crate::domain::{BatteryState, UpsHealth, UpsReading, UpsStatus};

pub type UpsSnapshot = BTreeMap<String, UpsStatus>;

/// Polls the configured UPS scripts and publishes evaluated health over a
/// watch channel. Script execution is bounded; a failed or malformed run
/// yields health Unknown, which controllers treat as "ignore the link".
pub struct UpsMonitor {
    cfg: UpsConfig,
    tx: watch::Sender<UpsSnapshot>,
}

impl UpsMonitor {
    pub fn new(cfg: UpsConfig) -> (Self, watch::Receiver<UpsSnapshot>) {
        let initial: UpsSnapshot = cfg
            .devices
            .iter()
            .map(|d| (d.name.clone(), UpsStatus::unknown(&d.name)))
            .collect();
        let (tx, rx) = watch::channel(initial);
        (Self { cfg, tx }, rx)
    }

    /// Poll loop; wakes `notify` whenever any UPS health transitions.
    pub async fn run(self, notify: tokio::sync::mpsc::Sender<()>) {
        let interval = Duration::from_secs(self.cfg.polling_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut changed = false;
            for device in &self.cfg.devices {
                let status = self.poll_one(device).await;
                self.tx.send_modify(|snapshot| {
                    let previous = snapshot.get(&device.name).map(|s| s.health);
                    if previous != Some(status.health) {
                        changed = true;
                    }
                    snapshot.insert(device.name.clone(), status);
                });
            }
            if changed {
                let _ = notify.try_send(());
            }
        }
    }

    async fn poll_one(&self, device: &UpsDeviceConfig) -> UpsStatus {
        match self.execute_script(device).await {
            Ok(reading) if reading.is_usable() => {
                let health = evaluate_health(device, &reading);
                UpsStatus {
                    name: device.name.clone(),
                    last_seen: Some(reading.timestamp),
                    battery_state: Some(reading.battery_state),
                    charge_percent: reading.battery_charge_percent,
                    runtime_seconds: reading.battery_runtime_seconds,
                    health,
                }
            }
            Ok(_) => {
                warn!(ups = %device.name, "UPS script reported neither charge nor runtime");
                UpsStatus::unknown(&device.name)
            }
            Err(e) => {
                warn!(ups = %device.name, error = %e, "UPS script failed");
                UpsStatus::unknown(&device.name)
            }
        }
    }

    async fn execute_script(&self, device: &UpsDeviceConfig) -> anyhow::Result<UpsReading> {
        let mut parts = device.script.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty script command"))?;
        let mut command = Command::new(program);
        command
            .args(parts)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.cfg.script_timeout_secs);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("script timed out after {timeout:?}"))??;

        if !output.status.success() {
            anyhow::bail!(
                "script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let reading: UpsReading = serde_json::from_slice(&output.stdout)
            .map_err(|e| anyhow::anyhow!("malformed script output: {e}"))?;
        debug!(ups = %device.name, state = ?reading.battery_state, "UPS reading");
        Ok(reading)
    }
}

/// Health thresholds depend on what the battery is doing. A charged battery
/// is healthy by definition; otherwise charge and runtime are checked
/// against the matching minimums. A threshold of zero is disabled.
pub fn evaluate_health(device: &UpsDeviceConfig, reading: &UpsReading) -> UpsHealth {
    let (min_charge, min_runtime) = match reading.battery_state {
        BatteryState::Charged => return UpsHealth::Healthy,
        BatteryState::Charging => (device.min_charge_when_charging, device.min_runtime_when_charging),
        BatteryState::Discharging => (
            device.min_charge_when_discharging,
            device.min_runtime_when_discharging,
        ),
    };

    if min_charge > 0.0 {
        match reading.battery_charge_percent {
            Some(charge) if charge < min_charge => return UpsHealth::Unhealthy,
            _ => {}
        }
    }
    if min_runtime > 0 {
        match reading.battery_runtime_seconds {
            Some(runtime) if runtime < min_runtime => return UpsHealth::Unhealthy,
            _ => {}
        }
    }
    UpsHealth::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn device() -> UpsDeviceConfig {
        UpsDeviceConfig {
            name: "rack".to_string(),
            script: "/usr/local/bin/ups-status.sh".to_string(),
            min_charge_when_charging: 0.0,
            min_runtime_when_charging: 0,
            min_charge_when_discharging: 10.0,
            min_runtime_when_discharging: 300,
        }
    }

    fn reading(state: BatteryState, charge: Option<f64>, runtime: Option<i64>) -> UpsReading {
        UpsReading {
            timestamp: Utc::now(),
            battery_state: state,
            battery_charge_percent: charge,
            battery_runtime_seconds: runtime,
        }
    }

    #[test]
    fn charged_battery_is_always_healthy() {
        let r = reading(BatteryState::Charged, Some(1.0), Some(1));
        assert_eq!(evaluate_health(&device(), &r), UpsHealth::Healthy);
    }

    #[test]
    fn discharging_below_charge_threshold_is_unhealthy() {
        let r = reading(BatteryState::Discharging, Some(8.0), Some(3600));
        assert_eq!(evaluate_health(&device(), &r), UpsHealth::Unhealthy);
    }

    #[test]
    fn discharging_below_runtime_threshold_is_unhealthy() {
        let r = reading(BatteryState::Discharging, Some(80.0), Some(120));
        assert_eq!(evaluate_health(&device(), &r), UpsHealth::Unhealthy);
    }

    #[test]
    fn charging_thresholds_of_zero_are_disabled() {
        let r = reading(BatteryState::Charging, Some(1.0), Some(1));
        assert_eq!(evaluate_health(&device(), &r), UpsHealth::Healthy);
    }

    #[test]
    fn missing_metric_does_not_trip_a_threshold() {
        // Charge absent: only runtime is checked.
        let r = reading(BatteryState::Discharging, None, Some(3600));
        assert_eq!(evaluate_health(&device(), &r), UpsHealth::Healthy);
    }

    #[test]
    fn unusable_reading_detected() {
        let r = reading(BatteryState::Discharging, None, None);
        assert!(!r.is_usable());
    }
}
