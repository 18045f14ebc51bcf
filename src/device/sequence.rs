use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{AppConfig, SequenceConfig, StepConfig};

use super::{ComponentRef, DeviceError, DeviceRegistry};

/// One resolved step of a turn-on/turn-off recipe.
#[derive(Debug, Clone)]
pub enum Step {
    ChangeOutput {
        relay: ComponentRef,
        relay_name: String,
        on: bool,
        retries: u32,
        backoff: Duration,
    },
    Sleep(Duration),
    RefreshStatus,
    GetLocation {
        device: String,
    },
}

/// An ordered recipe with an overall wall-clock budget. Exceeding the budget
/// cancels the remaining steps and reports failure; outputs stay in whatever
/// terminal state they reached.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub name: String,
    pub timeout: Duration,
    pub steps: Vec<Step>,
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequence '{0}' exceeded its {1:?} timeout")]
    Timeout(String, Duration),
    #[error("step {step} of sequence '{sequence}' failed: {source}")]
    StepFailed {
        sequence: String,
        step: usize,
        source: DeviceError,
    },
}

impl Sequence {
    /// Resolve a configured sequence against the declared devices.
    pub fn build(cfg: &SequenceConfig, app: &AppConfig) -> Result<Self> {
        let mut steps = Vec::with_capacity(cfg.steps.len());
        for step in &cfg.steps {
            steps.push(match step {
                StepConfig::ChangeOutput {
                    relay,
                    state,
                    retries,
                    retry_backoff_secs,
                } => {
                    let (device, index) = app
                        .locate_relay(relay)
                        .ok_or_else(|| anyhow::anyhow!(
                            "sequence '{}': relay '{relay}' is not declared",
                            cfg.name
                        ))?;
                    Step::ChangeOutput {
                        relay: ComponentRef {
                            device: device.name.clone(),
                            index,
                        },
                        relay_name: relay.clone(),
                        on: *state,
                        retries: *retries,
                        backoff: Duration::from_secs_f64(*retry_backoff_secs),
                    }
                }
                StepConfig::Sleep { seconds } => Step::Sleep(Duration::from_secs_f64(*seconds)),
                StepConfig::RefreshStatus => Step::RefreshStatus,
                StepConfig::GetLocation { device } => Step::GetLocation {
                    device: device.clone(),
                },
            });
        }
        Ok(Self {
            name: cfg.name.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            steps,
        })
    }

    /// A synthetic single-step sequence for outputs without a configured
    /// recipe.
    pub fn single_relay_change(relay_name: &str, relay: ComponentRef, on: bool) -> Self {
        Self {
            name: format!("set {relay_name} {}", if on { "on" } else { "off" }),
            timeout: Duration::from_secs(10),
            steps: vec![Step::ChangeOutput {
                relay,
                relay_name: relay_name.to_string(),
                on,
                retries: 2,
                backoff: Duration::from_secs(1),
            }],
        }
    }

    /// Execute the steps serially through the device workers, preserving the
    /// single-writer-per-device invariant.
    pub async fn run(&self, registry: &DeviceRegistry) -> Result<(), SequenceError> {
        let budget = self.timeout;
        match tokio::time::timeout(budget, self.run_steps(registry)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(sequence = %self.name, "sequence timed out, remaining steps cancelled");
                Err(SequenceError::Timeout(self.name.clone(), budget))
            }
        }
    }

    async fn run_steps(&self, registry: &DeviceRegistry) -> Result<(), SequenceError> {
        for (step_no, step) in self.steps.iter().enumerate() {
            match step {
                Step::ChangeOutput {
                    relay,
                    relay_name,
                    on,
                    retries,
                    backoff,
                } => {
                    let handle = registry.handle(&relay.device).map_err(|_| {
                        SequenceError::StepFailed {
                            sequence: self.name.clone(),
                            step: step_no,
                            source: DeviceError::Transport(format!(
                                "no worker for device '{}'",
                                relay.device
                            )),
                        }
                    })?;
                    let mut attempt = 0u32;
                    loop {
                        match handle.set_relay(relay.index, *on, Uuid::new_v4()).await {
                            Ok(()) => {
                                debug!(sequence = %self.name, relay = %relay_name, on, "step complete");
                                break;
                            }
                            Err(e) if attempt < *retries => {
                                attempt += 1;
                                warn!(
                                    sequence = %self.name,
                                    relay = %relay_name,
                                    attempt,
                                    error = %e,
                                    "step failed, backing off"
                                );
                                tokio::time::sleep(*backoff).await;
                            }
                            Err(e) => {
                                return Err(SequenceError::StepFailed {
                                    sequence: self.name.clone(),
                                    step: step_no,
                                    source: e,
                                });
                            }
                        }
                    }
                }
                Step::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                }
                Step::RefreshStatus => {
                    registry.request_refresh_all();
                }
                Step::GetLocation { device } => {
                    let handle = registry.handle(device).map_err(|_| {
                        SequenceError::StepFailed {
                            sequence: self.name.clone(),
                            step: step_no,
                            source: DeviceError::Transport(format!("no worker for device '{device}'")),
                        }
                    })?;
                    if let Err(e) = handle.get_location().await {
                        return Err(SequenceError::StepFailed {
                            sequence: self.name.clone(),
                            step: step_no,
                            source: e,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::worker::tests::{test_device, test_settings, FlakyClient};
    use crate::device::worker::spawn_worker;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn registry_with(client: Arc<FlakyClient>) -> DeviceRegistry {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let handle = spawn_worker(test_device(), test_settings(10), client, events_tx);
        let mut handles = BTreeMap::new();
        handles.insert("shed".to_string(), handle);
        let mut relays = BTreeMap::new();
        relays.insert(
            "Pump Relay".to_string(),
            ComponentRef { device: "shed".to_string(), index: 0 },
        );
        DeviceRegistry::for_tests(handles, relays)
    }

    fn two_relay_sequence(sleep_secs: f64, timeout_secs: u64) -> Sequence {
        Sequence {
            name: "pump on".to_string(),
            timeout: Duration::from_secs(timeout_secs),
            steps: vec![
                Step::ChangeOutput {
                    relay: ComponentRef { device: "shed".to_string(), index: 0 },
                    relay_name: "Pump Relay".to_string(),
                    on: true,
                    retries: 1,
                    backoff: Duration::from_millis(10),
                },
                Step::Sleep(Duration::from_secs_f64(sleep_secs)),
                Step::ChangeOutput {
                    relay: ComponentRef { device: "shed".to_string(), index: 0 },
                    relay_name: "Pump Relay".to_string(),
                    on: false,
                    retries: 1,
                    backoff: Duration::from_millis(10),
                },
            ],
        }
    }

    #[tokio::test]
    async fn sequence_runs_steps_in_order() {
        let client = Arc::new(FlakyClient::new(0));
        let registry = registry_with(client.clone());
        let seq = two_relay_sequence(0.01, 30);

        seq.run(&registry).await.unwrap();
        assert_eq!(client.relay_log.lock().unwrap().as_slice(), &[(0, true), (0, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_pending_steps() {
        let client = Arc::new(FlakyClient::new(0));
        let registry = registry_with(client.clone());
        // Sleep step far exceeds the 1 s budget: the second relay change
        // must never run.
        let seq = two_relay_sequence(60.0, 1);

        let result = seq.run(&registry).await;
        assert!(matches!(result, Err(SequenceError::Timeout(_, _))));
        assert_eq!(client.relay_log.lock().unwrap().as_slice(), &[(0, true)]);
    }

    #[tokio::test]
    async fn per_step_retries_apply_before_failure() {
        // First attempt of the first relay change fails, retry succeeds.
        let client = Arc::new(FlakyClient::new(1));
        let registry = registry_with(client.clone());
        let seq = two_relay_sequence(0.01, 30);

        seq.run(&registry).await.unwrap();
        assert_eq!(client.relay_log.lock().unwrap().as_slice(), &[(0, true), (0, false)]);
    }
}
