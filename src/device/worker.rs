use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DeviceConfig, DevicesConfig};

use super::client::{DeviceClient, DeviceError, DeviceLocation, MeterReading};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub temperature_c: f64,
    pub read_at: DateTime<Utc>,
}

/// Point-in-time view of one device, published over a watch channel. The
/// control loop reads the latest snapshot and never blocks on device I/O.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub online: bool,
    pub relays: BTreeMap<u32, bool>,
    pub inputs: BTreeMap<u32, bool>,
    pub meters: BTreeMap<u32, MeterReading>,
    pub probes: BTreeMap<u32, ProbeReading>,
    pub last_contact: Option<DateTime<Utc>>,
}

/// Lifecycle notifications surfaced to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// MaxConcurrentErrors consecutive failures: dependent outputs fault.
    Down { device: String },
    Up { device: String },
    StatusUpdated { device: String },
}

pub enum DeviceCommand {
    SetRelay {
        index: u32,
        on: bool,
        correlation_id: Uuid,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    ReadMeter {
        index: u32,
        reply: oneshot::Sender<Result<MeterReading, DeviceError>>,
    },
    GetLocation {
        reply: oneshot::Sender<Result<DeviceLocation, DeviceError>>,
    },
    RefreshStatus,
    Shutdown,
}

/// Cheap cloneable handle to a device worker. Commands are serialised per
/// device: the worker processes one at a time in submission order.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<DeviceCommand>,
    snapshot: watch::Receiver<DeviceSnapshot>,
}

impl DeviceHandle {
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub async fn set_relay(&self, index: u32, on: bool, correlation_id: Uuid) -> Result<(), DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::SetRelay { index, on, correlation_id, reply })
            .await
            .map_err(|_| DeviceError::Transport("device worker stopped".to_string()))?;
        rx.await
            .map_err(|_| DeviceError::Transport("device worker dropped request".to_string()))?
    }

    pub async fn read_meter(&self, index: u32) -> Result<MeterReading, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::ReadMeter { index, reply })
            .await
            .map_err(|_| DeviceError::Transport("device worker stopped".to_string()))?;
        rx.await
            .map_err(|_| DeviceError::Transport("device worker dropped request".to_string()))?
    }

    pub async fn get_location(&self) -> Result<DeviceLocation, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::GetLocation { reply })
            .await
            .map_err(|_| DeviceError::Transport("device worker stopped".to_string()))?;
        rx.await
            .map_err(|_| DeviceError::Transport("device worker dropped request".to_string()))?
    }

    /// Fire-and-forget: a full refresh lands in the snapshot when done.
    pub fn request_refresh(&self) {
        let _ = self.tx.try_send(DeviceCommand::RefreshStatus);
    }

    /// Queue a stop marker: the worker finishes everything already queued,
    /// then exits.
    pub fn close(&self) {
        let _ = self.tx.try_send(DeviceCommand::Shutdown);
    }
}

struct Worker {
    device: DeviceConfig,
    settings: DevicesConfig,
    client: Arc<dyn DeviceClient>,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
    events: mpsc::Sender<DeviceEvent>,
    consecutive_errors: u32,
    reported_down: bool,
    meter_cache: BTreeMap<u32, (DateTime<Utc>, MeterReading)>,
}

pub fn spawn_worker(
    device: DeviceConfig,
    settings: DevicesConfig,
    client: Arc<dyn DeviceClient>,
    events: mpsc::Sender<DeviceEvent>,
) -> DeviceHandle {
    let (tx, rx) = mpsc::channel(32);
    let (snapshot_tx, snapshot_rx) = watch::channel(DeviceSnapshot::default());
    let worker = Worker {
        device,
        settings,
        client,
        snapshot_tx,
        events,
        consecutive_errors: 0,
        reported_down: false,
        meter_cache: BTreeMap::new(),
    };
    tokio::spawn(worker.run(rx));
    DeviceHandle { tx, snapshot: snapshot_rx }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<DeviceCommand>) {
        debug!(device = %self.device.name, "device worker started");
        while let Some(command) = rx.recv().await {
            match command {
                DeviceCommand::SetRelay { index, on, correlation_id, reply } => {
                    let result = self
                        .with_retries(|client, device| async move {
                            client.set_relay(&device, index, on).await
                        })
                        .await;
                    if result.is_ok() {
                        // Reflect the acknowledged relay state immediately.
                        self.snapshot_tx.send_modify(|snap| {
                            snap.relays.insert(index, on);
                            snap.last_contact = Some(Utc::now());
                        });
                        debug!(
                            device = %self.device.name,
                            relay = index,
                            on,
                            %correlation_id,
                            "relay change acknowledged"
                        );
                    }
                    let _ = reply.send(result);
                }
                DeviceCommand::ReadMeter { index, reply } => {
                    let result = self.read_meter_coalesced(index).await;
                    let _ = reply.send(result);
                }
                DeviceCommand::GetLocation { reply } => {
                    let result = self
                        .with_retries(|client, device| async move {
                            client.get_location(&device).await
                        })
                        .await;
                    let _ = reply.send(result);
                }
                DeviceCommand::RefreshStatus => {
                    self.refresh_status().await;
                }
                DeviceCommand::Shutdown => break,
            }
        }
        debug!(device = %self.device.name, "device worker stopped");
    }

    /// Meter reads within the staleness window return the cached value.
    async fn read_meter_coalesced(&mut self, index: u32) -> Result<MeterReading, DeviceError> {
        let staleness = Duration::from_secs(self.settings.meter_staleness_secs);
        let now = Utc::now();
        if let Some((at, reading)) = self.meter_cache.get(&index) {
            if (now - *at).to_std().map(|d| d < staleness).unwrap_or(false) {
                return Ok(*reading);
            }
        }
        let reading = self
            .with_retries(|client, device| async move { client.read_meter(&device, index).await })
            .await?;
        self.meter_cache.insert(index, (now, reading));
        self.snapshot_tx.send_modify(|snap| {
            snap.meters.insert(index, reading);
            snap.last_contact = Some(now);
        });
        Ok(reading)
    }

    async fn refresh_status(&mut self) {
        let result = self
            .with_retries(|client, device| async move { client.get_status(&device).await })
            .await;
        match result {
            Ok(status) => {
                let now = Utc::now();
                self.snapshot_tx.send_modify(|snap| {
                    snap.online = true;
                    snap.relays = status.relays.clone();
                    snap.inputs = status.inputs.clone();
                    snap.meters = status.meters.clone();
                    for (index, temp) in &status.probes {
                        snap.probes.insert(
                            *index,
                            ProbeReading { temperature_c: *temp, read_at: now },
                        );
                    }
                    snap.last_contact = Some(now);
                });
                let _ = self
                    .events
                    .send(DeviceEvent::StatusUpdated { device: self.device.name.clone() })
                    .await;
            }
            Err(e) => {
                warn!(device = %self.device.name, error = %e, "status refresh failed");
                self.snapshot_tx.send_modify(|snap| snap.online = false);
            }
        }
    }

    /// Run one RPC with the configured retry budget and fixed delay, and
    /// keep the device-down bookkeeping.
    async fn with_retries<T, F, Fut>(&mut self, op: F) -> Result<T, DeviceError>
    where
        F: Fn(Arc<dyn DeviceClient>, DeviceConfig) -> Fut,
        Fut: std::future::Future<Output = Result<T, DeviceError>>,
    {
        let attempts = self.settings.retry_count + 1;
        let delay = Duration::from_secs(self.settings.retry_delay_secs);
        let mut last_err = DeviceError::Transport("no attempt made".to_string());
        for attempt in 1..=attempts {
            match op(self.client.clone(), self.device.clone()).await {
                Ok(value) => {
                    self.note_success().await;
                    return Ok(value);
                }
                Err(e) => {
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        self.note_failure().await;
        Err(last_err)
    }

    async fn note_success(&mut self) {
        if self.reported_down {
            let _ = self
                .events
                .send(DeviceEvent::Up { device: self.device.name.clone() })
                .await;
        }
        self.reported_down = false;
        self.consecutive_errors = 0;
    }

    async fn note_failure(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= self.settings.max_concurrent_errors && !self.reported_down {
            self.reported_down = true;
            self.snapshot_tx.send_modify(|snap| snap.online = false);
            let _ = self
                .events
                .send(DeviceEvent::Down { device: self.device.name.clone() })
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ComponentConfig;
    use crate::device::client::{DeviceStatus, DeviceLocation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted client: fails the first `fail_first` calls, then succeeds.
    pub struct FlakyClient {
        pub fail_first: u32,
        pub calls: AtomicU32,
        pub relay_log: Mutex<Vec<(u32, bool)>>,
    }

    impl FlakyClient {
        pub fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                relay_log: Mutex::new(Vec::new()),
            }
        }

        fn next_result(&self) -> Result<(), DeviceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(DeviceError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DeviceClient for FlakyClient {
        async fn get_status(&self, _device: &DeviceConfig) -> Result<DeviceStatus, DeviceError> {
            self.next_result()?;
            let mut status = DeviceStatus::default();
            status.relays.insert(0, false);
            Ok(status)
        }

        async fn set_relay(&self, _device: &DeviceConfig, index: u32, on: bool) -> Result<(), DeviceError> {
            self.next_result()?;
            self.relay_log.lock().unwrap().push((index, on));
            Ok(())
        }

        async fn read_meter(&self, _device: &DeviceConfig, _index: u32) -> Result<MeterReading, DeviceError> {
            self.next_result()?;
            Ok(MeterReading { power_w: 1000.0, energy_wh: 5000.0 })
        }

        async fn read_probe(&self, _device: &DeviceConfig, _index: u32) -> Result<f64, DeviceError> {
            self.next_result()?;
            Ok(21.5)
        }

        async fn get_location(&self, _device: &DeviceConfig) -> Result<DeviceLocation, DeviceError> {
            self.next_result()?;
            Ok(DeviceLocation { tz: Some("Australia/Sydney".to_string()), lat: Some(-33.9), lon: Some(151.2) })
        }
    }

    pub fn test_device() -> DeviceConfig {
        DeviceConfig {
            name: "shed".to_string(),
            host: "10.0.0.5".to_string(),
            relays: vec![ComponentConfig { name: "Pump Relay".to_string(), index: 0 }],
            meters: vec![ComponentConfig { name: "Pump Meter".to_string(), index: 0 }],
            inputs: Vec::new(),
            probes: Vec::new(),
        }
    }

    pub fn test_settings(max_errors: u32) -> DevicesConfig {
        DevicesConfig {
            max_concurrent_errors: max_errors,
            response_timeout_secs: 1,
            retry_count: 1,
            retry_delay_secs: 0,
            meter_staleness_secs: 60,
            devices: vec![test_device()],
        }
    }

    #[tokio::test]
    async fn retries_absorb_a_transient_failure() {
        let client = Arc::new(FlakyClient::new(1));
        let (events_tx, _events_rx) = mpsc::channel(16);
        let handle = spawn_worker(test_device(), test_settings(4), client.clone(), events_tx);

        let result = handle.set_relay(0, true, Uuid::new_v4()).await;
        assert!(result.is_ok());
        assert_eq!(client.relay_log.lock().unwrap().as_slice(), &[(0, true)]);
        // Acknowledged state is visible in the snapshot.
        assert_eq!(handle.snapshot().relays.get(&0), Some(&true));
    }

    #[tokio::test]
    async fn device_down_event_after_max_errors() {
        // Every call fails; retry_count 1 means 2 attempts per command.
        let client = Arc::new(FlakyClient::new(u32::MAX));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handle = spawn_worker(test_device(), test_settings(2), client, events_tx);

        assert!(handle.set_relay(0, true, Uuid::new_v4()).await.is_err());
        assert!(handle.set_relay(0, true, Uuid::new_v4()).await.is_err());

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event, DeviceEvent::Down { device: "shed".to_string() });
    }

    #[tokio::test]
    async fn recovery_emits_up_event() {
        // Fail enough for Down (2 commands x 2 attempts), then succeed.
        let client = Arc::new(FlakyClient::new(4));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handle = spawn_worker(test_device(), test_settings(2), client, events_tx);

        assert!(handle.set_relay(0, true, Uuid::new_v4()).await.is_err());
        assert!(handle.set_relay(0, true, Uuid::new_v4()).await.is_err());
        assert!(handle.set_relay(0, true, Uuid::new_v4()).await.is_ok());

        assert_eq!(events_rx.recv().await.unwrap(), DeviceEvent::Down { device: "shed".to_string() });
        assert_eq!(events_rx.recv().await.unwrap(), DeviceEvent::Up { device: "shed".to_string() });
    }

    #[tokio::test]
    async fn meter_reads_are_coalesced_within_staleness_window() {
        let client = Arc::new(FlakyClient::new(0));
        let (events_tx, _events_rx) = mpsc::channel(16);
        let handle = spawn_worker(test_device(), test_settings(4), client.clone(), events_tx);

        let first = handle.read_meter(0).await.unwrap();
        let second = handle.read_meter(0).await.unwrap();
        assert_eq!(first, second);
        // Only one RPC went out.
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
