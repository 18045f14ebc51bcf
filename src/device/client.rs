use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::DeviceConfig;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("request timed out")]
    Timeout,
    #[error("device returned HTTP {0}")]
    Http(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeviceError::Timeout
        } else if let Some(status) = e.status() {
            DeviceError::Http(status.as_u16())
        } else {
            DeviceError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub power_w: f64,
    pub energy_wh: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub relays: BTreeMap<u32, bool>,
    pub inputs: BTreeMap<u32, bool>,
    pub meters: BTreeMap<u32, MeterReading>,
    pub probes: BTreeMap<u32, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceLocation {
    pub tz: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// The relay/meter RPC surface the core consumes. One implementation talks
/// HTTP to on-LAN devices; tests substitute their own.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn get_status(&self, device: &DeviceConfig) -> Result<DeviceStatus, DeviceError>;
    async fn set_relay(&self, device: &DeviceConfig, index: u32, on: bool) -> Result<(), DeviceError>;
    async fn read_meter(&self, device: &DeviceConfig, index: u32) -> Result<MeterReading, DeviceError>;
    async fn read_probe(&self, device: &DeviceConfig, index: u32) -> Result<f64, DeviceError>;
    async fn get_location(&self, device: &DeviceConfig) -> Result<DeviceLocation, DeviceError>;
}

/// HTTP client for Gen2-style RPC devices: component status and control via
/// `GET /rpc/<Component>.<Method>?id=<n>`.
pub struct HttpDeviceClient {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    output: bool,
    #[serde(default)]
    apower: f64,
    #[serde(default)]
    aenergy: Option<EnergyCounter>,
}

#[derive(Debug, Deserialize)]
struct EnergyCounter {
    total: f64,
}

#[derive(Debug, Deserialize)]
struct InputStatus {
    state: bool,
}

#[derive(Debug, Deserialize)]
struct TemperatureStatus {
    #[serde(rename = "tC")]
    t_c: f64,
}

#[derive(Debug, Deserialize)]
struct SysConfig {
    #[serde(default)]
    location: Option<DeviceLocation>,
}

impl HttpDeviceClient {
    pub fn new(response_timeout: Duration) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .timeout(response_timeout)
            .build()
            .map_err(DeviceError::from)?;
        Ok(Self { client })
    }

    fn url(&self, device: &DeviceConfig, method: &str, id: Option<u32>) -> String {
        match id {
            Some(id) => format!("http://{}/rpc/{method}?id={id}", device.host),
            None => format!("http://{}/rpc/{method}", device.host),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, DeviceError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Http(status.as_u16()));
        }
        resp.json::<T>()
            .await
            .map_err(|e| DeviceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn get_status(&self, device: &DeviceConfig) -> Result<DeviceStatus, DeviceError> {
        let mut status = DeviceStatus::default();
        for c in &device.relays {
            let s: SwitchStatus = self
                .get_json(&self.url(device, "Switch.GetStatus", Some(c.index)))
                .await?;
            status.relays.insert(c.index, s.output);
        }
        for c in &device.meters {
            let s: SwitchStatus = self
                .get_json(&self.url(device, "Switch.GetStatus", Some(c.index)))
                .await?;
            status.meters.insert(
                c.index,
                MeterReading {
                    power_w: s.apower,
                    energy_wh: s.aenergy.map(|e| e.total).unwrap_or_default(),
                },
            );
        }
        for c in &device.inputs {
            let s: InputStatus = self
                .get_json(&self.url(device, "Input.GetStatus", Some(c.index)))
                .await?;
            status.inputs.insert(c.index, s.state);
        }
        for c in &device.probes {
            let s: TemperatureStatus = self
                .get_json(&self.url(device, "Temperature.GetStatus", Some(c.index)))
                .await?;
            status.probes.insert(c.index, s.t_c);
        }
        Ok(status)
    }

    async fn set_relay(&self, device: &DeviceConfig, index: u32, on: bool) -> Result<(), DeviceError> {
        let url = format!("http://{}/rpc/Switch.Set?id={index}&on={on}", device.host);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Http(status.as_u16()));
        }
        Ok(())
    }

    async fn read_meter(&self, device: &DeviceConfig, index: u32) -> Result<MeterReading, DeviceError> {
        let s: SwitchStatus = self
            .get_json(&self.url(device, "Switch.GetStatus", Some(index)))
            .await?;
        Ok(MeterReading {
            power_w: s.apower,
            energy_wh: s.aenergy.map(|e| e.total).unwrap_or_default(),
        })
    }

    async fn read_probe(&self, device: &DeviceConfig, index: u32) -> Result<f64, DeviceError> {
        let s: TemperatureStatus = self
            .get_json(&self.url(device, "Temperature.GetStatus", Some(index)))
            .await?;
        Ok(s.t_c)
    }

    async fn get_location(&self, device: &DeviceConfig) -> Result<DeviceLocation, DeviceError> {
        let s: SysConfig = self.get_json(&self.url(device, "Sys.GetConfig", None)).await?;
        s.location
            .ok_or_else(|| DeviceError::Decode("device reported no location".to_string()))
    }
}
