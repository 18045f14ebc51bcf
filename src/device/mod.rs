pub mod client;
pub mod sequence;
pub mod worker;

pub use client::{DeviceClient, DeviceError, DeviceLocation, DeviceStatus, HttpDeviceClient, MeterReading};
pub use sequence::{Sequence, SequenceError, Step};
pub use worker::{spawn_worker, DeviceEvent, DeviceHandle, DeviceSnapshot, ProbeReading};

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::AppConfig;

/// Where a named component lives: owning device plus component index.
#[derive(Debug, Clone)]
pub struct ComponentRef {
    pub device: String,
    pub index: u32,
}

/// One worker handle per physical device, plus name-to-component resolution
/// built once at startup.
pub struct DeviceRegistry {
    handles: BTreeMap<String, DeviceHandle>,
    relays: BTreeMap<String, ComponentRef>,
    meters: BTreeMap<String, ComponentRef>,
    inputs: BTreeMap<String, ComponentRef>,
    probes: BTreeMap<String, ComponentRef>,
}

impl DeviceRegistry {
    pub fn start(
        cfg: &AppConfig,
        client: Arc<dyn DeviceClient>,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        let mut handles = BTreeMap::new();
        for device in &cfg.devices.devices {
            let handle = spawn_worker(device.clone(), cfg.devices.clone(), client.clone(), events.clone());
            handles.insert(device.name.clone(), handle);
        }

        let mut registry = Self {
            handles,
            relays: BTreeMap::new(),
            meters: BTreeMap::new(),
            inputs: BTreeMap::new(),
            probes: BTreeMap::new(),
        };
        for device in &cfg.devices.devices {
            for c in &device.relays {
                registry.relays.insert(c.name.clone(), ComponentRef { device: device.name.clone(), index: c.index });
            }
            for c in &device.meters {
                registry.meters.insert(c.name.clone(), ComponentRef { device: device.name.clone(), index: c.index });
            }
            for c in &device.inputs {
                registry.inputs.insert(c.name.clone(), ComponentRef { device: device.name.clone(), index: c.index });
            }
            for c in &device.probes {
                registry.probes.insert(c.name.clone(), ComponentRef { device: device.name.clone(), index: c.index });
            }
        }
        registry
    }

    pub fn handle(&self, device: &str) -> Result<&DeviceHandle> {
        self.handles
            .get(device)
            .with_context(|| format!("no worker for device '{device}'"))
    }

    pub fn relay(&self, name: &str) -> Result<&ComponentRef> {
        self.relays
            .get(name)
            .with_context(|| format!("relay '{name}' is not declared"))
    }

    pub fn meter(&self, name: &str) -> Result<&ComponentRef> {
        self.meters
            .get(name)
            .with_context(|| format!("meter '{name}' is not declared"))
    }

    pub fn input(&self, name: &str) -> Result<&ComponentRef> {
        self.inputs
            .get(name)
            .with_context(|| format!("input '{name}' is not declared"))
    }

    pub fn probe(&self, name: &str) -> Result<&ComponentRef> {
        self.probes
            .get(name)
            .with_context(|| format!("probe '{name}' is not declared"))
    }

    pub fn handles(&self) -> impl Iterator<Item = (&String, &DeviceHandle)> {
        self.handles.iter()
    }

    /// Ask every worker for a status refresh without waiting on any of them.
    pub fn request_refresh_all(&self) {
        for handle in self.handles.values() {
            handle.request_refresh();
        }
    }

    /// Stop accepting new work and let workers drain.
    pub fn shutdown(&self) {
        for handle in self.handles.values() {
            handle.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        handles: BTreeMap<String, DeviceHandle>,
        relays: BTreeMap<String, ComponentRef>,
    ) -> Self {
        Self {
            handles,
            relays,
            meters: BTreeMap::new(),
            inputs: BTreeMap::new(),
            probes: BTreeMap::new(),
        }
    }
}
