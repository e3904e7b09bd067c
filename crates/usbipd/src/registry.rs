//! The set of exported devices.
//!
//! Each entry pairs the handshake-facing device summary with the parsed
//! configuration descriptors and the device's monitor channel. USB/IP allows
//! a single importer per device, so claiming is exclusive; the claim is
//! released when the [`ClaimedDevice`] is dropped (session end).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use usbip_protocol::{DeviceSummary, InterfaceSummary};
use usbipd_monitor::endpoints::{
    parse_configuration, Configuration, DescriptorError, EndpointClassifier,
};
use usbipd_monitor::probe::{probe_device, ProbeError};
use usbipd_monitor::DeviceChannel;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("bus id {0:?} is already exported")]
    DuplicateBusId(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A device to export: its wire summary, raw configuration descriptors, and
/// the channel to its monitor handle.
pub struct ExportedDevice {
    pub summary: DeviceSummary,
    pub configurations: Vec<Vec<u8>>,
    pub channel: Arc<dyn DeviceChannel>,
}

struct Slot {
    summary: DeviceSummary,
    configurations: Vec<Configuration>,
    channel: Arc<dyn DeviceChannel>,
    claimed: bool,
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. The configuration descriptors are parsed (and
    /// validated) here, once.
    pub fn insert(&self, device: ExportedDevice) -> Result<(), RegistryError> {
        let configurations = device
            .configurations
            .iter()
            .map(|raw| parse_configuration(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut inner = self.inner.lock().expect("device registry mutex poisoned");
        let busid = device.summary.busid.clone();
        if inner.contains_key(&busid) {
            return Err(RegistryError::DuplicateBusId(busid));
        }
        inner.insert(
            busid,
            Slot {
                summary: device.summary,
                configurations,
                channel: device.channel,
                claimed: false,
            },
        );
        Ok(())
    }

    /// Device summaries for `OP_REP_DEVLIST`, sorted by bus id.
    pub fn snapshot(&self) -> Vec<DeviceSummary> {
        let inner = self.inner.lock().expect("device registry mutex poisoned");
        let mut devices: Vec<_> = inner.values().map(|slot| slot.summary.clone()).collect();
        devices.sort_by(|a, b| a.busid.cmp(&b.busid));
        devices
    }

    /// Claims a device for one importer. Returns `None` for an unknown bus
    /// id or a device that is already attached.
    pub fn claim(&self, busid: &str) -> Option<ClaimedDevice> {
        let mut inner = self.inner.lock().expect("device registry mutex poisoned");
        let slot = inner.get_mut(busid)?;
        if slot.claimed {
            return None;
        }
        slot.claimed = true;
        Some(ClaimedDevice {
            registry: self.clone(),
            busid: busid.to_string(),
            summary: slot.summary.clone(),
            channel: slot.channel.clone(),
            classifier: EndpointClassifier::new(
                slot.configurations.clone(),
                slot.summary.configuration_value,
            ),
        })
    }

    fn release(&self, busid: &str) {
        let mut inner = self.inner.lock().expect("device registry mutex poisoned");
        if let Some(slot) = inner.get_mut(busid) {
            slot.claimed = false;
        }
    }
}

/// One claimed device, handed to the session engine. Dropping it releases
/// the claim.
pub struct ClaimedDevice {
    registry: DeviceRegistry,
    busid: String,
    pub summary: DeviceSummary,
    pub channel: Arc<dyn DeviceChannel>,
    pub classifier: EndpointClassifier,
}

impl ClaimedDevice {
    pub fn busid(&self) -> &str {
        &self.busid
    }
}

impl Drop for ClaimedDevice {
    fn drop(&mut self) {
        self.registry.release(&self.busid);
    }
}

/// Probes a device through its channel and registers it.
///
/// The summary's current configuration is taken from the first
/// configuration descriptor; the interface records come from its alternate
/// setting 0.
pub async fn export_probed_device(
    registry: &DeviceRegistry,
    busid: &str,
    path: &str,
    channel: Arc<dyn DeviceChannel>,
) -> Result<(), ExportError> {
    let probed = probe_device(channel.as_ref()).await?;

    let mut configuration_value = 0;
    let mut interfaces = Vec::new();
    if let Some(first) = probed.configurations.first() {
        if let Ok(parsed) = parse_configuration(first) {
            configuration_value = parsed.value;
            interfaces = parsed
                .interface_info()
                .iter()
                .map(|info| InterfaceSummary {
                    class: info.class,
                    subclass: info.subclass,
                    protocol: info.protocol,
                })
                .collect();
        }
    }

    let (busnum, devnum) = parse_busid(busid);
    let summary = DeviceSummary {
        path: path.to_string(),
        busid: busid.to_string(),
        busnum,
        devnum,
        speed: probed.descriptor.speed(),
        id_vendor: probed.descriptor.id_vendor,
        id_product: probed.descriptor.id_product,
        bcd_device: probed.descriptor.bcd_device,
        device_class: probed.descriptor.device_class,
        device_subclass: probed.descriptor.device_subclass,
        device_protocol: probed.descriptor.device_protocol,
        configuration_value,
        num_configurations: probed.descriptor.num_configurations,
        interfaces,
    };

    registry.insert(ExportedDevice {
        summary,
        configurations: probed.configurations,
        channel,
    })?;
    Ok(())
}

/// `"<busnum>-<devnum>"`, with a fixed fallback for ids in another shape.
fn parse_busid(busid: &str) -> (u32, u32) {
    if let Some((bus, dev)) = busid.split_once('-') {
        if let (Ok(bus), Ok(dev)) = (bus.parse(), dev.parse()) {
            return (bus, dev);
        }
    }
    (1, 1)
}
