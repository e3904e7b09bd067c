//! Endpoint transfer-type classification.
//!
//! The session engine must know each endpoint's transfer type to build URB
//! records, and the driver's view of the active configuration changes when
//! the client issues `SET_CONFIGURATION` / `SET_INTERFACE`. This module
//! parses configuration descriptors once, at export time, and the
//! [`EndpointClassifier`] then answers lookups against whatever
//! configuration and alternate settings are currently selected.

use std::collections::HashMap;

use thiserror::Error;

use crate::urb::TransferType;

pub const DESC_TYPE_DEVICE: u8 = 1;
pub const DESC_TYPE_CONFIGURATION: u8 = 2;
pub const DESC_TYPE_INTERFACE: u8 = 4;
pub const DESC_TYPE_ENDPOINT: u8 = 5;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor truncated at offset {0}")]
    Truncated(usize),
    #[error("descriptor with bLength 0 at offset {0}")]
    ZeroLength(usize),
    #[error("endpoint descriptor outside any interface at offset {0}")]
    OrphanEndpoint(usize),
    #[error("not a configuration descriptor (type {0:#04x})")]
    NotAConfiguration(u8),
}

/// Identity of one interface (alternate setting 0), for handshake replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

type EndpointEntry = (u8, bool, TransferType); // number, dir_in, type

/// One parsed configuration: endpoint maps per (interface, alternate
/// setting).
#[derive(Clone, Debug)]
pub struct Configuration {
    pub value: u8,
    interfaces: HashMap<u8, HashMap<u8, Vec<EndpointEntry>>>,
    interface_info: Vec<InterfaceInfo>,
}

impl Configuration {
    pub fn interface_info(&self) -> &[InterfaceInfo] {
        &self.interface_info
    }
}

/// Walks one raw configuration descriptor (header plus all subordinate
/// descriptors, as returned by `GET_DESCRIPTOR(CONFIGURATION)`).
pub fn parse_configuration(raw: &[u8]) -> Result<Configuration, DescriptorError> {
    if raw.len() < 9 {
        return Err(DescriptorError::Truncated(0));
    }
    if raw[1] != DESC_TYPE_CONFIGURATION {
        return Err(DescriptorError::NotAConfiguration(raw[1]));
    }

    let mut configuration = Configuration {
        value: raw[5],
        interfaces: HashMap::new(),
        interface_info: Vec::new(),
    };

    let mut current: Option<(u8, u8)> = None;
    let mut at = raw[0] as usize;
    while at < raw.len() {
        let len = raw[at] as usize;
        if len == 0 {
            return Err(DescriptorError::ZeroLength(at));
        }
        if at + len > raw.len() {
            return Err(DescriptorError::Truncated(at));
        }
        let desc = &raw[at..at + len];
        match desc[1] {
            DESC_TYPE_INTERFACE => {
                if len < 9 {
                    return Err(DescriptorError::Truncated(at));
                }
                let number = desc[2];
                let alt = desc[3];
                if alt == 0 {
                    configuration.interface_info.push(InterfaceInfo {
                        number,
                        class: desc[5],
                        subclass: desc[6],
                        protocol: desc[7],
                    });
                }
                configuration
                    .interfaces
                    .entry(number)
                    .or_default()
                    .entry(alt)
                    .or_default();
                current = Some((number, alt));
            }
            DESC_TYPE_ENDPOINT => {
                if len < 7 {
                    return Err(DescriptorError::Truncated(at));
                }
                let (interface, alt) = current.ok_or(DescriptorError::OrphanEndpoint(at))?;
                let address = desc[2];
                let transfer = match desc[3] & 0x03 {
                    0 => TransferType::Control,
                    1 => TransferType::Isochronous,
                    2 => TransferType::Bulk,
                    _ => TransferType::Interrupt,
                };
                configuration
                    .interfaces
                    .entry(interface)
                    .or_default()
                    .entry(alt)
                    .or_default()
                    .push((address & 0x0F, address & 0x80 != 0, transfer));
            }
            _ => {} // class- and vendor-specific descriptors
        }
        at += len;
    }

    Ok(configuration)
}

/// Answers `(endpoint number, direction) -> transfer type` against the
/// currently selected configuration and alternate settings.
///
/// Endpoint 0 is the default control pipe and classifies as
/// [`TransferType::Control`] regardless of state.
#[derive(Clone, Debug)]
pub struct EndpointClassifier {
    configurations: Vec<Configuration>,
    active: Option<u8>,
    alt_settings: HashMap<u8, u8>,
}

impl EndpointClassifier {
    /// `active` is the device's configuration at attach time (0 or absent
    /// means unconfigured).
    pub fn new(configurations: Vec<Configuration>, active: u8) -> Self {
        Self {
            configurations,
            active: (active != 0).then_some(active),
            alt_settings: HashMap::new(),
        }
    }

    pub fn endpoint_type(&self, number: u8, dir_in: bool) -> Option<TransferType> {
        if number == 0 {
            return Some(TransferType::Control);
        }
        let active = self.active?;
        let configuration = self
            .configurations
            .iter()
            .find(|configuration| configuration.value == active)?;
        for (interface, alts) in &configuration.interfaces {
            let alt = self.alt_settings.get(interface).copied().unwrap_or(0);
            let Some(endpoints) = alts.get(&alt) else {
                continue;
            };
            for &(ep_number, ep_dir_in, transfer) in endpoints {
                if ep_number == number && ep_dir_in == dir_in {
                    return Some(transfer);
                }
            }
        }
        None
    }

    /// Observes a trapped `SET_CONFIGURATION`. Selecting a configuration
    /// resets every interface to alternate setting 0.
    pub fn set_configuration(&mut self, value: u8) {
        self.active = (value != 0).then_some(value);
        self.alt_settings.clear();
    }

    /// Observes a trapped `SET_INTERFACE`.
    pub fn set_interface(&mut self, interface: u8, alt_setting: u8) {
        self.alt_settings.insert(interface, alt_setting);
    }
}
