//! Descriptor probing through the device channel.
//!
//! At export time the server needs the device descriptor (ids, class codes)
//! and the raw configuration descriptors (endpoint classification). Both are
//! read with plain `GET_DESCRIPTOR` control URBs through the same
//! [`DeviceChannel`] the session engine uses, so no separate enumeration
//! stack is involved.

use thiserror::Error;

use crate::ioctl::{self, xfer};
use crate::urb::{Direction, TransferType, Urb};
use crate::{ChannelError, DeviceChannel, OutputMode};

const DESC_TYPE_DEVICE: u8 = 1;
const DESC_TYPE_CONFIGURATION: u8 = 2;
const DEVICE_DESCRIPTOR_LEN: usize = 18;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("device rejected GET_DESCRIPTOR (driver status {0})")]
    TransferFailed(u32),
    #[error("descriptor reply truncated: {got} of {want} bytes")]
    Truncated { got: usize, want: usize },
}

/// The standard device descriptor fields the server cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < DEVICE_DESCRIPTOR_LEN {
            return None;
        }
        Some(Self {
            bcd_usb: u16::from_le_bytes([raw[2], raw[3]]),
            device_class: raw[4],
            device_subclass: raw[5],
            device_protocol: raw[6],
            id_vendor: u16::from_le_bytes([raw[8], raw[9]]),
            id_product: u16::from_le_bytes([raw[10], raw[11]]),
            bcd_device: u16::from_le_bytes([raw[12], raw[13]]),
            num_configurations: raw[17],
        })
    }

    /// `usb_device_speed` value for the handshake, derived from `bcdUSB`.
    pub fn speed(&self) -> u32 {
        match self.bcd_usb {
            0x0300.. => 5, // super
            0x0200.. => 3, // high
            _ => 2,        // full
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProbedDevice {
    pub descriptor: DeviceDescriptor,
    /// One raw configuration descriptor (with subordinates) per
    /// configuration, in index order.
    pub configurations: Vec<Vec<u8>>,
}

/// Reads the device descriptor and every configuration descriptor.
pub async fn probe_device(channel: &dyn DeviceChannel) -> Result<ProbedDevice, ProbeError> {
    let raw = control_in(
        channel,
        get_descriptor_setup(DESC_TYPE_DEVICE, 0, DEVICE_DESCRIPTOR_LEN as u16),
        DEVICE_DESCRIPTOR_LEN,
    )
    .await?;
    let descriptor = DeviceDescriptor::parse(&raw).ok_or(ProbeError::Truncated {
        got: raw.len(),
        want: DEVICE_DESCRIPTOR_LEN,
    })?;

    let mut configurations = Vec::with_capacity(descriptor.num_configurations as usize);
    for index in 0..descriptor.num_configurations {
        configurations.push(read_configuration(channel, index).await?);
    }

    Ok(ProbedDevice {
        descriptor,
        configurations,
    })
}

/// Reads one full configuration descriptor: the 9-byte header first for
/// `wTotalLength`, then the whole thing.
pub async fn read_configuration(
    channel: &dyn DeviceChannel,
    index: u8,
) -> Result<Vec<u8>, ProbeError> {
    let header = control_in(channel, get_descriptor_setup(DESC_TYPE_CONFIGURATION, index, 9), 9).await?;
    if header.len() < 9 {
        return Err(ProbeError::Truncated {
            got: header.len(),
            want: 9,
        });
    }
    let total = u16::from_le_bytes([header[2], header[3]]).max(9) as usize;
    let raw = control_in(
        channel,
        get_descriptor_setup(DESC_TYPE_CONFIGURATION, index, total as u16),
        total,
    )
    .await?;
    if raw.len() < total {
        return Err(ProbeError::Truncated {
            got: raw.len(),
            want: total,
        });
    }
    Ok(raw)
}

fn get_descriptor_setup(descriptor_type: u8, index: u8, length: u16) -> [u8; 8] {
    let w_value = (u16::from(descriptor_type) << 8) | u16::from(index);
    let mut setup = [0u8; 8];
    setup[0] = 0x80; // device-to-host, standard, device
    setup[1] = 6; // GET_DESCRIPTOR
    setup[2..4].copy_from_slice(&w_value.to_le_bytes());
    setup[6..8].copy_from_slice(&length.to_le_bytes());
    setup
}

/// One control IN transfer on endpoint 0: setup prepended, short reads
/// allowed, payload returned.
async fn control_in(
    channel: &dyn DeviceChannel,
    setup: [u8; 8],
    length: usize,
) -> Result<Vec<u8>, ProbeError> {
    let mut buffer = vec![0u8; 8 + length];
    buffer[..8].copy_from_slice(&setup);
    let urb = Urb {
        endpoint: 0,
        transfer_type: TransferType::Control,
        direction: Direction::In,
        short_ok: true,
        error: xfer::OK,
        len: buffer.len() as u32,
        buffer: buffer.as_mut_ptr() as u64,
        iso: Vec::new(),
    };
    let mut record = urb.encode();
    channel
        .submit_ioctl(ioctl::SEND_URB, &mut record, OutputMode::Exact)
        .await?;

    let mut completed = urb;
    completed.apply_completion(&record);
    if completed.error != xfer::OK {
        return Err(ProbeError::TransferFailed(completed.error));
    }
    let actual = (completed.len as usize).saturating_sub(8).min(length);
    Ok(buffer[8..8 + actual].to_vec())
}
