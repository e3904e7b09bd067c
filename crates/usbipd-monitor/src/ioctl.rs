//! Ioctl surface of the monitor driver.
//!
//! Request codes follow the usual `CTL_CODE` packing. Request payloads are
//! little-endian fixed-size records; beyond the fields named here the driver
//! treats them as opaque.

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_WRITE_ACCESS: u32 = 2;

const fn ctl(function: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_WRITE_ACCESS << 14) | (function << 2) | METHOD_BUFFERED
}

/// Submit one URB record ([`crate::urb::Urb`]); in/out, the driver writes
/// completion fields back into the same record.
pub const SEND_URB: u32 = ctl(0x603);
/// Select a device configuration by `bConfigurationValue`.
pub const USB_SET_CONFIG: u32 = ctl(0x604);
/// Select an interface alternate setting.
pub const USB_SELECT_INTERFACE: u32 = ctl(0x605);
/// Clear an endpoint halt condition.
pub const USB_CLEAR_ENDPOINT: u32 = ctl(0x606);
/// Abort every URB outstanding on an endpoint pipe.
pub const USB_ABORT_ENDPOINT: u32 = ctl(0x607);

/// Driver completion statuses written back into the URB record.
pub mod xfer {
    pub const OK: u32 = 0;
    pub const STALL: u32 = 1;
    /// Device not responding.
    pub const DNR: u32 = 2;
    pub const CRC: u32 = 3;
    pub const DATA_OVERRUN: u32 = 4;
    pub const DATA_UNDERRUN: u32 = 5;
    pub const DISCONNECTED: u32 = 6;
}

pub fn set_config(value: u8) -> [u8; 4] {
    [value, 0, 0, 0]
}

pub fn select_interface(interface: u8, alt_setting: u8) -> [u8; 4] {
    [interface, alt_setting, 0, 0]
}

/// `endpoint` is the raw endpoint address including the IN bit.
pub fn clear_endpoint(endpoint: u8) -> [u8; 4] {
    [endpoint, 0, 0, 0]
}

/// `endpoint` is the raw endpoint address including the IN bit.
pub fn abort_endpoint(endpoint: u8) -> [u8; 4] {
    [endpoint, 0, 0, 0]
}
