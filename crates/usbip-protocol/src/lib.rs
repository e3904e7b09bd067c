//! USB/IP wire protocol codec.
//!
//! Everything a server needs to speak the protocol described in the Linux
//! kernel documentation (`Documentation/usb/usbip_protocol.rst`): the
//! version-prefixed handshake operations (`OP_REQ_DEVLIST` / `OP_REQ_IMPORT`)
//! and the attached-phase command/reply headers (`CMD_SUBMIT`, `CMD_UNLINK`,
//! `RET_SUBMIT`, `RET_UNLINK`) together with isochronous packet descriptors.
//!
//! All integers are big-endian on the wire. This crate performs no buffering
//! beyond what the underlying stream offers: readers consume exactly the
//! bytes of the record they parse, encoders return exact-size buffers for
//! the caller to `write_all`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol version spoken during the handshake phase.
pub const USBIP_VERSION: u16 = 0x0111;

/// Handshake: request the list of exported devices.
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Handshake: reply carrying the exported device list.
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Handshake: request import of one device by bus id.
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Handshake: reply to an import request.
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Attached phase: submit an URB.
pub const CMD_SUBMIT: u32 = 0x0000_0001;
/// Attached phase: cancel a previously submitted URB.
pub const CMD_UNLINK: u32 = 0x0000_0002;
/// Attached phase: reply to `CMD_SUBMIT`.
pub const RET_SUBMIT: u32 = 0x0000_0003;
/// Attached phase: reply to `CMD_UNLINK`.
pub const RET_UNLINK: u32 = 0x0000_0004;

/// `direction` field: host to device.
pub const DIR_OUT: u32 = 0;
/// `direction` field: device to host.
pub const DIR_IN: u32 = 1;

/// Every attached-phase command and reply is a fixed 48-byte header.
pub const HEADER_LEN: usize = 48;
/// One isochronous packet descriptor on the wire.
pub const ISO_PACKET_LEN: usize = 16;
/// The fixed device block used by `OP_REP_DEVLIST` / `OP_REP_IMPORT`.
pub const DEVICE_BLOCK_LEN: usize = 312;

/// `transfer_flags` bit 0: the client does not tolerate a short read.
pub const URB_SHORT_NOT_OK: u32 = 0x0000_0001;

/// Linux errno values used in USB/IP status fields (always negated on the
/// wire; `0` is success).
pub mod errno {
    pub const EPIPE: i32 = 32;
    pub const ETIME: i32 = 62;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const EILSEQ: i32 = 84;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
    pub const EREMOTEIO: i32 = 121;
    pub const ENODEV: i32 = 19;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown command {0:#010x}")]
    UnknownCommand(u32),
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("unknown handshake operation {0:#06x}")]
    UnknownOp(u16),
    #[error("bus id is not valid UTF-8")]
    MalformedBusId,
}

/// The `basic` block shared by every attached-phase header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    /// Endpoint number, 0..=15. The direction lives in `direction`, not here.
    pub ep: u32,
}

/// `CMD_SUBMIT` overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    /// Packet count for isochronous submits. Non-iso submits carry 0 or
    /// `0xffff_ffff` here depending on the client; ignore it for them.
    pub number_of_packets: u32,
    pub interval: u32,
    /// Raw 8-byte setup packet (only meaningful for control transfers).
    pub setup: [u8; 8],
}

/// `CMD_UNLINK` overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdUnlink {
    /// Sequence number of the submit to cancel (not this command's seqnum).
    pub unlink_seqnum: u32,
}

/// One parsed attached-phase command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Submit { header: HeaderBasic, submit: CmdSubmit },
    Unlink { header: HeaderBasic, unlink: CmdUnlink },
}

impl Command {
    pub fn header(&self) -> &HeaderBasic {
        match self {
            Command::Submit { header, .. } => header,
            Command::Unlink { header, .. } => header,
        }
    }
}

fn be32(raw: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(raw[at..at + 4].try_into().unwrap())
}

fn put32(raw: &mut [u8], at: usize, value: u32) {
    raw[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Reads exactly one 48-byte attached-phase header.
///
/// Any command other than `CMD_SUBMIT` / `CMD_UNLINK` is a protocol
/// violation and fatal for the session.
pub async fn read_command<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Command, ProtocolError> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    parse_command(&raw)
}

/// Parses a 48-byte attached-phase header.
pub fn parse_command(raw: &[u8; HEADER_LEN]) -> Result<Command, ProtocolError> {
    let header = HeaderBasic {
        command: be32(raw, 0),
        seqnum: be32(raw, 4),
        devid: be32(raw, 8),
        direction: be32(raw, 12),
        ep: be32(raw, 16),
    };
    match header.command {
        CMD_SUBMIT => {
            let mut setup = [0u8; 8];
            setup.copy_from_slice(&raw[40..48]);
            Ok(Command::Submit {
                header,
                submit: CmdSubmit {
                    transfer_flags: be32(raw, 20),
                    transfer_buffer_length: be32(raw, 24),
                    start_frame: be32(raw, 28),
                    number_of_packets: be32(raw, 32),
                    interval: be32(raw, 36),
                    setup,
                },
            })
        }
        CMD_UNLINK => Ok(Command::Unlink {
            header,
            unlink: CmdUnlink {
                unlink_seqnum: be32(raw, 20),
            },
        }),
        other => Err(ProtocolError::UnknownCommand(other)),
    }
}

/// Encodes a `CMD_SUBMIT` header (client side; also used by tests).
///
/// The OUT payload and any iso packet descriptors follow separately on the
/// stream.
pub fn encode_cmd_submit(header: &HeaderBasic, submit: &CmdSubmit) -> [u8; HEADER_LEN] {
    let mut raw = [0u8; HEADER_LEN];
    put32(&mut raw, 0, CMD_SUBMIT);
    put32(&mut raw, 4, header.seqnum);
    put32(&mut raw, 8, header.devid);
    put32(&mut raw, 12, header.direction);
    put32(&mut raw, 16, header.ep);
    put32(&mut raw, 20, submit.transfer_flags);
    put32(&mut raw, 24, submit.transfer_buffer_length);
    put32(&mut raw, 28, submit.start_frame);
    put32(&mut raw, 32, submit.number_of_packets);
    put32(&mut raw, 36, submit.interval);
    raw[40..48].copy_from_slice(&submit.setup);
    raw
}

/// Encodes a `CMD_UNLINK` header (client side; also used by tests).
pub fn encode_cmd_unlink(header: &HeaderBasic, unlink_seqnum: u32) -> [u8; HEADER_LEN] {
    let mut raw = [0u8; HEADER_LEN];
    put32(&mut raw, 0, CMD_UNLINK);
    put32(&mut raw, 4, header.seqnum);
    put32(&mut raw, 8, header.devid);
    put32(&mut raw, 12, header.direction);
    put32(&mut raw, 16, header.ep);
    put32(&mut raw, 20, unlink_seqnum);
    raw
}

/// `RET_SUBMIT` reply header.
///
/// `status` is 0 on success or a negated Linux errno. For IN transfers the
/// caller writes `actual_length` payload bytes immediately after the header;
/// iso replies append the packet descriptor array after the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl RetSubmit {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        put32(&mut raw, 0, RET_SUBMIT);
        put32(&mut raw, 4, self.seqnum);
        put32(&mut raw, 8, self.devid);
        put32(&mut raw, 12, self.direction);
        put32(&mut raw, 16, self.ep);
        put32(&mut raw, 20, self.status as u32);
        put32(&mut raw, 24, self.actual_length);
        put32(&mut raw, 28, self.start_frame);
        put32(&mut raw, 32, self.number_of_packets);
        put32(&mut raw, 36, self.error_count);
        raw
    }
}

/// `RET_UNLINK` reply header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
}

impl RetUnlink {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        put32(&mut raw, 0, RET_UNLINK);
        put32(&mut raw, 4, self.seqnum);
        put32(&mut raw, 8, self.devid);
        put32(&mut raw, 12, self.direction);
        put32(&mut raw, 16, self.ep);
        put32(&mut raw, 20, self.status as u32);
        raw
    }
}

/// One isochronous packet descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

/// Reads exactly `count` iso packet descriptors (16 bytes each).
pub async fn read_iso_packets<R: AsyncRead + Unpin>(
    reader: &mut R,
    count: usize,
) -> Result<Vec<IsoPacket>, ProtocolError> {
    let mut raw = vec![0u8; count * ISO_PACKET_LEN];
    reader.read_exact(&mut raw).await?;
    let mut packets = Vec::with_capacity(count);
    for chunk in raw.chunks_exact(ISO_PACKET_LEN) {
        packets.push(IsoPacket {
            offset: be32(chunk, 0),
            length: be32(chunk, 4),
            actual_length: be32(chunk, 8),
            status: be32(chunk, 12) as i32,
        });
    }
    Ok(packets)
}

/// Encodes an iso packet descriptor array.
pub fn encode_iso_packets(packets: &[IsoPacket]) -> Vec<u8> {
    let mut raw = vec![0u8; packets.len() * ISO_PACKET_LEN];
    for (chunk, packet) in raw.chunks_exact_mut(ISO_PACKET_LEN).zip(packets) {
        put32(chunk, 0, packet.offset);
        put32(chunk, 4, packet.length);
        put32(chunk, 8, packet.actual_length);
        put32(chunk, 12, packet.status as u32);
    }
    raw
}

/// Interface record appended per interface in `OP_REP_DEVLIST`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The device block of the handshake replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSummary {
    /// Host-side device path (informational; truncated to 255 bytes).
    pub path: String,
    /// Bus id the client imports by (truncated to 31 bytes).
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    /// `usb_device_speed` value (1 low, 2 full, 3 high, 5 super).
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceSummary>,
}

impl DeviceSummary {
    /// `devid` the client echoes in attached-phase headers.
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }

    /// Encodes the fixed 312-byte device block (no interface records).
    pub fn encode(&self) -> [u8; DEVICE_BLOCK_LEN] {
        let mut raw = [0u8; DEVICE_BLOCK_LEN];
        copy_padded(&mut raw[0..256], self.path.as_bytes());
        copy_padded(&mut raw[256..288], self.busid.as_bytes());
        put32(&mut raw, 288, self.busnum);
        put32(&mut raw, 292, self.devnum);
        put32(&mut raw, 296, self.speed);
        raw[300..302].copy_from_slice(&self.id_vendor.to_be_bytes());
        raw[302..304].copy_from_slice(&self.id_product.to_be_bytes());
        raw[304..306].copy_from_slice(&self.bcd_device.to_be_bytes());
        raw[306] = self.device_class;
        raw[307] = self.device_subclass;
        raw[308] = self.device_protocol;
        raw[309] = self.configuration_value;
        raw[310] = self.num_configurations;
        raw[311] = self.interfaces.len() as u8;
        raw
    }

    /// Device block followed by one 4-byte record per interface (devlist
    /// replies only).
    pub fn encode_with_interfaces(&self) -> Vec<u8> {
        let mut raw = self.encode().to_vec();
        for interface in &self.interfaces {
            raw.extend_from_slice(&[interface.class, interface.subclass, interface.protocol, 0]);
        }
        raw
    }
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    // Keep at least one trailing NUL so the peer always sees a terminated
    // string.
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src[..n]);
}

/// One parsed handshake request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpRequest {
    Devlist,
    Import { busid: String },
}

/// Reads one handshake request (version, op code, status, operands).
pub async fn read_op_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<OpRequest, ProtocolError> {
    let version = reader.read_u16().await?;
    let code = reader.read_u16().await?;
    // Some clients send version 0 on attached-phase replays; only a real,
    // different version is rejected.
    if version != 0 && version != USBIP_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let _status = reader.read_u32().await?;
    match code {
        OP_REQ_DEVLIST => Ok(OpRequest::Devlist),
        OP_REQ_IMPORT => {
            let mut busid = [0u8; 32];
            reader.read_exact(&mut busid).await?;
            let end = busid.iter().position(|&b| b == 0).unwrap_or(busid.len());
            let busid = std::str::from_utf8(&busid[..end])
                .map_err(|_| ProtocolError::MalformedBusId)?
                .to_string();
            Ok(OpRequest::Import { busid })
        }
        other => Err(ProtocolError::UnknownOp(other)),
    }
}

/// Encodes an `OP_REP_DEVLIST` reply for the given devices.
pub fn encode_op_rep_devlist(devices: &[DeviceSummary]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(12 + devices.len() * DEVICE_BLOCK_LEN);
    raw.extend_from_slice(&USBIP_VERSION.to_be_bytes());
    raw.extend_from_slice(&OP_REP_DEVLIST.to_be_bytes());
    raw.extend_from_slice(&0u32.to_be_bytes());
    raw.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for device in devices {
        raw.extend_from_slice(&device.encode_with_interfaces());
    }
    raw
}

/// Encodes an `OP_REP_IMPORT` reply; `None` means the import failed.
pub fn encode_op_rep_import(device: Option<&DeviceSummary>) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + DEVICE_BLOCK_LEN);
    raw.extend_from_slice(&USBIP_VERSION.to_be_bytes());
    raw.extend_from_slice(&OP_REP_IMPORT.to_be_bytes());
    match device {
        Some(device) => {
            raw.extend_from_slice(&0u32.to_be_bytes());
            raw.extend_from_slice(&device.encode());
        }
        None => raw.extend_from_slice(&1u32.to_be_bytes()),
    }
    raw
}
