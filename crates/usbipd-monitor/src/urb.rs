//! The driver's URB record.
//!
//! An URB travels through [`ioctl::SEND_URB`](crate::ioctl::SEND_URB) as a
//! fixed 88-byte little-endian record. The transfer buffer itself is not part
//! of the record: it is referenced by address and must stay allocated until
//! the ioctl completes. On completion the driver writes `error`, `len` and
//! the iso slot array back into the same record.
//!
//! Record layout:
//!
//! ```text
//!  0      endpoint number (u8, no direction bit)
//!  1      transfer type (u8)
//!  2      direction (u8, 0 = out, 1 = in)
//!  3      flags (u8, bit 0 = short reads allowed)
//!  4..8   error (u32, driver write-back, see ioctl::xfer)
//!  8..12  len (u32; request length in, bytes transferred out)
//! 12..20  buffer address (u64)
//! 20..24  iso packet count (u32, at most 8)
//! 24..88  8 iso slots: length (u16), offset (u16), status (u32)
//! ```

/// Size of the URB record in bytes.
pub const URB_LEN: usize = 88;
/// The driver accepts at most this many iso packets per URB.
pub const MAX_ISO_PACKETS: usize = 8;
/// Largest byte span one URB may cover: iso slot offsets are 16-bit.
pub const MAX_URB_SPAN: usize = u16::MAX as usize;

const FLAG_SHORT_OK: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Maps the `bmAttributes` transfer-type bits (also this record's
    /// encoding) back to the enum.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TransferType::Control),
            1 => Some(TransferType::Isochronous),
            2 => Some(TransferType::Bulk),
            3 => Some(TransferType::Interrupt),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

/// One iso packet slot inside the record. `offset` is relative to the URB's
/// buffer address; the driver writes the packet's actual length into
/// `length` and its completion status into `status`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoSlot {
    pub length: u16,
    pub offset: u16,
    pub status: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Urb {
    /// Endpoint **number** (0..=15), not the endpoint address.
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    /// For IN transfers: the device may legally return fewer bytes than
    /// requested.
    pub short_ok: bool,
    /// Driver completion status (`ioctl::xfer`).
    pub error: u32,
    /// Request length going in; bytes actually transferred coming back.
    pub len: u32,
    /// Address of the transfer buffer. The buffer must outlive the ioctl.
    pub buffer: u64,
    /// Iso packet slots; empty for other transfer types. At most
    /// [`MAX_ISO_PACKETS`].
    pub iso: Vec<IsoSlot>,
}

impl Urb {
    pub fn encode(&self) -> [u8; URB_LEN] {
        debug_assert!(self.iso.len() <= MAX_ISO_PACKETS);
        let mut raw = [0u8; URB_LEN];
        raw[0] = self.endpoint;
        raw[1] = self.transfer_type as u8;
        raw[2] = self.direction as u8;
        raw[3] = if self.short_ok { FLAG_SHORT_OK } else { 0 };
        raw[4..8].copy_from_slice(&self.error.to_le_bytes());
        raw[8..12].copy_from_slice(&self.len.to_le_bytes());
        raw[12..20].copy_from_slice(&self.buffer.to_le_bytes());
        raw[20..24].copy_from_slice(&(self.iso.len() as u32).to_le_bytes());
        for (i, slot) in self.iso.iter().enumerate() {
            let at = 24 + i * 8;
            raw[at..at + 2].copy_from_slice(&slot.length.to_le_bytes());
            raw[at + 2..at + 4].copy_from_slice(&slot.offset.to_le_bytes());
            raw[at + 4..at + 8].copy_from_slice(&slot.status.to_le_bytes());
        }
        raw
    }

    /// Parses a full record. Returns `None` for a malformed type byte or an
    /// out-of-range packet count.
    pub fn parse(raw: &[u8; URB_LEN]) -> Option<Urb> {
        let transfer_type = TransferType::from_raw(raw[1])?;
        let direction = match raw[2] {
            0 => Direction::Out,
            1 => Direction::In,
            _ => return None,
        };
        let packets = le32(raw, 20) as usize;
        if packets > MAX_ISO_PACKETS {
            return None;
        }
        let mut urb = Urb {
            endpoint: raw[0],
            transfer_type,
            direction,
            short_ok: raw[3] & FLAG_SHORT_OK != 0,
            error: le32(raw, 4),
            len: le32(raw, 8),
            buffer: u64::from_le_bytes(raw[12..20].try_into().unwrap()),
            iso: vec![IsoSlot::default(); packets],
        };
        urb.read_slots(raw);
        Some(urb)
    }

    /// Applies the driver's write-back fields from a completed record
    /// without touching the request-side fields.
    pub fn apply_completion(&mut self, raw: &[u8; URB_LEN]) {
        self.error = le32(raw, 4);
        self.len = le32(raw, 8);
        self.read_slots(raw);
    }

    fn read_slots(&mut self, raw: &[u8; URB_LEN]) {
        for (i, slot) in self.iso.iter_mut().enumerate() {
            let at = 24 + i * 8;
            slot.length = u16::from_le_bytes(raw[at..at + 2].try_into().unwrap());
            slot.offset = u16::from_le_bytes(raw[at + 2..at + 4].try_into().unwrap());
            slot.status = le32(raw, at + 4);
        }
    }
}

fn le32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(raw[at..at + 4].try_into().unwrap())
}
