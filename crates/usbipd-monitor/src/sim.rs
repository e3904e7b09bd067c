//! Scripted in-memory device channel used by tests.
//!
//! `SimChannel` plays the role of the monitor driver: it records every ioctl
//! it receives and completes `SEND_URB` requests from a queue of scripted
//! outcomes, writing IN payloads through the URB's buffer address exactly
//! like the driver's DMA would. Scripts are consumed in ioctl-arrival order;
//! an empty queue completes URBs successfully at full length.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::ioctl::{self, xfer};
use crate::urb::{Direction, TransferType, Urb, URB_LEN};
use crate::{check_output, ChannelError, DeviceChannel, OutputMode};

/// One scripted `SEND_URB` completion.
#[derive(Debug, Default)]
pub struct UrbScript {
    gate: Option<oneshot::Receiver<()>>,
    status: u32,
    data: Vec<u8>,
    actual: Option<u32>,
    iso: Vec<(u16, u32)>,
}

impl UrbScript {
    /// Completes successfully at the requested length.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Completes with the given driver status (`ioctl::xfer`).
    pub fn status(status: u32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// IN payload the "driver" writes through the URB's buffer address.
    /// For control URBs the payload lands after the 8 setup bytes; for iso
    /// URBs it is laid out from the start of the URB's span (callers place
    /// packet payloads at their slot offsets).
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Overrides the written-back transfer length.
    pub fn with_actual(mut self, actual: u32) -> Self {
        self.actual = Some(actual);
        self
    }

    /// Per-packet `(actual_length, status)` pairs for an iso URB, in slot
    /// order. Missing entries complete at the requested length.
    pub fn with_iso(mut self, iso: Vec<(u16, u32)>) -> Self {
        self.iso = iso;
        self
    }

    /// Holds the completion until the returned sender fires (or is
    /// dropped). Used to stage unlink/completion races.
    pub fn gated(mut self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        self.gate = Some(rx);
        (self, tx)
    }
}

/// One recorded ioctl.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimCall {
    pub code: u32,
    pub input: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    scripts: VecDeque<UrbScript>,
    calls: Vec<SimCall>,
    failure: Option<std::io::Error>,
}

#[derive(Default)]
pub struct SimChannel {
    state: Mutex<SimState>,
}

impl SimChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, script: UrbScript) {
        self.state
            .lock()
            .expect("sim channel mutex poisoned")
            .scripts
            .push_back(script);
    }

    /// Makes the next ioctl (any code) fail with the given OS-level error,
    /// exercising the driver-hard-failure path.
    pub fn inject_failure(&self, error: std::io::Error) {
        self.state.lock().expect("sim channel mutex poisoned").failure = Some(error);
    }

    /// Every ioctl received so far, in arrival order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().expect("sim channel mutex poisoned").calls.clone()
    }

    /// The parsed `SEND_URB` requests received so far, in arrival order.
    pub fn urbs(&self) -> Vec<Urb> {
        self.calls()
            .iter()
            .filter(|call| call.code == ioctl::SEND_URB)
            .filter_map(|call| {
                let raw: &[u8; URB_LEN] = call.input.as_slice().try_into().ok()?;
                Urb::parse(raw)
            })
            .collect()
    }
}

/// Mirrors the driver's DMA into the caller's pinned buffer. The buffer is
/// owned by the submitting task and stays allocated until the ioctl
/// completes; `offset + data.len()` never exceeds the URB length by
/// construction of the callers below.
fn write_guest(buffer: u64, offset: usize, data: &[u8]) {
    if buffer == 0 || data.is_empty() {
        return;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), (buffer as *mut u8).add(offset), data.len());
    }
}

#[async_trait]
impl DeviceChannel for SimChannel {
    async fn submit_ioctl(
        &self,
        code: u32,
        buf: &mut [u8],
        output: OutputMode,
    ) -> Result<usize, ChannelError> {
        let mut script = {
            let mut state = self.state.lock().expect("sim channel mutex poisoned");
            state.calls.push(SimCall {
                code,
                input: buf.to_vec(),
            });
            if let Some(error) = state.failure.take() {
                return Err(ChannelError::Io(error));
            }
            if code == ioctl::SEND_URB {
                state.scripts.pop_front().unwrap_or_default()
            } else {
                return check_output(output, 0, buf.len());
            }
        };

        if let Some(gate) = script.gate.take() {
            let _ = gate.await;
        }

        let raw: &[u8; URB_LEN] = buf[..]
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad URB length"))
            .map_err(ChannelError::Io)?;
        let mut urb = Urb::parse(raw).ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "malformed URB record",
            ))
        })?;

        urb.error = script.status;
        if urb.transfer_type == TransferType::Isochronous {
            let mut total = 0u32;
            for (i, slot) in urb.iso.iter_mut().enumerate() {
                if let Some(&(actual, status)) = script.iso.get(i) {
                    slot.length = actual;
                    slot.status = status;
                }
                total += slot.length as u32;
            }
            urb.len = total;
            if urb.direction == Direction::In {
                // Each packet's bytes land at its slot offset, like the
                // driver's per-packet DMA.
                for slot in &urb.iso {
                    let start = slot.offset as usize;
                    let end = (start + slot.length as usize).min(script.data.len());
                    if start < end {
                        write_guest(urb.buffer, start, &script.data[start..end]);
                    }
                }
            }
        } else {
            let payload_at = if urb.transfer_type == TransferType::Control {
                8
            } else {
                0
            };
            match urb.direction {
                Direction::In => {
                    let capacity = (urb.len as usize).saturating_sub(payload_at);
                    let n = script.data.len().min(capacity);
                    write_guest(urb.buffer, payload_at, &script.data[..n]);
                    urb.len = script.actual.unwrap_or((payload_at + n) as u32);
                }
                Direction::Out => {
                    urb.len = script.actual.unwrap_or(urb.len);
                }
            }
            if script.status != xfer::OK && script.actual.is_none() && script.data.is_empty() {
                urb.len = 0;
            }
        }

        buf.copy_from_slice(&urb.encode());
        check_output(output, URB_LEN, buf.len())
    }
}
