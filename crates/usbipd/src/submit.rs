//! The submit engine: `CMD_SUBMIT` → driver URB(s) → `RET_SUBMIT`.
//!
//! The request phase (payload and iso descriptor reads, pending-table
//! insert, trapped control requests) runs on the receive path and keeps the
//! reader strictly ordered. Everything after the ioctl submission runs in a
//! spawned completion task: it awaits the driver, takes the write
//! serializer, and either emits the reply or drops it silently when the
//! client unlinked first.
//!
//! Each transfer buffer is owned by its completion task, so its address
//! stays valid from ioctl submission until the last ioctl referencing it
//! completes. This includes the split-iso case, where several concurrent
//! URBs share one buffer at different offsets.

use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::task::JoinSet;

use usbip_protocol as proto;
use usbipd_monitor::endpoints::EndpointClassifier;
use usbipd_monitor::ioctl::{self, xfer};
use usbipd_monitor::urb::{
    Direction, IsoSlot, TransferType, Urb, MAX_ISO_PACKETS, MAX_URB_SPAN,
};
use usbipd_monitor::OutputMode;

use crate::session::{SessionError, Shared};

const USB_REQ_CLEAR_FEATURE: u8 = 1;
const USB_REQ_SET_CONFIGURATION: u8 = 9;
const USB_REQ_SET_INTERFACE: u8 = 11;

/// Upper bound on iso packets per submit; keeps a malformed count from
/// driving an unbounded descriptor read.
const MAX_ISO_PACKETS_PER_SUBMIT: u32 = 1024;

/// Maps a driver completion status to the negated errno the client expects.
/// The table is deliberately coarse; anything unrecognised is `-EPROTO`.
pub(crate) fn errno_from_xfer(status: u32) -> i32 {
    match status {
        xfer::OK => 0,
        xfer::STALL => -proto::errno::EPIPE,
        xfer::DNR => -proto::errno::ETIME,
        xfer::CRC => -proto::errno::EILSEQ,
        xfer::DATA_OVERRUN => -proto::errno::EOVERFLOW,
        xfer::DATA_UNDERRUN => -proto::errno::EREMOTEIO,
        xfer::DISCONNECTED => -proto::errno::ENODEV,
        _ => -proto::errno::EPROTO,
    }
}

fn raw_endpoint(number: u8, dir_in: bool) -> u8 {
    number | if dir_in { 0x80 } else { 0 }
}

pub(crate) async fn handle_submit<S>(
    shared: &Arc<Shared<S>>,
    tasks: &mut JoinSet<()>,
    reader: &mut ReadHalf<S>,
    classifier: &mut EndpointClassifier,
    header: proto::HeaderBasic,
    submit: proto::CmdSubmit,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let number = (header.ep & 0x0F) as u8;
    let dir_in = header.direction == proto::DIR_IN;
    let transfer = classifier
        .endpoint_type(number, dir_in)
        .ok_or_else(|| SessionError::UnknownEndpoint(raw_endpoint(number, dir_in)))?;

    if transfer == TransferType::Isochronous {
        handle_iso(shared, tasks, reader, header, submit, number, dir_in).await
    } else {
        handle_plain(
            shared, tasks, reader, classifier, header, submit, number, dir_in, transfer,
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_plain<S>(
    shared: &Arc<Shared<S>>,
    tasks: &mut JoinSet<()>,
    reader: &mut ReadHalf<S>,
    classifier: &mut EndpointClassifier,
    header: proto::HeaderBasic,
    submit: proto::CmdSubmit,
    number: u8,
    dir_in: bool,
    transfer: TransferType,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let length = submit.transfer_buffer_length as usize;
    // Control transfers carry the 8-byte setup packet in front of the
    // payload; the driver's write-back length includes it.
    let setup_len = if transfer == TransferType::Control { 8 } else { 0 };
    let mut buffer = vec![0u8; setup_len + length];
    if setup_len != 0 {
        buffer[..8].copy_from_slice(&submit.setup);
    }
    if !dir_in {
        reader.read_exact(&mut buffer[setup_len..]).await?;
    }

    if number == 0 && !dir_in {
        if let Some(trap) = trapped_request(&submit.setup) {
            // Configuration-changing requests go through their dedicated
            // ioctls so the driver observes them, and they complete before
            // the next command is parsed. No pending entry.
            apply_trap(shared, classifier, trap).await?;
            let reply = proto::RetSubmit {
                seqnum: header.seqnum,
                devid: header.devid,
                direction: header.direction,
                ep: header.ep,
                status: 0,
                actual_length: 0,
                start_frame: 0,
                number_of_packets: 0,
                error_count: 0,
            }
            .encode();
            let mut writer = shared.writer.lock().await;
            writer.write_all(&reply).await?;
            return Ok(());
        }
    }

    shared.insert_pending(header.seqnum, raw_endpoint(number, dir_in))?;

    let urb = Urb {
        endpoint: number,
        transfer_type: transfer,
        direction: if dir_in { Direction::In } else { Direction::Out },
        short_ok: dir_in && submit.transfer_flags & proto::URB_SHORT_NOT_OK == 0,
        error: xfer::OK,
        len: buffer.len() as u32,
        buffer: buffer.as_mut_ptr() as u64,
        iso: Vec::new(),
    };

    let shared = Arc::clone(shared);
    tasks.spawn(async move {
        if let Err(err) = complete_plain(&shared, header, setup_len, buffer, urb).await {
            let _ = shared.fatal.send(err).await;
        }
    });
    Ok(())
}

async fn complete_plain<S>(
    shared: &Arc<Shared<S>>,
    header: proto::HeaderBasic,
    payload_at: usize,
    buffer: Vec<u8>,
    urb: Urb,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut record = urb.encode();
    shared
        .channel
        .submit_ioctl(ioctl::SEND_URB, &mut record, OutputMode::Exact)
        .await?;
    let mut completed = urb;
    completed.apply_completion(&record);

    // For control transfers the driver counts the setup bytes; the client
    // does not.
    let actual = (completed.len as usize)
        .saturating_sub(payload_at)
        .min(buffer.len() - payload_at);

    let mut writer = shared.writer.lock().await;
    if shared.remove_pending(header.seqnum).is_none() {
        // Lost the race against CMD_UNLINK; the unlink reply owns this
        // seqnum.
        shared.metrics.reply_dropped();
        return Ok(());
    }

    let status = errno_from_xfer(completed.error);
    if status != 0 {
        shared.metrics.urb_error();
    }
    let reply = proto::RetSubmit {
        seqnum: header.seqnum,
        devid: header.devid,
        direction: header.direction,
        ep: header.ep,
        status,
        actual_length: actual as u32,
        start_frame: 0,
        number_of_packets: 0,
        error_count: 0,
    }
    .encode();
    writer.write_all(&reply).await?;
    if header.direction == proto::DIR_IN && actual != 0 {
        writer.write_all(&buffer[payload_at..payload_at + actual]).await?;
    }
    drop(writer);
    shared.metrics.submit_completed();
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trap {
    SetConfiguration(u8),
    SetInterface { interface: u8, alt_setting: u8 },
    ClearEndpointHalt(u8),
}

/// Standard requests on endpoint 0 that the driver must observe.
fn trapped_request(setup: &[u8; 8]) -> Option<Trap> {
    let w_value = u16::from_le_bytes([setup[2], setup[3]]);
    let w_index = u16::from_le_bytes([setup[4], setup[5]]);
    match (setup[0], setup[1]) {
        (0x00, USB_REQ_SET_CONFIGURATION) => Some(Trap::SetConfiguration(w_value as u8)),
        (0x01, USB_REQ_SET_INTERFACE) => Some(Trap::SetInterface {
            interface: w_index as u8,
            alt_setting: w_value as u8,
        }),
        // CLEAR_FEATURE(ENDPOINT_HALT): wValue 0, endpoint in wIndex.
        (0x02, USB_REQ_CLEAR_FEATURE) if w_value == 0 => Some(Trap::ClearEndpointHalt(w_index as u8)),
        _ => None,
    }
}

async fn apply_trap<S>(
    shared: &Arc<Shared<S>>,
    classifier: &mut EndpointClassifier,
    trap: Trap,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match trap {
        Trap::SetConfiguration(value) => {
            let mut request = ioctl::set_config(value);
            shared
                .channel
                .submit_ioctl(ioctl::USB_SET_CONFIG, &mut request, OutputMode::None)
                .await?;
            classifier.set_configuration(value);
        }
        Trap::SetInterface {
            interface,
            alt_setting,
        } => {
            let mut request = ioctl::select_interface(interface, alt_setting);
            shared
                .channel
                .submit_ioctl(ioctl::USB_SELECT_INTERFACE, &mut request, OutputMode::None)
                .await?;
            classifier.set_interface(interface, alt_setting);
        }
        Trap::ClearEndpointHalt(endpoint) => {
            let mut request = ioctl::clear_endpoint(endpoint);
            shared
                .channel
                .submit_ioctl(ioctl::USB_CLEAR_ENDPOINT, &mut request, OutputMode::None)
                .await?;
        }
    }
    Ok(())
}

async fn handle_iso<S>(
    shared: &Arc<Shared<S>>,
    tasks: &mut JoinSet<()>,
    reader: &mut ReadHalf<S>,
    header: proto::HeaderBasic,
    submit: proto::CmdSubmit,
    number: u8,
    dir_in: bool,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if submit.number_of_packets > MAX_ISO_PACKETS_PER_SUBMIT {
        return Err(SessionError::TooManyIsoPackets(submit.number_of_packets));
    }
    let count = submit.number_of_packets as usize;
    let length = submit.transfer_buffer_length as usize;

    let mut buffer = vec![0u8; length];
    if !dir_in {
        reader.read_exact(&mut buffer).await?;
    }
    let packets = proto::read_iso_packets(reader, count).await?;

    let mut sum = 0u64;
    for packet in &packets {
        if packet.length as usize > MAX_URB_SPAN {
            return Err(SessionError::IsoPacketTooLarge(packet.length));
        }
        sum += u64::from(packet.length);
    }
    if sum != u64::from(submit.transfer_buffer_length) {
        return Err(SessionError::IsoLengthMismatch {
            sum,
            expected: submit.transfer_buffer_length,
        });
    }

    shared.insert_pending(header.seqnum, raw_endpoint(number, dir_in))?;

    // One buffer for the whole submit; each span's URB points into it at
    // the span's start, with slot offsets relative to that start.
    let base = buffer.as_mut_ptr() as u64;
    let spans = split_packets(&packets);
    let mut urbs = Vec::with_capacity(spans.len());
    let mut span_start = 0usize;
    for &(first, span_count) in &spans {
        let mut iso = Vec::with_capacity(span_count);
        let mut relative = 0u16;
        let mut span_bytes = 0usize;
        for packet in &packets[first..first + span_count] {
            iso.push(IsoSlot {
                length: packet.length as u16,
                offset: relative,
                status: xfer::OK,
            });
            span_bytes += packet.length as usize;
            relative = span_bytes as u16;
        }
        urbs.push(Urb {
            endpoint: number,
            transfer_type: TransferType::Isochronous,
            direction: if dir_in { Direction::In } else { Direction::Out },
            short_ok: dir_in,
            error: xfer::OK,
            len: span_bytes as u32,
            buffer: base + span_start as u64,
            iso,
        });
        span_start += span_bytes;
    }

    let shared = Arc::clone(shared);
    let start_frame = submit.start_frame;
    tasks.spawn(async move {
        if let Err(err) = complete_iso(&shared, header, buffer, packets, urbs, start_frame).await {
            let _ = shared.fatal.send(err).await;
        }
    });
    Ok(())
}

/// Greedy split: up to [`MAX_ISO_PACKETS`] packets per URB, and an URB
/// never spans more than [`MAX_URB_SPAN`] bytes so that every slot offset
/// fits in 16 bits. Returns `(first packet, packet count)` per URB.
fn split_packets(packets: &[proto::IsoPacket]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut first = 0usize;
    let mut bytes = 0usize;
    for (i, packet) in packets.iter().enumerate() {
        let length = packet.length as usize;
        if i > first && (i - first == MAX_ISO_PACKETS || bytes + length > MAX_URB_SPAN) {
            spans.push((first, i - first));
            first = i;
            bytes = 0;
        }
        bytes += length;
    }
    if first < packets.len() {
        spans.push((first, packets.len() - first));
    }
    spans
}

async fn complete_iso<S>(
    shared: &Arc<Shared<S>>,
    header: proto::HeaderBasic,
    buffer: Vec<u8>,
    packets: Vec<proto::IsoPacket>,
    mut urbs: Vec<Urb>,
    start_frame: u32,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut records: Vec<_> = urbs.iter().map(Urb::encode).collect();
    try_join_all(records.iter_mut().map(|record| {
        shared
            .channel
            .submit_ioctl(ioctl::SEND_URB, record.as_mut_slice(), OutputMode::Exact)
    }))
    .await?;

    // Fold the per-URB write-backs into one reply descriptor array. The
    // reply echoes each packet's offset and length; actual_length and
    // status come from the driver.
    let mut reply_packets = packets;
    let mut error_count = 0u32;
    let mut total_actual = 0u64;
    let mut index = 0usize;
    for (urb, record) in urbs.iter_mut().zip(&records) {
        urb.apply_completion(record);
        for slot in &urb.iso {
            let packet = &mut reply_packets[index];
            let actual = u32::from(slot.length).min(packet.length);
            packet.actual_length = actual;
            packet.status = errno_from_xfer(slot.status);
            if packet.status != 0 {
                error_count += 1;
            }
            total_actual += u64::from(actual);
            index += 1;
        }
    }
    let actual_length = total_actual as u32;
    let dir_in = header.direction == proto::DIR_IN;

    let mut writer = shared.writer.lock().await;
    if shared.remove_pending(header.seqnum).is_none() {
        shared.metrics.reply_dropped();
        return Ok(());
    }

    let reply = proto::RetSubmit {
        seqnum: header.seqnum,
        devid: header.devid,
        direction: header.direction,
        ep: header.ep,
        status: 0,
        actual_length,
        start_frame,
        number_of_packets: reply_packets.len() as u32,
        error_count,
    }
    .encode();
    writer.write_all(&reply).await?;
    if dir_in {
        if (actual_length as usize) < buffer.len() {
            // Short completion: concatenate each packet's first
            // actual_length bytes from its slot in the buffer.
            let mut payload = Vec::with_capacity(actual_length as usize);
            let mut at = 0usize;
            for packet in &reply_packets {
                payload.extend_from_slice(&buffer[at..at + packet.actual_length as usize]);
                at += packet.length as usize;
            }
            writer.write_all(&payload).await?;
        } else {
            writer.write_all(&buffer).await?;
        }
    }
    writer.write_all(&proto::encode_iso_packets(&reply_packets)).await?;
    drop(writer);

    shared.metrics.submit_completed();
    if error_count != 0 {
        shared.metrics.urb_error();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso(lengths: &[u32]) -> Vec<proto::IsoPacket> {
        let mut offset = 0;
        lengths
            .iter()
            .map(|&length| {
                let packet = proto::IsoPacket {
                    offset,
                    length,
                    actual_length: 0,
                    status: 0,
                };
                offset += length;
                packet
            })
            .collect()
    }

    #[test]
    fn split_respects_packet_cap() {
        assert_eq!(split_packets(&iso(&[8; 10])), vec![(0, 8), (8, 2)]);
        assert_eq!(split_packets(&iso(&[8; 9])), vec![(0, 8), (8, 1)]);
        assert_eq!(split_packets(&iso(&[8; 8])), vec![(0, 8)]);
        assert_eq!(split_packets(&iso(&[])), Vec::<(usize, usize)>::new());
    }

    #[test]
    fn split_respects_cumulative_length() {
        // 8 x 8192 = 65536: the last packet would push the span past the
        // 16-bit boundary.
        assert_eq!(split_packets(&iso(&[8192; 8])), vec![(0, 7), (7, 1)]);
        // 65535 bytes exactly fit in one span.
        assert_eq!(split_packets(&iso(&[65535])), vec![(0, 1)]);
        assert_eq!(split_packets(&iso(&[65534, 1])), vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn trapped_requests_are_detected() {
        // SET_CONFIGURATION(2)
        assert_eq!(
            trapped_request(&[0x00, 9, 2, 0, 0, 0, 0, 0]),
            Some(Trap::SetConfiguration(2))
        );
        // SET_INTERFACE(interface 1, alt 2)
        assert_eq!(
            trapped_request(&[0x01, 11, 2, 0, 1, 0, 0, 0]),
            Some(Trap::SetInterface {
                interface: 1,
                alt_setting: 2
            })
        );
        // CLEAR_FEATURE(ENDPOINT_HALT) on 0x81
        assert_eq!(
            trapped_request(&[0x02, 1, 0, 0, 0x81, 0, 0, 0]),
            Some(Trap::ClearEndpointHalt(0x81))
        );
        // CLEAR_FEATURE with a non-halt feature selector passes through.
        assert_eq!(trapped_request(&[0x02, 1, 1, 0, 0x81, 0, 0, 0]), None);
        // GET_DESCRIPTOR is not trapped.
        assert_eq!(trapped_request(&[0x80, 6, 0, 1, 0, 0, 18, 0]), None);
        // Direction matters: an IN SET_CONFIGURATION shape is not a trap.
        assert_eq!(trapped_request(&[0x80, 9, 2, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn errno_table_matches_wire_expectations() {
        assert_eq!(errno_from_xfer(xfer::OK), 0);
        assert_eq!(errno_from_xfer(xfer::STALL), -32);
        assert_eq!(errno_from_xfer(xfer::DNR), -62);
        assert_eq!(errno_from_xfer(xfer::CRC), -84);
        assert_eq!(errno_from_xfer(xfer::DATA_OVERRUN), -75);
        assert_eq!(errno_from_xfer(xfer::DATA_UNDERRUN), -121);
        assert_eq!(errno_from_xfer(xfer::DISCONNECTED), -19);
        assert_eq!(errno_from_xfer(0xFF), -71);
    }
}
