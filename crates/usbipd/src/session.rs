//! The attached-client session engine.
//!
//! One session owns one claimed device and one TCP stream. The loop reads
//! commands strictly in wire order (a submit's payload and iso descriptors
//! are consumed before the next header), while URB completions run as
//! spawned tasks and may reply out of order. Two shared structures connect
//! the halves:
//!
//! - the **pending table** maps every in-flight seqnum to its raw endpoint
//!   byte; whoever removes an entry first (completion or unlink) owns the
//!   reply for that seqnum, the other side stays silent;
//! - the **write serializer** (a fair async mutex over the write half)
//!   keeps each reply (header + payload + iso descriptors) atomic on the
//!   stream.
//!
//! Any protocol violation, stream failure, or driver hard failure ends the
//! session; in-band URB errors are reported to the client and are not
//! fatal.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use usbip_protocol as proto;
use usbipd_monitor::{ioctl, ChannelError, DeviceChannel, OutputMode};

use crate::metrics::Metrics;
use crate::registry::ClaimedDevice;
use crate::submit;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] proto::ProtocolError),
    #[error("duplicate sequence number {0}")]
    DuplicateSeqnum(u32),
    #[error("iso packet lengths sum to {sum}, expected {expected}")]
    IsoLengthMismatch { sum: u64, expected: u32 },
    #[error("iso packet of {0} bytes exceeds the per-packet limit")]
    IsoPacketTooLarge(u32),
    #[error("iso submit with {0} packets exceeds the per-submit limit")]
    TooManyIsoPackets(u32),
    #[error("no endpoint {0:#04x} in the active configuration")]
    UnknownEndpoint(u8),
    #[error("usb monitor: {0}")]
    Channel(#[from] ChannelError),
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared between the session loop and spawned completion tasks.
pub(crate) struct Shared<S> {
    pub(crate) writer: tokio::sync::Mutex<WriteHalf<S>>,
    pending: Mutex<HashMap<u32, u8>>,
    pub(crate) channel: Arc<dyn DeviceChannel>,
    pub(crate) metrics: Metrics,
    pub(crate) fatal: mpsc::Sender<SessionError>,
}

impl<S> Shared<S> {
    /// A duplicate seqnum is a protocol violation.
    pub(crate) fn insert_pending(&self, seqnum: u32, endpoint: u8) -> Result<(), SessionError> {
        let mut pending = self.pending.lock().expect("pending table mutex poisoned");
        match pending.entry(seqnum) {
            Entry::Occupied(_) => Err(SessionError::DuplicateSeqnum(seqnum)),
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    pub(crate) fn remove_pending(&self, seqnum: u32) -> Option<u8> {
        self.pending
            .lock()
            .expect("pending table mutex poisoned")
            .remove(&seqnum)
    }

    fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending table mutex poisoned").len()
    }
}

/// Runs one attached session until the stream closes, the client violates
/// the protocol, or the driver fails hard.
pub async fn run_session<S>(
    stream: S,
    device: ClaimedDevice,
    metrics: Metrics,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = tracing::info_span!("session", busid = %device.busid());
    run_session_inner(stream, device, metrics).instrument(span).await
}

async fn run_session_inner<S>(
    stream: S,
    mut device: ClaimedDevice,
    metrics: Metrics,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    metrics.session_opened();
    let _guard = SessionGuard {
        metrics: metrics.clone(),
    };
    tracing::info!("client attached");

    let (mut reader, writer) = tokio::io::split(stream);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<SessionError>(8);
    let shared = Arc::new(Shared {
        writer: tokio::sync::Mutex::new(writer),
        pending: Mutex::new(HashMap::new()),
        channel: device.channel.clone(),
        metrics: metrics.clone(),
        fatal: fatal_tx,
    });
    let classifier = &mut device.classifier;
    let mut tasks = JoinSet::new();

    let result = loop {
        tokio::select! {
            biased;
            Some(err) = fatal_rx.recv() => break Err(err),
            command = proto::read_command(&mut reader) => {
                let command = match command {
                    Ok(command) => command,
                    Err(proto::ProtocolError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                        // Client closed between commands: a normal detach.
                        break Ok(());
                    }
                    Err(err) => break Err(err.into()),
                };
                metrics.command_received();
                let handled = match command {
                    proto::Command::Submit { header, submit } => {
                        submit::handle_submit(
                            &shared,
                            &mut tasks,
                            &mut reader,
                            classifier,
                            header,
                            submit,
                        )
                        .await
                    }
                    proto::Command::Unlink { header, unlink } => {
                        handle_unlink(&shared, header, unlink).await
                    }
                };
                if let Err(err) = handled {
                    break Err(err);
                }
            }
        }
    };

    // Ioctls themselves are not cancellable; abort the completion tasks and
    // let the driver fault any in-flight URBs when the channel handle goes
    // away.
    tasks.shutdown().await;

    match &result {
        Ok(()) => tracing::info!(outstanding = shared.pending_len(), "client detached"),
        Err(SessionError::Io(err)) | Err(SessionError::Protocol(proto::ProtocolError::Io(err))) => {
            tracing::info!("session stream failed: {err}");
        }
        Err(SessionError::Channel(err)) => {
            tracing::warn!("usb monitor failed: {err}");
        }
        Err(err) => {
            metrics.protocol_error();
            tracing::warn!("session aborted: {err}");
        }
    }
    result
}

/// `CMD_UNLINK`: whoever removes the pending entry first owns the reply.
///
/// If the entry was still present, the endpoint pipe is aborted (the only
/// cancellation primitive the driver offers; it cancels every URB on that
/// pipe) and the unlink reports `-ECONNRESET`. If the submit completed
/// first (or the seqnum was never pending), the unlink reports success.
async fn handle_unlink<S>(
    shared: &Arc<Shared<S>>,
    header: proto::HeaderBasic,
    unlink: proto::CmdUnlink,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancelled = shared.remove_pending(unlink.unlink_seqnum);
    if let Some(endpoint) = cancelled {
        let mut request = ioctl::abort_endpoint(endpoint);
        shared
            .channel
            .submit_ioctl(ioctl::USB_ABORT_ENDPOINT, &mut request, OutputMode::None)
            .await?;
    }

    let status = if cancelled.is_some() {
        -proto::errno::ECONNRESET
    } else {
        0
    };
    let reply = proto::RetUnlink {
        seqnum: header.seqnum,
        devid: header.devid,
        direction: header.direction,
        ep: header.ep,
        status,
    }
    .encode();
    let mut writer = shared.writer.lock().await;
    writer.write_all(&reply).await?;
    drop(writer);
    shared.metrics.unlink_handled();
    Ok(())
}

struct SessionGuard {
    metrics: Metrics,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.session_closed();
    }
}
