//! Per-connection handshake: device list and import.
//!
//! A connection speaks at most one handshake operation. `OP_REQ_DEVLIST`
//! answers and closes; `OP_REQ_IMPORT` claims the device, confirms, and
//! hands the same stream to the session engine until the client detaches.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use usbip_protocol as proto;

use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::session::{run_session, SessionError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] proto::ProtocolError),
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub async fn serve_connection<S>(
    mut stream: S,
    registry: DeviceRegistry,
    metrics: Metrics,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match proto::read_op_request(&mut stream).await? {
        proto::OpRequest::Devlist => {
            let devices = registry.snapshot();
            tracing::debug!(count = devices.len(), "device list requested");
            stream
                .write_all(&proto::encode_op_rep_devlist(&devices))
                .await?;
            Ok(())
        }
        proto::OpRequest::Import { busid } => match registry.claim(&busid) {
            Some(device) => {
                stream
                    .write_all(&proto::encode_op_rep_import(Some(&device.summary)))
                    .await?;
                run_session(stream, device, metrics).await?;
                Ok(())
            }
            None => {
                tracing::warn!(%busid, "import rejected (unknown or already claimed)");
                stream.write_all(&proto::encode_op_rep_import(None)).await?;
                Ok(())
            }
        },
    }
}
