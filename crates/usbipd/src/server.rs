use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::handshake;
use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::Config;

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Binds the listener and starts accepting connections.
pub async fn start_server(
    config: Config,
    registry: DeviceRegistry,
    metrics: Metrics,
) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(bind = %addr, "usbipd listening");

    let connections =
        (config.max_connections != 0).then(|| Arc::new(Semaphore::new(config.max_connections)));

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("accept failed: {err}");
                            continue;
                        }
                    };

                    let permit = match &connections {
                        None => None,
                        Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                tracing::warn!(%peer, "connection limit reached, dropping");
                                continue;
                            }
                        },
                    };

                    let _ = stream.set_nodelay(true);
                    let registry = registry.clone();
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let span = tracing::info_span!("conn", %peer);
                        if let Err(err) =
                            handshake::serve_connection(stream, registry, metrics)
                                .instrument(span)
                                .await
                        {
                            tracing::debug!(%peer, "connection ended: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}
