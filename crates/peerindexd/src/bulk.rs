//! Bulk channel listener.
//!
//! One TCP connection per transfer. The first frame is a `BulkHandshake`
//! naming the operation and the `(peer, name)` key; after that the
//! connection belongs to the transfer coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};

use peerindex_core::wire::{read_frame, write_frame};
use peerindex_core::{BulkHandshake, BulkOp, BulkStatus, IndexError};
use peerindex_services::{ContentKey, ContentStore, TransferCoordinator};

pub struct BulkListener<S: ContentStore> {
    listener: TcpListener,
    coordinator: TransferCoordinator<S>,
    sessions: Arc<Semaphore>,
    max_sessions: usize,
    shutdown: broadcast::Receiver<()>,
}

impl<S: ContentStore> BulkListener<S> {
    pub fn new(
        listener: TcpListener,
        coordinator: TransferCoordinator<S>,
        max_sessions: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            coordinator,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("bulk listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (mut stream, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let Ok(permit) = self.sessions.clone().try_acquire_owned() else {
                        tracing::warn!(%peer_addr, limit = self.max_sessions, "bulk session limit reached");
                        let e = IndexError::CapacityExceeded(format!(
                            "{} bulk sessions already active",
                            self.max_sessions
                        ));
                        tokio::spawn(async move {
                            let _ = write_frame(&mut stream, &BulkStatus::from(&e)).await;
                        });
                        continue;
                    };

                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_connection(coordinator, stream, peer_addr).await;
                    });
                }
            }
        }
    }
}

async fn handle_connection<S: ContentStore>(
    coordinator: TransferCoordinator<S>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let idle = coordinator.settings().idle_timeout;
    let handshake: BulkHandshake = match tokio::time::timeout(idle, read_frame(&mut stream)).await {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => {
            tracing::warn!(%peer_addr, error = %e, "bad bulk handshake");
            let _ = write_frame(&mut stream, &BulkStatus::from(&e)).await;
            return;
        }
        Err(_) => {
            tracing::warn!(%peer_addr, timeout_secs = idle.as_secs(), "no bulk handshake, closing");
            return;
        }
    };

    if let Err(e) = handshake.validate() {
        tracing::warn!(%peer_addr, error = %e, "bad bulk handshake");
        let _ = write_frame(&mut stream, &BulkStatus::from(&e)).await;
        return;
    }

    let key = ContentKey::new(&handshake.peer_id, &handshake.name);
    tracing::debug!(%peer_addr, key = %key, op = ?handshake.op, "bulk session started");

    match handshake.op {
        BulkOp::Upload => {
            // the coordinator logs aborts itself
            let _ = coordinator
                .run_upload(key, handshake.size_bytes, &mut stream)
                .await;
        }
        BulkOp::Download => {
            if let Err(e) = coordinator.run_download(key.clone(), &mut stream).await {
                tracing::warn!(%peer_addr, key = %key, error = %e, "download failed");
            }
        }
    }
}
