//! Control channel listener.
//!
//! One datagram in, one datagram out. Each request runs in its own task
//! so a slow deregister (blob removal) never stalls the receive loop.
//! When `max_inflight` requests are already running, new datagrams are
//! dropped; the transport is unreliable and clients retry.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Semaphore};

use peerindex_services::{ContentStore, Dispatcher};

/// Larger than any accepted request, so oversized datagrams are seen as
/// oversized rather than silently truncated to a valid one.
const RECV_BUF_SIZE: usize = 2048;

pub struct ControlListener<S: ContentStore> {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher<S>>,
    inflight: Arc<Semaphore>,
    shutdown: broadcast::Receiver<()>,
}

impl<S: ContentStore> ControlListener<S> {
    pub fn new(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<Dispatcher<S>>,
        max_inflight: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            dispatcher,
            inflight: Arc::new(Semaphore::new(max_inflight)),
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("control listener shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    let permit = match self.inflight.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::warn!(%from, "control queue full, dropping datagram");
                            continue;
                        }
                    };

                    let datagram = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        respond(&socket, &dispatcher, &datagram, from).await;
                    });
                }
            }
        }
    }
}

async fn respond<S: ContentStore>(
    socket: &UdpSocket,
    dispatcher: &Dispatcher<S>,
    datagram: &[u8],
    from: SocketAddr,
) {
    let reply = dispatcher.handle(datagram, from).await;
    let encoded = reply.encode();
    tracing::debug!(%from, reply = %first_line(&encoded), "control reply");
    if let Err(e) = socket.send_to(encoded.as_bytes(), from).await {
        tracing::warn!(%from, error = %e, "failed to send control reply");
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
