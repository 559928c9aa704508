//! Routes control requests to the registry and transfer coordinator.
//!
//! Every datagram gets exactly one reply. Parse failures are answered
//! without touching the registry.

use std::net::SocketAddr;

use peerindex_core::{IndexError, Reply, Request};

use crate::store::ContentStore;
use crate::transfer::TransferCoordinator;

pub struct Dispatcher<S: ContentStore> {
    coordinator: TransferCoordinator<S>,
    /// Advertised in READY and download replies.
    bulk_port: u16,
}

impl<S: ContentStore> Dispatcher<S> {
    pub fn new(coordinator: TransferCoordinator<S>, bulk_port: u16) -> Self {
        Self {
            coordinator,
            bulk_port,
        }
    }

    pub fn coordinator(&self) -> &TransferCoordinator<S> {
        &self.coordinator
    }

    /// Handle one datagram from `from`.
    pub async fn handle(&self, datagram: &[u8], from: SocketAddr) -> Reply {
        let request = match Request::parse(datagram) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%from, error = %e, "rejected datagram");
                return Reply::from(e);
            }
        };

        let command = request.command();
        match self.execute(request, from).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(%from, command, code = e.code(), error = %e, "request failed");
                Reply::from(e)
            }
        }
    }

    async fn execute(&self, request: Request, from: SocketAddr) -> Result<Reply, IndexError> {
        let registry = self.coordinator.registry();
        match request {
            Request::Register { peer_id, name } => {
                registry.upsert_peer(&peer_id, from);
                self.coordinator.begin_upload(&peer_id, &name)?;
                tracing::info!(peer = %peer_id, name = %name, %from, "register accepted");
                Ok(Reply::Ready {
                    name,
                    bulk_port: self.bulk_port,
                })
            }
            Request::Deregister { peer_id, name } => {
                self.coordinator.deregister(&peer_id, &name).await?;
                Ok(Reply::Removed { name })
            }
            Request::Search { name } => {
                let hit = registry.find_by_name(&name)?;
                Ok(Reply::Found {
                    name,
                    addr: hit.address,
                    owner: hit.peer_id,
                })
            }
            Request::List { peer_id } => {
                let names = registry
                    .list_for(&peer_id)
                    .into_iter()
                    .map(|r| r.name)
                    .collect();
                Ok(Reply::Listing { peer_id, names })
            }
            Request::Download { name } => {
                let hit = self.coordinator.locate(&name)?;
                Ok(Reply::Download {
                    name,
                    addr: hit.address,
                    size_bytes: hit.record.size_bytes.unwrap_or(0),
                    owner: hit.peer_id,
                    bulk_port: self.bulk_port,
                })
            }
        }
    }
}
