//! Content registry — who has what.
//!
//! One `PeerEntry` per peer id, each holding its content records in
//! registration order. Entries live in a `DashMap`, so mutations of
//! different peers lock different shards and a search only takes brief
//! shard read locks while it scans.
//!
//! A record is `Pending` from an accepted register until its upload
//! commits. Pending records are invisible to search, list and download.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use peerindex_core::IndexError;

use crate::store::BlobKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Pending,
    Available,
}

/// Registry metadata for one named item owned by one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub name: String,
    pub owner_peer: String,
    /// Unknown until the upload completes.
    pub size_bytes: Option<u64>,
    pub state: ContentState,
    /// Distinguishes successive registrations of the same `(owner, name)`.
    pub generation: u64,
}

impl ContentRecord {
    pub fn is_available(&self) -> bool {
        self.state == ContentState::Available
    }

    /// Where this generation's bytes live in the content store.
    pub fn blob_key(&self) -> BlobKey {
        BlobKey::new(&self.owner_peer, &self.name, self.generation)
    }
}

/// Tracked state for a peer that has registered at least once.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: String,
    /// Source address of the peer's most recent register.
    pub last_known_address: SocketAddr,
    /// Registration order; user-visible through `list_for`.
    pub contents: Vec<ContentRecord>,
    /// Creation order across peers. Search picks the lowest.
    order: u64,
}

/// Result of a name search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub peer_id: String,
    pub address: SocketAddr,
    pub record: ContentRecord,
}

/// Point-in-time counts, for the stats log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub peers: usize,
    pub available: usize,
    pub pending: usize,
}

/// The registry — shared between the dispatcher and the transfer coordinator.
#[derive(Clone)]
pub struct Registry {
    peers: Arc<DashMap<String, PeerEntry>>,
    counter: Arc<AtomicU64>,
    max_contents_per_peer: usize,
}

impl Registry {
    pub fn new(max_contents_per_peer: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            counter: Arc::new(AtomicU64::new(1)),
            max_contents_per_peer,
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Create the peer's entry, or refresh its address.
    pub fn upsert_peer(&self, peer_id: &str, address: SocketAddr) -> PeerEntry {
        let mut entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry {
                peer_id: peer_id.to_string(),
                last_known_address: address,
                contents: Vec::new(),
                order: self.next(),
            });
        entry.last_known_address = address;
        entry.value().clone()
    }

    /// Insert a `Pending` record. Fails if the peer already has a record
    /// with that name in any state, or is at capacity.
    pub fn begin_register(&self, peer_id: &str, name: &str) -> Result<ContentRecord, IndexError> {
        let mut entry = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| IndexError::UnknownPeer(peer_id.to_string()))?;

        if entry.contents.iter().any(|r| r.name == name) {
            return Err(IndexError::DuplicateName {
                peer: peer_id.to_string(),
                name: name.to_string(),
            });
        }
        if entry.contents.len() >= self.max_contents_per_peer {
            return Err(IndexError::CapacityExceeded(format!(
                "peer '{}' already has {} records",
                peer_id, self.max_contents_per_peer
            )));
        }

        let record = ContentRecord {
            name: name.to_string(),
            owner_peer: peer_id.to_string(),
            size_bytes: None,
            state: ContentState::Pending,
            generation: self.next(),
        };
        entry.contents.push(record.clone());
        Ok(record)
    }

    /// Promote the pending record of `generation` to `Available`.
    ///
    /// If that record is gone it was deregistered mid-upload, and the
    /// caller gets `RecordRemoved` rather than resurrecting it.
    pub fn commit_register(
        &self,
        peer_id: &str,
        name: &str,
        generation: u64,
        size_bytes: u64,
    ) -> Result<ContentRecord, IndexError> {
        let removed = || IndexError::RecordRemoved {
            peer: peer_id.to_string(),
            name: name.to_string(),
        };
        let mut entry = self.peers.get_mut(peer_id).ok_or_else(removed)?;
        let record = entry
            .contents
            .iter_mut()
            .find(|r| r.name == name && r.generation == generation)
            .ok_or_else(removed)?;
        record.state = ContentState::Available;
        record.size_bytes = Some(size_bytes);
        Ok(record.clone())
    }

    /// Drop the pending record of `generation`. Returns whether it existed.
    pub fn abort_register(&self, peer_id: &str, name: &str, generation: u64) -> bool {
        let Some(mut entry) = self.peers.get_mut(peer_id) else {
            return false;
        };
        let before = entry.contents.len();
        entry.contents.retain(|r| {
            !(r.name == name && r.generation == generation && r.state == ContentState::Pending)
        });
        before != entry.contents.len()
    }

    /// Remove a record in either state and return it.
    pub fn deregister(&self, peer_id: &str, name: &str) -> Result<ContentRecord, IndexError> {
        let not_found = || {
            IndexError::NotFound(format!("peer '{}' has no content named '{}'", peer_id, name))
        };
        let mut entry = self.peers.get_mut(peer_id).ok_or_else(not_found)?;
        let pos = entry
            .contents
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(not_found)?;
        Ok(entry.contents.remove(pos))
    }

    /// First `Available` match in registry order: peers by first
    /// registration, then records by registration within the peer.
    ///
    /// This is a deterministic simplification, not load balancing.
    /// `find_all` returns every holder.
    pub fn find_by_name(&self, name: &str) -> Result<Located, IndexError> {
        self.find_all(name)
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::NotFound(format!("content '{}'", name)))
    }

    /// Every `Available` holder of `name`, in registry order.
    pub fn find_all(&self, name: &str) -> Vec<Located> {
        let mut hits: Vec<(u64, Located)> = self
            .peers
            .iter()
            .filter_map(|entry| {
                entry
                    .contents
                    .iter()
                    .find(|r| r.name == name && r.is_available())
                    .map(|r| {
                        (
                            entry.order,
                            Located {
                                peer_id: entry.peer_id.clone(),
                                address: entry.last_known_address,
                                record: r.clone(),
                            },
                        )
                    })
            })
            .collect();
        hits.sort_by_key(|(order, _)| *order);
        hits.into_iter().map(|(_, located)| located).collect()
    }

    /// `Available` records of one peer, in registration order. Unknown
    /// peers yield an empty list.
    pub fn list_for(&self, peer_id: &str) -> Vec<ContentRecord> {
        self.peers
            .get(peer_id)
            .map(|entry| {
                entry
                    .contents
                    .iter()
                    .filter(|r| r.is_available())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The `Available` record for an exact key, as a download binds to it.
    pub fn get_available(&self, peer_id: &str, name: &str) -> Result<ContentRecord, IndexError> {
        self.peers
            .get(peer_id)
            .and_then(|entry| {
                entry
                    .contents
                    .iter()
                    .find(|r| r.name == name && r.is_available())
                    .cloned()
            })
            .ok_or_else(|| {
                IndexError::NotFound(format!("peer '{}' has no content named '{}'", peer_id, name))
            })
    }

    /// Generation of the pending record for a key, if there is one.
    pub fn pending_generation(&self, peer_id: &str, name: &str) -> Option<u64> {
        self.peers.get(peer_id).and_then(|entry| {
            entry
                .contents
                .iter()
                .find(|r| r.name == name && r.state == ContentState::Pending)
                .map(|r| r.generation)
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.peers.iter() {
            stats.peers += 1;
            for record in &entry.contents {
                match record.state {
                    ContentState::Available => stats.available += 1,
                    ContentState::Pending => stats.pending += 1,
                }
            }
        }
        stats
    }
}
