//! Transfer coordinator — binds control-plane intent to bulk-plane bytes.
//!
//! An accepted register reserves an upload slot for `(peer, name)` and
//! leaves a `Pending` record in the registry. The slot is claimed by the
//! first bulk UPLOAD naming that key; until then a second register is
//! `TransferInProgress`. A slot nobody claims within the connect timeout
//! is released and its record aborted.
//!
//! Downloads are not serialized against each other. They bind to the
//! `Available` record at handshake time and stream that generation's blob.
//!
//! The registry lock is never held across I/O: every registry call
//! returns before the coordinator touches a stream or the store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use peerindex_core::wire::{write_frame, BulkStatus};
use peerindex_core::IndexError;

use crate::registry::{ContentRecord, ContentState, Located, Registry};
use crate::store::ContentStore;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// `(peer, name)` — the unit of transfer exclusivity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub peer_id: String,
    pub name: String,
}

impl ContentKey {
    pub fn new(peer_id: &str, name: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer_id, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadPhase {
    /// Register accepted, bulk connection not yet seen.
    Awaiting,
    Streaming,
}

#[derive(Debug, Clone, Copy)]
struct UploadSlot {
    generation: u64,
    phase: UploadPhase,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Largest accepted upload; `None` = unbounded.
    pub max_blob_bytes: Option<u64>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_blob_bytes: None,
        }
    }
}

impl From<&peerindex_core::config::TransferConfig> for TransferSettings {
    fn from(c: &peerindex_core::config::TransferConfig) -> Self {
        Self {
            idle_timeout: c.idle_timeout(),
            connect_timeout: c.connect_timeout(),
            max_blob_bytes: c.blob_limit(),
        }
    }
}

pub struct TransferCoordinator<S: ContentStore> {
    registry: Registry,
    store: Arc<S>,
    uploads: Arc<DashMap<ContentKey, UploadSlot>>,
    settings: TransferSettings,
}

impl<S: ContentStore> Clone for TransferCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            store: self.store.clone(),
            uploads: self.uploads.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: ContentStore> TransferCoordinator<S> {
    pub fn new(registry: Registry, store: Arc<S>, settings: TransferSettings) -> Self {
        Self {
            registry,
            store,
            uploads: Arc::new(DashMap::new()),
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Uploads reserved or streaming right now.
    pub fn uploads_in_flight(&self) -> usize {
        self.uploads.len()
    }

    // ── Control-plane entry points ───────────────────────────────────────────

    /// Accept a register: reserve the upload slot and insert a `Pending`
    /// record. Must be called inside a tokio runtime; it arms the connect
    /// timeout.
    pub fn begin_upload(&self, peer_id: &str, name: &str) -> Result<ContentRecord, IndexError> {
        let key = ContentKey::new(peer_id, name);
        let record = match self.uploads.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(IndexError::TransferInProgress {
                    peer: peer_id.to_string(),
                    name: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let record = self.registry.begin_register(peer_id, name)?;
                slot.insert(UploadSlot {
                    generation: record.generation,
                    phase: UploadPhase::Awaiting,
                });
                record
            }
        };

        self.arm_connect_timeout(key, record.generation);
        tracing::debug!(peer = peer_id, name, generation = record.generation, "upload reserved");
        Ok(record)
    }

    fn arm_connect_timeout(&self, key: ContentKey, generation: u64) {
        let uploads = self.uploads.clone();
        let registry = self.registry.clone();
        let timeout = self.settings.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = uploads
                .remove_if(&key, |_, slot| {
                    slot.generation == generation && slot.phase == UploadPhase::Awaiting
                })
                .is_some();
            if expired {
                registry.abort_register(&key.peer_id, &key.name, generation);
                tracing::warn!(
                    key = %key,
                    timeout_secs = timeout.as_secs(),
                    "upload never connected, registration aborted"
                );
            }
        });
    }

    /// Deregister a record. Published bytes are deleted; an unclaimed
    /// upload slot is released. A streaming upload keeps running and
    /// fails with `RecordRemoved` when it tries to commit.
    pub async fn deregister(&self, peer_id: &str, name: &str) -> Result<ContentRecord, IndexError> {
        let record = self.registry.deregister(peer_id, name)?;
        match record.state {
            ContentState::Pending => {
                let key = ContentKey::new(peer_id, name);
                self.uploads.remove_if(&key, |_, slot| {
                    slot.generation == record.generation && slot.phase == UploadPhase::Awaiting
                });
            }
            ContentState::Available => {
                if let Err(e) = self.store.remove(&record.blob_key()).await {
                    tracing::warn!(blob = %record.blob_key(), error = %e, "failed to delete blob");
                }
            }
        }
        tracing::info!(peer = peer_id, name, "content deregistered");
        Ok(record)
    }

    /// Resolve a download by name. The requester then opens a bulk
    /// DOWNLOAD naming the returned owner.
    pub fn locate(&self, name: &str) -> Result<Located, IndexError> {
        self.registry.find_by_name(name)
    }

    // ── Bulk-plane sessions ──────────────────────────────────────────────────

    /// Claim the slot reserved by `begin_upload`.
    fn claim_upload(&self, key: &ContentKey) -> Result<u64, IndexError> {
        let generation = {
            let mut slot = self.uploads.get_mut(key).ok_or_else(|| {
                IndexError::NotFound(format!("no pending registration for {}", key))
            })?;
            if slot.phase == UploadPhase::Streaming {
                return Err(IndexError::TransferInProgress {
                    peer: key.peer_id.clone(),
                    name: key.name.clone(),
                });
            }
            slot.phase = UploadPhase::Streaming;
            slot.generation
        };

        if self.registry.pending_generation(&key.peer_id, &key.name) != Some(generation) {
            self.release_slot(key, generation);
            return Err(IndexError::RecordRemoved {
                peer: key.peer_id.clone(),
                name: key.name.clone(),
            });
        }
        Ok(generation)
    }

    fn release_slot(&self, key: &ContentKey, generation: u64) {
        self.uploads
            .remove_if(key, |_, slot| slot.generation == generation);
    }

    /// Run one upload session on an already-handshaken bulk stream.
    ///
    /// Replies `accepted`, reads the body until the client half-closes,
    /// publishes the blob, commits the record and replies `complete`. With
    /// a `declared` length, EOF anywhere else is a failed transfer. On any
    /// failure the record is aborted, the partial blob deleted and
    /// `rejected` sent on a best-effort basis.
    pub async fn run_upload<T>(
        &self,
        key: ContentKey,
        declared: Option<u64>,
        stream: &mut T,
    ) -> Result<ContentRecord, IndexError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let generation = match self.claim_upload(&key) {
            Ok(g) => g,
            Err(e) => {
                let _ = write_frame(stream, &BulkStatus::from(&e)).await;
                return Err(e);
            }
        };

        let result = self.receive_body(&key, generation, declared, stream).await;
        self.release_slot(&key, generation);

        match result {
            Ok(record) => {
                let size_bytes = record.size_bytes.unwrap_or(0);
                tracing::info!(key = %key, bytes = size_bytes, "upload committed");
                if let Err(e) = write_frame(stream, &BulkStatus::Complete { size_bytes }).await {
                    tracing::debug!(key = %key, error = %e, "client left before completion frame");
                }
                Ok(record)
            }
            Err(e) => {
                self.registry
                    .abort_register(&key.peer_id, &key.name, generation);
                tracing::warn!(key = %key, error = %e, "upload aborted");
                let _ = write_frame(stream, &BulkStatus::from(&e)).await;
                Err(e)
            }
        }
    }

    async fn receive_body<T>(
        &self,
        key: &ContentKey,
        generation: u64,
        declared: Option<u64>,
        stream: &mut T,
    ) -> Result<ContentRecord, IndexError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let (Some(size), Some(max)) = (declared, self.settings.max_blob_bytes) {
            if size > max {
                return Err(IndexError::CapacityExceeded(format!(
                    "declared size {} exceeds {} byte limit",
                    size, max
                )));
            }
        }

        let blob = crate::store::BlobKey::new(&key.peer_id, &key.name, generation);
        let mut writer = self
            .store
            .create(&blob)
            .await
            .map_err(|e| IndexError::Storage(format!("{:#}", e)))?;

        if let Err(e) = write_frame(stream, &BulkStatus::Accepted).await {
            drop(writer);
            self.discard(&blob).await;
            return Err(e);
        }

        let copied = copy_until_eof(
            stream,
            &mut writer,
            self.settings.idle_timeout,
            declared,
            self.settings.max_blob_bytes,
        )
        .await
            .and_then(|total| match declared {
                Some(size) if total != size => Err(IndexError::TransferIo(format!(
                    "connection closed after {} of {} bytes",
                    total, size
                ))),
                _ => Ok(total),
            });
        if let Err(e) = copied {
            drop(writer);
            self.discard(&blob).await;
            return Err(e);
        }

        let size = match self.store.finish(&blob, writer).await {
            Ok(size) => size,
            Err(e) => {
                self.discard(&blob).await;
                return Err(IndexError::Storage(format!("{:#}", e)));
            }
        };

        match self
            .registry
            .commit_register(&key.peer_id, &key.name, generation, size)
        {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Err(err) = self.store.remove(&blob).await {
                    tracing::warn!(blob = %blob, error = %err, "failed to delete orphaned blob");
                }
                Err(e)
            }
        }
    }

    fn is_current(&self, key: &ContentKey, generation: u64) -> bool {
        self.registry
            .get_available(&key.peer_id, &key.name)
            .is_ok_and(|r| r.generation == generation)
    }

    async fn discard(&self, blob: &crate::store::BlobKey) {
        if let Err(e) = self.store.discard(blob).await {
            tracing::warn!(blob = %blob, error = %e, "failed to discard partial blob");
        }
    }

    /// Run one download session: bind to the `Available` record for
    /// `(owner, name)`, reply `sending` with its size, then stream exactly
    /// that many bytes.
    pub async fn run_download<T>(&self, key: ContentKey, stream: &mut T) -> Result<u64, IndexError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let opened = match self.registry.get_available(&key.peer_id, &key.name) {
            Ok(record) => match self.store.open(&record.blob_key()).await {
                Ok(o) => Ok(o),
                // deregistered between the lookup and the open
                Err(_) if !self.is_current(&key, record.generation) => {
                    Err(IndexError::NotFound(format!("{} was removed", key)))
                }
                Err(e) => Err(IndexError::Storage(format!("{:#}", e))),
            },
            Err(e) => Err(e),
        };
        let (mut reader, size) = match opened {
            Ok(o) => o,
            Err(e) => {
                let _ = write_frame(stream, &BulkStatus::from(&e)).await;
                return Err(e);
            }
        };

        write_frame(stream, &BulkStatus::Sending { size_bytes: size }).await?;
        copy_exact(&mut reader, stream, size, self.settings.idle_timeout).await?;
        stream.shutdown().await.map_err(IndexError::io)?;

        tracing::info!(key = %key, bytes = size, "download served");
        Ok(size)
    }
}

/// Copy until `reader` reaches EOF. Overrunning the `declared` length is
/// a transfer failure; passing `max` is a capacity failure. Each read and
/// write must make progress within `idle`.
async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    declared: Option<u64>,
    max: Option<u64>,
) -> Result<u64, IndexError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = with_idle_timeout(idle, reader.read(&mut buf)).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if let Some(size) = declared {
            if total > size {
                return Err(IndexError::TransferIo(format!(
                    "upload overran its declared {} bytes",
                    size
                )));
            }
        }
        if let Some(max) = max {
            if total > max {
                return Err(IndexError::CapacityExceeded(format!(
                    "upload exceeds {} bytes",
                    max
                )));
            }
        }
        with_idle_timeout(idle, writer.write_all(&buf[..n]))
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
    }
}

/// Copy exactly `len` bytes. A short source is a storage failure.
async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: Duration,
) -> Result<(), IndexError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = with_idle_timeout(idle, reader.read(&mut buf[..want]))
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        if n == 0 {
            return Err(IndexError::Storage(format!(
                "blob ended {} bytes early",
                remaining
            )));
        }
        with_idle_timeout(idle, writer.write_all(&buf[..n])).await?;
        remaining -= n as u64;
    }
    with_idle_timeout(idle, writer.flush()).await
}

async fn with_idle_timeout<F, T>(idle: Duration, fut: F) -> Result<T, IndexError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(idle, fut).await {
        Ok(result) => result.map_err(IndexError::io),
        Err(_) => Err(IndexError::TransferIo(format!(
            "no progress for {}s",
            idle.as_secs()
        ))),
    }
}
