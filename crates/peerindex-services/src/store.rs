//! Content store — where uploaded bytes live.
//!
//! The registry never touches bytes and the store never touches registry
//! state; the transfer coordinator is the only caller of both.
//!
//! Blobs are addressed by `(owner, name, generation)`. The generation
//! comes from the registry record, so a re-registration of the same name
//! never shares a blob with the registration it replaced.

use std::fmt;
use std::future::Future;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Identity of one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub owner: String,
    pub name: String,
    pub generation: u64,
}

impl BlobKey {
    pub fn new(owner: &str, name: &str, generation: u64) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            generation,
        }
    }

    /// BLAKE3 over the length-prefixed fields, hex encoded. Peer ids and
    /// names are arbitrary text, so they never become path components.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for field in [self.owner.as_bytes(), self.name.as_bytes()] {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(&self.generation.to_be_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.name, self.generation)
    }
}

/// Byte sink/source the transfer coordinator streams through.
///
/// Exactly one writer exists per key at a time; the coordinator enforces
/// that. Readers are unrestricted.
pub trait ContentStore: Send + Sync + 'static {
    type Writer: AsyncWrite + Unpin + Send;
    type Reader: AsyncRead + Unpin + Send;

    /// Start a partial blob.
    fn create(&self, key: &BlobKey) -> impl Future<Output = Result<Self::Writer>> + Send;

    /// Flush the partial blob to durable storage and publish it under
    /// `key`. Returns the byte count. Once this returns the bytes are
    /// complete and visible to `open`.
    fn finish(
        &self,
        key: &BlobKey,
        writer: Self::Writer,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Delete whatever partial blob exists for `key`.
    fn discard(&self, key: &BlobKey) -> impl Future<Output = Result<()>> + Send;

    /// Open a published blob, returning its reader and length.
    fn open(&self, key: &BlobKey) -> impl Future<Output = Result<(Self::Reader, u64)>> + Send;

    /// Delete a published blob. Absent blobs are not an error.
    fn remove(&self, key: &BlobKey) -> impl Future<Output = Result<()>> + Send;
}

// ── Filesystem ────────────────────────────────────────────────────────────────

/// Blobs on the local filesystem, two-level like git objects:
///   {root}/{digest[0..2]}/{digest}
/// with in-progress uploads at `{digest}.partial`.
#[derive(Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn blob_path(&self, key: &BlobKey) -> PathBuf {
        let digest = key.digest();
        self.root.join(&digest[0..2]).join(&digest)
    }

    fn partial_path(&self, key: &BlobKey) -> PathBuf {
        self.blob_path(key).with_extension("partial")
    }
}

async fn remove_if_present(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

impl ContentStore for FsContentStore {
    type Writer = fs::File;
    type Reader = fs::File;

    async fn create(&self, key: &BlobKey) -> Result<fs::File> {
        let path = self.partial_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }
        fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create partial blob: {}", path.display()))
    }

    async fn finish(&self, key: &BlobKey, mut writer: fs::File) -> Result<u64> {
        let partial = self.partial_path(key);
        let path = self.blob_path(key);

        writer.flush().await.context("failed to flush blob")?;
        writer.sync_all().await.context("failed to sync blob to disk")?;
        let len = writer
            .metadata()
            .await
            .context("failed to stat blob")?
            .len();
        drop(writer);

        fs::rename(&partial, &path).await.with_context(|| {
            format!(
                "failed to rename {} to {}",
                partial.display(),
                path.display()
            )
        })?;

        tracing::trace!(blob = %key, bytes = len, "blob stored");
        Ok(len)
    }

    async fn discard(&self, key: &BlobKey) -> Result<()> {
        remove_if_present(&self.partial_path(key)).await
    }

    async fn open(&self, key: &BlobKey) -> Result<(fs::File, u64)> {
        let path = self.blob_path(key);
        let file = fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open blob: {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat blob: {}", path.display()))?
            .len();
        Ok((file, len))
    }

    async fn remove(&self, key: &BlobKey) -> Result<()> {
        remove_if_present(&self.blob_path(key)).await
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// Blobs held in process memory. Partial uploads exist only in the
/// writer, so a dropped upload leaves nothing behind.
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<DashMap<BlobKey, Arc<Vec<u8>>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    type Writer = Vec<u8>;
    type Reader = Cursor<Vec<u8>>;

    async fn create(&self, _key: &BlobKey) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn finish(&self, key: &BlobKey, writer: Vec<u8>) -> Result<u64> {
        let len = writer.len() as u64;
        self.blobs.insert(key.clone(), Arc::new(writer));
        Ok(len)
    }

    async fn discard(&self, _key: &BlobKey) -> Result<()> {
        Ok(())
    }

    async fn open(&self, key: &BlobKey) -> Result<(Cursor<Vec<u8>>, u64)> {
        let data = self
            .blobs
            .get(key)
            .map(|b| Arc::clone(b.value()))
            .with_context(|| format!("no blob stored for {}", key))?;
        let len = data.len() as u64;
        Ok((Cursor::new(data.as_ref().clone()), len))
    }

    async fn remove(&self, key: &BlobKey) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}
