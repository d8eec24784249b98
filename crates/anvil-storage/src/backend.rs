use anvil_core::error::Result;
use async_trait::async_trait;

/// A storage backend receives chunks out of order and in parallel, and
/// composes them into one object once the upload session reports every
/// chunk present. Implementations must treat `write_chunk` as
/// idempotent: re-sending the same chunk number overwrites, never
/// duplicates.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Begin a multipart upload for `key`, returning a backend-assigned
    /// upload id the caller must pass to subsequent calls.
    async fn init_upload(&self, key: &str) -> Result<String>;

    /// Write chunk `chunk_no` (1-indexed) and return its content hash,
    /// used by the upload session to track which chunks have landed.
    async fn write_chunk(
        &self,
        key: &str,
        upload_id: &str,
        chunk_no: u32,
        data: Vec<u8>,
    ) -> Result<ChunkWriteResult>;

    /// Compose all chunks into the final object. Returns the final
    /// object size in bytes.
    async fn complete_upload(&self, key: &str, upload_id: &str, chunk_count: u32) -> Result<u64>;

    /// Discard all chunk data for an abandoned or failed upload.
    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Write the entirety of `data` as object `key` in a single call, for
    /// artifacts too small to bother chunking.
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Read back a complete object's bytes, e.g. for post-upload
    /// checksum verification.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a completed object.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Size of a completed object, for post-upload validation.
    async fn size(&self, key: &str) -> Result<u64>;

    /// A time-limited URL a client can use to fetch `key` directly from
    /// the backend, bypassing the daemon.
    async fn signed_url(&self, key: &str, expires_in_secs: u64) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ChunkWriteResult {
    pub etag: String,
    pub size: u64,
}
