use anvil_core::error::{AnvilError, Result};
use async_trait::async_trait;
use opendal::Operator;
use sha2::Digest as _;

use crate::backend::{ChunkWriteResult, StorageBackend};

/// Object-store backed storage via `opendal`. Chunks are written as
/// `<key>.part.<n>` objects; completion composes them into `<key>` by
/// streaming each part through the operator in order. Tolerates any
/// opendal service (S3, GCS, ...) the deployment configures, not just S3.
pub struct ObjectStoreBackend {
    op: Operator,
}

impl ObjectStoreBackend {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    fn part_path(&self, upload_id: &str, chunk_no: u32) -> String {
        format!(".parts/{upload_id}/{chunk_no}")
    }

    fn parts_prefix(&self, upload_id: &str) -> String {
        format!(".parts/{upload_id}/")
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn init_upload(&self, _key: &str) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn write_chunk(
        &self,
        _key: &str,
        upload_id: &str,
        chunk_no: u32,
        data: Vec<u8>,
    ) -> Result<ChunkWriteResult> {
        let mut hasher = sha2::Sha256::new();
        hasher.update(&data);
        let etag = format!("{:x}", hasher.finalize());
        let size = data.len() as u64;

        self.op
            .write(&self.part_path(upload_id, chunk_no), data)
            .await
            .map_err(|e| AnvilError::internal(format!("write part {chunk_no}: {e}")))?;

        Ok(ChunkWriteResult { etag, size })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, chunk_count: u32) -> Result<u64> {
        let mut writer = self
            .op
            .writer(key)
            .await
            .map_err(|e| AnvilError::internal(format!("open writer for {key}: {e}")))?;

        let mut total = 0u64;
        for chunk_no in 1..=chunk_count {
            let part = self.part_path(upload_id, chunk_no);
            let data = self
                .op
                .read(&part)
                .await
                .map_err(|e| AnvilError::internal(format!("read part {chunk_no}: {e}")))?
                .to_vec();
            total += data.len() as u64;
            writer
                .write(data)
                .await
                .map_err(|e| AnvilError::internal(format!("compose write: {e}")))?;
        }
        writer
            .close()
            .await
            .map_err(|e| AnvilError::internal(format!("close writer: {e}")))?;

        let _ = self.op.remove_all(&self.parts_prefix(upload_id)).await;

        Ok(total)
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let _ = self.op.remove_all(&self.parts_prefix(upload_id)).await;
        Ok(())
    }

    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.op
            .write(key, data)
            .await
            .map_err(|e| AnvilError::internal(format!("write {key}: {e}")))?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.op
            .read(key)
            .await
            .map(|buf| buf.to_vec())
            .map_err(|e| {
                if e.kind() == opendal::ErrorKind::NotFound {
                    AnvilError::not_found("object", key)
                } else {
                    AnvilError::internal(format!("read {key}: {e}"))
                }
            })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.op
            .delete(key)
            .await
            .map_err(|e| AnvilError::internal(format!("delete {key}: {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.op
            .exists(key)
            .await
            .map_err(|e| AnvilError::internal(format!("exists {key}: {e}")))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let meta = self
            .op
            .stat(key)
            .await
            .map_err(|_| AnvilError::not_found("object", key))?;
        Ok(meta.content_length())
    }

    async fn signed_url(&self, key: &str, expires_in_secs: u64) -> Result<String> {
        let duration = std::time::Duration::from_secs(expires_in_secs);
        self.op
            .presign_read(key, duration)
            .await
            .map(|req| req.uri().to_string())
            .map_err(|e| AnvilError::internal(format!("presign {key}: {e}")))
    }
}
