use std::path::{Path, PathBuf};

use anvil_core::error::{AnvilError, Result};
use async_trait::async_trait;
use sha2::Digest as _;
use tokio::io::AsyncWriteExt;

use crate::backend::{ChunkWriteResult, StorageBackend};

/// Filesystem-backed storage. Chunks land under `<root>/.parts/<upload_id>/<chunk_no>`
/// and are concatenated into `<root>/<key>` on completion via a
/// write-to-temp-then-rename so a crash mid-compose never leaves a
/// partial file at the final path.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn parts_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(".parts").join(upload_id)
    }

    fn final_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AnvilError::internal(format!("mkdir {}: {e}", parent.display())))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn init_upload(&self, _key: &str) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.parts_dir(&upload_id))
            .await
            .map_err(|e| AnvilError::internal(format!("create parts dir: {e}")))?;
        Ok(upload_id)
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

        let path = self.parts_dir(upload_id).join(chunk_no.to_string());
        Self::ensure_parent(&path).await?;
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| AnvilError::internal(format!("create chunk file: {e}")))?;
        file.write_all(&data)
            .await
            .map_err(|e| AnvilError::internal(format!("write chunk: {e}")))?;
        file.flush()
            .await
            .map_err(|e| AnvilError::internal(format!("flush chunk: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AnvilError::internal(format!("rename chunk: {e}")))?;

        Ok(ChunkWriteResult { etag, size })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, chunk_count: u32) -> Result<u64> {
        let final_path = self.final_path(key);
        Self::ensure_parent(&final_path).await?;
        let tmp = final_path.with_extension("tmp-compose");

        let mut out = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| AnvilError::internal(format!("create compose file: {e}")))?;

        let mut total = 0u64;
        for chunk_no in 1..=chunk_count {
            let part_path = self.parts_dir(upload_id).join(chunk_no.to_string());
            let data = tokio::fs::read(&part_path).await.map_err(|e| {
                AnvilError::internal(format!("read chunk {chunk_no} for compose: {e}"))
            })?;
            total += data.len() as u64;
            out.write_all(&data)
                .await
                .map_err(|e| AnvilError::internal(format!("write compose: {e}")))?;
        }
        out.flush()
            .await
            .map_err(|e| AnvilError::internal(format!("flush compose: {e}")))?;
        drop(out);

        tokio::fs::rename(&tmp, &final_path)
            .await
            .map_err(|e| AnvilError::internal(format!("rename compose: {e}")))?;

        let _ = tokio::fs::remove_dir_all(self.parts_dir(upload_id)).await;

        Ok(total)
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let _ = tokio::fs::remove_dir_all(self.parts_dir(upload_id)).await;
        Ok(())
    }

    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.final_path(key);
        Self::ensure_parent(&path).await?;
        let tmp = path.with_extension("tmp-upload");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| AnvilError::internal(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AnvilError::internal(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.final_path(key)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AnvilError::not_found("object", key)
            } else {
                AnvilError::internal(format!("read {key}: {e}"))
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.final_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AnvilError::internal(format!("delete {}: {e}", path.display()))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.final_path(key)).await.is_ok())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let meta = tokio::fs::metadata(self.final_path(key))
            .await
            .map_err(|_| AnvilError::not_found("object", key))?;
        Ok(meta.len())
    }

    async fn signed_url(&self, key: &str, _expires_in_secs: u64) -> Result<String> {
        Err(AnvilError::Upstream {
            message: format!("local backend has no signed URLs for {key}; fetch through the daemon"),
        })
    }
}
