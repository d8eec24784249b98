use std::sync::Arc;

use anvil_core::config::UploadConfig;
use anvil_core::error::{AnvilError, Result};
use anvil_core::model::{ChunkRecord, UploadSession, UploadStatus};
use anvil_core::naming::generate_upload_session_id;
use anvil_core::store::Store;
use anvil_storage::StorageBackend;
use tracing::info;

/// Progress snapshot returned by `progress`.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub total_size: u64,
    pub uploaded_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub percent: f64,
}

/// Parameters to `init`.
pub struct InitRequest {
    pub filename: String,
    pub tag: String,
    pub total_size: u64,
    pub chunk_size: Option<u64>,
    pub checksum: Option<String>,
}

/// The resumable chunked upload state machine. Generic over the store
/// and backend so the daemon can wire a real `sqlx` store and `opendal`
/// backend while tests use the in-memory equivalents.
pub struct UploadEngine<S, B> {
    store: Arc<S>,
    backend: Arc<B>,
    config: UploadConfig,
}

impl<S: Store, B: StorageBackend> UploadEngine<S, B> {
    pub fn new(store: Arc<S>, backend: Arc<B>, config: UploadConfig) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    fn storage_key(&self, identity: &str, session_id: &str, filename: &str, class: &str) -> String {
        format!("{class}/{identity}/{session_id}/{filename}")
    }

    /// `vms` for VM image tags, `docker` otherwise.
    fn class_for_tag(tag: &str) -> &'static str {
        matches!(tag, "ova" | "vmdk" | "qcow2" | "vdi" | "iso")
            .then_some("vms")
            .unwrap_or("docker")
    }

    pub async fn init(&self, identity: &str, req: InitRequest) -> Result<UploadSession> {
        let active = self.store.list_upload_sessions().await?;
        let in_flight = active
            .iter()
            .filter(|s| {
                s.owner == identity
                    && !matches!(
                        s.status,
                        UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
                    )
            })
            .count();
        if in_flight >= self.config.max_sessions_per_identity {
            return Err(AnvilError::QuotaExceeded {
                message: format!(
                    "max {} concurrent upload sessions per identity",
                    self.config.max_sessions_per_identity
                ),
            });
        }

        let entry = self
            .config
            .file_types
            .get(&req.tag)
            .ok_or_else(|| AnvilError::Validation {
                message: format!("unsupported file type tag: {}", req.tag),
            })?;

        if req.total_size > entry.max_bytes {
            return Err(AnvilError::Validation {
                message: format!(
                    "file too large for tag {}: {} bytes > max {} bytes",
                    req.tag, req.total_size, entry.max_bytes
                ),
            });
        }

        let chunk_size = req
            .chunk_size
            .unwrap_or(self.config.default_chunk_size)
            .clamp(self.config.min_chunk_size, self.config.max_chunk_size);

        let total_chunks = req.total_size.div_ceil(chunk_size).max(1) as u32;

        let session_id = generate_upload_session_id();
        let class = Self::class_for_tag(&req.tag);
        let key = self.storage_key(identity, &session_id, &req.filename, class);

        let backend_upload_id = self
            .backend
            .init_upload(&key)
            .await
            .map_err(|e| AnvilError::Upstream {
                message: format!("backend init failed: {e}"),
            })?;

        let now = chrono::Utc::now();
        let session = UploadSession {
            id: session_id,
            owner: identity.to_string(),
            filename: key,
            tag: req.tag,
            total_size: req.total_size,
            chunk_size,
            total_chunks,
            backend_upload_id,
            chunks: Default::default(),
            caller_checksum: req.checksum,
            status: UploadStatus::Uploading,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.session_expiry_secs as i64),
            failure_reason: None,
        };

        self.store.put_upload_session(session.clone()).await?;
        info!(session_id = %session.id, tag = %session.tag, "upload session initialized");
        Ok(session)
    }

    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let mut session = self.store.get_upload_session(session_id).await?;

        if session.is_terminal_for_upload() {
            return Err(AnvilError::Conflict {
                message: format!("session {session_id} is {:?}, no longer accepts chunks", session.status),
            });
        }

        if session.chunks.contains_key(&chunk_number) {
            return Ok(());
        }

        if chunk_number == 0 || chunk_number > session.total_chunks {
            return Err(AnvilError::Validation {
                message: format!(
                    "chunk {chunk_number} out of range 1..={}",
                    session.total_chunks
                ),
            });
        }

        let result = self
            .backend
            .write_chunk(
                &session.filename,
                &session.backend_upload_id,
                chunk_number,
                data,
            )
            .await
            .map_err(|e| AnvilError::Upstream {
                message: format!("backend chunk write failed: {e}"),
            })?;

        session.chunks.insert(
            chunk_number,
            ChunkRecord {
                etag: result.etag,
                size: result.size,
            },
        );
        session.updated_at = chrono::Utc::now();
        self.store.put_upload_session(session).await?;
        Ok(())
    }

    pub async fn complete(&self, session_id: &str) -> Result<UploadSession> {
        let mut session = self.store.get_upload_session(session_id).await?;

        if (session.chunks.len() as u32) != session.total_chunks {
            return Err(AnvilError::Conflict {
                message: format!(
                    "session {session_id} missing chunks: {}/{} present",
                    session.chunks.len(),
                    session.total_chunks
                ),
            });
        }

        session.status = UploadStatus::Processing;
        self.store.put_upload_session(session.clone()).await?;

        let finalize = self
            .backend
            .complete_upload(&session.filename, &session.backend_upload_id, session.total_chunks)
            .await;

        if let Err(e) = finalize {
            session.status = UploadStatus::Failed;
            session.failure_reason = Some(e.to_string());
            session.updated_at = chrono::Utc::now();
            self.store.put_upload_session(session.clone()).await?;
            return Err(AnvilError::Upstream {
                message: format!("complete failed: {e}"),
            });
        }

        if let Some(expected) = session.caller_checksum.clone() {
            session.status = UploadStatus::Validating;
            self.store.put_upload_session(session.clone()).await?;

            if let Err(e) = self.verify_checksum(&session, &expected).await {
                let _ = self.backend.delete(&session.filename).await;
                session.status = UploadStatus::Failed;
                session.failure_reason = Some(e.to_string());
                session.updated_at = chrono::Utc::now();
                self.store.put_upload_session(session.clone()).await?;
                return Err(e);
            }
        }

        session.status = UploadStatus::Completed;
        session.updated_at = chrono::Utc::now();
        self.store.put_upload_session(session.clone()).await?;
        info!(session_id = %session.id, "upload completed");
        Ok(session)
    }

    /// Reads the finalized object back from the backend and compares its
    /// SHA-256 against the checksum the caller supplied at `init`.
    async fn verify_checksum(&self, session: &UploadSession, expected: &str) -> Result<()> {
        let bytes = self
            .backend
            .download(&session.filename)
            .await
            .map_err(|e| AnvilError::Upstream {
                message: format!("checksum readback failed: {e}"),
            })?;
        let actual = crate::validator::sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(AnvilError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let mut session = self.store.get_upload_session(session_id).await?;
        self.backend
            .abort_upload(&session.filename, &session.backend_upload_id)
            .await
            .map_err(|e| AnvilError::Upstream {
                message: format!("abort failed: {e}"),
            })?;
        session.status = UploadStatus::Cancelled;
        session.updated_at = chrono::Utc::now();
        self.store.put_upload_session(session).await?;
        Ok(())
    }

    pub async fn progress(&self, session_id: &str) -> Result<UploadProgress> {
        let session = self.store.get_upload_session(session_id).await?;
        let uploaded_size = session.uploaded_size();
        let percent = if session.total_size == 0 {
            100.0
        } else {
            (uploaded_size as f64 / session.total_size as f64) * 100.0
        };
        Ok(UploadProgress {
            total_size: session.total_size,
            uploaded_size,
            total_chunks: session.total_chunks,
            uploaded_chunks: session.chunks.len() as u32,
            percent,
        })
    }

    pub async fn missing(&self, session_id: &str) -> Result<Vec<u32>> {
        let session = self.store.get_upload_session(session_id).await?;
        Ok(session.missing_chunks())
    }
}

trait TerminalForUpload {
    fn is_terminal_for_upload(&self) -> bool;
}

impl TerminalForUpload for UploadSession {
    fn is_terminal_for_upload(&self) -> bool {
        matches!(
            self.status,
            UploadStatus::Completed
                | UploadStatus::Failed
                | UploadStatus::Cancelled
                | UploadStatus::Processing
                | UploadStatus::Validating
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::store::MemStore;
    use anvil_storage::LocalBackend;

    fn engine(dir: &std::path::Path) -> UploadEngine<MemStore, LocalBackend> {
        UploadEngine::new(
            Arc::new(MemStore::new()),
            Arc::new(LocalBackend::new(dir)),
            UploadConfig::default(),
        )
    }

    #[tokio::test]
    async fn init_rejects_unsupported_tag() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let err = e
            .init(
                "user-1",
                InitRequest {
                    filename: "x.exe".into(),
                    tag: "exe".into(),
                    total_size: 100,
                    chunk_size: None,
                    checksum: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "validation");
    }

    #[tokio::test]
    async fn init_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let err = e
            .init(
                "user-1",
                InitRequest {
                    filename: "Dockerfile".into(),
                    tag: "dockerfile".into(),
                    total_size: 10 * 1024 * 1024,
                    chunk_size: None,
                    checksum: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "validation");
    }

    #[tokio::test]
    async fn full_upload_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let session = e
            .init(
                "user-1",
                InitRequest {
                    filename: "base.qcow2".into(),
                    tag: "qcow2".into(),
                    total_size: 10,
                    chunk_size: Some(5),
                    checksum: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 2);

        e.upload_chunk(&session.id, 1, vec![1, 2, 3, 4, 5])
            .await
            .unwrap();
        e.upload_chunk(&session.id, 2, vec![6, 7, 8, 9, 10])
            .await
            .unwrap();

        assert!(e.missing(&session.id).await.unwrap().is_empty());

        let completed = e.complete(&session.id).await.unwrap();
        assert_eq!(completed.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let session = e
            .init(
                "user-1",
                InitRequest {
                    filename: "base.qcow2".into(),
                    tag: "qcow2".into(),
                    total_size: 5,
                    chunk_size: Some(5),
                    checksum: None,
                },
            )
            .await
            .unwrap();
        e.upload_chunk(&session.id, 1, vec![1, 2, 3, 4, 5])
            .await
            .unwrap();
        e.upload_chunk(&session.id, 1, vec![1, 2, 3, 4, 5])
            .await
            .unwrap();
        let progress = e.progress(&session.id).await.unwrap();
        assert_eq!(progress.uploaded_chunks, 1);
    }

    #[tokio::test]
    async fn complete_with_missing_chunks_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let session = e
            .init(
                "user-1",
                InitRequest {
                    filename: "base.qcow2".into(),
                    tag: "qcow2".into(),
                    total_size: 10,
                    chunk_size: Some(5),
                    checksum: None,
                },
            )
            .await
            .unwrap();
        let err = e.complete(&session.id).await.unwrap_err();
        assert_eq!(err.tag(), "conflict");
    }

    #[tokio::test]
    async fn complete_verifies_checksum_and_fails_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let session = e
            .init(
                "user-1",
                InitRequest {
                    filename: "base.qcow2".into(),
                    tag: "qcow2".into(),
                    total_size: 5,
                    chunk_size: Some(5),
                    checksum: Some("0".repeat(64)),
                },
            )
            .await
            .unwrap();
        e.upload_chunk(&session.id, 1, vec![1, 2, 3, 4, 5])
            .await
            .unwrap();

        let err = e.complete(&session.id).await.unwrap_err();
        assert_eq!(err.tag(), "checksum_mismatch");

        let fetched = e.store.get_upload_session(&session.id).await.unwrap();
        assert_eq!(fetched.status, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn complete_accepts_matching_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let data = vec![1u8, 2, 3, 4, 5];
        let checksum = crate::validator::sha256_hex(&data);
        let session = e
            .init(
                "user-1",
                InitRequest {
                    filename: "base.qcow2".into(),
                    tag: "qcow2".into(),
                    total_size: data.len() as u64,
                    chunk_size: Some(5),
                    checksum: Some(checksum),
                },
            )
            .await
            .unwrap();
        e.upload_chunk(&session.id, 1, data).await.unwrap();

        let completed = e.complete(&session.id).await.unwrap();
        assert_eq!(completed.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_transitions_to_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let session = e
            .init(
                "user-1",
                InitRequest {
                    filename: "Dockerfile".into(),
                    tag: "dockerfile".into(),
                    total_size: 10,
                    chunk_size: None,
                    checksum: None,
                },
            )
            .await
            .unwrap();
        e.cancel(&session.id).await.unwrap();
        let fetched = e.store.get_upload_session(&session.id).await.unwrap();
        assert_eq!(fetched.status, UploadStatus::Cancelled);
    }
}
