use std::sync::Arc;

use anvil_core::model::UploadStatus;
use anvil_core::store::Store;
use tracing::{info, warn};

use crate::backend::StorageBackend;

/// Sweeps upload sessions past `expires_at` that never completed,
/// aborting their backend-side chunk state and deleting the session
/// record so they stop counting against `max_sessions_per_identity`.
pub struct StaleSessionJanitor<S, B> {
    store: Arc<S>,
    backend: Arc<B>,
}

impl<S: Store, B: StorageBackend> StaleSessionJanitor<S, B> {
    pub fn new(store: Arc<S>, backend: Arc<B>) -> Self {
        Self { store, backend }
    }

    /// Run one sweep pass, returning the number of sessions reaped.
    pub async fn sweep(&self) -> anvil_core::error::Result<usize> {
        let now = chrono::Utc::now();
        let sessions = self.store.list_upload_sessions().await?;
        let mut reaped = 0;

        for session in sessions {
            let stale = session.expires_at < now
                && !matches!(session.status, UploadStatus::Completed);
            if !stale {
                continue;
            }

            if let Err(e) = self
                .backend
                .abort_upload(&session.filename, &session.backend_upload_id)
                .await
            {
                warn!(session_id = %session.id, error = %e, "failed to abort backend upload during sweep");
                continue;
            }

            self.store.delete_upload_session(&session.id).await?;
            info!(session_id = %session.id, "reaped stale upload session");
            reaped += 1;
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::model::{UploadSession, UploadStatus};
    use anvil_core::store::MemStore;
    use crate::local::LocalBackend;

    fn session(id: &str, expires_at: chrono::DateTime<chrono::Utc>, status: UploadStatus) -> UploadSession {
        let now = chrono::Utc::now();
        UploadSession {
            id: id.to_string(),
            owner: "user-1".into(),
            filename: format!("{id}.qcow2"),
            tag: "qcow2".into(),
            total_size: 10,
            chunk_size: 10,
            total_chunks: 1,
            backend_upload_id: "backend-1".into(),
            chunks: Default::default(),
            caller_checksum: None,
            status,
            created_at: now,
            updated_at: now,
            expires_at,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_incomplete_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let backend = Arc::new(LocalBackend::new(dir.path()));

        let past = chrono::Utc::now() - chrono::Duration::hours(1);
        let future = chrono::Utc::now() + chrono::Duration::hours(1);

        store
            .put_upload_session(session("stale", past, UploadStatus::Uploading))
            .await
            .unwrap();
        store
            .put_upload_session(session("fresh", future, UploadStatus::Uploading))
            .await
            .unwrap();
        store
            .put_upload_session(session("done", past, UploadStatus::Completed))
            .await
            .unwrap();

        let janitor = StaleSessionJanitor::new(store.clone(), backend);
        let reaped = janitor.sweep().await.unwrap();

        assert_eq!(reaped, 1);
        assert!(store.get_upload_session("stale").await.is_err());
        assert!(store.get_upload_session("fresh").await.is_ok());
        assert!(store.get_upload_session("done").await.is_ok());
    }
}
