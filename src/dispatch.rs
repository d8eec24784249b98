//! Maps each `DaemonRequest` onto the service that owns it and turns the
//! result into a `DaemonResponse`. The one place that knows about every
//! collaborator the daemon wires together.

use std::collections::HashMap;
use std::sync::Arc;

use anvil_core::audit::{self, AuditAction, AuditEntry};
use anvil_core::error::AnvilError;
use anvil_core::model::InstanceOwner;
use anvil_core::protocol::{DaemonRequest, DaemonResponse};
use anvil_core::store::Store;
use anvil_runtime::InstanceManager;
use anvil_security::{RateLimitScope, RateLimiter};
use anvil_storage::StorageBackend;
use anvil_upload::engine::InitRequest;
use anvil_upload::UploadEngine;
use anvil_wireguard::kernel::SystemRunner;
use anvil_wireguard::WireguardManager;
use base64::Engine as _;
use tracing::warn;

use crate::observability::metrics;

pub struct AppState<S: Store, B: StorageBackend> {
    pub store: Arc<S>,
    pub instance_manager: Arc<InstanceManager<S>>,
    pub upload_engine: Arc<UploadEngine<S, B>>,
    pub wireguard: Arc<WireguardManager<S, SystemRunner>>,
    pub rate_limiters: HashMap<RateLimitScope, Arc<RateLimiter>>,
}

impl<S: Store, B: StorageBackend> AppState<S, B> {
    fn rate_limited(&self, scope: RateLimitScope, key: &str) -> bool {
        match self.rate_limiters.get(&scope) {
            Some(limiter) => !limiter.allow(key),
            None => false,
        }
    }

    fn audit(&self, user_id: &str, instance_id: Option<&str>, action: AuditAction) {
        audit::log_event(&AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            user_id: user_id.to_string(),
            instance_id: instance_id.map(str::to_string),
            challenge_id: None,
            action,
            detail: None,
        });
    }

    pub async fn dispatch(&self, req: DaemonRequest) -> DaemonResponse {
        metrics::global().requests_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match self.handle(req).await {
            Ok(resp) => resp,
            Err(e) => {
                metrics::global().requests_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(kind = e.tag(), error = %e, "request failed");
                DaemonResponse::Error {
                    kind: e.tag().to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn handle(&self, req: DaemonRequest) -> anvil_core::error::Result<DaemonResponse> {
        match req {
            DaemonRequest::Ping => Ok(DaemonResponse::Pong),

            DaemonRequest::CreateInstance { user_id, challenge_id } => {
                if self.rate_limited(RateLimitScope::InstanceStart, &user_id) {
                    self.audit(&user_id, None, AuditAction::QuotaRejected);
                    return Err(AnvilError::Forbidden {
                        message: "rate limit exceeded for instance creation".to_string(),
                    });
                }
                let challenge = self.store.get_challenge(&challenge_id).await?;
                let instance = self
                    .instance_manager
                    .create(InstanceOwner::User(user_id.clone()), &challenge)
                    .await?;
                metrics::global().instances_created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&user_id, Some(&instance.id), AuditAction::InstanceCreated);
                Ok(data(&instance)?)
            }

            DaemonRequest::StartInstance { instance_id } => {
                let instance = self.instance_manager.start(&instance_id).await?;
                metrics::global().instances_started.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&owner_key(&instance.owner), Some(&instance.id), AuditAction::InstanceStarted);
                Ok(data(&instance)?)
            }

            DaemonRequest::StopInstance { instance_id } => {
                let instance = self.instance_manager.stop(&instance_id).await?;
                metrics::global().instances_stopped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&owner_key(&instance.owner), Some(&instance.id), AuditAction::InstanceStopped);
                Ok(data(&instance)?)
            }

            DaemonRequest::ResetInstance { instance_id } => {
                let instance = self.instance_manager.reset(&instance_id).await?;
                metrics::global().instances_reset.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&owner_key(&instance.owner), Some(&instance.id), AuditAction::InstanceReset);
                Ok(data(&instance)?)
            }

            DaemonRequest::ExtendInstance { instance_id, minutes } => {
                let instance = self.instance_manager.extend(&instance_id, minutes).await?;
                metrics::global().instances_extended.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&owner_key(&instance.owner), Some(&instance.id), AuditAction::InstanceExtended);
                Ok(data(&instance)?)
            }

            DaemonRequest::DestroyInstance { instance_id } => {
                let instance = self.instance_manager.get(&instance_id).await?;
                self.instance_manager.destroy(&instance_id).await?;
                metrics::global().instances_destroyed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&owner_key(&instance.owner), Some(&instance_id), AuditAction::InstanceDestroyed);
                Ok(DaemonResponse::Ok)
            }

            DaemonRequest::GetInstance { instance_id } => {
                let instance = self.instance_manager.get(&instance_id).await?;
                Ok(data(&instance)?)
            }

            DaemonRequest::ListInstances { user_id } => {
                let instances = self.store.list_instances_for_owner(&user_id).await?;
                Ok(data(&instances)?)
            }

            DaemonRequest::CreateVpnPeer { user_id } => {
                if self.rate_limited(RateLimitScope::VpnConfigGenerate, &user_id) {
                    return Err(AnvilError::Forbidden {
                        message: "rate limit exceeded for VPN config generation".to_string(),
                    });
                }
                let generated = self.wireguard.generate_user_config(&user_id).await?;
                metrics::global().vpn_peers_created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&user_id, None, AuditAction::PeerCreated);
                Ok(data(&serde_json::json!({
                    "client_config": generated.client_config,
                    "public_key": generated.public_key,
                }))?)
            }

            DaemonRequest::RemoveVpnPeer { user_id } => {
                self.wireguard.remove_peer(&user_id).await?;
                metrics::global().vpn_peers_removed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&user_id, None, AuditAction::PeerRemoved);
                Ok(DaemonResponse::Ok)
            }

            DaemonRequest::ListVpnPeers => {
                let peers = self.store.list_vpn_peers().await?;
                Ok(data(&peers)?)
            }

            DaemonRequest::RegisterNode { node } => {
                self.store.put_node(node).await?;
                Ok(DaemonResponse::Ok)
            }

            DaemonRequest::ListNodes => {
                let nodes = self.store.list_nodes().await?;
                Ok(data(&nodes)?)
            }

            DaemonRequest::InitUpload { identity, req } => {
                let session = self
                    .upload_engine
                    .init(
                        &identity,
                        InitRequest {
                            filename: req.filename,
                            tag: req.tag,
                            total_size: req.total_size,
                            chunk_size: req.chunk_size,
                            checksum: req.checksum,
                        },
                    )
                    .await?;
                metrics::global().upload_sessions_started.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(data(&session)?)
            }

            DaemonRequest::UploadChunk { session_id, chunk_number, data_b64 } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&data_b64)
                    .map_err(|e| AnvilError::Validation {
                        message: format!("chunk is not valid base64: {e}"),
                    })?;
                self.upload_engine.upload_chunk(&session_id, chunk_number, bytes).await?;
                metrics::global().upload_chunks_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(DaemonResponse::Ok)
            }

            DaemonRequest::CompleteUpload { session_id } => {
                let session = self.upload_engine.complete(&session_id).await?;
                metrics::global().upload_sessions_completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit(&session.owner, None, AuditAction::UploadCompleted);
                Ok(data(&session)?)
            }

            DaemonRequest::UploadStatus { session_id } => {
                let progress = self.upload_engine.progress(&session_id).await?;
                Ok(data(&serde_json::json!({
                    "total_size": progress.total_size,
                    "uploaded_size": progress.uploaded_size,
                    "total_chunks": progress.total_chunks,
                    "uploaded_chunks": progress.uploaded_chunks,
                    "percent": progress.percent,
                }))?)
            }
        }
    }
}

fn owner_key(owner: &InstanceOwner) -> String {
    match owner {
        InstanceOwner::User(id) => id.clone(),
        InstanceOwner::Session(id) => id.clone(),
    }
}

fn data<T: serde::Serialize>(value: &T) -> anvil_core::error::Result<DaemonResponse> {
    let payload = serde_json::to_value(value)
        .map_err(|e| AnvilError::internal(format!("failed to serialize response: {e}")))?;
    Ok(DaemonResponse::Data { payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::config::{ContainerConfig, QuotaConfig, WireguardConfig};
    use anvil_core::model::{Node, NodeCapacity, NodeConnection};
    use anvil_runtime::ContainerService;
    use anvil_runtime::vm::service::VmService;
    use anvil_storage::LocalBackend;
    use anvil_upload::UploadEngine;
    use anvil_wireguard::kernel::{SystemRunner, WgInterface};
    use anvil_core::config::UploadConfig;

    fn test_state() -> AppState<anvil_core::store::MemStore, LocalBackend> {
        let store = Arc::new(anvil_core::store::MemStore::new());
        let backend = Arc::new(LocalBackend::new(
            tempfile::tempdir().unwrap().path().to_path_buf(),
        ));
        let docker = bollard::Docker::connect_with_local_defaults()
            .expect("bollard client construction does not contact the daemon");
        let container_service = Arc::new(ContainerService::new(docker, ContainerConfig::default()));
        let vm_service = Arc::new(VmService::new(
            store.clone(),
            QuotaConfig::default(),
            "/tmp/anvil-test-overlays",
        ));
        let instance_manager = Arc::new(InstanceManager::new(
            store.clone(),
            QuotaConfig::default(),
            container_service,
            vm_service,
        ));
        let upload_engine = Arc::new(UploadEngine::new(
            store.clone(),
            backend,
            UploadConfig::default(),
        ));

        let wg_dir = tempfile::tempdir().unwrap();
        let identity = crate::identity::load_or_generate(wg_dir.path().to_str().unwrap()).unwrap();
        let iface = WgInterface::new("wg-test", SystemRunner);
        let wireguard = Arc::new(
            WireguardManager::new(
                store.clone(),
                iface,
                WireguardConfig::default(),
                identity.public_key,
                identity.encryption_key,
            )
            .unwrap(),
        );

        AppState {
            store,
            instance_manager,
            upload_engine,
            wireguard,
            rate_limiters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let state = test_state();
        let resp = state.dispatch(DaemonRequest::Ping).await;
        assert!(matches!(resp, DaemonResponse::Pong));
    }

    #[tokio::test]
    async fn register_then_list_nodes_round_trips() {
        let state = test_state();
        let node = Node {
            id: "node-1".to_string(),
            hostname: "node-1.lab".to_string(),
            status: anvil_core::model::NodeStatus::Online,
            priority: 0,
            max_vms: 10,
            active_vms: 0,
            capacity: NodeCapacity {
                total_vcpu: 16,
                total_memory_mb: 32768,
                total_disk_gb: 500,
                reserved_vcpu: 0,
                reserved_memory_mb: 0,
                used_vcpu: 0,
                used_memory_mb: 0,
            },
            connection: NodeConnection {
                ssh_host: "localhost".to_string(),
                ssh_port: 22,
                ssh_user: "anvil".to_string(),
                ssh_key_path: "/dev/null".to_string(),
                libvirt_uri: "qemu:///system".to_string(),
                bridge_network: "anvil-vm-net".to_string(),
                vnc_port_start: 5900,
                vnc_port_end: 5901,
                vm_subnet: "10.100.10.0/24".to_string(),
            },
            last_heartbeat: None,
        };

        let resp = state
            .dispatch(DaemonRequest::RegisterNode { node: node.clone() })
            .await;
        assert!(matches!(resp, DaemonResponse::Ok));

        let resp = state.dispatch(DaemonRequest::ListNodes).await;
        match resp {
            DaemonResponse::Data { payload } => {
                let nodes: Vec<Node> = serde_json::from_value(payload).unwrap();
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].id, "node-1");
            }
            other => panic!("expected Data response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_challenge_surfaces_as_not_found_error() {
        let state = test_state();
        let resp = state
            .dispatch(DaemonRequest::CreateInstance {
                user_id: "u-1".to_string(),
                challenge_id: "does-not-exist".to_string(),
            })
            .await;
        match resp {
            DaemonResponse::Error { kind, .. } => assert_eq!(kind, "not_found"),
            other => panic!("expected Error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn instance_start_rate_limit_rejects_over_threshold() {
        let mut state = test_state();
        state.rate_limiters.insert(
            RateLimitScope::InstanceStart,
            Arc::new(RateLimiter::new(RateLimitScope::InstanceStart, 0, 60, 0)),
        );

        let resp = state
            .dispatch(DaemonRequest::CreateInstance {
                user_id: "u-1".to_string(),
                challenge_id: "c-1".to_string(),
            })
            .await;
        match resp {
            DaemonResponse::Error { kind, .. } => assert_eq!(kind, "forbidden"),
            other => panic!("expected Error response, got {other:?}"),
        }
    }
}
