use std::collections::HashMap;
use std::sync::Mutex;

use anvil_core::config::QuotaConfig;
use anvil_core::error::{AnvilError, Result};
use anvil_core::model::{
    Challenge, Cooldown, Instance, InstanceNetwork, InstanceOwner, InstanceState, ResourceKind,
};
use anvil_core::store::Store;
use chrono::Utc;
use tracing::info;

use crate::container::{ContainerService, CreateContainerRequest};
use crate::vm::service::{CreateVmRequest, VmService};

fn owner_key(owner: &InstanceOwner) -> String {
    match owner {
        InstanceOwner::User(id) => id.clone(),
        InstanceOwner::Session(id) => id.clone(),
    }
}

/// Single entry point used by HTTP handlers. Delegates to the container
/// or VM service by challenge kind; the in-memory cache is an
/// accelerator only, the store is the record of truth.
pub struct InstanceManager<S: Store> {
    store: std::sync::Arc<S>,
    quotas: QuotaConfig,
    container_service: std::sync::Arc<ContainerService>,
    vm_service: std::sync::Arc<VmService<S>>,
    cache: Mutex<HashMap<String, Instance>>,
}

impl<S: Store> InstanceManager<S> {
    pub fn new(
        store: std::sync::Arc<S>,
        quotas: QuotaConfig,
        container_service: std::sync::Arc<ContainerService>,
        vm_service: std::sync::Arc<VmService<S>>,
    ) -> Self {
        Self {
            store,
            quotas,
            container_service,
            vm_service,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, owner: InstanceOwner, challenge: &Challenge) -> Result<Instance> {
        let key = owner_key(&owner);
        let existing = self.store.list_instances_for_owner(&key).await?;
        let live: Vec<&Instance> = existing.iter().filter(|i| !i.is_terminal()).collect();

        match challenge.kind {
            ResourceKind::Docker => {
                let count = live.iter().filter(|i| i.kind == ResourceKind::Docker).count() as u32;
                if count >= self.quotas.max_docker_per_user {
                    return Err(AnvilError::QuotaExceeded {
                        message: format!("max {} docker instances per user", self.quotas.max_docker_per_user),
                    });
                }
            }
            ResourceKind::Vm => {
                let count = live.iter().filter(|i| i.kind == ResourceKind::Vm).count() as u32;
                if count >= self.quotas.max_vm_per_user {
                    return Err(AnvilError::QuotaExceeded {
                        message: format!("max {} vm instances per user", self.quotas.max_vm_per_user),
                    });
                }
            }
        }
        if live.len() as u32 >= self.quotas.max_per_user {
            return Err(AnvilError::QuotaExceeded {
                message: format!("max {} instances per user", self.quotas.max_per_user),
            });
        }

        if let Some(cooldown) = self.store.get_cooldown(&key, &challenge.id).await? {
            let now = Utc::now();
            if cooldown.cooldown_until > now {
                return Err(AnvilError::Cooldown {
                    retry_after_secs: (cooldown.cooldown_until - now).num_seconds().max(0) as u64,
                });
            }
        }

        let duration_minutes = challenge.effective_timeout_minutes();
        let instance_id = format!("i-{}", uuid::Uuid::new_v4());

        let instance = match challenge.kind {
            ResourceKind::Docker => {
                self.create_docker_instance(&instance_id, &owner, challenge, duration_minutes).await?
            }
            ResourceKind::Vm => self.create_vm_instance(&instance_id, &owner, challenge, duration_minutes).await?,
        };

        self.cache.lock().unwrap().insert(instance.id.clone(), instance.clone());
        info!(user_id = %key, instance_id = %instance.id, challenge_id = %challenge.id, "instance.started");
        Ok(instance)
    }

    async fn create_docker_instance(
        &self,
        instance_id: &str,
        owner: &InstanceOwner,
        challenge: &Challenge,
        duration_minutes: u32,
    ) -> Result<Instance> {
        let docker = challenge
            .docker
            .as_ref()
            .ok_or_else(|| AnvilError::internal("docker challenge missing docker spec"))?;

        let exposed_ports: Vec<u16> = docker
            .exposed_ports
            .iter()
            .filter_map(|p| p.split('/').next().and_then(|n| n.parse().ok()))
            .collect();

        let req = CreateContainerRequest {
            instance_id: instance_id.to_string(),
            challenge_slug: challenge.slug.clone(),
            image: docker.image.clone(),
            tag: docker.tag.clone(),
            registry: docker.registry.clone(),
            exposed_ports,
            cpu_limit: docker.cpu_limit.clone(),
            memory_limit: docker.memory_limit.clone(),
            extra_labels: HashMap::from([("anvil.challenge-id".to_string(), challenge.id.clone())]),
            env: HashMap::new(),
        };

        let created = self.container_service.create_instance(req).await?;
        let now = Utc::now();
        let instance = Instance {
            id: instance_id.to_string(),
            kind: ResourceKind::Docker,
            owner: owner.clone(),
            challenge_id: challenge.id.clone(),
            resource_ref: format!("{}:{}", docker.image, docker.tag),
            state: InstanceState::Running,
            network: InstanceNetwork {
                ip_address: created.ip,
                mac_address: None,
                port_mappings: created.port_mappings.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                vnc_port: None,
            },
            created_at: now,
            started_at: Some(now),
            expires_at: now + chrono::Duration::minutes(duration_minutes as i64),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: challenge.timer.max_extensions,
            resets_used: 0,
            max_resets: challenge.timer.max_resets,
            node_id: None,
            overlay_path: None,
            error: None,
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        self.store.put_instance(instance.clone()).await?;
        Ok(instance)
    }

    async fn create_vm_instance(
        &self,
        instance_id: &str,
        owner: &InstanceOwner,
        challenge: &Challenge,
        duration_minutes: u32,
    ) -> Result<Instance> {
        let vm = challenge
            .vm
            .as_ref()
            .ok_or_else(|| AnvilError::internal("vm challenge missing vm spec"))?;

        self.vm_service
            .create(CreateVmRequest {
                instance_id: instance_id.to_string(),
                owner: owner.clone(),
                challenge_id: challenge.id.clone(),
                template_id: vm.template_id.clone(),
                vcpu_override: Some(vm.vcpu),
                memory_mb_override: Some(vm.memory_mb),
                duration_minutes,
                max_duration_minutes: duration_minutes,
                max_extensions: challenge.timer.max_extensions,
                max_resets: challenge.timer.max_resets,
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Instance> {
        let instance = self.store.get_instance(id).await?;
        self.cache.lock().unwrap().insert(id.to_string(), instance.clone());
        Ok(instance)
    }

    pub async fn stop(&self, id: &str) -> Result<Instance> {
        let instance = self.store.get_instance(id).await?;
        let updated = match instance.kind {
            ResourceKind::Docker => {
                self.container_service.stop_instance(&format!("anvil-{id}")).await?;
                let mut i = instance;
                i.state = InstanceState::Stopped;
                i.stopped_at = Some(Utc::now());
                self.store.put_instance(i.clone()).await?;
                i
            }
            ResourceKind::Vm => self.vm_service.stop(id).await?,
        };
        self.cache.lock().unwrap().insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn start(&self, id: &str) -> Result<Instance> {
        let instance = self.store.get_instance(id).await?;
        let updated = match instance.kind {
            ResourceKind::Docker => {
                self.container_service.start_instance(&format!("anvil-{id}")).await?;
                let mut i = instance;
                i.state = InstanceState::Running;
                i.started_at = Some(Utc::now());
                i.stopped_at = None;
                self.store.put_instance(i.clone()).await?;
                i
            }
            ResourceKind::Vm => self.vm_service.start(id).await?,
        };
        self.cache.lock().unwrap().insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn reset(&self, id: &str) -> Result<Instance> {
        let instance = self.store.get_instance(id).await?;
        if instance.resets_used >= instance.max_resets {
            return Err(AnvilError::QuotaExceeded {
                message: format!("max {} resets reached", instance.max_resets),
            });
        }
        let updated = match instance.kind {
            ResourceKind::Docker => {
                let container_id = format!("anvil-{id}");
                self.container_service.stop_instance(&container_id).await?;
                self.container_service.start_instance(&container_id).await?;
                let mut i = instance;
                i.resets_used += 1;
                i.state = InstanceState::Running;
                i.started_at = Some(Utc::now());
                self.store.put_instance(i.clone()).await?;
                i
            }
            ResourceKind::Vm => self.vm_service.reset(id).await?,
        };
        self.cache.lock().unwrap().insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn extend(&self, id: &str, extension_minutes: u32) -> Result<Instance> {
        let instance = self.store.get_instance(id).await?;
        let challenge = self.store.get_challenge(&instance.challenge_id).await?;
        let max_duration_minutes = challenge.effective_timeout_minutes();

        let updated = match instance.kind {
            ResourceKind::Docker => {
                let mut i = instance;
                if i.extensions_used >= i.max_extensions {
                    return Err(AnvilError::QuotaExceeded {
                        message: format!("max {} extensions reached", i.max_extensions),
                    });
                }
                let cap = i.created_at + chrono::Duration::minutes(max_duration_minutes as i64);
                let requested = i.expires_at + chrono::Duration::minutes(extension_minutes as i64);
                i.expires_at = requested.min(cap);
                i.extensions_used += 1;
                self.store.put_instance(i.clone()).await?;
                i
            }
            ResourceKind::Vm => {
                self.vm_service
                    .extend(id, extension_minutes, max_duration_minutes)
                    .await?
            }
        };
        self.cache.lock().unwrap().insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    /// Destroys the instance and, if its challenge declares a cooldown,
    /// inserts a cooldown entry that blocks immediate recreation.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let instance = self.store.get_instance(id).await?;
        match instance.kind {
            ResourceKind::Docker => {
                self.container_service.remove_instance(&format!("anvil-{id}")).await?;
                self.store.delete_instance(id).await?;
            }
            ResourceKind::Vm => self.vm_service.destroy(id).await?,
        }
        self.cache.lock().unwrap().remove(id);

        if let Ok(challenge) = self.store.get_challenge(&instance.challenge_id).await {
            if challenge.timer.cooldown_minutes > 0 {
                self.store
                    .put_cooldown(Cooldown {
                        user_id: owner_key(&instance.owner),
                        challenge_id: instance.challenge_id.clone(),
                        cooldown_until: Utc::now() + chrono::Duration::minutes(challenge.timer.cooldown_minutes as i64),
                        reason: "instance destroyed".to_string(),
                        triggering_instance_id: id.to_string(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Marks expired rows `expired` where `expires_at < now` and the
    /// instance is still in a running/stopped state. Run every 2 minutes.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut marked = 0;
        for mut instance in self.store.list_instances().await? {
            if instance.expires_at < now
                && matches!(instance.state, InstanceState::Running | InstanceState::Stopped)
            {
                instance.state = InstanceState::Expired;
                self.store.put_instance(instance.clone()).await?;
                self.cache.lock().unwrap().insert(instance.id.clone(), instance);
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Deletes terminal rows older than `older_than`. Run every 2 minutes
    /// alongside `sweep_expired`.
    pub async fn purge_old_terminal(&self, older_than: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for instance in self.store.list_instances().await? {
            let terminal_failed =
                matches!(instance.state, InstanceState::Error | InstanceState::Stopped | InstanceState::Expired);
            if terminal_failed && now - instance.created_at > older_than {
                self.store.delete_instance(&instance.id).await?;
                self.cache.lock().unwrap().remove(&instance.id);
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Invokes the VM service's own expiry sweep. Run every 5 minutes.
    pub async fn cleanup_expired_vms(&self) -> Result<usize> {
        self.vm_service.cleanup_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::config::ContainerConfig;
    use anvil_core::model::{Difficulty, DockerSpec, TimerConfig, UserRole, UserStatus, VmSpec};
    use anvil_core::store::MemStore;

    fn docker_challenge() -> Challenge {
        Challenge {
            id: "c-1".into(),
            slug: "pwn-me".into(),
            kind: ResourceKind::Docker,
            difficulty: Difficulty::Easy,
            docker: Some(DockerSpec {
                image: "anvil-labs/pwn-me".into(),
                tag: "latest".into(),
                registry: None,
                exposed_ports: vec!["1337/tcp".into()],
                cpu_limit: "0.5".into(),
                memory_limit: "256m".into(),
            }),
            vm: None,
            timer: TimerConfig {
                timeout_minutes: Some(30),
                max_extensions: 1,
                extension_minutes: 15,
                cooldown_minutes: 5,
                max_resets: 2,
            },
            flags: vec!["flag{test}".into()],
        }
    }

    fn manager() -> InstanceManager<MemStore> {
        let store = std::sync::Arc::new(MemStore::new());
        // Constructing the client doesn't dial the daemon; connection is
        // lazy per-request, so this is safe to build without Docker running.
        let docker = bollard::Docker::connect_with_local_defaults().expect("bollard client construction");
        let container_service = std::sync::Arc::new(ContainerService::new(docker, ContainerConfig::default()));
        let vm_service = std::sync::Arc::new(crate::vm::service::VmService::new(
            store.clone(),
            QuotaConfig::default(),
            "/var/lib/anvil/storage/vms/overlays",
        ));
        InstanceManager::new(store, QuotaConfig::default(), container_service, vm_service)
    }

    #[tokio::test]
    async fn cooldown_blocks_recreate_until_elapsed() {
        let mgr = manager();
        mgr.store
            .put_user(anvil_core::model::User {
                id: "u-1".into(),
                handle: "alice".into(),
                role: UserRole::User,
                status: UserStatus::Active,
                score: 0,
            })
            .await
            .unwrap();
        mgr.store.put_challenge(docker_challenge()).await.unwrap();
        mgr.store
            .put_cooldown(Cooldown {
                user_id: "u-1".into(),
                challenge_id: "c-1".into(),
                cooldown_until: Utc::now() + chrono::Duration::minutes(5),
                reason: "prior destroy".into(),
                triggering_instance_id: "i-old".into(),
            })
            .await
            .unwrap();

        let err = mgr
            .create(InstanceOwner::User("u-1".into()), &docker_challenge())
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "cooldown");
    }

    #[tokio::test]
    async fn sweep_expired_marks_running_rows_past_expiry() {
        let mgr = manager();
        let now = Utc::now();
        let instance = Instance {
            id: "i-1".into(),
            kind: ResourceKind::Docker,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "anvil-labs/pwn-me:latest".into(),
            state: InstanceState::Running,
            network: Default::default(),
            created_at: now - chrono::Duration::hours(2),
            started_at: Some(now - chrono::Duration::hours(2)),
            expires_at: now - chrono::Duration::minutes(1),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: 1,
            resets_used: 0,
            max_resets: 2,
            node_id: None,
            overlay_path: None,
            error: None,
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        mgr.store.put_instance(instance).await.unwrap();
        let marked = mgr.sweep_expired().await.unwrap();
        assert_eq!(marked, 1);
        assert_eq!(mgr.store.get_instance("i-1").await.unwrap().state, InstanceState::Expired);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_rows_only() {
        let mgr = manager();
        let now = Utc::now();
        let old_stopped = Instance {
            id: "i-old".into(),
            kind: ResourceKind::Docker,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "x".into(),
            state: InstanceState::Stopped,
            network: Default::default(),
            created_at: now - chrono::Duration::hours(3),
            started_at: None,
            expires_at: now - chrono::Duration::hours(2),
            stopped_at: Some(now - chrono::Duration::hours(2)),
            extensions_used: 0,
            max_extensions: 1,
            resets_used: 0,
            max_resets: 2,
            node_id: None,
            overlay_path: None,
            error: None,
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        let recent_stopped = Instance { id: "i-recent".into(), created_at: now, ..old_stopped.clone() };
        mgr.store.put_instance(old_stopped).await.unwrap();
        mgr.store.put_instance(recent_stopped).await.unwrap();

        let purged = mgr.purge_old_terminal(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(mgr.store.get_instance("i-old").await.is_err());
        assert!(mgr.store.get_instance("i-recent").await.is_ok());
    }
}
