use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anvil_core::config::QuotaConfig;
use anvil_core::error::{AnvilError, Result};
use anvil_core::model::{
    Instance, InstanceNetwork, InstanceOwner, InstanceState, Node, ResourceKind,
};
use anvil_core::store::Store;

use crate::runner::{runner_for, virsh, write_file};
use crate::scheduler::NodeScheduler;
use crate::vm::disk;
use crate::vm::domain_xml::{render_domain_xml, DomainParams};
use crate::vm::network::{self, mac_for_instance, VmIpPool};
use crate::vm::template;

pub struct CreateVmRequest {
    pub instance_id: String,
    pub owner: InstanceOwner,
    pub challenge_id: String,
    pub template_id: String,
    pub vcpu_override: Option<u32>,
    pub memory_mb_override: Option<u32>,
    pub duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub max_extensions: u32,
    pub max_resets: u32,
}

/// Per-node in-memory allocator state. Service-local, never persisted —
/// rebuilt from the store on restart by the orphan-reconciliation pass.
struct NodeState {
    ip_pool: VmIpPool,
    vnc_used: BTreeSet<u16>,
}

pub struct VmService<S: Store> {
    store: std::sync::Arc<S>,
    scheduler: NodeScheduler<S>,
    quotas: QuotaConfig,
    overlays_dir: String,
    node_state: Mutex<HashMap<String, NodeState>>,
}

impl<S: Store> VmService<S> {
    pub fn new(store: std::sync::Arc<S>, quotas: QuotaConfig, overlays_dir: impl Into<String>) -> Self {
        let scheduler = NodeScheduler::new(store.clone());
        Self {
            store,
            scheduler,
            quotas,
            overlays_dir: overlays_dir.into(),
            node_state: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_vnc(&self, node: &Node) -> Result<u16> {
        let mut states = self.node_state.lock().unwrap();
        let state = states.entry(node.id.clone()).or_insert_with(|| NodeState {
            ip_pool: VmIpPool::new(&node.connection.vm_subnet).expect("node subnet validated at registration"),
            vnc_used: BTreeSet::new(),
        });
        for port in node.connection.vnc_port_start..=node.connection.vnc_port_end {
            if !state.vnc_used.contains(&port) {
                state.vnc_used.insert(port);
                return Ok(port);
            }
        }
        Err(AnvilError::Exhausted {
            message: format!("node {} has no free VNC port", node.id),
        })
    }

    fn release_vnc(&self, node_id: &str, port: u16) {
        if let Some(state) = self.node_state.lock().unwrap().get_mut(node_id) {
            state.vnc_used.remove(&port);
        }
    }

    fn allocate_ip(&self, node: &Node) -> Result<std::net::Ipv4Addr> {
        let mut states = self.node_state.lock().unwrap();
        let state = states.entry(node.id.clone()).or_insert_with(|| NodeState {
            ip_pool: VmIpPool::new(&node.connection.vm_subnet).expect("node subnet validated at registration"),
            vnc_used: BTreeSet::new(),
        });
        state.ip_pool.allocate()
    }

    fn release_ip(&self, node_id: &str, ip: std::net::Ipv4Addr) {
        if let Some(state) = self.node_state.lock().unwrap().get_mut(node_id) {
            state.ip_pool.release(ip);
        }
    }

    /// Commits a capacity reservation against `node` transactionally so
    /// the scheduler's next `select` sees the updated usage immediately.
    async fn reserve_capacity(&self, node: &Node, vcpu: u32, memory_mb: u32) -> Result<()> {
        let mut node = node.clone();
        node.capacity.used_vcpu += vcpu;
        node.capacity.used_memory_mb += memory_mb;
        self.store.put_node(node).await
    }

    /// Releases a prior reservation. Tolerates the node having vanished
    /// or the counters already being below the release amount, since
    /// this also runs on best-effort rollback paths.
    async fn release_capacity(&self, node_id: &str, vcpu: u32, memory_mb: u32) {
        if let Ok(mut node) = self.store.get_node(node_id).await {
            node.capacity.used_vcpu = node.capacity.used_vcpu.saturating_sub(vcpu);
            node.capacity.used_memory_mb = node.capacity.used_memory_mb.saturating_sub(memory_mb);
            let _ = self.store.put_node(node).await;
        }
    }

    async fn vm_instance_count(&self, owner_key: &str) -> Result<u32> {
        let existing = self.store.list_instances_for_owner(owner_key).await?;
        Ok(existing
            .iter()
            .filter(|i| i.kind == ResourceKind::Vm && !i.is_terminal())
            .count() as u32)
    }

    /// Runs the full instance-creation happy path. On any failure after a
    /// resource is allocated, compensates in reverse order: overlay, VNC
    /// port, IP reservation, domain define.
    pub async fn create(&self, req: CreateVmRequest) -> Result<Instance> {
        let template = self.store.get_vm_template(&req.template_id).await?;
        let owner_key = req.owner_key();

        if self.vm_instance_count(&owner_key).await? >= self.quotas.max_vm_per_user {
            return Err(AnvilError::QuotaExceeded {
                message: format!("max {} vm instances per user", self.quotas.max_vm_per_user),
            });
        }

        let vcpu = req.vcpu_override.unwrap_or(template.vcpu);
        let memory_mb = req.memory_mb_override.unwrap_or(template.memory_mb);
        let duration_minutes = req.duration_minutes.min(req.max_duration_minutes);

        let node = self.scheduler.select(vcpu, memory_mb).await?;
        let runner = runner_for(&node.connection);
        let conn = &node.connection;

        self.reserve_capacity(&node, vcpu, memory_mb).await?;

        let overlay_path = format!("{}/{}.qcow2", self.overlays_dir, req.instance_id);
        if let Err(e) = disk::create_overlay(&*runner, &template.image_path, &overlay_path).await {
            self.release_capacity(&node.id, vcpu, memory_mb).await;
            return Err(e);
        }

        let vnc_port = match self.allocate_vnc(&node) {
            Ok(p) => p,
            Err(e) => {
                disk::remove_overlay(&*runner, &overlay_path).await.ok();
                self.release_capacity(&node.id, vcpu, memory_mb).await;
                return Err(e);
            }
        };

        let mac = mac_for_instance(&req.instance_id);

        let ip = match self.allocate_ip(&node) {
            Ok(ip) => ip,
            Err(e) => {
                self.release_vnc(&node.id, vnc_port);
                disk::remove_overlay(&*runner, &overlay_path).await.ok();
                self.release_capacity(&node.id, vcpu, memory_mb).await;
                return Err(e);
            }
        };

        // Best-effort: the guest still gets an address from the DHCP
        // pool even if the reservation call fails (step 5 of the VM
        // happy path). Final truth is the post-boot domifaddr poll.
        let _ = network::add_dhcp_reservation(&*runner, conn, &mac, ip).await;

        let domain_name = format!("anvil-{}", req.instance_id);
        let uuid = uuid::Uuid::new_v4().to_string();
        let xml = render_domain_xml(&DomainParams {
            name: &domain_name,
            uuid: &uuid,
            memory_mb,
            vcpu,
            disk_path: &overlay_path,
            mac: &mac,
            source_network: &conn.bridge_network,
            vnc_port,
        })?;

        let define_result = self.define_and_start(&*runner, conn, &domain_name, &xml).await;
        if let Err(e) = define_result {
            network::remove_dhcp_reservation(&*runner, conn, &mac, ip).await.ok();
            self.release_ip(&node.id, ip);
            self.release_vnc(&node.id, vnc_port);
            disk::remove_overlay(&*runner, &overlay_path).await.ok();
            self.release_capacity(&node.id, vcpu, memory_mb).await;
            return Err(e);
        }

        let guest_ip = match network::discover_guest_ip(&*runner, conn, &domain_name).await {
            Ok(ip) => ip,
            Err(e) => {
                virsh(&*runner, conn, &["destroy", &domain_name]).await.ok();
                virsh(&*runner, conn, &["undefine", &domain_name]).await.ok();
                network::remove_dhcp_reservation(&*runner, conn, &mac, ip).await.ok();
                self.release_ip(&node.id, ip);
                self.release_vnc(&node.id, vnc_port);
                disk::remove_overlay(&*runner, &overlay_path).await.ok();
                self.release_capacity(&node.id, vcpu, memory_mb).await;
                return Err(e);
            }
        };

        let now = chrono::Utc::now();
        let instance = Instance {
            id: req.instance_id.clone(),
            kind: ResourceKind::Vm,
            owner: req.owner,
            challenge_id: req.challenge_id,
            resource_ref: req.template_id,
            state: InstanceState::Running,
            network: InstanceNetwork {
                ip_address: Some(guest_ip.to_string()),
                mac_address: Some(mac),
                port_mappings: Default::default(),
                vnc_port: Some(vnc_port),
            },
            created_at: now,
            started_at: Some(now),
            expires_at: now + chrono::Duration::minutes(duration_minutes as i64),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: req.max_extensions,
            resets_used: 0,
            max_resets: req.max_resets,
            node_id: Some(node.id.clone()),
            overlay_path: Some(overlay_path),
            error: None,
            allocated_vcpu: vcpu,
            allocated_memory_mb: memory_mb,
        };
        self.store.put_instance(instance.clone()).await?;
        Ok(instance)
    }

    async fn define_and_start(
        &self,
        runner: &dyn CommandRunner,
        conn: &anvil_core::model::NodeConnection,
        domain_name: &str,
        xml: &str,
    ) -> Result<()> {
        let tmp_path = format!("/tmp/anvil-{domain_name}.xml");
        write_file(runner, &tmp_path, xml).await?;
        virsh(runner, conn, &["define", &tmp_path]).await?;
        virsh(runner, conn, &["start", domain_name]).await?;
        runner.run("rm", &["-f", &tmp_path]).await.ok();
        Ok(())
    }

    pub async fn stop(&self, instance_id: &str) -> Result<Instance> {
        let mut instance = self.store.get_instance(instance_id).await?;
        let node = self.node_for(&instance).await?;
        let runner = runner_for(&node.connection);
        let domain_name = format!("anvil-{instance_id}");
        virsh(&*runner, &node.connection, &["destroy", &domain_name]).await.ok();
        instance.state = InstanceState::Stopped;
        instance.stopped_at = Some(chrono::Utc::now());
        self.store.put_instance(instance.clone()).await?;
        Ok(instance)
    }

    pub async fn start(&self, instance_id: &str) -> Result<Instance> {
        let mut instance = self.store.get_instance(instance_id).await?;
        let node = self.node_for(&instance).await?;
        let runner = runner_for(&node.connection);
        let domain_name = format!("anvil-{instance_id}");
        virsh(&*runner, &node.connection, &["start", &domain_name]).await?;
        instance.state = InstanceState::Running;
        instance.started_at = Some(chrono::Utc::now());
        instance.stopped_at = None;
        self.store.put_instance(instance.clone()).await?;
        Ok(instance)
    }

    pub async fn reset(&self, instance_id: &str) -> Result<Instance> {
        let mut instance = self.store.get_instance(instance_id).await?;
        if instance.resets_used >= instance.max_resets {
            return Err(AnvilError::QuotaExceeded {
                message: format!("max {} resets reached", instance.max_resets),
            });
        }
        let node = self.node_for(&instance).await?;
        let runner = runner_for(&node.connection);
        let conn = &node.connection;
        let domain_name = format!("anvil-{instance_id}");
        virsh(&*runner, conn, &["destroy", &domain_name]).await.ok();

        let template = self.store.get_vm_template(&instance.resource_ref).await?;
        let overlay_path = instance
            .overlay_path
            .clone()
            .ok_or_else(|| AnvilError::internal("instance has no overlay path"))?;
        disk::remove_overlay(&*runner, &overlay_path).await.ok();
        disk::create_overlay(&*runner, &template.image_path, &overlay_path).await?;

        virsh(&*runner, conn, &["start", &domain_name]).await?;
        instance.resets_used += 1;
        instance.state = InstanceState::Running;
        instance.started_at = Some(chrono::Utc::now());
        self.store.put_instance(instance.clone()).await?;
        Ok(instance)
    }

    pub async fn extend(&self, instance_id: &str, extension_minutes: u32, max_duration_minutes: u32) -> Result<Instance> {
        let mut instance = self.store.get_instance(instance_id).await?;
        if instance.extensions_used >= instance.max_extensions {
            return Err(AnvilError::QuotaExceeded {
                message: format!("max {} extensions reached", instance.max_extensions),
            });
        }
        let cap = instance.created_at + chrono::Duration::minutes(max_duration_minutes as i64);
        let requested = instance.expires_at + chrono::Duration::minutes(extension_minutes as i64);
        instance.expires_at = requested.min(cap);
        instance.extensions_used += 1;
        self.store.put_instance(instance.clone()).await?;
        Ok(instance)
    }

    /// Stops, undefines, releases all allocated resources, and deletes
    /// the instance record. Every step tolerates "already gone" so a
    /// repeated `destroy` on an errored instance is always safe.
    pub async fn destroy(&self, instance_id: &str) -> Result<()> {
        let instance = self.store.get_instance(instance_id).await?;
        if let Some(node_id) = &instance.node_id {
            if let Ok(node) = self.store.get_node(node_id).await {
                let runner = runner_for(&node.connection);
                let conn = &node.connection;
                let domain_name = format!("anvil-{instance_id}");
                virsh(&*runner, conn, &["destroy", &domain_name]).await.ok();
                virsh(&*runner, conn, &["undefine", &domain_name]).await.ok();
                if let Some(overlay) = &instance.overlay_path {
                    disk::remove_overlay(&*runner, overlay).await.ok();
                }
                if let (Some(mac), Some(ip_str)) = (&instance.network.mac_address, &instance.network.ip_address) {
                    if let Ok(ip) = ip_str.parse() {
                        network::remove_dhcp_reservation(&*runner, conn, mac, ip).await.ok();
                        self.release_ip(node_id, ip);
                    }
                }
                if let Some(vnc) = instance.network.vnc_port {
                    self.release_vnc(node_id, vnc);
                }
                if instance.allocated_vcpu > 0 || instance.allocated_memory_mb > 0 {
                    self.release_capacity(node_id, instance.allocated_vcpu, instance.allocated_memory_mb)
                        .await;
                }
            }
        }
        self.store.delete_instance(instance_id).await?;
        Ok(())
    }

    /// Destroys every instance whose `expires_at` has passed. Invoked by
    /// the unified instance manager's 5-minute sweep.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let instances = self.store.list_instances().await?;
        let mut destroyed = 0;
        for instance in instances {
            if instance.kind == ResourceKind::Vm && instance.expires_at < now && !instance.is_terminal() {
                self.destroy(&instance.id).await?;
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    /// On startup, destroys any `anvil-*` domain on a node with no
    /// matching instance record, and sweeps stale DHCP reservations.
    pub async fn reconcile_orphans(&self, node: &Node) -> Result<usize> {
        let runner = runner_for(&node.connection);
        let conn = &node.connection;
        let domains = template::list_anvil_domains(&*runner, conn).await?;
        let instances = self.store.list_instances().await?;
        let live: HashSet<String> = instances
            .iter()
            .filter(|i| i.node_id.as_deref() == Some(node.id.as_str()))
            .map(|i| format!("anvil-{}", i.id))
            .collect();

        let mut reaped = 0;
        for domain_name in domains {
            if !live.contains(&domain_name) {
                virsh(&*runner, conn, &["destroy", &domain_name]).await.ok();
                virsh(&*runner, conn, &["undefine", &domain_name]).await.ok();
                reaped += 1;
            }
        }

        let live_macs: HashSet<String> = instances
            .iter()
            .filter_map(|i| i.network.mac_address.clone())
            .collect();
        network::sweep_stale_reservations(&*runner, conn, &live_macs).await?;

        Ok(reaped)
    }

    async fn node_for(&self, instance: &Instance) -> Result<Node> {
        let node_id = instance
            .node_id
            .as_ref()
            .ok_or_else(|| AnvilError::internal("instance has no assigned node"))?;
        self.store.get_node(node_id).await
    }
}

impl CreateVmRequest {
    fn owner_key(&self) -> String {
        match &self.owner {
            InstanceOwner::User(id) => id.clone(),
            InstanceOwner::Session(id) => id.clone(),
        }
    }
}

use crate::runner::CommandRunner;

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::model::{NodeCapacity, NodeConnection, OsFamily, VmTemplate};
    use anvil_core::store::MemStore;

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            hostname: "localhost".into(),
            status: anvil_core::model::NodeStatus::Online,
            priority: 0,
            max_vms: 20,
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
                ssh_host: "localhost".into(),
                ssh_port: 22,
                ssh_user: "anvil".into(),
                ssh_key_path: "/dev/null".into(),
                libvirt_uri: "qemu:///system".into(),
                bridge_network: "anvil-vm-net".into(),
                vnc_port_start: 5900,
                vnc_port_end: 5901,
                vm_subnet: "10.100.10.0/24".into(),
            },
            last_heartbeat: Some(chrono::Utc::now()),
        }
    }

    fn template(id: &str) -> VmTemplate {
        VmTemplate {
            id: id.into(),
            name: "base".into(),
            image_path: "/templates/base.qcow2".into(),
            vcpu: 2,
            memory_mb: 2048,
            disk_gb: 20,
            os_family: OsFamily::Linux,
            exposed_services: vec!["ssh".into()],
            requires_nested_virt: false,
            public: true,
            active: true,
        }
    }

    fn base_req(id: &str) -> CreateVmRequest {
        CreateVmRequest {
            instance_id: id.into(),
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            template_id: "tpl-1".into(),
            vcpu_override: None,
            memory_mb_override: None,
            duration_minutes: 60,
            max_duration_minutes: 240,
            max_extensions: 2,
            max_resets: 3,
        }
    }

    #[tokio::test]
    async fn quota_blocks_creation_over_limit() {
        let store = std::sync::Arc::new(MemStore::new());
        store.put_node(node("node-a")).await.unwrap();
        store.put_vm_template(template("tpl-1")).await.unwrap();
        let quotas = QuotaConfig { max_docker_per_user: 3, max_vm_per_user: 1, max_per_user: 4 };
        let svc = VmService::new(store.clone(), quotas, "/overlays");

        // Manually seed one existing non-terminal vm instance for u-1.
        let existing = Instance {
            id: "i-existing".into(),
            kind: ResourceKind::Vm,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "tpl-1".into(),
            state: InstanceState::Running,
            network: Default::default(),
            created_at: chrono::Utc::now(),
            started_at: None,
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: 2,
            resets_used: 0,
            max_resets: 3,
            node_id: None,
            overlay_path: None,
            error: None,
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        store.put_instance(existing).await.unwrap();

        let err = svc.create(base_req("i-new")).await.unwrap_err();
        assert_eq!(err.tag(), "quota_exceeded");
    }

    #[tokio::test]
    async fn extend_is_bounded_by_max_duration() {
        let store = std::sync::Arc::new(MemStore::new());
        let quotas = QuotaConfig::default();
        let svc = VmService::new(store.clone(), quotas, "/overlays");
        let created_at = chrono::Utc::now();
        let instance = Instance {
            id: "i-1".into(),
            kind: ResourceKind::Vm,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "tpl-1".into(),
            state: InstanceState::Running,
            network: Default::default(),
            created_at,
            started_at: Some(created_at),
            expires_at: created_at + chrono::Duration::minutes(60),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: 2,
            resets_used: 0,
            max_resets: 3,
            node_id: None,
            overlay_path: None,
            error: None,
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        store.put_instance(instance).await.unwrap();

        let extended = svc.extend("i-1", 1000, 90).await.unwrap();
        let cap = created_at + chrono::Duration::minutes(90);
        assert_eq!(extended.expires_at, cap);
        assert_eq!(extended.extensions_used, 1);
    }

    #[tokio::test]
    async fn extend_rejects_past_max_extensions() {
        let store = std::sync::Arc::new(MemStore::new());
        let quotas = QuotaConfig::default();
        let svc = VmService::new(store.clone(), quotas, "/overlays");
        let created_at = chrono::Utc::now();
        let instance = Instance {
            id: "i-1".into(),
            kind: ResourceKind::Vm,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "tpl-1".into(),
            state: InstanceState::Running,
            network: Default::default(),
            created_at,
            started_at: Some(created_at),
            expires_at: created_at + chrono::Duration::minutes(60),
            stopped_at: None,
            extensions_used: 2,
            max_extensions: 2,
            resets_used: 0,
            max_resets: 3,
            node_id: None,
            overlay_path: None,
            error: None,
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        store.put_instance(instance).await.unwrap();

        let err = svc.extend("i-1", 30, 240).await.unwrap_err();
        assert_eq!(err.tag(), "quota_exceeded");
    }

    #[tokio::test]
    async fn reserve_capacity_then_release_round_trips_usage() {
        let store = std::sync::Arc::new(MemStore::new());
        let quotas = QuotaConfig::default();
        let svc = VmService::new(store.clone(), quotas, "/overlays");
        let n = node("node-a");
        store.put_node(n.clone()).await.unwrap();

        svc.reserve_capacity(&n, 4, 4096).await.unwrap();
        let after_reserve = store.get_node("node-a").await.unwrap();
        assert_eq!(after_reserve.capacity.used_vcpu, 4);
        assert_eq!(after_reserve.capacity.used_memory_mb, 4096);

        svc.release_capacity("node-a", 4, 4096).await;
        let after_release = store.get_node("node-a").await.unwrap();
        assert_eq!(after_release.capacity.used_vcpu, 0);
        assert_eq!(after_release.capacity.used_memory_mb, 0);
    }

    #[tokio::test]
    async fn destroy_releases_allocated_capacity_from_its_node() {
        let store = std::sync::Arc::new(MemStore::new());
        let quotas = QuotaConfig::default();
        let svc = VmService::new(store.clone(), quotas, "/overlays");
        let mut n2 = node("node-b");
        n2.capacity.used_vcpu = 2;
        n2.capacity.used_memory_mb = 2048;
        store.put_node(n2).await.unwrap();
        let instance2 = Instance {
            id: "i-2".into(),
            kind: ResourceKind::Vm,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "tpl-1".into(),
            state: InstanceState::Error,
            network: Default::default(),
            created_at: chrono::Utc::now(),
            started_at: None,
            expires_at: chrono::Utc::now(),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: 2,
            resets_used: 0,
            max_resets: 3,
            node_id: Some("node-b".into()),
            overlay_path: None,
            error: Some("boom".into()),
            allocated_vcpu: 2,
            allocated_memory_mb: 2048,
        };
        store.put_instance(instance2).await.unwrap();
        svc.destroy("i-2").await.unwrap();

        let after = store.get_node("node-b").await.unwrap();
        assert_eq!(after.capacity.used_vcpu, 0);
        assert_eq!(after.capacity.used_memory_mb, 0);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_on_already_gone_resources() {
        let store = std::sync::Arc::new(MemStore::new());
        let quotas = QuotaConfig::default();
        let svc = VmService::new(store.clone(), quotas, "/overlays");
        let instance = Instance {
            id: "i-1".into(),
            kind: ResourceKind::Vm,
            owner: InstanceOwner::User("u-1".into()),
            challenge_id: "c-1".into(),
            resource_ref: "tpl-1".into(),
            state: InstanceState::Error,
            network: Default::default(),
            created_at: chrono::Utc::now(),
            started_at: None,
            expires_at: chrono::Utc::now(),
            stopped_at: None,
            extensions_used: 0,
            max_extensions: 2,
            resets_used: 0,
            max_resets: 3,
            node_id: None,
            overlay_path: None,
            error: Some("boom".into()),
            allocated_vcpu: 0,
            allocated_memory_mb: 0,
        };
        store.put_instance(instance).await.unwrap();
        svc.destroy("i-1").await.unwrap();
        assert!(store.get_instance("i-1").await.is_err());
    }
}
