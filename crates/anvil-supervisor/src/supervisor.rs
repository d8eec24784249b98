use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anvil_core::config::SupervisorConfig;
use anvil_core::model::{NodeStatus, ResourceKind};
use anvil_core::store::Store;
use anvil_runtime::runner::runner_for;
use anvil_runtime::scheduler::NodeScheduler;
use anvil_runtime::vm::{network, template};
use anvil_runtime::{ContainerService, InstanceManager, VmService};
use anvil_security::{AbuseTracker, RateLimiter};
use anvil_storage::{StaleSessionJanitor, StorageBackend};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns every long-running reconcile loop. Constructed once by the daemon
/// with the same service handles the request path uses, so a sweep and a
/// live request can never disagree about which store or service they're
/// driving.
pub struct Supervisor<S: Store, B: StorageBackend> {
    store: Arc<S>,
    config: SupervisorConfig,
    container_cleanup_interval_secs: u64,
    instance_manager: Arc<InstanceManager<S>>,
    vm_service: Arc<VmService<S>>,
    container_service: Arc<ContainerService>,
    upload_janitor: Arc<StaleSessionJanitor<S, B>>,
    rate_limiters: Vec<Arc<RateLimiter>>,
    abuse_tracker: Arc<AbuseTracker>,
}

impl<S: Store + 'static, B: StorageBackend + 'static> Supervisor<S, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        config: SupervisorConfig,
        container_cleanup_interval_secs: u64,
        instance_manager: Arc<InstanceManager<S>>,
        vm_service: Arc<VmService<S>>,
        container_service: Arc<ContainerService>,
        upload_janitor: Arc<StaleSessionJanitor<S, B>>,
        rate_limiters: Vec<Arc<RateLimiter>>,
        abuse_tracker: Arc<AbuseTracker>,
    ) -> Self {
        Self {
            store,
            config,
            container_cleanup_interval_secs,
            instance_manager,
            vm_service,
            container_service,
            upload_janitor,
            rate_limiters,
            abuse_tracker,
        }
    }

    /// Runs orphan reconciliation once against every registered node, then
    /// spawns each periodic loop. Returns their join handles so the caller
    /// can await a clean shutdown after cancelling `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.reconcile_orphans_once().await;

        vec![
            self.clone().spawn_loop(
                "instance-sweep",
                self.config.instance_sweep_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_instances()),
            ),
            self.clone().spawn_loop(
                "vm-cleanup",
                self.config.vm_cleanup_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_vm_cleanup()),
            ),
            self.clone().spawn_loop(
                "node-heartbeat",
                self.config.node_heartbeat_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_heartbeats()),
            ),
            self.clone().spawn_loop(
                "upload-janitor",
                self.config.upload_janitor_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_uploads()),
            ),
            self.clone().spawn_loop(
                "rate-limit-janitor",
                self.config.rate_limit_janitor_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_rate_limits()),
            ),
            self.clone().spawn_loop(
                "dhcp-sweep",
                self.config.dhcp_sweep_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_dhcp()),
            ),
            self.clone().spawn_loop(
                "container-cleanup",
                self.container_cleanup_interval_secs,
                shutdown.clone(),
                |s| Box::pin(s.sweep_containers()),
            ),
        ]
    }

    fn spawn_loop<F>(
        self: Arc<Self>,
        name: &'static str,
        period_secs: u64,
        shutdown: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period_secs.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick(self.clone()).await;
                    }
                    _ = shutdown.cancelled() => {
                        info!(loop_name = name, "reconciler loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn reconcile_orphans_once(&self) {
        let nodes = match self.store.list_nodes().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to list nodes for orphan reconciliation");
                return;
            }
        };
        for node in &nodes {
            match self.vm_service.reconcile_orphans(node).await {
                Ok(count) if count > 0 => {
                    info!(node = %node.id, reaped = count, "reconciled orphan VM domains on startup")
                }
                Ok(_) => {}
                Err(e) => warn!(node = %node.id, error = %e, "orphan reconciliation failed"),
            }
        }
    }

    async fn sweep_instances(self: Arc<Self>) {
        match self.instance_manager.sweep_expired().await {
            Ok(count) if count > 0 => info!(count, "marked expired instances"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "instance sweep failed"),
        }

        let retention = chrono::Duration::seconds(self.config.terminal_retention_secs as i64);
        match self.instance_manager.purge_old_terminal(retention).await {
            Ok(count) if count > 0 => info!(count, "purged old terminal instance rows"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "terminal row purge failed"),
        }
    }

    async fn sweep_vm_cleanup(self: Arc<Self>) {
        match self.instance_manager.cleanup_expired_vms().await {
            Ok(count) if count > 0 => info!(count, "cleaned up expired VM overlays"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "VM cleanup sweep failed"),
        }
    }

    async fn sweep_containers(self: Arc<Self>) {
        let instances = match self.store.list_instances().await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "failed to list instances for container cleanup");
                return;
            }
        };
        let live: HashSet<String> = instances
            .iter()
            .filter(|i| i.kind == ResourceKind::Docker && !i.is_terminal())
            .map(|i| i.id.clone())
            .collect();

        match self.container_service.cleanup(&live).await {
            Ok(count) if count > 0 => info!(count, "reaped orphan containers"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "container cleanup sweep failed"),
        }
    }

    /// Probes every node for its current domain count, refreshes
    /// `last_heartbeat`/`active_vms`, then lets the scheduler mark any node
    /// whose heartbeat has gone stale as offline. A probe failure leaves
    /// the node's heartbeat untouched — it ages out and goes offline on
    /// its own rather than being force-marked from one transient error.
    async fn sweep_heartbeats(self: Arc<Self>) {
        let nodes = match self.store.list_nodes().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to list nodes for heartbeat sweep");
                return;
            }
        };

        for mut node in nodes {
            if node.status != NodeStatus::Online {
                continue;
            }
            let runner = runner_for(&node.connection);
            match template::list_anvil_domains(&*runner, &node.connection).await {
                Ok(domains) => {
                    node.active_vms = domains.len() as u32;
                    node.last_heartbeat = Some(chrono::Utc::now());
                    if let Err(e) = self.store.put_node(node).await {
                        warn!(error = %e, "failed to persist node heartbeat");
                    }
                }
                Err(e) => warn!(node = %node.id, error = %e, "node heartbeat probe failed"),
            }
        }

        let scheduler = NodeScheduler::new(self.store.clone());
        match scheduler
            .expire_stale_heartbeats(self.config.node_heartbeat_timeout_secs)
            .await
        {
            Ok(count) if count > 0 => info!(count, "marked nodes offline on stale heartbeat"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "heartbeat expiry sweep failed"),
        }
    }

    async fn sweep_uploads(self: Arc<Self>) {
        match self.upload_janitor.sweep().await {
            Ok(count) if count > 0 => info!(count, "reaped stale upload sessions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "upload janitor sweep failed"),
        }
    }

    async fn sweep_rate_limits(self: Arc<Self>) {
        for limiter in &self.rate_limiters {
            let evicted = limiter.sweep();
            if evicted > 0 {
                info!(scope = limiter.scope().label(), evicted, "evicted stale rate-limit buckets");
            }
        }
        let evicted = self.abuse_tracker.sweep();
        if evicted > 0 {
            info!(evicted, "evicted stale abuse-tracker records");
        }
    }

    /// For each node, collects the MACs of its non-terminal VM instances
    /// and removes any DHCP host reservation that doesn't match one of
    /// them.
    async fn sweep_dhcp(self: Arc<Self>) {
        let nodes = match self.store.list_nodes().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to list nodes for DHCP sweep");
                return;
            }
        };
        let instances = match self.store.list_instances().await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "failed to list instances for DHCP sweep");
                return;
            }
        };

        for node in &nodes {
            let live_macs: HashSet<String> = instances
                .iter()
                .filter(|i| i.kind == ResourceKind::Vm && !i.is_terminal())
                .filter(|i| i.node_id.as_deref() == Some(node.id.as_str()))
                .filter_map(|i| i.network.mac_address.clone())
                .collect();

            let runner = runner_for(&node.connection);
            match network::sweep_stale_reservations(&*runner, &node.connection, &live_macs).await
            {
                Ok(count) if count > 0 => {
                    info!(node = %node.id, count, "removed stale DHCP reservations")
                }
                Ok(_) => {}
                Err(e) => warn!(node = %node.id, error = %e, "DHCP sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::store::MemStore;
    use anvil_storage::LocalBackend;

    #[test]
    fn supervisor_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Supervisor<MemStore, LocalBackend>>();
    }

    #[tokio::test]
    async fn run_spawns_one_loop_per_cadence_and_stops_on_cancel() {
        let store = Arc::new(MemStore::new());
        let backend = Arc::new(LocalBackend::new(
            tempfile::tempdir().unwrap().path().to_path_buf(),
        ));
        let vm_service = Arc::new(VmService::new(
            store.clone(),
            anvil_core::config::QuotaConfig::default(),
            "/tmp/anvil-overlays",
        ));
        let container_service = Arc::new(
            ContainerService::new(
                bollard::Docker::connect_with_local_defaults()
                    .expect("bollard client construction"),
                anvil_core::config::ContainerConfig::default(),
            ),
        );
        let instance_manager = Arc::new(InstanceManager::new(
            store.clone(),
            anvil_core::config::QuotaConfig::default(),
            container_service.clone(),
            vm_service.clone(),
        ));
        let janitor = Arc::new(StaleSessionJanitor::new(store.clone(), backend));
        let rate_limiters = vec![Arc::new(RateLimiter::new(
            anvil_security::RateLimitScope::GlobalIp,
            120,
            60,
            30,
        ))];
        let abuse_tracker = Arc::new(AbuseTracker::new(10, 900, 900));

        let mut config = SupervisorConfig::default();
        // Fast cadence so the loops tick at least once before cancel.
        config.instance_sweep_secs = 1;
        config.vm_cleanup_secs = 1;
        config.node_heartbeat_secs = 1;
        config.upload_janitor_secs = 1;
        config.rate_limit_janitor_secs = 1;
        config.dhcp_sweep_secs = 1;

        let supervisor = Arc::new(Supervisor::new(
            store,
            config,
            1,
            instance_manager,
            vm_service,
            container_service,
            janitor,
            rate_limiters,
            abuse_tracker,
        ));

        let shutdown = CancellationToken::new();
        let handles = supervisor.run(shutdown.clone()).await;
        assert_eq!(handles.len(), 7);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
