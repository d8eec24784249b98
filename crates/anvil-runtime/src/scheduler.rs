use anvil_core::error::{AnvilError, Result};
use anvil_core::model::{Node, NodeStatus};
use anvil_core::store::Store;

/// Picks a placement target for a new VM. Read-only over the current
/// node snapshot; callers are responsible for committing usage-counter
/// updates transactionally once placement succeeds.
pub struct NodeScheduler<S: Store> {
    store: std::sync::Arc<S>,
}

impl<S: Store> NodeScheduler<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// Selects the best node for `(vcpu, memory_mb)`, ordered by
    /// `(priority DESC, availableVCPU DESC, availableMemoryMB DESC)`.
    pub async fn select(&self, vcpu: u32, memory_mb: u32) -> Result<Node> {
        let nodes = self.store.list_nodes().await?;
        let mut candidates: Vec<Node> = nodes
            .into_iter()
            .filter(|n| n.is_placement_candidate(vcpu, memory_mb))
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.capacity.available_vcpu().cmp(&a.capacity.available_vcpu()))
                .then(b.capacity.available_memory_mb().cmp(&a.capacity.available_memory_mb()))
        });

        candidates.into_iter().next().ok_or_else(|| AnvilError::NoCapacity {
            message: format!("no node has capacity for {vcpu} vcpu / {memory_mb} MiB"),
        })
    }

    /// Marks a node offline if its last heartbeat is older than `timeout_secs`.
    /// Existing instances on the node are left untouched; it simply drops
    /// out of placement consideration until a fresh heartbeat arrives.
    pub async fn expire_stale_heartbeats(&self, timeout_secs: i64) -> Result<usize> {
        let now = chrono::Utc::now();
        let nodes = self.store.list_nodes().await?;
        let mut expired = 0;
        for mut node in nodes {
            if node.status == NodeStatus::Online {
                let stale = match node.last_heartbeat {
                    Some(last) => (now - last).num_seconds() > timeout_secs,
                    None => true,
                };
                if stale {
                    node.status = NodeStatus::Offline;
                    self.store.put_node(node).await?;
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }
}
