//! Persistence contract. The real deployment backs this with a
//! relational store (sqlx against Postgres/SQLite); `MemStore` backs
//! unit and integration tests across the workspace.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AnvilError, Result};
use crate::model::{
    Challenge, Cooldown, FlagSolve, Instance, Node, UploadSession, User, VmTemplate, VpnPeer,
};

/// A single applied schema migration, as recorded in
/// `schema_migrations(version, applied_at)`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_user(&self, user: User) -> Result<()>;
    async fn get_user(&self, id: &str) -> Result<User>;

    async fn put_challenge(&self, challenge: Challenge) -> Result<()>;
    async fn get_challenge(&self, id: &str) -> Result<Challenge>;

    async fn put_vm_template(&self, template: VmTemplate) -> Result<()>;
    async fn get_vm_template(&self, id: &str) -> Result<VmTemplate>;

    async fn put_node(&self, node: Node) -> Result<()>;
    async fn get_node(&self, id: &str) -> Result<Node>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn put_instance(&self, instance: Instance) -> Result<()>;
    async fn get_instance(&self, id: &str) -> Result<Instance>;
    async fn delete_instance(&self, id: &str) -> Result<()>;
    async fn list_instances(&self) -> Result<Vec<Instance>>;
    async fn list_instances_for_owner(&self, owner_key: &str) -> Result<Vec<Instance>>;

    async fn put_vpn_peer(&self, peer: VpnPeer) -> Result<()>;
    async fn get_vpn_peer(&self, user_id: &str) -> Result<VpnPeer>;
    async fn delete_vpn_peer(&self, user_id: &str) -> Result<()>;
    async fn list_vpn_peers(&self) -> Result<Vec<VpnPeer>>;

    async fn put_upload_session(&self, session: UploadSession) -> Result<()>;
    async fn get_upload_session(&self, id: &str) -> Result<UploadSession>;
    async fn delete_upload_session(&self, id: &str) -> Result<()>;
    async fn list_upload_sessions(&self) -> Result<Vec<UploadSession>>;

    async fn put_cooldown(&self, cooldown: Cooldown) -> Result<()>;
    async fn get_cooldown(&self, user_id: &str, challenge_id: &str) -> Result<Option<Cooldown>>;
    async fn clear_cooldown(&self, user_id: &str, challenge_id: &str) -> Result<()>;

    async fn put_flag_solve(&self, solve: FlagSolve) -> Result<bool>;
    async fn has_solved(&self, user_id: &str, challenge_id: &str) -> Result<bool>;

    async fn record_migration(&self, version: &str) -> Result<()>;
    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>>;
}

#[derive(Default)]
struct MemStoreInner {
    users: HashMap<String, User>,
    challenges: HashMap<String, Challenge>,
    templates: HashMap<String, VmTemplate>,
    nodes: HashMap<String, Node>,
    instances: HashMap<String, Instance>,
    peers: HashMap<String, VpnPeer>,
    uploads: HashMap<String, UploadSession>,
    cooldowns: HashMap<(String, String), Cooldown>,
    solves: HashMap<(String, String), FlagSolve>,
    migrations: Vec<MigrationRecord>,
}

/// In-memory `Store` for tests. Never a process singleton — each test
/// constructs its own.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put_user(&self, user: User) -> Result<()> {
        self.inner.lock().unwrap().users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<User> {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("user", id))
    }

    async fn put_challenge(&self, challenge: Challenge) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .challenges
            .insert(challenge.id.clone(), challenge);
        Ok(())
    }

    async fn get_challenge(&self, id: &str) -> Result<Challenge> {
        self.inner
            .lock()
            .unwrap()
            .challenges
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("challenge", id))
    }

    async fn put_vm_template(&self, template: VmTemplate) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .templates
            .insert(template.id.clone(), template);
        Ok(())
    }

    async fn get_vm_template(&self, id: &str) -> Result<VmTemplate> {
        self.inner
            .lock()
            .unwrap()
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("vm_template", id))
    }

    async fn put_node(&self, node: Node) -> Result<()> {
        self.inner.lock().unwrap().nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Node> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("node", id))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.inner.lock().unwrap().nodes.values().cloned().collect())
    }

    async fn put_instance(&self, instance: Instance) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("instance", id))
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().instances.remove(id);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect())
    }

    async fn list_instances_for_owner(&self, owner_key: &str) -> Result<Vec<Instance>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| i.owner_key() == owner_key)
            .cloned()
            .collect())
    }

    async fn put_vpn_peer(&self, peer: VpnPeer) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .insert(peer.user_id.clone(), peer);
        Ok(())
    }

    async fn get_vpn_peer(&self, user_id: &str) -> Result<VpnPeer> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(user_id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("vpn_peer", user_id))
    }

    async fn delete_vpn_peer(&self, user_id: &str) -> Result<()> {
        self.inner.lock().unwrap().peers.remove(user_id);
        Ok(())
    }

    async fn list_vpn_peers(&self) -> Result<Vec<VpnPeer>> {
        Ok(self.inner.lock().unwrap().peers.values().cloned().collect())
    }

    async fn put_upload_session(&self, session: UploadSession) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .uploads
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_upload_session(&self, id: &str) -> Result<UploadSession> {
        self.inner
            .lock()
            .unwrap()
            .uploads
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::not_found("upload_session", id))
    }

    async fn delete_upload_session(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().uploads.remove(id);
        Ok(())
    }

    async fn list_upload_sessions(&self) -> Result<Vec<UploadSession>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .uploads
            .values()
            .cloned()
            .collect())
    }

    async fn put_cooldown(&self, cooldown: Cooldown) -> Result<()> {
        let key = (cooldown.user_id.clone(), cooldown.challenge_id.clone());
        self.inner.lock().unwrap().cooldowns.insert(key, cooldown);
        Ok(())
    }

    async fn get_cooldown(&self, user_id: &str, challenge_id: &str) -> Result<Option<Cooldown>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .cooldowns
            .get(&(user_id.to_string(), challenge_id.to_string()))
            .cloned())
    }

    async fn clear_cooldown(&self, user_id: &str, challenge_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .cooldowns
            .remove(&(user_id.to_string(), challenge_id.to_string()));
        Ok(())
    }

    async fn put_flag_solve(&self, solve: FlagSolve) -> Result<bool> {
        let key = (solve.user_id.clone(), solve.challenge_id.clone());
        let mut inner = self.inner.lock().unwrap();
        if inner.solves.contains_key(&key) {
            return Ok(false);
        }
        inner.solves.insert(key, solve);
        Ok(true)
    }

    async fn has_solved(&self, user_id: &str, challenge_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .solves
            .contains_key(&(user_id.to_string(), challenge_id.to_string())))
    }

    async fn record_migration(&self, version: &str) -> Result<()> {
        self.inner.lock().unwrap().migrations.push(MigrationRecord {
            version: version.to_string(),
            applied_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.inner.lock().unwrap().migrations.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UserRole, UserStatus};

    fn sample_user() -> User {
        User {
            id: "u-1".into(),
            handle: "alice".into(),
            role: UserRole::User,
            status: UserStatus::Active,
            score: 0,
        }
    }

    #[tokio::test]
    async fn put_and_get_user_roundtrips() {
        let store = MemStore::new();
        store.put_user(sample_user()).await.unwrap();
        let fetched = store.get_user("u-1").await.unwrap();
        assert_eq!(fetched.handle, "alice");
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let store = MemStore::new();
        let err = store.get_user("nope").await.unwrap_err();
        assert_eq!(err.tag(), "not_found");
    }

    #[tokio::test]
    async fn first_flag_solve_scores_second_is_noop() {
        let store = MemStore::new();
        let solve = FlagSolve {
            user_id: "u-1".into(),
            challenge_id: "c-1".into(),
            flag: "flag{a}".into(),
            solved_at: chrono::Utc::now(),
        };
        assert!(store.put_flag_solve(solve.clone()).await.unwrap());
        assert!(!store.put_flag_solve(solve).await.unwrap());
        assert!(store.has_solved("u-1", "c-1").await.unwrap());
    }

    #[tokio::test]
    async fn two_mem_stores_do_not_share_state() {
        let a = MemStore::new();
        let b = MemStore::new();
        a.put_user(sample_user()).await.unwrap();
        assert!(b.get_user("u-1").await.is_err());
    }

    #[tokio::test]
    async fn migrations_record_in_order() {
        let store = MemStore::new();
        store.record_migration("0001_init").await.unwrap();
        store.record_migration("0002_add_nodes").await.unwrap();
        let applied = store.applied_migrations().await.unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].version, "0001_init");
    }
}
