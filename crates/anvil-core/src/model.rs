//! Entity types for the Anvil lab platform: plain serde structs mirroring
//! the behavioral data model. No persistence logic lives here — see
//! `store` for the trait that owns CRUD.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AnvilError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Author,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
    Banned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub handle: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Docker,
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Insane,
}

impl Difficulty {
    /// Default instance timeout in minutes when a challenge does not
    /// override its own `timeout_minutes`.
    pub fn default_timeout_minutes(self) -> u32 {
        match self {
            Difficulty::Easy => 60,
            Difficulty::Medium => 120,
            Difficulty::Hard => 180,
            Difficulty::Insane => 240,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    pub max_extensions: u32,
    pub extension_minutes: u32,
    pub cooldown_minutes: u32,
    #[serde(default)]
    pub max_resets: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSpec {
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub registry: Option<String>,
    pub exposed_ports: Vec<String>,
    pub cpu_limit: String,
    pub memory_limit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub template_id: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub slug: String,
    pub kind: ResourceKind,
    pub difficulty: Difficulty,
    pub docker: Option<DockerSpec>,
    pub vm: Option<VmSpec>,
    pub timer: TimerConfig,
    pub flags: Vec<String>,
}

impl Challenge {
    pub fn effective_timeout_minutes(&self) -> u32 {
        self.timer
            .timeout_minutes
            .unwrap_or_else(|| self.difficulty.default_timeout_minutes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    Windows,
    Bsd,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: String,
    pub name: String,
    /// Path to the canonical QCOW2 base image. Invariant: always QCOW2
    /// once the template is marked active.
    pub image_path: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub os_family: OsFamily,
    pub exposed_services: Vec<String>,
    pub requires_nested_virt: bool,
    pub public: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
    Draining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub total_vcpu: u32,
    pub total_memory_mb: u32,
    pub total_disk_gb: u32,
    pub reserved_vcpu: u32,
    pub reserved_memory_mb: u32,
    pub used_vcpu: u32,
    pub used_memory_mb: u32,
}

impl NodeCapacity {
    pub fn available_vcpu(&self) -> u32 {
        self.total_vcpu
            .saturating_sub(self.used_vcpu)
            .saturating_sub(self.reserved_vcpu)
    }

    pub fn available_memory_mb(&self) -> u32 {
        self.total_memory_mb
            .saturating_sub(self.used_memory_mb)
            .saturating_sub(self.reserved_memory_mb)
    }

    pub fn fits(&self, vcpu: u32, memory_mb: u32) -> bool {
        self.available_vcpu() >= vcpu && self.available_memory_mb() >= memory_mb
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnection {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub libvirt_uri: String,
    pub bridge_network: String,
    pub vnc_port_start: u16,
    pub vnc_port_end: u16,
    pub vm_subnet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub status: NodeStatus,
    pub priority: i32,
    pub max_vms: u32,
    pub active_vms: u32,
    pub capacity: NodeCapacity,
    pub connection: NodeConnection,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_placement_candidate(&self, vcpu: u32, memory_mb: u32) -> bool {
        self.status == NodeStatus::Online
            && self.active_vms < self.max_vms
            && self.capacity.fits(vcpu, memory_mb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    Expired,
    Destroyed,
}

/// Valid lifecycle transitions for a unified instance. `Destroyed` is
/// reachable from any non-terminal state (force cleanup); `Error` is
/// reachable from any in-flight state.
pub fn validate_instance_transition(from: InstanceState, to: InstanceState) -> Result<()> {
    use InstanceState::*;

    if to == Destroyed && from != Destroyed {
        return Ok(());
    }
    if to == Error && !matches!(from, Destroyed | Error) {
        return Ok(());
    }

    let allowed = matches!(
        (from, to),
        (Provisioning, Starting)
            | (Starting, Running)
            | (Running, Paused)
            | (Running, Stopping)
            | (Running, Expired)
            | (Paused, Running)
            | (Stopping, Stopped)
            | (Stopped, Starting)
            | (Stopped, Expired)
            | (Expired, Stopping)
    );

    if allowed {
        Ok(())
    } else {
        Err(AnvilError::Conflict {
            message: format!("invalid instance transition {:?} -> {:?}", from, to),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceNetwork {
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub port_mappings: std::collections::BTreeMap<String, u16>,
    pub vnc_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstanceOwner {
    User(String),
    Session(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub kind: ResourceKind,
    pub owner: InstanceOwner,
    pub challenge_id: String,
    /// VM template id or docker image ref, denormalized for quick display.
    pub resource_ref: String,
    pub state: InstanceState,
    pub network: InstanceNetwork,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub extensions_used: u32,
    pub max_extensions: u32,
    pub resets_used: u32,
    pub max_resets: u32,
    pub node_id: Option<String>,
    pub overlay_path: Option<String>,
    pub error: Option<String>,
    /// vcpu/memory actually reserved against `node_id`'s capacity at
    /// creation time. Zero for docker instances, which aren't scheduled
    /// onto a libvirt node.
    pub allocated_vcpu: u32,
    pub allocated_memory_mb: u32,
}

impl Instance {
    pub fn owner_key(&self) -> &str {
        match &self.owner {
            InstanceOwner::User(id) => id,
            InstanceOwner::Session(id) => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Stopped | InstanceState::Expired | InstanceState::Destroyed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnPeer {
    pub user_id: String,
    pub public_key: String,
    /// AES-GCM-encrypted private key, base64. Never returned to callers.
    pub encrypted_private_key: String,
    pub assigned_ip: String,
    pub allowed_ips: String,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Processing,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub tag: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub backend_upload_id: String,
    pub chunks: std::collections::BTreeMap<u32, ChunkRecord>,
    pub caller_checksum: Option<String>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl UploadSession {
    pub fn uploaded_size(&self) -> u64 {
        self.chunks.values().map(|c| c.size).sum()
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|n| !self.chunks.contains_key(n))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooldown {
    pub user_id: String,
    pub challenge_id: String,
    pub cooldown_until: DateTime<Utc>,
    pub reason: String,
    pub triggering_instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagAttempt {
    pub id: String,
    pub user_id: String,
    pub challenge_id: String,
    pub submitted: String,
    pub correct: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagSolve {
    pub user_id: String,
    pub challenge_id: String,
    pub flag: String,
    pub solved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_defaults() {
        assert_eq!(Difficulty::Easy.default_timeout_minutes(), 60);
        assert_eq!(Difficulty::Medium.default_timeout_minutes(), 120);
        assert_eq!(Difficulty::Hard.default_timeout_minutes(), 180);
        assert_eq!(Difficulty::Insane.default_timeout_minutes(), 240);
    }

    #[test]
    fn node_capacity_availability() {
        let cap = NodeCapacity {
            total_vcpu: 16,
            total_memory_mb: 32768,
            total_disk_gb: 500,
            reserved_vcpu: 2,
            reserved_memory_mb: 2048,
            used_vcpu: 4,
            used_memory_mb: 8192,
        };
        assert_eq!(cap.available_vcpu(), 10);
        assert_eq!(cap.available_memory_mb(), 22528);
        assert!(cap.fits(2, 2048));
        assert!(!cap.fits(11, 2048));
    }

    #[test]
    fn valid_instance_transitions() {
        use InstanceState::*;
        assert!(validate_instance_transition(Provisioning, Starting).is_ok());
        assert!(validate_instance_transition(Starting, Running).is_ok());
        assert!(validate_instance_transition(Stopped, Starting).is_ok());
        assert!(validate_instance_transition(Running, Paused).is_ok());
    }

    #[test]
    fn invalid_instance_transition_rejected() {
        use InstanceState::*;
        assert!(validate_instance_transition(Provisioning, Running).is_err());
        assert!(validate_instance_transition(Destroyed, Running).is_err());
    }

    #[test]
    fn destroyed_reachable_from_any_non_terminal_state() {
        use InstanceState::*;
        for s in [Provisioning, Starting, Running, Paused, Stopping, Stopped, Error, Expired] {
            assert!(validate_instance_transition(s, Destroyed).is_ok());
        }
        assert!(validate_instance_transition(Destroyed, Destroyed).is_err());
    }

    #[test]
    fn upload_session_missing_chunks() {
        let mut session = sample_session();
        session.chunks.insert(1, ChunkRecord { etag: "a".into(), size: 3_000_000 });
        session.chunks.insert(3, ChunkRecord { etag: "b".into(), size: 3_000_000 });
        session.chunks.insert(4, ChunkRecord { etag: "c".into(), size: 1_000_000 });
        assert_eq!(session.missing_chunks(), vec![2]);
        assert_eq!(session.uploaded_size(), 7_000_000);
    }

    fn sample_session() -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id: "up-1".into(),
            owner: "user-1".into(),
            filename: "base.qcow2".into(),
            tag: "qcow2".into(),
            total_size: 10_000_000,
            chunk_size: 3_000_000,
            total_chunks: 4,
            backend_upload_id: "mp-1".into(),
            chunks: Default::default(),
            caller_checksum: None,
            status: UploadStatus::Uploading,
            created_at: now,
            updated_at: now,
            expires_at: now,
            failure_reason: None,
        }
    }
}
