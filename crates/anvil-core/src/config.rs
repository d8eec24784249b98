use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration, loaded from a TOML file with environment
/// overrides applied on top (`ANVIL_*`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnvilConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub wireguard: WireguardConfig,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Local,
    ObjectStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Root for the local backend, or bucket prefix for the object-store backend.
    pub root: String,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,
    /// Max objects composed together in one object-store compose call.
    #[serde(default = "default_compose_fanin")]
    pub compose_fanin: usize,
}

fn default_compose_fanin() -> usize {
    32
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            root: "/var/lib/anvil/storage".to_string(),
            s3_endpoint: None,
            s3_bucket: None,
            s3_region: None,
            compose_fanin: default_compose_fanin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTypeEntry {
    pub extensions: Vec<String>,
    pub max_bytes: u64,
    pub class: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    #[serde(default = "default_session_expiry_secs")]
    pub session_expiry_secs: u64,
    #[serde(default = "default_max_sessions_per_identity")]
    pub max_sessions_per_identity: usize,
    #[serde(default = "default_file_types")]
    pub file_types: HashMap<String, FileTypeEntry>,
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}
fn default_min_chunk_size() -> u64 {
    1024 * 1024
}
fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024
}
fn default_session_expiry_secs() -> u64 {
    24 * 3600
}
fn default_max_sessions_per_identity() -> usize {
    4
}

/// The closed file-type registry from the upload contract.
fn default_file_types() -> HashMap<String, FileTypeEntry> {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    let mut m = HashMap::new();
    m.insert(
        "dockerfile".to_string(),
        FileTypeEntry {
            extensions: vec!["Dockerfile".into(), "dockerfile".into()],
            max_bytes: MIB,
            class: "docker".into(),
        },
    );
    m.insert(
        "docker_context".to_string(),
        FileTypeEntry {
            extensions: vec![".tar".into(), ".tar.gz".into(), ".tgz".into()],
            max_bytes: 512 * MIB,
            class: "docker".into(),
        },
    );
    m.insert(
        "docker_image".to_string(),
        FileTypeEntry {
            extensions: vec![".tar".into()],
            max_bytes: 10 * GIB,
            class: "docker".into(),
        },
    );
    m.insert(
        "ova".to_string(),
        FileTypeEntry {
            extensions: vec![".ova".into()],
            max_bytes: 50 * GIB,
            class: "vm".into(),
        },
    );
    m.insert(
        "vmdk".to_string(),
        FileTypeEntry {
            extensions: vec![".vmdk".into()],
            max_bytes: 50 * GIB,
            class: "vm".into(),
        },
    );
    m.insert(
        "qcow2".to_string(),
        FileTypeEntry {
            extensions: vec![".qcow2".into(), ".qcow".into()],
            max_bytes: 50 * GIB,
            class: "vm".into(),
        },
    );
    m.insert(
        "vdi".to_string(),
        FileTypeEntry {
            extensions: vec![".vdi".into()],
            max_bytes: 50 * GIB,
            class: "vm".into(),
        },
    );
    m.insert(
        "iso".to_string(),
        FileTypeEntry {
            extensions: vec![".iso".into()],
            max_bytes: 10 * GIB,
            class: "vm".into(),
        },
    );
    m
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            session_expiry_secs: default_session_expiry_secs(),
            max_sessions_per_identity: default_max_sessions_per_identity(),
            file_types: default_file_types(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    pub interface: String,
    pub listen_port: u16,
    pub server_endpoint: String,
    /// The full lab network, e.g. "10.100.0.0/16".
    pub lab_cidr: String,
    pub dns: String,
    /// Directory holding the server's persisted Curve25519 keypair and
    /// AES-GCM at-rest encryption key, generated on first run.
    pub state_dir: String,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: "wg-anvil".to_string(),
            listen_port: 51820,
            server_endpoint: "lab.example.org".to_string(),
            lab_cidr: "10.100.0.0/16".to_string(),
            dns: "1.1.1.1".to_string(),
            state_dir: "/var/lib/anvil/wireguard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub max_docker_per_user: u32,
    pub max_vm_per_user: u32,
    pub max_per_user: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_docker_per_user: 3,
            max_vm_per_user: 2,
            max_per_user: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub network_name: String,
    pub network_subnet: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub cleanup_interval_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            network_name: "anvil-lab-net".to_string(),
            network_subnet: "172.30.0.0/16".to_string(),
            port_range_start: 32000,
            port_range_end: 33000,
            cleanup_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub global_rate_per_window: u32,
    pub global_window_secs: u64,
    pub global_burst: u32,
    pub abuse_threshold: u32,
    pub abuse_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rate_per_window: 120,
            global_window_secs: 60,
            global_burst: 30,
            abuse_threshold: 10,
            abuse_window_secs: 15 * 60,
        }
    }
}

/// Cadences for the background reconciler loops (`anvil-supervisor`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Mark expired instance rows and delete stale terminal ones.
    pub instance_sweep_secs: u64,
    /// How long a terminal (`Error`/`Stopped`/`Expired`) row survives
    /// before the sweep deletes it.
    pub terminal_retention_secs: u64,
    /// Invoke the VM service's own expired-overlay cleanup.
    pub vm_cleanup_secs: u64,
    /// Probe each node and refresh `last_heartbeat`/`active_vms`.
    pub node_heartbeat_secs: u64,
    /// A node with no successful heartbeat probe in this long is marked offline.
    pub node_heartbeat_timeout_secs: i64,
    /// Reap upload sessions that expired without completing.
    pub upload_janitor_secs: u64,
    /// Evict stale rate-limiter/abuse-tracker buckets.
    pub rate_limit_janitor_secs: u64,
    /// Remove DHCP host reservations with no matching live instance.
    pub dhcp_sweep_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            instance_sweep_secs: 120,
            terminal_retention_secs: 3600,
            vm_cleanup_secs: 300,
            node_heartbeat_secs: 30,
            node_heartbeat_timeout_secs: 90,
            upload_janitor_secs: 300,
            rate_limit_janitor_secs: 60,
            dhcp_sweep_secs: 600,
        }
    }
}

/// Load config from a TOML file. Missing sections fall back to their
/// `Default` impl via `#[serde(default)]`.
pub fn load(path: &std::path::Path) -> anyhow::Result<AnvilConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AnvilConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Check if running in production mode (`ANVIL_PRODUCTION=1`).
pub fn is_production_mode() -> bool {
    std::env::var("ANVIL_PRODUCTION")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_closed_file_type_registry() {
        let cfg = AnvilConfig::default();
        assert_eq!(cfg.upload.file_types.len(), 8);
        assert!(cfg.upload.file_types.contains_key("qcow2"));
        assert_eq!(
            cfg.upload.file_types["ova"].max_bytes,
            50 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn quota_defaults_match_spec() {
        let q = QuotaConfig::default();
        assert_eq!(q.max_docker_per_user, 3);
        assert_eq!(q.max_vm_per_user, 2);
        assert_eq!(q.max_per_user, 4);
    }

    #[test]
    fn not_production_by_default() {
        unsafe { std::env::remove_var("ANVIL_PRODUCTION") };
        assert!(!is_production_mode());
    }

    #[test]
    fn toml_roundtrip_of_default_config() {
        let cfg = AnvilConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: AnvilConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.quotas.max_vm_per_user, cfg.quotas.max_vm_per_user);
    }
}
