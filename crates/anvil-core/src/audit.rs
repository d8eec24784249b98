use serde::{Deserialize, Serialize};
use tracing::info;

/// Audit event types for per-user/per-instance audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditAction {
    InstanceCreated,
    InstanceStarted,
    InstanceStopped,
    InstanceExtended,
    InstanceReset,
    InstanceDestroyed,
    InstanceExpired,
    CooldownApplied,
    QuotaRejected,
    FlagSolved,
    UploadCompleted,
    PeerCreated,
    PeerRemoved,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub user_id: String,
    pub instance_id: Option<String>,
    pub challenge_id: Option<String>,
    pub action: AuditAction,
    pub detail: Option<String>,
}

/// Emit one audit entry as a structured log event. Callers build the
/// `AuditEntry` themselves; this just gives every entry one consistent
/// tracing target (`anvil::audit`) so deployments can route it to its
/// own sink independent of the rest of the daemon's logs.
pub fn log_event(entry: &AuditEntry) {
    info!(
        target: "anvil::audit",
        user_id = %entry.user_id,
        instance_id = entry.instance_id.as_deref(),
        challenge_id = entry.challenge_id.as_deref(),
        action = ?entry.action,
        detail = entry.detail.as_deref(),
        "audit event",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_entry_serialization() {
        let entry = AuditEntry {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            user_id: "u-1".to_string(),
            instance_id: Some("i-abc123".to_string()),
            challenge_id: Some("c-1".to_string()),
            action: AuditAction::InstanceStarted,
            detail: Some("node=node-3".to_string()),
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"user_id\":\"u-1\""));
        assert!(json.contains("\"InstanceStarted\""));
    }

    #[test]
    fn audit_entry_no_optionals() {
        let entry = AuditEntry {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            user_id: "u-1".to_string(),
            instance_id: None,
            challenge_id: None,
            action: AuditAction::QuotaRejected,
            detail: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"instance_id\":null"));
    }

    #[test]
    fn all_audit_actions_serialize() {
        let actions = vec![
            AuditAction::InstanceCreated,
            AuditAction::InstanceStarted,
            AuditAction::InstanceStopped,
            AuditAction::InstanceExtended,
            AuditAction::InstanceReset,
            AuditAction::InstanceDestroyed,
            AuditAction::InstanceExpired,
            AuditAction::CooldownApplied,
            AuditAction::QuotaRejected,
            AuditAction::FlagSolved,
            AuditAction::UploadCompleted,
            AuditAction::PeerCreated,
            AuditAction::PeerRemoved,
        ];

        for action in actions {
            let json = serde_json::to_string(&action).unwrap();
            assert!(!json.is_empty());
        }
    }
}
