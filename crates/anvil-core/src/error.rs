use serde::Serialize;

/// Canonical error kinds shared across every Anvil component.
///
/// Each variant carries a short machine-readable `tag` (stable API
/// contract) and a human-readable message. Components map their
/// internal failures onto one of these before they cross a crate
/// boundary.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnvilError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("cooldown active, retry after {retry_after_secs}s")]
    Cooldown { retry_after_secs: u64 },

    #[error("no capacity available: {message}")]
    NoCapacity { message: String },

    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("upstream failure: {message}")]
    Upstream { message: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malware detected: {signature}")]
    MalwareDetected { signature: String },

    #[error("resource exhausted: {message}")]
    Exhausted { message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AnvilError {
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Tag used in API responses and log fields, independent of the
    /// `Display` message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Cooldown { .. } => "cooldown",
            Self::NoCapacity { .. } => "no_capacity",
            Self::Timeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::MalwareDetected { .. } => "malware_detected",
            Self::Exhausted { .. } => "exhausted",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnvilError>;
