use anyhow::{Result, bail};

/// Validate an id: lowercase alphanumeric + hyphens, 1-63 chars.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        bail!("{} ID must be 1-63 characters, got {}", kind, id.len());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "{} ID must be lowercase alphanumeric + hyphens: {:?}",
            kind,
            id
        );
    }
    if id.starts_with('-') || id.ends_with('-') {
        bail!("{} ID must not start or end with a hyphen: {:?}", kind, id);
    }
    Ok(())
}

/// Generate a random instance ID: "i-" followed by 8 hex chars.
pub fn generate_instance_id() -> String {
    format!("i-{}", hex8())
}

/// Generate a random upload session ID: "up-" followed by 8 hex chars.
pub fn generate_upload_session_id() -> String {
    format!("up-{}", hex8())
}

/// Generate a domain name for a VM instance: "anvil-<id-without-prefix>".
/// Orphan reconciliation matches this exact prefix (`^anvil-`).
pub fn vm_domain_name(instance_id: &str) -> String {
    format!("anvil-{}", instance_id.trim_start_matches("i-"))
}

/// Deterministic MAC address in the QEMU-reserved `52:54:00:xx:xx:xx`
/// range, derived from the instance id so repeated lookups for the same
/// instance always agree without a separate allocation table.
pub fn qemu_mac_address(instance_id: &str) -> String {
    use sha2::Digest as _;
    let mut hasher = sha2::Sha256::new();
    hasher.update(instance_id.as_bytes());
    let hash = hasher.finalize();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", hash[0], hash[1], hash[2])
}

fn hex8() -> String {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    bytes[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// Quarantine file name for a failed malware scan: `<checksum8>_<basename>`.
pub fn quarantine_name(checksum_hex: &str, basename: &str) -> String {
    let prefix = &checksum_hex[..checksum_hex.len().min(8)];
    format!("{}_{}", prefix, basename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_accepts_well_formed() {
        assert!(validate_id("ubuntu-base", "template").is_ok());
        assert!(validate_id("a", "template").is_ok());
    }

    #[test]
    fn validate_id_rejects_malformed() {
        assert!(validate_id("", "template").is_err());
        assert!(validate_id("UPPER", "template").is_err());
        assert!(validate_id("-leading", "template").is_err());
        assert!(validate_id("trailing-", "template").is_err());
        assert!(validate_id("has space", "template").is_err());
        assert!(validate_id(&"a".repeat(64), "template").is_err());
    }

    #[test]
    fn generate_instance_id_format() {
        let id = generate_instance_id();
        assert!(id.starts_with("i-"));
        assert_eq!(id.len(), 10);
    }

    #[test]
    fn vm_domain_name_has_anvil_prefix() {
        let id = generate_instance_id();
        let name = vm_domain_name(&id);
        assert!(name.starts_with("anvil-"));
    }

    #[test]
    fn qemu_mac_is_deterministic_and_in_range() {
        let a = qemu_mac_address("i-deadbeef");
        let b = qemu_mac_address("i-deadbeef");
        assert_eq!(a, b);
        assert!(a.starts_with("52:54:00:"));
        assert_eq!(a.len(), 17);
    }

    #[test]
    fn qemu_mac_differs_across_instances() {
        let a = qemu_mac_address("i-aaaaaaaa");
        let b = qemu_mac_address("i-bbbbbbbb");
        assert_ne!(a, b);
    }

    #[test]
    fn quarantine_name_truncates_checksum() {
        let name = quarantine_name("0123456789abcdef", "malware.ova");
        assert_eq!(name, "01234567_malware.ova");
    }
}
